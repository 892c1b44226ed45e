//! Gap-driven backfill.
//!
//! Consumes the gap file produced by the detector and runs a harvest pass
//! over exactly those appids, with its own checkpoint prefix and batch
//! prefix so a backfill never collides with the primary harvest state. The
//! resulting batches land in the games batch directory, where the next
//! loader run picks them up through the normal `ON CONFLICT DO NOTHING`
//! path.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::checkpoint::CheckpointStore;
use crate::client::SteamClient;
use crate::gaps;
use crate::harvester::{self, BatchWriter, DetailFetcher, HarvestSummary};

pub const BACKFILL_STATE_PREFIX: &str = "processed_backfill";
pub const BACKFILL_BATCH_PREFIX: &str = "steam_backfill";

/// Harvest appdetails for every appid in the gap file. Resumable like the
/// primary harvest: re-running after an interruption only touches appids the
/// previous attempt never finished.
#[instrument(skip(client, stop))]
pub async fn run(
    client: &SteamClient,
    gap_file: &Path,
    state_dir: &Path,
    out_dir: &Path,
    batch_size: usize,
    stop: &AtomicBool,
) -> Result<HarvestSummary> {
    let queue = gaps::read_gap_file(gap_file)
        .with_context(|| format!("reading gap file {}", gap_file.display()))?;
    if queue.is_empty() {
        info!("gap file is empty; nothing to backfill");
        return Ok(HarvestSummary::default());
    }
    info!(appids = queue.len(), "starting backfill harvest");

    let mut checkpoints = CheckpointStore::open(state_dir, BACKFILL_STATE_PREFIX)?;
    let mut writer = BatchWriter::new(out_dir, BACKFILL_BATCH_PREFIX, batch_size)?;
    let fetcher = DetailFetcher(client);
    harvester::run(&queue, &fetcher, &mut checkpoints, &mut writer, stop).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FetchError;
    use crate::harvester::Fetch;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct AlwaysOk;

    #[async_trait]
    impl Fetch for AlwaysOk {
        async fn fetch(&self, appid: i64) -> Result<Option<Value>, FetchError> {
            Ok(Some(json!({"success": true, "data": {"steam_appid": appid}})))
        }
    }

    #[tokio::test]
    async fn backfill_state_is_disjoint_from_primary_harvest() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");

        // A primary-harvest checkpoint must not mask backfill work.
        {
            let mut primary = CheckpointStore::open(&state, "processed").unwrap();
            primary.append_success(42).unwrap();
        }

        let mut checkpoints = CheckpointStore::open(&state, BACKFILL_STATE_PREFIX).unwrap();
        let mut writer =
            BatchWriter::new(&dir.path().join("data"), BACKFILL_BATCH_PREFIX, 10).unwrap();
        let summary = harvester::run(
            &[42],
            &AlwaysOk,
            &mut checkpoints,
            &mut writer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn backfill_batches_use_their_own_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let mut checkpoints =
            CheckpointStore::open(&dir.path().join("state"), BACKFILL_STATE_PREFIX).unwrap();
        let mut writer = BatchWriter::new(&data, BACKFILL_BATCH_PREFIX, 1).unwrap();
        harvester::run(
            &[7],
            &AlwaysOk,
            &mut checkpoints,
            &mut writer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();
        assert!(data.join("steam_backfill_batch_00001.json").exists());
    }
}
