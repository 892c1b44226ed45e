//! Gap detection across the two harvest tracks.
//!
//! The review harvester discovers appids the detail harvester never landed
//! in the store (hard failures, records skipped by the loader, runs against
//! stale catalogs). This module computes review appids minus stored appids
//! and persists the difference as one appid per line, the same shape the
//! checkpoint files use, so the backfill harvester can consume it directly.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::db::Db;
use crate::stream;

/// Ids present in `observed` but absent from `known`, sorted ascending for
/// stable output.
pub fn missing_ids(observed: &HashSet<i64>, known: &HashSet<i64>) -> Vec<i64> {
    let mut missing: Vec<i64> = observed.difference(known).copied().collect();
    missing.sort_unstable();
    missing
}

/// Every appid referenced by a review batch collection. Streams the
/// collection; memory is bounded by the id set, not the review payloads.
pub fn review_appids(reviews_dir: &Path) -> Result<HashSet<i64>> {
    let mut appids = HashSet::new();
    let total = stream::stream_collection(reviews_dir, |record| {
        match record.get("appid").and_then(Value::as_i64) {
            Some(appid) => {
                appids.insert(appid);
            }
            None => warn!("review record without an appid; ignoring"),
        }
        Ok(())
    })?;
    info!(
        records = total,
        distinct = appids.len(),
        "scanned review collection for appids"
    );
    Ok(appids)
}

/// Compare review-side appids against the store and write the gap list.
#[instrument(skip(db))]
pub async fn find_gaps(db: &Db, reviews_dir: &Path, out_path: &Path) -> Result<Vec<i64>> {
    let reviews_dir = reviews_dir.to_path_buf();
    let observed = tokio::task::spawn_blocking(move || review_appids(&reviews_dir))
        .await
        .context("review scan panicked")??;
    let known = db.existing_appids().await?;
    let missing = missing_ids(&observed, &known);
    info!(
        review_appids = observed.len(),
        stored_appids = known.len(),
        missing = missing.len(),
        "gap detection complete"
    );
    write_gap_file(out_path, &missing)?;
    Ok(missing)
}

pub fn write_gap_file(path: &Path, appids: &[i64]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("creating gap file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for appid in appids {
        writeln!(writer, "{appid}")?;
    }
    writer.flush()?;
    info!(path = %path.display(), count = appids.len(), "gap file written");
    Ok(())
}

/// Read a gap file back as a work queue, preserving order and skipping
/// malformed lines.
pub fn read_gap_file(path: &Path) -> Result<Vec<i64>> {
    let file =
        File::open(path).with_context(|| format!("opening gap file {}", path.display()))?;
    let mut appids = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<i64>() {
            Ok(appid) => appids.push(appid),
            Err(_) => warn!(line = trimmed, "malformed gap file line; skipping"),
        }
    }
    Ok(appids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_is_observed_minus_known() {
        let observed: HashSet<i64> = [2, 3, 4, 5].into_iter().collect();
        let known: HashSet<i64> = [1, 2, 3].into_iter().collect();
        assert_eq!(missing_ids(&observed, &known), vec![4, 5]);
    }

    #[test]
    fn no_gaps_when_store_covers_reviews() {
        let observed: HashSet<i64> = [1, 2].into_iter().collect();
        let known: HashSet<i64> = [1, 2, 3].into_iter().collect();
        assert!(missing_ids(&observed, &known).is_empty());
    }

    #[test]
    fn scans_review_collection_for_distinct_appids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("steam_reviews_batch_00001.json"),
            json!([
                {"appid": 10, "reviews": {}},
                {"appid": 20, "reviews": {}},
                {"appid": 10, "reviews": {}},
                {"no_appid": true},
            ])
            .to_string(),
        )
        .unwrap();
        let appids = review_appids(dir.path()).unwrap();
        assert_eq!(appids, [10, 20].into_iter().collect());
    }

    #[test]
    fn gap_file_round_trips_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing_appids.txt");
        write_gap_file(&path, &[4, 5, 99]).unwrap();

        std::fs::write(
            &path,
            format!("{}\nnot-a-number\n\n", std::fs::read_to_string(&path).unwrap()),
        )
        .unwrap();
        assert_eq!(read_gap_file(&path).unwrap(), vec![4, 5, 99]);
    }
}
