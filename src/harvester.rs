//! Resumable, checkpointed harvester.
//!
//! Drives a fetcher across the remaining work queue, checkpointing every
//! item outcome before the payload joins the in-memory batch. Two instances
//! (appdetails, reviews) run as separate processes with disjoint state dirs,
//! output dirs, and credentials, so one instance's throttling cannot stall
//! the other.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::{FetchError, SteamClient};
use crate::error::PipelineError;

/// Fetch seam for one work item.
///
/// `Ok(Some(raw))` is a payload for the current batch, `Ok(None)` is a
/// completed item with nothing to persist (e.g. an app with zero reviews),
/// `Err` is a failed item recorded for later backfill.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, appid: i64) -> Result<Option<Value>, FetchError>;
}

/// Appdetails fetcher. Application-level failures (`success: false`) are
/// persisted in the batch like the original collector does: they are real,
/// expected observations about delisted content.
pub struct DetailFetcher<'a>(pub &'a SteamClient);

#[async_trait]
impl Fetch for DetailFetcher<'_> {
    async fn fetch(&self, appid: i64) -> Result<Option<Value>, FetchError> {
        let record = self.0.app_details(appid).await?;
        Ok(Some(record.into_raw(Utc::now())))
    }
}

/// Review-summary fetcher. Wraps the response so the batch record carries
/// the owning appid alongside the raw payload.
pub struct ReviewFetcher<'a>(pub &'a SteamClient);

#[async_trait]
impl Fetch for ReviewFetcher<'_> {
    async fn fetch(&self, appid: i64) -> Result<Option<Value>, FetchError> {
        match self.0.app_reviews(appid).await? {
            Some(reviews) => Ok(Some(serde_json::json!({
                "appid": appid,
                "reviews": reviews,
                "fetched_at": Utc::now().to_rfc3339(),
            }))),
            None => Ok(None),
        }
    }
}

/// Accumulates raw records and flushes them as numbered, immutable JSON
/// array files. Numbering continues after existing files so a resumed run
/// never overwrites a flushed batch.
pub struct BatchWriter {
    dir: PathBuf,
    prefix: String,
    batch_size: usize,
    buf: Vec<Value>,
    next_index: u32,
}

impl BatchWriter {
    pub fn new(dir: &Path, prefix: &str, batch_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating batch dir {}", dir.display()))?;
        // Highest existing index wins, not the file count: a hole in the
        // numbering must never cause a flush to overwrite a flushed batch.
        let highest = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_prefix(prefix)?
                    .strip_prefix("_batch_")?
                    .strip_suffix(".json")?
                    .parse::<u32>()
                    .ok()
            })
            .max()
            .unwrap_or(0);
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            batch_size: batch_size.max(1),
            buf: Vec::new(),
            next_index: highest + 1,
        })
    }

    pub fn push(&mut self, record: Value) -> Result<Option<PathBuf>> {
        self.buf.push(record);
        if self.buf.len() >= self.batch_size {
            self.flush()
        } else {
            Ok(None)
        }
    }

    /// Write the pending batch, if any, and clear the accumulator.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let path = self
            .dir
            .join(format!("{}_batch_{:05}.json", self.prefix, self.next_index));
        let file = std::fs::File::create(&path)
            .with_context(|| format!("creating batch file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.buf)
            .with_context(|| format!("writing batch file {}", path.display()))?;
        use std::io::Write;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        info!(path = %path.display(), records = self.buf.len(), "flushed batch");
        self.buf.clear();
        self.next_index += 1;
        Ok(Some(path))
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct HarvestSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub already_done: u64,
    pub batches_written: u32,
    pub stopped_early: bool,
}

/// Run one harvester instance over `queue`.
///
/// `remaining = queue - checkpoints.load()`; each remaining item is fetched,
/// its outcome checkpointed, and its payload (if any) pushed into the batch
/// accumulator. A single bad item never aborts the run. The stop flag is
/// honored at the top of the per-item loop; the partial batch is flushed on
/// the way out, so a requested stop loses nothing.
pub async fn run(
    queue: &[i64],
    fetcher: &dyn Fetch,
    checkpoints: &mut CheckpointStore,
    writer: &mut BatchWriter,
    stop: &AtomicBool,
) -> Result<HarvestSummary> {
    let done = checkpoints.load()?;
    let remaining: Vec<i64> = queue.iter().copied().filter(|id| !done.contains(id)).collect();
    let mut summary = HarvestSummary {
        already_done: (queue.len() - remaining.len()) as u64,
        ..Default::default()
    };
    if remaining.is_empty() {
        info!("no new work items; collection is up to date");
        return Ok(summary);
    }
    info!(
        total = queue.len(),
        remaining = remaining.len(),
        "starting harvest run"
    );

    for appid in remaining {
        if stop.load(Ordering::Relaxed) {
            warn!(appid, "stop requested; halting before next item");
            summary.stopped_early = true;
            break;
        }
        summary.attempted += 1;
        match fetcher.fetch(appid).await {
            Ok(payload) => {
                // Checkpoint first: the batch accumulator is the only thing
                // a crash may lose, never the "this item is done" record.
                checkpoints.append_success(appid)?;
                summary.succeeded += 1;
                if let Some(record) = payload {
                    if writer.push(record)?.is_some() {
                        summary.batches_written += 1;
                    }
                }
            }
            Err(err) => {
                checkpoints.append_failure(appid)?;
                summary.failed += 1;
                let err = PipelineError::from(err);
                warn!(appid, error = %err, "work item failed; recorded and continuing");
            }
        }
    }

    if writer.flush()?.is_some() {
        summary.batches_written += 1;
    }
    info!(
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        batches = summary.batches_written,
        "harvest run finished"
    );
    Ok(summary)
}
