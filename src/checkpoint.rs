//! Append-only checkpoint store for harvester progress.
//!
//! Two plain line-oriented logs per harvester instance: one for appids that
//! yielded a payload, one for appids that permanently failed. Appends are
//! flushed and fsynced before returning, so a crash immediately after a
//! successful harvest still finds the checkpoint on restart. Logs are never
//! rewritten, only extended; `load()` unions both so restart recomputes
//! `catalog - completed` without reprocessing anything.
//!
//! The files are deliberately human-readable: `tail -f state/processed_appids.txt`
//! is the supported live-progress interface.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

pub struct CheckpointStore {
    succeeded_path: PathBuf,
    failed_path: PathBuf,
    succeeded: File,
    failed: File,
}

impl CheckpointStore {
    /// Open (creating if absent) the checkpoint logs for one harvester
    /// instance. `prefix` keeps concurrent harvesters' state disjoint,
    /// e.g. `processed` vs `processed_reviews`.
    pub fn open(state_dir: &Path, prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        let succeeded_path = state_dir.join(format!("{prefix}_appids.txt"));
        let failed_path = state_dir.join(format!("{prefix}_failed_appids.txt"));
        let succeeded = Self::open_append(&succeeded_path)?;
        let failed = Self::open_append(&failed_path)?;
        Ok(Self {
            succeeded_path,
            failed_path,
            succeeded,
            failed,
        })
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening checkpoint log {}", path.display()))
    }

    /// Union of succeeded and failed appids. Malformed lines are skipped;
    /// a torn final line from a crash mid-write must not poison the run.
    pub fn load(&self) -> Result<HashSet<i64>> {
        let mut seen = HashSet::new();
        for path in [&self.succeeded_path, &self.failed_path] {
            let file = File::open(path)
                .with_context(|| format!("reading checkpoint log {}", path.display()))?;
            let mut skipped = 0usize;
            for line in BufReader::new(file).lines() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match trimmed.parse::<i64>() {
                    Ok(id) => {
                        seen.insert(id);
                    }
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!(path = %path.display(), skipped, "skipped malformed checkpoint lines");
            }
        }
        info!(count = seen.len(), "loaded previously attempted appids");
        Ok(seen)
    }

    pub fn append_success(&mut self, appid: i64) -> Result<()> {
        Self::append(&mut self.succeeded, &self.succeeded_path, appid)
    }

    pub fn append_failure(&mut self, appid: i64) -> Result<()> {
        Self::append(&mut self.failed, &self.failed_path, appid)
    }

    // Flush-before-return is the crash-safety contract: at most the single
    // in-flight request is lost, never a recorded outcome.
    fn append(file: &mut File, path: &Path, appid: i64) -> Result<()> {
        writeln!(file, "{appid}")
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .with_context(|| format!("appending checkpoint to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_unions_succeeded_and_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path(), "processed").unwrap();
        store.append_success(10).unwrap();
        store.append_success(20).unwrap();
        store.append_failure(30).unwrap();

        let seen = store.load().unwrap();
        assert_eq!(seen, HashSet::from([10, 20, 30]));
    }

    #[test]
    fn reopen_preserves_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = CheckpointStore::open(dir.path(), "processed").unwrap();
            store.append_success(1).unwrap();
            store.append_failure(2).unwrap();
        }
        // Simulated restart: a fresh handle over the same state dir.
        let mut store = CheckpointStore::open(dir.path(), "processed").unwrap();
        store.append_success(3).unwrap();
        assert_eq!(store.load().unwrap(), HashSet::from([1, 2, 3]));
    }

    #[test]
    fn prefixes_keep_instances_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut details = CheckpointStore::open(dir.path(), "processed").unwrap();
        let mut reviews = CheckpointStore::open(dir.path(), "processed_reviews").unwrap();
        details.append_success(1).unwrap();
        reviews.append_success(2).unwrap();
        assert_eq!(details.load().unwrap(), HashSet::from([1]));
        assert_eq!(reviews.load().unwrap(), HashSet::from([2]));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_appids.txt");
        std::fs::write(&path, "1\ngarbage\n2\n4").unwrap();
        let store = CheckpointStore::open(dir.path(), "processed").unwrap();
        assert_eq!(store.load().unwrap(), HashSet::from([1, 2, 4]));
    }
}
