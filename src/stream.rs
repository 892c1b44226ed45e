//! Streaming reader for the raw batch files.
//!
//! Every batch file is a single JSON array of response objects; master files
//! produced by merging batches run to multiple gigabytes, so nothing in the
//! pipeline is allowed to deserialize a whole array. This module drives
//! serde's seq machinery directly: each element is handed to a callback and
//! dropped, so peak memory is bounded by the largest single record.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::{DeserializeSeed, SeqAccess, Visitor};
use serde::Deserializer;
use serde_json::Value;

struct RecordSink<'a, F> {
    callback: &'a mut F,
}

impl<'de, F> Visitor<'de> for RecordSink<'_, F>
where
    F: FnMut(Value) -> Result<()>,
{
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a JSON array of records")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<u64, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut count = 0u64;
        while let Some(record) = seq.next_element::<Value>()? {
            (self.callback)(record).map_err(serde::de::Error::custom)?;
            count += 1;
        }
        Ok(count)
    }
}

impl<'de, F> DeserializeSeed<'de> for RecordSink<'_, F>
where
    F: FnMut(Value) -> Result<()>,
{
    type Value = u64;

    fn deserialize<D>(self, deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

/// Stream every record of a JSON array through `callback`, returning the
/// record count. The callback owns each record; an error from it aborts the
/// stream.
pub fn stream_reader<R, F>(reader: R, mut callback: F) -> Result<u64>
where
    R: Read,
    F: FnMut(Value) -> Result<()>,
{
    let mut de = serde_json::Deserializer::from_reader(BufReader::new(reader));
    let sink = RecordSink {
        callback: &mut callback,
    };
    let count = sink.deserialize(&mut de)?;
    de.end()?;
    Ok(count)
}

/// Stream a single batch file.
pub fn stream_file<F>(path: &Path, callback: F) -> Result<u64>
where
    F: FnMut(Value) -> Result<()>,
{
    let file = File::open(path).with_context(|| format!("opening batch file {}", path.display()))?;
    stream_reader(file, callback)
        .with_context(|| format!("streaming records from {}", path.display()))
}

/// All `.json` batch files under `dir`, sorted by name so numbered batches
/// replay in harvest order. A path to a single file is returned as-is.
pub fn batch_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if dir.is_file() {
        return Ok(vec![dir.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading batch directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Stream every record across all batch files under `dir` (or a single
/// file), in batch order. Returns the total record count.
pub fn stream_collection<F>(dir: &Path, mut callback: F) -> Result<u64>
where
    F: FnMut(Value) -> Result<()>,
{
    let mut total = 0u64;
    for path in batch_files(dir)? {
        total += stream_file(&path, &mut callback)?;
    }
    Ok(total)
}

/// Bridge the blocking record stream into async code through a bounded
/// channel. The bound is what keeps memory flat: the reader blocks when the
/// consumer falls behind. Returns the receiver plus a handle resolving to
/// the total record count.
pub fn record_channel(
    dir: PathBuf,
    capacity: usize,
) -> (
    tokio::sync::mpsc::Receiver<Value>,
    tokio::task::JoinHandle<Result<u64>>,
) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        stream_collection(&dir, |record| {
            tx.blocking_send(record)
                .map_err(|_| anyhow::anyhow!("record consumer dropped"))
        })
    });
    (rx, handle)
}
