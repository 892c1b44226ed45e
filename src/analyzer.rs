//! Streaming structural analyzer for raw batch collections.
//!
//! Characterizes a collection in a single forward pass: total record count,
//! the first few records verbatim, and a key-presence table. Memory stays
//! bounded by the largest single record regardless of collection size, which
//! is what makes this usable on multi-gigabyte master files.

use std::path::Path;

use anyhow::Result;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::stream;

#[derive(Debug, Default, Serialize)]
pub struct StructureReport {
    pub total_count: u64,
    pub sample_records: Vec<Value>,
    /// Top-level key -> occurrence count, in order of first appearance.
    pub key_presence: IndexMap<String, u64>,
    pub non_object_records: u64,
}

impl StructureReport {
    pub fn key_percentage(&self, count: u64) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            (count as f64 / self.total_count as f64) * 100.0
        }
    }

    /// Plain-text report for operators.
    pub fn render(&self, source: &str) -> String {
        let mut out = String::new();
        let rule = "=".repeat(80);
        out.push_str(&format!("{rule}\nANALYSIS REPORT FOR: {source}\n{rule}\n"));
        out.push_str(&format!("Total records: {}\n", self.total_count));
        if self.non_object_records > 0 {
            out.push_str(&format!(
                "Non-object records: {}\n",
                self.non_object_records
            ));
        }
        for (i, record) in self.sample_records.iter().enumerate() {
            out.push_str(&format!("\n--- Record {} ---\n", i + 1));
            out.push_str(
                &serde_json::to_string_pretty(record).unwrap_or_else(|_| "<unprintable>".into()),
            );
            out.push('\n');
        }
        out.push_str("\n--- Top-Level Key Presence ---\n");
        out.push_str(&format!(
            "{:<35} {:>12} {:>10}\n",
            "Key Name", "Occurrences", "Percent"
        ));
        let mut keys: Vec<(&String, &u64)> = self.key_presence.iter().collect();
        keys.sort_by(|a, b| b.1.cmp(a.1));
        for (key, count) in keys {
            out.push_str(&format!(
                "{:<35} {:>12} {:>9.2}%\n",
                key,
                count,
                self.key_percentage(*count)
            ));
        }
        out
    }
}

/// Analyze a batch file or a whole batch directory, keeping the first
/// `sample_size` records as previews.
pub fn analyze(path: &Path, sample_size: usize) -> Result<StructureReport> {
    let mut report = StructureReport::default();
    let total = stream::stream_collection(path, |record| {
        if report.sample_records.len() < sample_size {
            report.sample_records.push(record.clone());
        }
        match record.as_object() {
            Some(map) => {
                for key in map.keys() {
                    *report.key_presence.entry(key.clone()).or_insert(0) += 1;
                }
            }
            None => report.non_object_records += 1,
        }
        Ok(())
    })?;
    report.total_count = total;
    info!(
        source = %path.display(),
        records = report.total_count,
        distinct_keys = report.key_presence.len(),
        "structural analysis complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_batch(dir: &Path, name: &str, records: Value) {
        std::fs::write(dir.join(name), records.to_string()).unwrap();
    }

    #[test]
    fn counts_samples_and_key_presence() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(
            dir.path(),
            "steam_data_batch_00001.json",
            json!([
                {"success": true, "data": {"steam_appid": 10}},
                {"success": false},
                {"success": true, "data": {"steam_appid": 20}},
            ]),
        );

        let report = analyze(dir.path(), 2).unwrap();
        assert_eq!(report.total_count, 3);
        assert_eq!(report.sample_records.len(), 2);
        assert_eq!(report.key_presence.get("success"), Some(&3));
        assert_eq!(report.key_presence.get("data"), Some(&2));
        assert!((report.key_percentage(2) - 66.666).abs() < 0.01);
    }

    #[test]
    fn tolerates_non_object_records() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(
            dir.path(),
            "steam_data_batch_00001.json",
            json!([{"a": 1}, 42, null]),
        );
        let report = analyze(dir.path(), 3).unwrap();
        assert_eq!(report.total_count, 3);
        assert_eq!(report.non_object_records, 2);
    }

    #[test]
    fn renders_without_panicking_on_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(dir.path(), "steam_data_batch_00001.json", json!([]));
        let report = analyze(dir.path(), 3).unwrap();
        let text = report.render("steam_data_batch_00001.json");
        assert!(text.contains("Total records: 0"));
    }
}
