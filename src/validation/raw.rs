//! Stages 1-3: streamed checks over the raw batch collections.
//!
//! Each stage is a single forward pass; memory is bounded by the duplicate
//! appid set, never by payload size.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{Severity, StageReport};
use crate::loader;
use crate::stream;

/// Stage 1: raw response shape. A batch file that fails to parse at all is
/// CRITICAL; individually malformed records are ERROR.
pub fn response_shape(games_dir: &Path) -> Result<StageReport> {
    let mut report = StageReport::new(1, "raw response shape");
    let mut non_objects = 0u64;
    let mut missing_success = 0u64;

    for path in stream::batch_files(games_dir)? {
        let result = stream::stream_file(&path, |record| {
            report.checked += 1;
            match record.as_object() {
                None => non_objects += 1,
                Some(obj) => {
                    if !obj.contains_key("success") {
                        missing_success += 1;
                    }
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            report.add(
                Severity::Critical,
                format!("batch file {} is unreadable: {err:#}", path.display()),
                1,
            );
        }
    }
    if non_objects > 0 {
        report.add(Severity::Error, "records that are not JSON objects", non_objects);
    }
    if missing_success > 0 {
        report.add(
            Severity::Error,
            "records without a success field",
            missing_success,
        );
    }
    Ok(report)
}

/// Stage 2: field, type, and range checks on successful records.
pub fn field_checks(games_dir: &Path) -> Result<StageReport> {
    let mut report = StageReport::new(2, "field and range checks");
    let mut missing_appid = 0u64;
    let mut bad_metacritic = 0u64;
    let mut duplicates = 0u64;
    let mut seen: HashSet<i64> = HashSet::new();

    stream::stream_collection(games_dir, |record| {
        report.checked += 1;
        let Some(data) = loader::record_payload(&record) else {
            return Ok(());
        };
        match data.get("steam_appid").and_then(Value::as_i64) {
            None => missing_appid += 1,
            Some(appid) => {
                if !seen.insert(appid) {
                    duplicates += 1;
                }
            }
        }
        if let Some(score) = data
            .get("metacritic")
            .and_then(|m| m.get("score"))
            .and_then(Value::as_i64)
        {
            if !(0..=100).contains(&score) {
                bad_metacritic += 1;
            }
        }
        Ok(())
    })?;

    if missing_appid > 0 {
        report.add(
            Severity::Error,
            "successful records without an integral steam_appid",
            missing_appid,
        );
    }
    if duplicates > 0 {
        report.add(
            Severity::Error,
            "duplicate appids within the collection",
            duplicates,
        );
    }
    if bad_metacritic > 0 {
        report.add(
            Severity::Warning,
            "metacritic score outside 0-100",
            bad_metacritic,
        );
    }
    Ok(report)
}

/// Stage 3: business rules the loader also enforces. Violations here mean
/// the loader will skip or repair the record; the stage makes that visible
/// before the load runs.
pub fn business_rules(games_dir: &Path) -> Result<StageReport> {
    let mut report = StageReport::new(3, "business rules");
    let mut hollow_success = 0u64;
    let mut free_with_price = 0u64;
    let mut unknown_type = 0u64;

    stream::stream_collection(games_dir, |record| {
        report.checked += 1;
        let Some(obj) = record.as_object() else {
            return Ok(());
        };
        if obj.get("success").and_then(Value::as_bool) == Some(true)
            && obj.get("data").and_then(Value::as_object).is_none()
        {
            hollow_success += 1;
            return Ok(());
        }
        let Some(data) = loader::record_payload(&record) else {
            return Ok(());
        };
        let is_free = data.get("is_free").and_then(Value::as_bool) == Some(true);
        let final_price = data
            .get("price_overview")
            .and_then(|p| p.get("final"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if is_free && final_price > 0 {
            free_with_price += 1;
        }
        if let Some(kind) = data.get("type").and_then(Value::as_str) {
            if !["game", "dlc", "software", "video", "demo", "music"].contains(&kind) {
                unknown_type += 1;
            }
        }
        Ok(())
    })?;

    if hollow_success > 0 {
        report.add(
            Severity::Error,
            "success records without a data payload",
            hollow_success,
        );
    }
    if free_with_price > 0 {
        report.add(
            Severity::Warning,
            "free applications carrying a positive final price",
            free_with_price,
        );
    }
    if unknown_type > 0 {
        report.add(
            Severity::Info,
            "applications with a type outside the known set",
            unknown_type,
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_batch(dir: &Path, records: Value) {
        std::fs::write(dir.join("steam_data_batch_00001.json"), records.to_string()).unwrap();
    }

    #[test]
    fn shape_stage_flags_non_objects_and_missing_success() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(
            dir.path(),
            json!([{"success": true, "data": {}}, 42, {"data": {}}]),
        );
        let report = response_shape(dir.path()).unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.severity(), Severity::Error);
        assert_eq!(report.findings.len(), 2);
    }

    #[test]
    fn shape_stage_marks_unreadable_file_critical() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("steam_data_batch_00001.json"), "[{broken").unwrap();
        let report = response_shape(dir.path()).unwrap();
        assert_eq!(report.severity(), Severity::Critical);
    }

    #[test]
    fn field_stage_finds_duplicates_and_range_violations() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(
            dir.path(),
            json!([
                {"success": true, "data": {"steam_appid": 10, "metacritic": {"score": 85}}},
                {"success": true, "data": {"steam_appid": 10}},
                {"success": true, "data": {"steam_appid": 20, "metacritic": {"score": 150}}},
                {"success": true, "data": {"name": "no appid"}},
                {"success": false},
            ]),
        );
        let report = field_checks(dir.path()).unwrap();
        assert_eq!(report.checked, 5);
        assert_eq!(report.severity(), Severity::Error);
        let by_msg = |needle: &str| {
            report
                .findings
                .iter()
                .find(|f| f.message.contains(needle))
                .map(|f| f.affected)
        };
        assert_eq!(by_msg("duplicate"), Some(1));
        assert_eq!(by_msg("metacritic"), Some(1));
        assert_eq!(by_msg("steam_appid"), Some(1));
    }

    #[test]
    fn business_stage_flags_free_with_price_as_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(
            dir.path(),
            json!([
                {"success": true, "data": {
                    "steam_appid": 10, "is_free": true,
                    "price_overview": {"final": 999}
                }},
                {"success": true},
            ]),
        );
        let report = business_rules(dir.path()).unwrap();
        assert_eq!(report.severity(), Severity::Error);
        assert!(report.findings.iter().any(|f| {
            f.severity == Severity::Warning && f.message.contains("free applications")
        }));
        assert!(report
            .findings
            .iter()
            .any(|f| f.severity == Severity::Error && f.message.contains("data payload")));
    }

    #[test]
    fn clean_collection_produces_no_findings() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(
            dir.path(),
            json!([{
                "success": true,
                "data": {"steam_appid": 10, "type": "game", "is_free": false,
                         "metacritic": {"score": 90}}
            }]),
        );
        for report in [
            response_shape(dir.path()).unwrap(),
            field_checks(dir.path()).unwrap(),
            business_rules(dir.path()).unwrap(),
        ] {
            assert!(report.findings.is_empty());
            assert_eq!(report.severity(), Severity::Info);
        }
    }
}
