//! Five-stage validation framework.
//!
//! Stages 1-3 run against the raw batch collections on disk; stages 4 and 5
//! run against the target store. Every check produces findings with a
//! severity; the overall status of a run is the maximum severity observed,
//! and a CRITICAL stage halts the sequence because later stages would only
//! report noise derived from the same corruption.

mod raw;
mod store;

use std::path::Path;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub stage: u8,
    pub severity: Severity,
    pub message: String,
    /// How many records/rows the finding covers.
    pub affected: u64,
}

#[derive(Debug, Serialize)]
pub struct StageReport {
    pub stage: u8,
    pub name: &'static str,
    /// Records or rows examined by the stage.
    pub checked: u64,
    pub findings: Vec<Finding>,
}

impl StageReport {
    pub fn new(stage: u8, name: &'static str) -> Self {
        Self {
            stage,
            name,
            checked: 0,
            findings: Vec::new(),
        }
    }

    pub fn add(&mut self, severity: Severity, message: impl Into<String>, affected: u64) {
        self.findings.push(Finding {
            stage: self.stage,
            severity,
            message: message.into(),
            affected,
        });
    }

    /// Worst finding in the stage; a clean stage is Info.
    pub fn severity(&self) -> Severity {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Info)
    }
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub stages: Vec<StageReport>,
    /// True when a CRITICAL stage stopped the sequence early.
    pub halted: bool,
}

impl ValidationReport {
    pub fn overall(&self) -> Severity {
        self.stages
            .iter()
            .map(StageReport::severity)
            .max()
            .unwrap_or(Severity::Info)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Validation Report\n\n");
        out.push_str(&format!("Overall status: **{}**\n", self.overall()));
        if self.halted {
            out.push_str("\n> Run halted early: a CRITICAL stage stops the sequence.\n");
        }
        for stage in &self.stages {
            out.push_str(&format!(
                "\n## Stage {}: {} ({})\n\n",
                stage.stage,
                stage.name,
                stage.severity()
            ));
            out.push_str(&format!("Checked: {}\n", stage.checked));
            if stage.findings.is_empty() {
                out.push_str("\nNo findings.\n");
                continue;
            }
            out.push_str("\n| Severity | Affected | Finding |\n|---|---|---|\n");
            for f in &stage.findings {
                out.push_str(&format!(
                    "| {} | {} | {} |\n",
                    f.severity, f.affected, f.message
                ));
            }
        }
        out
    }
}

/// Run the validation sequence. `only` restricts the run to a single stage;
/// otherwise stages execute in order 1 through 5 and a CRITICAL stage halts
/// the sequence. `db` may be None when only raw stages run.
pub async fn run(
    games_dir: &Path,
    db: Option<&Db>,
    only: Option<u8>,
) -> Result<ValidationReport> {
    let stages: Vec<u8> = match only {
        Some(n) if (1..=5).contains(&n) => vec![n],
        Some(n) => bail!("unknown validation stage {n}; stages are 1 through 5"),
        None => vec![1, 2, 3, 4, 5],
    };

    let mut report = ValidationReport {
        stages: Vec::new(),
        halted: false,
    };

    for stage in stages {
        let stage_report = match stage {
            1 => raw::response_shape(games_dir)?,
            2 => raw::field_checks(games_dir)?,
            3 => raw::business_rules(games_dir)?,
            4 | 5 => {
                let Some(db) = db else {
                    bail!("validation stage {stage} requires a store connection");
                };
                if stage == 4 {
                    store::constraints(db).await?
                } else {
                    store::materialization(db).await?
                }
            }
            _ => unreachable!(),
        };
        let severity = stage_report.severity();
        info!(stage, %severity, findings = stage_report.findings.len(), "validation stage complete");
        report.stages.push(stage_report);
        if severity == Severity::Critical && only.is_none() {
            warn!(stage, "CRITICAL finding; halting validation sequence");
            report.halted = true;
            break;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_is_totally_ordered() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
        assert_eq!(
            [Severity::Warning, Severity::Critical, Severity::Info]
                .into_iter()
                .max(),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn stage_severity_is_worst_finding_and_clean_is_info() {
        let mut stage = StageReport::new(2, "field checks");
        assert_eq!(stage.severity(), Severity::Info);
        stage.add(Severity::Warning, "metacritic out of range", 1);
        stage.add(Severity::Error, "duplicate appid", 2);
        assert_eq!(stage.severity(), Severity::Error);
    }

    #[test]
    fn overall_is_max_across_stages() {
        let mut a = StageReport::new(1, "shape");
        a.add(Severity::Info, "fine", 0);
        let mut b = StageReport::new(3, "rules");
        b.add(Severity::Error, "bad", 3);
        let report = ValidationReport {
            stages: vec![a, b],
            halted: false,
        };
        assert_eq!(report.overall(), Severity::Error);
    }

    #[tokio::test]
    async fn critical_raw_stage_halts_before_store_stages() {
        let dir = tempfile::tempdir().unwrap();
        // An unparseable batch file is a collection-integrity failure.
        std::fs::write(dir.path().join("steam_data_batch_00001.json"), "{ not json").unwrap();

        let report = run(dir.path(), None, None).await.unwrap();
        assert!(report.halted);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].stage, 1);
        assert_eq!(report.overall(), Severity::Critical);
        // Stages 4 and 5 were never reached, so the missing store connection
        // never mattered.
    }

    #[tokio::test]
    async fn clean_raw_stages_all_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("steam_data_batch_00001.json"),
            json!([{
                "success": true,
                "data": {"steam_appid": 10, "name": "A", "type": "game", "is_free": false}
            }])
            .to_string(),
        )
        .unwrap();

        let report = run(dir.path(), None, Some(3)).await.unwrap();
        assert!(!report.halted);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.overall(), Severity::Info);
    }

    #[tokio::test]
    async fn store_stage_without_connection_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path(), None, Some(4)).await.is_err());
    }

    #[test]
    fn markdown_report_carries_overall_and_findings() {
        let mut stage = StageReport::new(2, "field and range checks");
        stage.checked = 10;
        stage.add(Severity::Warning, "metacritic score out of range", 2);
        let report = ValidationReport {
            stages: vec![stage],
            halted: false,
        };
        let md = report.render_markdown();
        assert!(md.contains("Overall status: **WARNING**"));
        assert!(md.contains("metacritic score out of range"));
        assert!(report.to_json().unwrap().contains("\"affected\": 2"));
    }
}
