use super::{scan, scan::ScanTable, BenchTool, ReportError};
use crate::config::{TargetConfig, ToolConfig, WorkloadSpec};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::debug;

/// operations warp can report, matched case-sensitively
pub const ALLOWED_OPS: &[&str] = &["Put", "Get", "Stat", "Delete"];

/// driver for the wall-time-bound warp tool
///
/// warp runs for a requested `--duration`, so each iteration is handed the
/// remaining budget and normally exits on its own just before the deadline.
#[derive(Clone, Debug)]
pub struct WarpDriver {
    exec: PathBuf,
    params: Vec<String>,
}

impl WarpDriver {
    pub fn new(tool: &ToolConfig) -> Self {
        Self {
            exec: tool.exec.clone(),
            params: tool.params.clone(),
        }
    }
}

#[derive(Deserialize)]
struct Report {
    operations: Vec<OpEntry>,
}

#[derive(Deserialize)]
struct OpEntry {
    #[serde(rename = "type")]
    operation: String,
    errors: u64,
}

/// warp reports upper-case operation names, fold them onto the allow-list
fn normalize_op(raw: &str) -> Option<&'static str> {
    match raw {
        "PUT" | "Put" => Some("Put"),
        "GET" | "Get" => Some("Get"),
        "STAT" | "Stat" => Some("Stat"),
        "DELETE" | "Delete" => Some("Delete"),
        _ => None,
    }
}

impl BenchTool for WarpDriver {
    fn kind(&self) -> &'static str {
        "warp"
    }

    fn build_command(
        &self,
        spec: &WorkloadSpec,
        target: &TargetConfig,
        remaining: Duration,
        report: &Path,
    ) -> Command {
        // warp rejects a zero duration outright
        let duration_secs = remaining.as_secs().max(1);
        let mut command = Command::new(&self.exec);
        command
            .args(&self.params)
            .arg("mixed")
            .arg("--host")
            .arg(&target.endpoint)
            .arg("--access-key")
            .arg(&target.access_key)
            .arg("--secret-key")
            .arg(&target.secret_key)
            .arg("--bucket")
            .arg(&target.bucket)
            .arg("--concurrent")
            .arg(spec.clients.to_string())
            .arg("--obj.size")
            .arg(spec.object_size.to_string())
            .arg("--duration")
            .arg(format!("{duration_secs}s"))
            .arg("--report-file")
            .arg(report);
        command
    }

    fn parse_report(&self, path: &Path) -> Result<Vec<(String, u64)>, ReportError> {
        let data = fs::read_to_string(path)?;
        let report: Report = serde_json::from_str(&data)?;
        Ok(report
            .operations
            .into_iter()
            .filter_map(|entry| match normalize_op(&entry.operation) {
                Some(op) => Some((op.to_string(), entry.errors)),
                None => {
                    debug!(operation = %entry.operation, "unrecognized operation in warp report");
                    None
                }
            })
            .collect())
    }

    fn scan_table(&self) -> &'static ScanTable {
        &scan::WARP_TABLE
    }
}
