use super::{scan, scan::ScanTable, BenchTool, ReportError};
use crate::config::{TargetConfig, ToolConfig, WorkloadSpec};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

/// operations s3bench can report, matched case-sensitively
pub const ALLOWED_OPS: &[&str] = &["Write", "Read", "Head", "Validate"];

/// driver for the sample-count-bound s3bench tool
///
/// s3bench sizes its run by `-numSamples`, not wall time, so the deadline is
/// enforced entirely by the supervisor.
#[derive(Clone, Debug)]
pub struct S3benchDriver {
    exec: PathBuf,
    params: Vec<String>,
}

impl S3benchDriver {
    pub fn new(tool: &ToolConfig) -> Self {
        Self {
            exec: tool.exec.clone(),
            params: tool.params.clone(),
        }
    }
}

#[derive(Deserialize)]
struct Report {
    #[serde(rename = "Tests")]
    tests: Vec<TestEntry>,
}

#[derive(Deserialize)]
struct TestEntry {
    #[serde(rename = "Operation")]
    operation: String,
    #[serde(rename = "Total Errors")]
    errors: u64,
}

impl BenchTool for S3benchDriver {
    fn kind(&self) -> &'static str {
        "s3bench"
    }

    fn build_command(
        &self,
        spec: &WorkloadSpec,
        target: &TargetConfig,
        _remaining: Duration,
        report: &Path,
    ) -> Command {
        let mut command = Command::new(&self.exec);
        command
            .args(&self.params)
            .arg("-endpoint")
            .arg(&target.endpoint)
            .arg("-accessKey")
            .arg(&target.access_key)
            .arg("-accessSecret")
            .arg(&target.secret_key)
            .arg("-bucket")
            .arg(&target.bucket)
            .arg("-numClients")
            .arg(spec.clients.to_string())
            .arg("-numSamples")
            .arg(spec.samples.to_string())
            .arg("-objectSize")
            .arg(spec.object_size.to_string())
            .arg("-operations")
            .arg(spec.operations.join(","))
            .arg("-jsonOutputToFile")
            .arg(report);
        command
    }

    fn parse_report(&self, path: &Path) -> Result<Vec<(String, u64)>, ReportError> {
        let data = fs::read_to_string(path)?;
        let report: Report = serde_json::from_str(&data)?;
        Ok(report
            .tests
            .into_iter()
            .map(|test| (test.operation, test.errors))
            .collect())
    }

    fn scan_table(&self) -> &'static ScanTable {
        &scan::S3BENCH_TABLE
    }
}
