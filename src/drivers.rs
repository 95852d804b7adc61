pub mod s3bench;
pub mod scan;
pub mod warp;

use crate::{
    config::{ConfigErrors, TargetConfig, ToolConfig, WorkloadSpec},
    registry::{TaskKind, TaskOutcome},
    supervisor::{ProcessSupervisor, SupervisorError},
};
use scan::ScanTable;
use std::{
    collections::BTreeMap,
    fmt, fs,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// substituted when a workload has no configured duration, effectively
/// "run until externally told to stop"
pub const DEFAULT_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// a leftover budget below this cannot fit a useful iteration, the loop
/// exits cleanly instead of spawning a tool only to kill it
const MIN_ITERATION_BUDGET: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to create artifact {}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("supervisor failure")]
    Supervisor(#[from] SupervisorError),
}

#[derive(Error, Debug)]
pub(crate) enum ReportError {
    #[error("failed to read report file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to deserialize report: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// how a verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// derived from a parsed structured report
    Definitive,
    /// derived from the console-log fallback scan
    Degraded,
}

/// error count for one operation, `Unknown` when the log could not be
/// attributed unambiguously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpErrors {
    Counted(u64),
    Unknown,
}

impl fmt::Display for OpErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counted(errors) => write!(f, "{errors}"),
            Self::Unknown => write!(f, "NA"),
        }
    }
}

/// outcome of one workload execution, immutable once produced
#[derive(Debug, Clone)]
pub struct WorkloadRunResult {
    pub success: bool,
    /// terminated by the deadline rather than exiting on its own
    pub timed_out: bool,
    pub confidence: Confidence,
    pub op_errors: BTreeMap<String, OpErrors>,
    /// fatal substring matched in the console log, if any
    pub fatal_marker: Option<String>,
    pub iterations: u32,
}

impl WorkloadRunResult {
    /// synthetic failure for a driver that could not run its tool at all
    pub fn driver_failure(operations: &[String]) -> Self {
        Self {
            success: false,
            timed_out: false,
            confidence: Confidence::Degraded,
            op_errors: operations
                .iter()
                .map(|op| (op.clone(), OpErrors::Unknown))
                .collect(),
            fatal_marker: None,
            iterations: 0,
        }
    }
}

/// everything a driver needs besides the workload spec itself
pub struct DriverCtx {
    pub target: TargetConfig,
    pub artifact_dir: PathBuf,
    pub supervisor: ProcessSupervisor,
    /// global stop request; no new iteration starts once set
    pub stop: Arc<AtomicBool>,
}

/// one benchmark tool behind the common iterate/supervise/classify loop
pub(crate) trait BenchTool {
    fn kind(&self) -> &'static str;

    /// flat argument list: endpoint, credentials, op mix, concurrency,
    /// object size, report path; console output is redirected by the loop
    fn build_command(
        &self,
        spec: &WorkloadSpec,
        target: &TargetConfig,
        remaining: Duration,
        report: &Path,
    ) -> Command;

    /// per-operation error counts from the structured report, names already
    /// normalized to the driver's allow-list
    fn parse_report(&self, path: &Path) -> Result<Vec<(String, u64)>, ReportError>;

    fn scan_table(&self) -> &'static ScanTable;
}

/// the two driver variants
/// (enum dispatch instead of trait objects, selection happens once at load)
#[derive(Clone, Debug)]
pub enum Drivers {
    S3bench(s3bench::S3benchDriver),
    Warp(warp::WarpDriver),
}

impl Drivers {
    pub fn load(tool: &ToolConfig) -> Result<Self, ConfigErrors> {
        match tool.kind.as_str() {
            "s3bench" => Ok(Self::S3bench(s3bench::S3benchDriver::new(tool))),
            "warp" => Ok(Self::Warp(warp::WarpDriver::new(tool))),
            _ => Err(ConfigErrors::UnsupportedTool(tool.kind.clone())),
        }
    }

    pub fn run(
        &self,
        workload: &str,
        spec: &WorkloadSpec,
        ctx: &DriverCtx,
    ) -> Result<WorkloadRunResult, DriverError> {
        match self {
            Self::S3bench(driver) => run_workload(driver, workload, spec, ctx),
            Self::Warp(driver) => run_workload(driver, workload, spec, ctx),
        }
    }
}

/// fixed, case-sensitive operation allow-list for a tool kind
pub fn allowed_ops(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "s3bench" => Some(s3bench::ALLOWED_OPS),
        "warp" => Some(warp::ALLOWED_OPS),
        _ => None,
    }
}

fn verdict(
    op_errors: BTreeMap<String, OpErrors>,
    confidence: Confidence,
    timed_out: bool,
    fatal_marker: Option<String>,
    iterations: u32,
) -> WorkloadRunResult {
    let success = fatal_marker.is_none()
        && op_errors
            .values()
            .all(|count| !matches!(count, OpErrors::Counted(errors) if *errors > 0));
    WorkloadRunResult {
        success,
        timed_out,
        confidence,
        op_errors,
        fatal_marker,
        iterations,
    }
}

/// fold report entries onto the configured operations, later entries for the
/// same operation override earlier ones
fn fold_report(entries: Vec<(String, u64)>, operations: &[String]) -> BTreeMap<String, OpErrors> {
    let mut counts: BTreeMap<String, OpErrors> = operations
        .iter()
        .map(|op| (op.clone(), OpErrors::Unknown))
        .collect();
    for (operation, errors) in entries {
        match counts.get_mut(&operation) {
            Some(slot) => *slot = OpErrors::Counted(errors),
            None => debug!(operation = %operation, "report entry outside the configured mix"),
        }
    }
    counts
}

fn scan_verdict<T: BenchTool>(
    tool: &T,
    spec: &WorkloadSpec,
    console_path: &Path,
    timed_out: bool,
    iterations: u32,
) -> WorkloadRunResult {
    let console = fs::read_to_string(console_path).unwrap_or_default();
    let scanned = scan::scan_console(&console, &spec.operations, tool.scan_table());
    verdict(
        scanned.counts,
        Confidence::Degraded,
        timed_out,
        scanned.fatal_marker,
        iterations,
    )
}

/// run one workload to its absolute finish time, one supervised process per
/// iteration, and classify the result
fn run_workload<T: BenchTool>(
    tool: &T,
    workload: &str,
    spec: &WorkloadSpec,
    ctx: &DriverCtx,
) -> Result<WorkloadRunResult, DriverError> {
    let total = Duration::from_secs(spec.duration.unwrap_or(DEFAULT_DURATION_SECS));
    let finish = Instant::now() + total;
    let mut iteration: u32 = 0;

    loop {
        iteration += 1;
        // iteration counter lands in both artifact names so restarted tools
        // never clobber an earlier iteration's evidence
        let report_path = ctx
            .artifact_dir
            .join(format!("{workload}-it{iteration}.report.json"));
        let console_path = ctx
            .artifact_dir
            .join(format!("{workload}-it{iteration}.console.log"));

        let console = File::create(&console_path).map_err(|source| DriverError::Artifact {
            path: console_path.clone(),
            source,
        })?;
        let console_err = console.try_clone().map_err(|source| DriverError::Artifact {
            path: console_path.clone(),
            source,
        })?;

        let remaining = finish.saturating_duration_since(Instant::now());
        let mut command = tool.build_command(spec, &ctx.target, remaining, &report_path);
        command
            .stdout(Stdio::from(console))
            .stderr(Stdio::from(console_err));

        info!(workload, iteration, tool = tool.kind(), "starting benchmark iteration");
        let mut child = ctx.supervisor.spawn(
            command,
            TaskKind::Workload {
                name: workload.to_string(),
            },
        )?;
        let pid = child.id();

        let status = ctx.supervisor.wait_with_deadline(&mut child, remaining)?;
        let result = match status {
            None => {
                warn!(workload, pid, "deadline elapsed, terminating process group");
                ctx.supervisor.terminate(pid);
                ctx.supervisor.ensure_exit(&mut child)?;
                // no structured report is guaranteed complete after a forced
                // kill, judge from whatever log evidence exists
                scan_verdict(tool, spec, &console_path, true, iteration)
            }
            Some(status) => {
                debug!(workload, pid, code = status.code(), "process exited on its own");
                match tool.parse_report(&report_path) {
                    Ok(entries) => verdict(
                        fold_report(entries, &spec.operations),
                        Confidence::Definitive,
                        false,
                        None,
                        iteration,
                    ),
                    Err(error) => {
                        warn!(
                            workload,
                            %error,
                            report = %report_path.display(),
                            "report unusable, falling back to console scan"
                        );
                        scan_verdict(tool, spec, &console_path, false, iteration)
                    }
                }
            }
        };

        ctx.supervisor
            .complete(pid, TaskOutcome::Workload(result.clone()));

        let stop_requested = ctx.stop.load(Ordering::Relaxed);
        let leftover = finish.saturating_duration_since(Instant::now());
        if !result.success || result.timed_out || stop_requested || leftover < MIN_ITERATION_BUDGET
        {
            if stop_requested {
                debug!(workload, "stop requested, not starting another iteration");
            }
            return Ok(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProcessRegistry;
    use std::{io::Write, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn ops(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn target() -> TargetConfig {
        TargetConfig {
            endpoint: "http://127.0.0.1:9000".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            bucket: "bucket".into(),
        }
    }

    fn spec(duration: Option<u64>, operations: &[&str]) -> WorkloadSpec {
        WorkloadSpec {
            tool: "s3bench".into(),
            start_after: 0,
            duration,
            operations: ops(operations),
            clients: 2,
            samples: 10,
            object_size: 1024,
            priority: 10,
        }
    }

    /// write an executable stand-in for the benchmark binary
    fn fake_tool(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-s3bench");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        drop(file);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// sh fragment that finds the report path in the argument list
    const FIND_REPORT: &str = r#"report=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-jsonOutputToFile" ]; then report="$2"; fi
  shift
done"#;

    fn ctx(dir: &TempDir) -> DriverCtx {
        DriverCtx {
            target: target(),
            artifact_dir: dir.path().to_path_buf(),
            supervisor: ProcessSupervisor::with_intervals(
                ProcessRegistry::new(),
                Duration::from_millis(50),
                Duration::from_millis(500),
            ),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn report_counts_decide_the_verdict() {
        let entries = vec![("Write".to_string(), 0), ("Read".to_string(), 2)];
        let result = verdict(
            fold_report(entries, &ops(&["Write", "Read"])),
            Confidence::Definitive,
            false,
            None,
            1,
        );

        assert!(!result.success);
        assert_eq!(result.op_errors["Write"], OpErrors::Counted(0));
        assert_eq!(result.op_errors["Read"], OpErrors::Counted(2));
        assert_eq!(result.confidence, Confidence::Definitive);
    }

    #[test]
    fn unknown_counts_alone_do_not_fail_a_run() {
        let result = verdict(
            fold_report(Vec::new(), &ops(&["Write"])),
            Confidence::Degraded,
            false,
            None,
            1,
        );
        assert!(result.success);
        assert_eq!(result.op_errors["Write"], OpErrors::Unknown);
    }

    #[test]
    fn unknown_tool_kind_is_rejected() {
        let tool = ToolConfig {
            kind: "iometer".into(),
            exec: PathBuf::from("/bin/true"),
            params: Vec::new(),
        };
        assert!(matches!(
            Drivers::load(&tool),
            Err(ConfigErrors::UnsupportedTool(_))
        ));
    }

    #[test]
    fn clean_report_ends_iteration_loop_at_finish_time() {
        let dir = TempDir::new().unwrap();
        let exec = fake_tool(
            &dir,
            &format!(
                "{FIND_REPORT}\n\
                 echo '{{\"Tests\":[{{\"Operation\":\"Write\",\"Total Errors\":0}}]}}' > \"$report\""
            ),
        );
        let driver = Drivers::S3bench(s3bench::S3benchDriver::new(&ToolConfig {
            kind: "s3bench".into(),
            exec,
            params: Vec::new(),
        }));

        let result = driver
            .run("clean", &spec(Some(1), &["Write"]), &ctx(&dir))
            .unwrap();

        assert!(result.success);
        assert!(!result.timed_out);
        assert_eq!(result.confidence, Confidence::Definitive);
        assert!(result.iterations >= 1);
    }

    #[test]
    fn failing_report_returns_without_further_iterations() {
        let dir = TempDir::new().unwrap();
        let exec = fake_tool(
            &dir,
            &format!(
                "{FIND_REPORT}\n\
                 echo '{{\"Tests\":[{{\"Operation\":\"Write\",\"Total Errors\":4}}]}}' > \"$report\""
            ),
        );
        let driver = Drivers::S3bench(s3bench::S3benchDriver::new(&ToolConfig {
            kind: "s3bench".into(),
            exec,
            params: Vec::new(),
        }));

        let result = driver
            .run("failing", &spec(Some(30), &["Write"]), &ctx(&dir))
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.op_errors["Write"], OpErrors::Counted(4));
    }

    #[test]
    fn missing_report_falls_back_to_console_scan() {
        let dir = TempDir::new().unwrap();
        let exec = fake_tool(&dir, "echo 'panic: lost connection to endpoint'");
        let driver = Drivers::S3bench(s3bench::S3benchDriver::new(&ToolConfig {
            kind: "s3bench".into(),
            exec,
            params: Vec::new(),
        }));

        let result = driver
            .run("degraded", &spec(Some(30), &["Write"]), &ctx(&dir))
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.confidence, Confidence::Degraded);
        assert_eq!(result.fatal_marker.as_deref(), Some("panic: "));
        assert_eq!(result.op_errors["Write"], OpErrors::Unknown);
    }

    #[test]
    fn deadline_kill_produces_a_degraded_timeout_verdict() {
        let dir = TempDir::new().unwrap();
        // never writes a report, must be killed at the deadline
        let exec = fake_tool(&dir, "sleep 30");
        let driver = Drivers::S3bench(s3bench::S3benchDriver::new(&ToolConfig {
            kind: "s3bench".into(),
            exec,
            params: Vec::new(),
        }));

        let result = driver
            .run("stuck", &spec(Some(1), &["Write", "Read"]), &ctx(&dir))
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.confidence, Confidence::Degraded);
        assert_eq!(result.op_errors["Write"], OpErrors::Unknown);
        assert_eq!(result.op_errors["Read"], OpErrors::Unknown);
    }
}
