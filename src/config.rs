use crate::drivers;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::error;

// check if a file exists and carries an executable bit
pub fn check_executable(path: &PathBuf) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("Tool kind not supported: {0}")]
    UnsupportedTool(String),
    #[error("Workload references undefined tool: {0}")]
    UnknownTool(String),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(std::io::Error),
    #[error("Configuration failed preflight checks")]
    PreflightFailed,
}

/// declarative description of one whole run
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    // endpoint and credentials handed verbatim to the benchmark tools
    pub target: TargetConfig,
    // benchmark tools as generic executables with fixed parameters
    pub tools: BTreeMap<String, ToolConfig>,
    pub workloads: BTreeMap<String, WorkloadSpec>,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// seconds between registry polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    // selects the driver, see Drivers::load
    pub kind: String,
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    pub tool: String,
    /// launch offset from run start, seconds
    #[serde(default)]
    pub start_after: u64,
    /// seconds; unset means run until the controller stops the run
    pub duration: Option<u64>,
    pub operations: Vec<String>,
    pub clients: u32,
    #[serde(default = "default_samples")]
    pub samples: u64,
    pub object_size: u64,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceConfig {
    pub health_check: Option<MaintenanceTask>,
    pub support_bundle: Option<MaintenanceTask>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceTask {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    /// seconds between invocations
    pub interval: u64,
    /// seconds one invocation may take before it is cut off
    pub timeout: u64,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// validate everything that must hold before any process starts
    ///
    /// Attempts to catch all errors instead of piece-by-piece to make
    /// debugging easier for users. Returns true if any check failed.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.workloads.is_empty() {
            error!("No workload was defined, nothing to schedule");
            contains_error = true;
        }

        for (name, tool) in self.tools.iter() {
            if drivers::allowed_ops(&tool.kind).is_none() {
                error!(
                    "tools.{name}.kind ({}) is not supported, use `s3bench` or `warp`",
                    tool.kind
                );
                contains_error = true;
            }

            // a missing benchmark binary is setup-fatal, not retryable
            match check_executable(&tool.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "tools.{name}.exec ({}) is not executable",
                        tool.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to find tools.{name}.exec at {}: {e}",
                        tool.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        for (name, workload) in self.workloads.iter() {
            match self.tools.get(&workload.tool) {
                None => {
                    let tool = &workload.tool;
                    error!("Workload {name} references {tool} but {tool} is not defined in tools");
                    contains_error = true;
                }
                Some(tool) => {
                    if let Some(allowed) = drivers::allowed_ops(&tool.kind) {
                        for op in workload.operations.iter() {
                            if !allowed.contains(&op.as_str()) {
                                error!(
                                    "Workload {name} operation {op} is not supported by {}",
                                    tool.kind
                                );
                                contains_error = true;
                            }
                        }
                    }
                }
            }

            if workload.operations.is_empty() {
                error!("Workload {name} has an empty operation mix");
                contains_error = true;
            }

            if workload.duration == Some(0) {
                error!("Workload {name}.duration cannot be 0, leave it unset to run unbounded");
                contains_error = true;
            }

            if workload.clients == 0 {
                error!("Workload {name}.clients cannot be 0");
                contains_error = true;
            }
        }

        for (name, task) in [
            ("health_check", &self.maintenance.health_check),
            ("support_bundle", &self.maintenance.support_bundle),
        ] {
            let Some(task) = task else { continue };

            if task.interval == 0 || task.timeout == 0 {
                error!("maintenance.{name} interval and timeout must be nonzero");
                contains_error = true;
            }

            match check_executable(&task.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "maintenance.{name}.exec ({}) is not executable",
                        task.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to find maintenance.{name}.exec at {}: {e}",
                        task.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if self.controller.poll_interval == 0 {
            error!("controller.poll_interval cannot be 0, that would busy-wait the poll loop");
            contains_error = true;
        }

        contains_error
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("./artifacts")
}

fn default_samples() -> u64 {
    1000
}

fn default_priority() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn executable(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        drop(file);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_yaml(exec: &Path) -> String {
        format!(
            r#"
target:
  endpoint: http://127.0.0.1:9000
  access_key: minio
  secret_key: minio123
  bucket: bench
tools:
  s3bench:
    kind: s3bench
    exec: {exec}
workloads:
  small-objects:
    tool: s3bench
    duration: 3600
    operations: [Write, Read]
    clients: 8
    object_size: 4096
"#,
            exec = exec.display()
        )
    }

    #[test]
    fn well_formed_config_parses_and_passes_preflight() {
        let dir = TempDir::new().unwrap();
        let exec = executable(&dir, "s3bench");
        let config: RunConfig = serde_yaml::from_str(&config_yaml(&exec)).unwrap();

        assert_eq!(config.controller.poll_interval, 30);
        assert_eq!(config.workloads["small-objects"].samples, 1000);
        assert_eq!(config.workloads["small-objects"].priority, 10);
        assert!(!config.preflight_checks());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let exec = executable(&dir, "s3bench");
        let yaml = config_yaml(&exec) + "unexpected_field: 1\n";
        assert!(serde_yaml::from_str::<RunConfig>(&yaml).is_err());
    }

    #[test]
    fn missing_tool_reference_fails_preflight() {
        let dir = TempDir::new().unwrap();
        let exec = executable(&dir, "s3bench");
        let mut config: RunConfig = serde_yaml::from_str(&config_yaml(&exec)).unwrap();
        config.workloads.get_mut("small-objects").unwrap().tool = "warp".into();

        assert!(config.preflight_checks());
    }

    #[test]
    fn operation_outside_allow_list_fails_preflight() {
        let dir = TempDir::new().unwrap();
        let exec = executable(&dir, "s3bench");
        let mut config: RunConfig = serde_yaml::from_str(&config_yaml(&exec)).unwrap();
        config
            .workloads
            .get_mut("small-objects")
            .unwrap()
            .operations = vec!["Delete".into()];

        // Delete belongs to warp, not s3bench
        assert!(config.preflight_checks());
    }

    #[test]
    fn missing_binary_is_setup_fatal() {
        let dir = TempDir::new().unwrap();
        let exec = executable(&dir, "s3bench");
        let mut config: RunConfig = serde_yaml::from_str(&config_yaml(&exec)).unwrap();
        config.tools.get_mut("s3bench").unwrap().exec = PathBuf::from("/no/such/binary");

        assert!(config.preflight_checks());
    }

    #[test]
    fn zero_duration_fails_preflight() {
        let dir = TempDir::new().unwrap();
        let exec = executable(&dir, "s3bench");
        let mut config: RunConfig = serde_yaml::from_str(&config_yaml(&exec)).unwrap();
        config.workloads.get_mut("small-objects").unwrap().duration = Some(0);

        assert!(config.preflight_checks());
    }

    #[test]
    fn non_executable_file_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-executable");
        File::create(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(!check_executable(&path).unwrap());
    }
}
