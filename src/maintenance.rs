use crate::{
    config::MaintenanceTask,
    registry::{TaskKind, TaskOutcome},
    supervisor::ProcessSupervisor,
};
use std::{process::Command, time::Duration};
use tracing::{debug, info, warn};

/// one periodic auxiliary task (health check or support-bundle collection)
///
/// Maintenance tasks run under the same supervision as workloads and land in
/// the same registry, but their failures are recorded and logged rather than
/// escalated: they are not part of the run's pass/fail contract.
#[derive(Debug, Clone)]
pub struct MaintenanceRunner {
    task: MaintenanceTask,
    kind: TaskKind,
    supervisor: ProcessSupervisor,
}

impl MaintenanceRunner {
    pub fn new(task: MaintenanceTask, kind: TaskKind, supervisor: ProcessSupervisor) -> Self {
        Self {
            task,
            kind,
            supervisor,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.task.interval)
    }

    /// run one invocation to completion or its timeout; never escalates
    pub fn run_once(&self) {
        let mut command = Command::new(&self.task.exec);
        command.args(&self.task.params);

        let mut child = match self.supervisor.spawn(command, self.kind.clone()) {
            Ok(child) => child,
            Err(error) => {
                warn!(kind = %self.kind, %error, "failed to launch maintenance task");
                return;
            }
        };
        let pid = child.id();

        let (success, note) = match self
            .supervisor
            .wait_with_deadline(&mut child, Duration::from_secs(self.task.timeout))
        {
            Ok(Some(status)) => (status.success(), format!("exit code {:?}", status.code())),
            Ok(None) => {
                warn!(kind = %self.kind, pid, "maintenance task hit its timeout");
                self.supervisor.terminate(pid);
                if let Err(error) = self.supervisor.ensure_exit(&mut child) {
                    warn!(kind = %self.kind, pid, %error, "failed to reap maintenance task");
                }
                (false, "terminated by timeout".to_string())
            }
            Err(error) => {
                warn!(kind = %self.kind, pid, %error, "failed to wait for maintenance task");
                (false, format!("wait failed: {error}"))
            }
        };

        if success {
            debug!(kind = %self.kind, pid, "maintenance task passed");
        } else {
            // logged but never aborts the run
            warn!(kind = %self.kind, pid, note = %note, "maintenance task failed");
        }

        self.supervisor
            .complete(pid, TaskOutcome::Maintenance { success, note });
    }
}

/// log-only visibility for operators following a long run
pub fn log_schedule(kind: &TaskKind, interval: Duration) {
    info!(kind = %kind, interval_secs = interval.as_secs(), "periodic maintenance armed");
}
