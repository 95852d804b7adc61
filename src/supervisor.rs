use crate::registry::{ProcessRecord, ProcessRegistry, TaskKind, TaskOutcome};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// liveness poll period, fixed independent of deadline length
const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(5);
/// grace between the cooperative interrupt and a hard kill
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn process")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait on child process")]
    Wait(#[from] std::io::Error),
}

/// runs one external command to completion or forcibly stops it at a deadline
///
/// Children are spawned into their own process group so a forced stop can
/// signal the whole subtree, not just the direct child.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    registry: ProcessRegistry,
    poll_period: Duration,
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self::with_intervals(registry, DEFAULT_POLL_PERIOD, DEFAULT_KILL_GRACE)
    }

    pub fn with_intervals(
        registry: ProcessRegistry,
        poll_period: Duration,
        kill_grace: Duration,
    ) -> Self {
        Self {
            registry,
            poll_period,
            kill_grace,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// spawn the command in a fresh process group and register a Started record
    pub fn spawn(&self, mut command: Command, kind: TaskKind) -> Result<Child, SupervisorError> {
        command.process_group(0);
        let child = command.spawn().map_err(SupervisorError::Spawn)?;
        debug!(pid = child.id(), kind = %kind, "spawned process");
        self.registry.put(ProcessRecord::started(child.id(), kind));
        Ok(child)
    }

    /// poll the child until it exits or the deadline elapses
    ///
    /// `None` means the deadline elapsed first (the child is still running);
    /// the caller decides whether to terminate. The return is guaranteed no
    /// earlier than the deadline and no later than deadline + poll period.
    pub fn wait_with_deadline(
        &self,
        child: &mut Child,
        deadline: Duration,
    ) -> Result<Option<ExitStatus>, SupervisorError> {
        let start = Instant::now();
        loop {
            let remaining = match deadline.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Ok(None),
            };
            if let Some(status) = child.wait_timeout(remaining.min(self.poll_period))? {
                return Ok(Some(status));
            }
        }
    }

    /// send a cooperative interrupt to the process group
    /// an already-exited pid is a no-op, never an error
    pub fn terminate(&self, pid: u32) {
        match killpg(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) => debug!(pid, "sent SIGINT to process group"),
            Err(Errno::ESRCH) => debug!(pid, "process group already gone"),
            Err(errno) => warn!(pid, %errno, "failed to signal process group"),
        }
    }

    /// reap a terminated child, escalating to SIGKILL if it ignores the
    /// interrupt past the grace period
    pub fn ensure_exit(&self, child: &mut Child) -> Result<(), SupervisorError> {
        if child.wait_timeout(self.kill_grace)?.is_none() {
            warn!(pid = child.id(), "process ignored interrupt, sending SIGKILL");
            let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
            child.wait()?;
        }
        Ok(())
    }

    /// write the terminal state and result back into the registry
    pub fn complete(&self, pid: u32, outcome: TaskOutcome) {
        self.registry.complete(pid, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProcState;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::with_intervals(
            ProcessRegistry::new(),
            Duration::from_millis(50),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn deadline_elapses_while_process_still_runs() {
        let sup = supervisor();
        let mut cmd = Command::new("/bin/sleep");
        cmd.arg("5");
        let mut child = sup.spawn(cmd, TaskKind::HealthCheck).unwrap();

        let deadline = Duration::from_millis(200);
        let start = Instant::now();
        let status = sup.wait_with_deadline(&mut child, deadline).unwrap();

        assert!(status.is_none());
        assert!(start.elapsed() >= deadline);
        assert!(start.elapsed() < deadline + Duration::from_millis(150));

        sup.terminate(child.id());
        sup.ensure_exit(&mut child).unwrap();
    }

    #[test]
    fn natural_exit_returns_before_deadline() {
        let sup = supervisor();
        let child_cmd = Command::new("/bin/true");
        let mut child = sup.spawn(child_cmd, TaskKind::SupportBundle).unwrap();

        let status = sup
            .wait_with_deadline(&mut child, Duration::from_secs(5))
            .unwrap();
        assert!(matches!(status, Some(status) if status.success()));
    }

    #[test]
    fn terminate_after_exit_is_a_noop() {
        let sup = supervisor();
        let child_cmd = Command::new("/bin/true");
        let mut child = sup.spawn(child_cmd, TaskKind::HealthCheck).unwrap();
        sup.wait_with_deadline(&mut child, Duration::from_secs(5))
            .unwrap();

        // process is gone, this must not panic or error out
        sup.terminate(child.id());
    }

    #[test]
    fn spawn_registers_a_started_record() {
        let sup = supervisor();
        let child_cmd = Command::new("/bin/true");
        let mut child = sup.spawn(child_cmd, TaskKind::HealthCheck).unwrap();
        let pid = child.id();

        let snap = sup.registry().snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].pid, pid);
        assert_eq!(snap[0].state, ProcState::Started);

        sup.wait_with_deadline(&mut child, Duration::from_secs(5))
            .unwrap();
        sup.complete(
            pid,
            TaskOutcome::Maintenance {
                success: true,
                note: String::new(),
            },
        );
        let snap = sup.registry().snapshot();
        assert_eq!(snap[0].state, ProcState::Done);
    }
}
