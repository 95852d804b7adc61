use crate::drivers::WorkloadRunResult;
use parking_lot::RwLock;
use std::{collections::BTreeMap, fmt, sync::Arc, time::SystemTime};
use tracing::error;

/// tag identifying which driver or maintenance task owns a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Workload { name: String },
    HealthCheck,
    SupportBundle,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workload { name } => write!(f, "workload/{name}"),
            Self::HealthCheck => write!(f, "health-check"),
            Self::SupportBundle => write!(f, "support-bundle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Started,
    Done,
}

/// terminal result of a supervised process
/// only a failed `Workload` outcome participates in the abort decision,
/// maintenance tasks are best-effort auxiliary operations
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Workload(WorkloadRunResult),
    Maintenance { success: bool, note: String },
}

/// state entry tracking one supervised OS process from launch to terminal result
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub kind: TaskKind,
    pub state: ProcState,
    pub started_at: SystemTime,
    pub outcome: Option<TaskOutcome>,
}

impl ProcessRecord {
    pub fn started(pid: u32, kind: TaskKind) -> Self {
        Self {
            pid,
            kind,
            state: ProcState::Started,
            started_at: SystemTime::now(),
            outcome: None,
        }
    }

    pub fn is_workload_failure(&self) -> bool {
        matches!(
            self.outcome,
            Some(TaskOutcome::Workload(ref result)) if !result.success
        )
    }
}

/// concurrent-safe table of in-flight and completed process records
///
/// Writers are the supervising threads (one per process), the reader is the
/// controller's poll loop. A snapshot never observes a half-written record.
/// Records are never removed while the run is active so the final summary
/// can report every process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RwLock<BTreeMap<u32, ProcessRecord>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, record: ProcessRecord) {
        self.inner.write().insert(record.pid, record);
    }

    /// atomically mutate the record for `pid`
    /// an unknown pid is a programming-invariant violation, not a user error
    pub fn update<F>(&self, pid: u32, mutator: F) -> bool
    where
        F: FnOnce(&mut ProcessRecord),
    {
        match self.inner.write().get_mut(&pid) {
            Some(record) => {
                mutator(record);
                true
            }
            None => {
                error!(pid, "attempted to update an unregistered process record");
                false
            }
        }
    }

    /// mark a record Done with its terminal outcome, exactly once
    pub fn complete(&self, pid: u32, outcome: TaskOutcome) {
        self.update(pid, |record| {
            if record.state == ProcState::Done {
                error!(pid, kind = %record.kind, "process record completed twice");
                return;
            }
            record.state = ProcState::Done;
            record.outcome = Some(outcome);
        });
    }

    pub fn snapshot(&self) -> Vec<ProcessRecord> {
        self.inner.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn record_transitions_started_to_done_once() {
        let registry = ProcessRegistry::new();
        registry.put(ProcessRecord::started(42, TaskKind::HealthCheck));

        registry.complete(
            42,
            TaskOutcome::Maintenance {
                success: true,
                note: String::new(),
            },
        );
        // second completion must not overwrite the first outcome
        registry.complete(
            42,
            TaskOutcome::Maintenance {
                success: false,
                note: "late".into(),
            },
        );

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].state, ProcState::Done);
        match snap[0].outcome {
            Some(TaskOutcome::Maintenance { success, .. }) => assert!(success),
            ref other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn concurrent_writers_and_snapshots() {
        let registry = ProcessRegistry::new();
        let writers: Vec<_> = (0..8u32)
            .map(|pid| {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry.put(ProcessRecord::started(pid, TaskKind::SupportBundle));
                    registry.complete(
                        pid,
                        TaskOutcome::Maintenance {
                            success: true,
                            note: String::new(),
                        },
                    );
                })
            })
            .collect();

        // reader racing the writers must only ever see whole records
        for _ in 0..100 {
            for record in registry.snapshot() {
                if record.state == ProcState::Done {
                    assert!(record.outcome.is_some());
                }
            }
        }

        for writer in writers {
            writer.join().unwrap();
        }

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 8);
        assert!(snap.iter().all(|r| r.state == ProcState::Done));
    }

    #[test]
    fn update_on_unknown_pid_is_rejected() {
        let registry = ProcessRegistry::new();
        assert!(!registry.update(7, |_| panic!("must not run")));
    }
}
