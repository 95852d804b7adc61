use crate::{
    config::{ConfigErrors, RunConfig},
    drivers::{DriverCtx, Drivers, WorkloadRunResult},
    maintenance::{self, MaintenanceRunner},
    registry::{ProcState, ProcessRecord, ProcessRegistry, TaskKind, TaskOutcome},
    scheduler::Scheduler,
    supervisor::ProcessSupervisor,
    RunError,
};
use itertools::Itertools;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs, mem,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// maintenance events yield to workload launches at equal fire times
const MAINTENANCE_PRIORITY: u32 = 50;
/// granularity at which a sleeping poll loop notices an interrupt
const INTERRUPT_SLICE: Duration = Duration::from_millis(250);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("failed to prepare artifact directory")]
    Artifacts(#[source] std::io::Error),
}

/// exit status of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Clean,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Initializing,
    Scheduling,
    Polling,
    DrainingOk,
    Aborting,
    Stopped,
}

/// route SIGINT/SIGTERM into the poll loop's abort path
pub fn install_signal_handlers() {
    extern "C" fn on_signal(_signal: nix::libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        if signal::sigaction(Signal::SIGINT, &action).is_err() {
            warn!("failed to install SIGINT handler");
        }
        if signal::sigaction(Signal::SIGTERM, &action).is_err() {
            warn!("failed to install SIGTERM handler");
        }
    }
}

fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// sleep through one poll interval, waking early on an external interrupt
fn sleep_unless_interrupted(interval: Duration) {
    let deadline = Instant::now() + interval;
    loop {
        if interrupted() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(INTERRUPT_SLICE));
    }
}

/// owns a whole run: schedules workload launches and periodic maintenance,
/// polls the registry, and decides stop-clean versus abort
///
/// The first failing workload ends the run; maintenance failures never do.
pub struct RunController {
    config: RunConfig,
    registry: ProcessRegistry,
    scheduler: Scheduler,
    stop: Arc<AtomicBool>,
}

impl RunController {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            registry: ProcessRegistry::new(),
            scheduler: Scheduler::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn run(self) -> Result<RunStatus, RunError> {
        let mut state = RunState::Initializing;
        debug!(state = ?state, "run starting");

        fs::create_dir_all(&self.config.controller.artifact_dir)
            .map_err(ControllerError::Artifacts)?;
        let supervisor = ProcessSupervisor::new(self.registry.clone());

        // resolve every driver up front, an unknown kind is setup-fatal
        let mut drivers: BTreeMap<String, Drivers> = BTreeMap::new();
        for (name, tool) in self.config.tools.iter() {
            drivers.insert(name.clone(), Drivers::load(tool)?);
        }

        state = RunState::Scheduling;
        debug!(state = ?state, workloads = self.config.workloads.len(), "registering events");

        let ctx = Arc::new(DriverCtx {
            target: self.config.target.clone(),
            artifact_dir: self.config.controller.artifact_dir.clone(),
            supervisor: supervisor.clone(),
            stop: self.stop.clone(),
        });
        let results: Arc<Mutex<BTreeMap<String, WorkloadRunResult>>> = Arc::default();
        let handles: Arc<Mutex<Vec<thread::JoinHandle<()>>>> = Arc::default();
        let completed = Arc::new(AtomicUsize::new(0));

        for (name, spec) in self.config.workloads.clone() {
            let driver = match drivers.get(&spec.tool) {
                Some(driver) => driver.clone(),
                None => return Err(ConfigErrors::UnknownTool(spec.tool.clone()).into()),
            };
            let delay = Duration::from_secs(spec.start_after);
            let priority = spec.priority;
            let ctx = ctx.clone();
            let results = results.clone();
            let handles = handles.clone();
            let completed = completed.clone();

            self.scheduler.schedule(
                delay,
                priority,
                Box::new(move || {
                    // hand off immediately so the dispatch loop never blocks
                    // on workload completion
                    let driver = driver.clone();
                    let spec = spec.clone();
                    let name = name.clone();
                    let ctx = ctx.clone();
                    let results = results.clone();
                    let completed = completed.clone();
                    let handle = thread::spawn(move || {
                        info!(workload = %name, tool = %spec.tool, "launching workload");
                        match driver.run(&name, &spec, &ctx) {
                            Ok(result) => {
                                if !result.success {
                                    warn!(workload = %name, "workload reported failure");
                                }
                                results.lock().insert(name, result);
                            }
                            Err(error) => {
                                error!(workload = %name, %error, "workload driver failed");
                                results.lock().insert(
                                    name,
                                    WorkloadRunResult::driver_failure(&spec.operations),
                                );
                            }
                        }
                        completed.fetch_add(1, Ordering::SeqCst);
                    });
                    handles.lock().push(handle);
                    None
                }),
            );
        }

        for (kind, task) in [
            (
                TaskKind::HealthCheck,
                self.config.maintenance.health_check.clone(),
            ),
            (
                TaskKind::SupportBundle,
                self.config.maintenance.support_bundle.clone(),
            ),
        ] {
            let Some(task) = task else { continue };
            let runner = MaintenanceRunner::new(task, kind.clone(), supervisor.clone());
            let interval = runner.interval();
            maintenance::log_schedule(&kind, interval);
            self.scheduler.schedule(
                interval,
                MAINTENANCE_PRIORITY,
                Box::new(move || {
                    runner.run_once();
                    // re-arm as the last step so drift never exceeds one
                    // invocation's duration
                    Some(interval)
                }),
            );
        }

        let scheduler_loop = self.scheduler.clone();
        let scheduler_thread = thread::spawn(move || scheduler_loop.run());

        state = RunState::Polling;
        let poll_interval = Duration::from_secs(self.config.controller.poll_interval);
        let total_workloads = self.config.workloads.len();
        info!(state = ?state, poll_secs = poll_interval.as_secs(), "poll loop started");

        let clean = loop {
            sleep_unless_interrupted(poll_interval);
            if interrupted() {
                warn!("interrupt received, aborting the run");
                break false;
            }

            let snapshot = self.registry.snapshot();
            if let Some(failed) = snapshot.iter().find(|record| record.is_workload_failure()) {
                error!(pid = failed.pid, kind = %failed.kind, "workload failed, aborting the run");
                break false;
            }
            if results.lock().values().any(|result| !result.success) {
                // driver died before a registry record could carry the verdict
                error!("a workload driver failed without a process verdict, aborting the run");
                break false;
            }

            if completed.load(Ordering::SeqCst) == total_workloads {
                // re-check: a failure may have landed after the scans above
                let registry_ok = !self
                    .registry
                    .snapshot()
                    .iter()
                    .any(|record| record.is_workload_failure());
                let results_ok = results.lock().values().all(|result| result.success);
                break registry_ok && results_ok;
            }
        };

        state = if clean {
            RunState::DrainingOk
        } else {
            RunState::Aborting
        };
        info!(state = ?state, "run winding down");

        self.stop.store(true, Ordering::SeqCst);
        self.scheduler.request_stop();
        if !clean {
            // best-effort shutdown: interrupt everything still in flight,
            // already-exited results stay collected in the registry
            for record in self.registry.snapshot() {
                if record.state == ProcState::Started {
                    supervisor.terminate(record.pid);
                }
            }
        }

        let mut panicked = false;
        if scheduler_thread.join().is_err() {
            error!("scheduler loop panicked");
            panicked = true;
        }
        for handle in mem::take(&mut *handles.lock()) {
            if handle.join().is_err() {
                error!("a workload thread panicked");
                panicked = true;
            }
        }

        state = RunState::Stopped;
        log_summary(&results.lock(), &self.registry.snapshot(), clean);
        info!(state = ?state, clean, "run stopped");

        if panicked {
            return Err(RunError::WorkerPanic);
        }
        Ok(if clean {
            RunStatus::Clean
        } else {
            RunStatus::Aborted
        })
    }
}

/// final matrix of per-workload, per-operation results
fn log_summary(
    results: &BTreeMap<String, WorkloadRunResult>,
    records: &[ProcessRecord],
    clean: bool,
) {
    if clean {
        info!("run finished cleanly");
    } else {
        error!("run aborted");
    }

    for (name, result) in results {
        let breakdown = result
            .op_errors
            .iter()
            .map(|(op, errors)| format!("{op}={errors}"))
            .join(", ");
        info!(
            workload = %name,
            success = result.success,
            timed_out = result.timed_out,
            confidence = ?result.confidence,
            iterations = result.iterations,
            errors = %breakdown,
            "workload verdict"
        );
        if let Some(marker) = &result.fatal_marker {
            warn!(workload = %name, marker = %marker, "fatal marker matched in console log");
        }
    }

    let (mut passed, mut failed) = (0usize, 0usize);
    for record in records {
        if let Some(TaskOutcome::Maintenance { success, .. }) = &record.outcome {
            if *success {
                passed += 1;
            } else {
                failed += 1;
            }
        }
    }
    if passed + failed > 0 {
        info!(passed, failed, "maintenance task summary");
    }
}
