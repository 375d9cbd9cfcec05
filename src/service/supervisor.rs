use crate::common::audit::AuditLog;
use crate::common::config::{DEFAULT_INTERVAL_SECS, TargetSource, TargetSpec};
use crate::service::inspector::{MutationError, ProcessHandle, ProcessInspector};
use crate::service::policy::MutationPolicy;
use crate::service::status::{Observer, Outcome, StatusEvent};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long `stop` waits for the background task before aborting it.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

struct Shared {
    inspector: Arc<dyn ProcessInspector>,
    source: Arc<dyn TargetSource>,
    policy: RwLock<MutationPolicy>,
    observer: RwLock<Option<Observer>>,
    audit: AuditLog,
    last_interval: AtomicU64,
    cycles: AtomicU64,
}

/// One started run: its continue flag, wake-up channel and task.
struct Run {
    active: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Periodically applies the mutation policy to every configured target.
///
/// `start` and `stop` are idempotent. At most one background task exists at
/// a time, and once `stop` returns the stopped run emits nothing more.
pub struct Supervisor {
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl Supervisor {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        source: Arc<dyn TargetSource>,
        audit: AuditLog,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inspector,
                source,
                policy: RwLock::new(MutationPolicy::default()),
                observer: RwLock::new(None),
                audit,
                last_interval: AtomicU64::new(DEFAULT_INTERVAL_SECS),
                cycles: AtomicU64::new(0),
            }),
            run: Mutex::new(None),
        }
    }

    /// Register the single status observer, replacing any previous one.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.set_shared_observer(Arc::new(observer));
    }

    pub fn set_shared_observer(&self, observer: Observer) {
        if let Ok(mut slot) = self.shared.observer.write() {
            *slot = Some(observer);
        }
    }

    pub fn policy(&self) -> MutationPolicy {
        self.shared.policy()
    }

    /// Takes effect from the next process lookup onward.
    pub fn set_policy(&self, policy: MutationPolicy) {
        if let Ok(mut current) = self.shared.policy.write() {
            *current = policy;
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_run()
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// Launch the background cycle. Must be called from within a tokio
    /// runtime. Returns `false` when a run is already active.
    pub fn start(&self, policy: MutationPolicy) -> bool {
        let mut run = self.lock_run();

        if run.as_ref().is_some_and(|run| !run.task.is_finished()) {
            debug!("Supervisor already running, ignoring start");
            return false;
        }

        self.set_policy(policy);

        let active = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            Arc::clone(&active),
            stop_rx,
        ));

        *run = Some(Run {
            active,
            stop_tx,
            task,
        });

        info!(
            "Monitoring started (priority: {}, cpu: {})",
            policy.priority, policy.cpu
        );
        self.shared.audit.append("monitor started");
        true
    }

    /// Stop the background cycle, waiting at most [`STOP_GRACE`] for it to
    /// finish. Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let taken = { self.lock_run().take() };
        let Some(run) = taken else {
            debug!("Supervisor idle, ignoring stop");
            return false;
        };

        run.active.store(false, Ordering::SeqCst);
        let _ = run.stop_tx.send(true);

        let mut task = run.task;
        match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(())) => debug!("Supervision task finished"),
            Ok(Err(e)) => error!("Supervision task failed: {}", e),
            Err(_) => {
                warn!(
                    "Supervision task did not finish within {:?}, aborting",
                    STOP_GRACE
                );
                task.abort();
            }
        }

        info!("Monitoring stopped");
        self.shared.audit.append("monitor stopped");
        true
    }

    /// Run a single pass over the targets on the calling thread.
    pub fn run_cycle(&self) -> Duration {
        let active = AtomicBool::new(true);
        self.shared.cycle(&active)
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(run) = self.lock_run().take() {
            run.active.store(false, Ordering::SeqCst);
            run.task.abort();
        }
    }
}

async fn run_loop(shared: Arc<Shared>, active: Arc<AtomicBool>, mut stop_rx: watch::Receiver<bool>) {
    debug!("Supervision task started");

    while active.load(Ordering::SeqCst) {
        // Scans and syscalls block, keep them off the runtime workers
        let pass = {
            let shared = Arc::clone(&shared);
            let active = Arc::clone(&active);
            tokio::task::spawn_blocking(move || shared.cycle(&active))
        };

        let interval = tokio::select! {
            result = pass => match result {
                Ok(interval) => interval,
                Err(e) => {
                    error!("Check pass failed: {}", e);
                    shared.last_interval()
                }
            },
            // The pass stays gated on `active` and winds down on its own
            _ = stop_rx.changed() => break,
        };

        if !active.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => break,
        }
    }

    debug!("Supervision task exiting");
}

impl Shared {
    fn policy(&self) -> MutationPolicy {
        self.policy.read().map(|p| *p).unwrap_or_default()
    }

    fn last_interval(&self) -> Duration {
        Duration::from_secs(self.last_interval.load(Ordering::Relaxed).max(1))
    }

    /// One pass over all targets. Returns how long to sleep afterwards.
    fn cycle(&self, active: &AtomicBool) -> Duration {
        let seq = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        self.audit.append("checking processes...");

        let spec = match self.source.targets() {
            Ok(spec) => {
                self.last_interval
                    .store(spec.interval_secs.max(1), Ordering::Relaxed);
                spec
            }
            Err(e) => {
                warn!("Could not read targets, skipping this cycle: {:#}", e);
                TargetSpec {
                    names: Vec::new(),
                    interval_secs: self.last_interval.load(Ordering::Relaxed),
                }
            }
        };

        debug!(
            "Checking {} targets, next check in {}s",
            spec.names.len(),
            spec.interval_secs
        );

        for name in &spec.names {
            if !active.load(Ordering::SeqCst) {
                return spec.interval();
            }
            self.check_target(name, seq, active);
        }

        self.audit.append("check complete, waiting for next check...");
        spec.interval()
    }

    fn check_target(&self, name: &str, seq: u64, active: &AtomicBool) {
        let policy = self.policy();
        let handles = self.inspector.find(name);

        if handles.is_empty() {
            debug!("Process not found: {}", name);
            self.audit.append(&format!("process not found: {}", name));
            self.emit(active, StatusEvent::not_found(name).in_cycle(seq));
            return;
        }

        for handle in &handles {
            if !active.load(Ordering::SeqCst) {
                return;
            }
            self.check_process(name, handle, policy, seq, active);
        }
    }

    /// Found, then priority, then affinity. Each mutation is attempted even
    /// if the previous one failed, but none once the run has been stopped.
    fn check_process(
        &self,
        name: &str,
        handle: &ProcessHandle,
        policy: MutationPolicy,
        seq: u64,
        active: &AtomicBool,
    ) {
        let event = |outcome| StatusEvent::for_process(name, handle.pid, outcome).in_cycle(seq);

        info!("Found process: {} (PID: {})", name, handle.pid);
        self.audit
            .append(&format!("found process: {} (PID: {})", name, handle.pid));
        self.emit(active, event(Outcome::Found));

        if !active.load(Ordering::SeqCst) {
            return;
        }

        let outcome = match self.inspector.set_priority(handle, policy.priority) {
            Ok(()) => {
                info!("Set priority of PID {} to {}", handle.pid, policy.priority);
                self.audit
                    .append(&format!("priority set to {}", policy.priority));
                Outcome::PrioritySuccess
            }
            Err(e) => {
                report_failure("priority", &e);
                self.audit
                    .append(&format!("failed to set priority of {}: {}", name, e));
                Outcome::PriorityFailed
            }
        };
        self.emit(active, event(outcome));

        if !active.load(Ordering::SeqCst) {
            return;
        }

        let outcome = match self.inspector.set_affinity(handle, policy.cpu) {
            Ok(cores) => {
                info!("Pinned PID {} to cores {:?}", handle.pid, cores);
                self.audit
                    .append(&format!("affinity set to CPU {:?}", cores));
                Outcome::AffinitySuccess
            }
            Err(e) => {
                report_failure("affinity", &e);
                self.audit
                    .append(&format!("failed to set affinity of {}: {}", name, e));
                Outcome::AffinityFailed
            }
        };
        self.emit(active, event(outcome));
    }

    fn emit(&self, active: &AtomicBool, event: StatusEvent) {
        if !active.load(Ordering::SeqCst) {
            return;
        }

        let observer = self.observer.read().ok().and_then(|slot| slot.clone());
        if let Some(observer) = observer {
            observer(&event);
        }
    }
}

fn report_failure(what: &str, err: &MutationError) {
    if err.is_tolerated() {
        warn!("Could not set {}: {}", what, err);
    } else {
        error!("Unexpected failure setting {}: {}", what, err);
    }
}
