use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::DaemonSettings;
use crate::error::SupervisorError;
use crate::models::process::{ALL, TUNNEL};
use crate::models::{
    LaunchSpec, ProcessState, ProcessStatus, SettingsView, StatusSnapshot, TunnelInfo,
};
use crate::services::health_checker::HealthChecker;
use crate::services::process_checker::probe_liveness;
use crate::services::restart_scheduler::RestartScheduler;
use crate::services::status_store::StatusStore;

/// One live incarnation of a named process.
///
/// The `Child` itself lives in the exit-monitor task; the supervisor keeps the
/// kill switch. Sending on it, or dropping the handle, makes the monitor kill
/// and reap the child.
struct ProcessHandle {
    command: String,
    pid: Option<u32>,
    started_at: Instant,
    generation: u64,
    kill_switch: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    fn kill(mut self) {
        if let Some(switch) = self.kill_switch.take() {
            let _ = switch.send(());
        }
    }
}

enum ExitOutcome {
    Exited(ExitStatus),
    Killed,
    WaitFailed(std::io::Error),
}

impl ExitOutcome {
    fn describe(&self) -> String {
        match self {
            ExitOutcome::Exited(status) => status.to_string(),
            ExitOutcome::Killed => "killed".to_string(),
            ExitOutcome::WaitFailed(err) => format!("wait failed: {}", err),
        }
    }
}

struct Inner {
    processes: HashMap<String, ProcessHandle>,
    records: HashMap<String, ProcessStatus>,
    /// Last launch directive per name, replayed by the restart timers
    directives: HashMap<String, LaunchSpec>,
    tunnel: TunnelInfo,
    restarts: RestartScheduler,
    health: HealthChecker,
    monitors: JoinSet<()>,
    next_generation: u64,
    /// Sequence of the last snapshot handed to the status store
    saves: u64,
}

/// Removes the handle for `name` only if it is still the given incarnation.
fn take_current(inner: &mut Inner, name: &str, generation: u64) -> Option<ProcessHandle> {
    let current = inner
        .processes
        .get(name)
        .is_some_and(|handle| handle.generation == generation);
    if current {
        inner.processes.remove(name)
    } else {
        None
    }
}

struct Shared {
    settings: DaemonSettings,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    started_at: Instant,
    store: Option<Arc<StatusStore>>,
    launches: broadcast::Sender<String>,
}

/// Daemon manager: starts named processes, watches them and restarts them
/// under bounded exponential backoff.
///
/// Every mutation of the process map and the status records goes through one
/// mutex that is never held across an await point.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(settings: DaemonSettings) -> Self {
        let store = settings
            .status_file
            .clone()
            .map(|path| Arc::new(StatusStore::new(path)));

        let tunnel = store
            .as_ref()
            .and_then(|store| match store.load_tunnel_info() {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("Ignoring unreadable status cache: {:#}", e);
                    None
                }
            })
            .unwrap_or_default();

        if !tunnel.domain.is_empty() {
            log::info!("Recovered tunnel info from cache: {} ({})", tunnel.domain, tunnel.tunnel_type);
        }

        let inner = Inner {
            processes: HashMap::new(),
            records: HashMap::new(),
            directives: HashMap::new(),
            tunnel,
            restarts: RestartScheduler::new(settings.restart_delay, settings.restart_cap),
            health: HealthChecker::new(settings.check_interval),
            monitors: JoinSet::new(),
            next_generation: 0,
            saves: 0,
        };
        let (launches, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                settings,
                inner: Mutex::new(inner),
                cancel: CancellationToken::new(),
                started_at: Instant::now(),
                store,
                launches,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launches `command` as process `name` and returns its PID.
    ///
    /// An explicit start always resets the retry counter. Must be called from
    /// within a tokio runtime.
    pub fn start(
        &self,
        name: &str,
        command: impl Into<PathBuf>,
        args: Vec<String>,
    ) -> Result<u32, SupervisorError> {
        self.start_spec(LaunchSpec::new(name, command, args))
    }

    fn start_spec(&self, spec: LaunchSpec) -> Result<u32, SupervisorError> {
        let mut inner = self.lock();
        inner.restarts.cancel(&spec.name);
        self.launch_locked(&mut inner, spec, true)
    }

    fn launch_locked(
        &self,
        inner: &mut Inner,
        spec: LaunchSpec,
        reset_retries: bool,
    ) -> Result<u32, SupervisorError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SupervisorError::ShutDown);
        }

        let name = spec.name.clone();
        if let Some(old) = inner.processes.remove(&name) {
            log::info!("Replacing process {} (PID: {:?})", name, old.pid);
            old.kill();
        }
        inner.health.disarm(&name);
        inner.directives.insert(name.clone(), spec.clone());

        let tunnel = inner.tunnel.clone();
        let record = inner
            .records
            .entry(name.clone())
            .or_insert_with(|| ProcessStatus::new(&name));
        if reset_retries {
            record.retries = 0;
        }
        record.set_state(ProcessState::Starting);

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Launch {
                    name: name.clone(),
                    command: spec.command.display().to_string(),
                    source,
                };
                log::error!("❌ {}", err);
                record.pid = None;
                record.mark_exited(ProcessState::Stopped);
                // a failed launch counts as a zero-length abnormal run
                self.handle_abnormal(inner, &name);
                return Err(err);
            }
        };

        let pid = child.id();
        let mut fresh = ProcessStatus::new(&name);
        fresh.retries = record.retries;
        fresh.pid = pid;
        fresh.set_state(ProcessState::Running);
        if name == TUNNEL {
            fresh.tunnel_type = tunnel.tunnel_type;
            fresh.domain = tunnel.domain;
        }
        *record = fresh;

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (kill_switch, kill_signal) = oneshot::channel();

        inner.processes.insert(
            name.clone(),
            ProcessHandle {
                command: spec.command.display().to_string(),
                pid,
                started_at: Instant::now(),
                generation,
                kill_switch: Some(kill_switch),
            },
        );

        while inner.monitors.try_join_next().is_some() {}
        inner
            .monitors
            .spawn(self.clone().monitor_exit(name.clone(), generation, child, kill_signal));

        let supervisor = self.clone();
        let health_name = name.clone();
        inner.health.arm(&name, self.shared.cancel.clone(), move || {
            supervisor.check_health(&health_name, generation)
        });

        // nobody listening is fine
        let _ = self.shared.launches.send(name.clone());

        log::info!("✓ Process {} started (PID: {:?})", name, pid);
        Ok(pid.unwrap_or_default())
    }

    async fn monitor_exit(
        self,
        name: String,
        generation: u64,
        mut child: Child,
        mut kill_signal: oneshot::Receiver<()>,
    ) {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut kill_signal => None,
        };

        let outcome = match waited {
            Some(Ok(status)) => ExitOutcome::Exited(status),
            Some(Err(e)) => ExitOutcome::WaitFailed(e),
            None => {
                if let Err(e) = child.start_kill() {
                    log::debug!("Kill of {} failed, assuming it already exited: {}", name, e);
                }
                let _ = child.wait().await;
                ExitOutcome::Killed
            }
        };

        self.handle_exit(&name, generation, outcome);
    }

    fn handle_exit(&self, name: &str, generation: u64, outcome: ExitOutcome) {
        let mut inner = self.lock();

        // a newer incarnation, restart or shutdown took over this name
        let handle = take_current(&mut inner, name, generation);
        let Some(handle) = handle else {
            log::debug!("Process {} (generation {}) stopped on request", name, generation);
            return;
        };

        inner.health.disarm(name);
        let ran_for = handle.started_at.elapsed();

        match outcome {
            ExitOutcome::Exited(status) if status.success() => {
                log::info!("Process {} exited normally after {:?}", name, ran_for);
                if let Some(record) = inner.records.get_mut(name) {
                    record.mark_exited(ProcessState::Stopped);
                }
            }
            other => {
                log::error!(
                    "❌ Process {} ({}) exited abnormally after {:?}: {}",
                    name,
                    handle.command,
                    ran_for,
                    other.describe()
                );
                if let Some(record) = inner.records.get_mut(name) {
                    record.mark_exited(ProcessState::Stopped);
                }
                self.handle_abnormal(&mut inner, name);
            }
        }
    }

    /// Counts the failure and either arms a restart or gives up on the name.
    fn handle_abnormal(&self, inner: &mut Inner, name: &str) {
        let max_retries = self.shared.settings.max_retries;
        let Some(record) = inner.records.get_mut(name) else {
            return;
        };

        if self.shared.cancel.is_cancelled() {
            record.set_state(ProcessState::Stopped);
            return;
        }

        if record.retries >= max_retries {
            record.set_state(ProcessState::PermanentlyFailed);
            log::error!(
                "Process {} reached the maximum of {} restarts, waiting for an explicit restart",
                name,
                max_retries
            );
            return;
        }

        record.retries += 1;
        record.set_state(ProcessState::Restarting);
        let retries = record.retries;

        let supervisor = self.clone();
        let relaunch_name = name.to_string();
        let delay = inner
            .restarts
            .schedule(name, retries, self.shared.cancel.clone(), move |timer_id| {
                supervisor.relaunch(&relaunch_name, timer_id)
            });

        log::info!(
            "🔄 Restarting process {} in {:?} (attempt {}/{})",
            name,
            delay,
            retries,
            max_retries
        );
    }

    fn relaunch(&self, name: &str, timer_id: u64) {
        let mut inner = self.lock();
        if self.shared.cancel.is_cancelled() || !inner.restarts.take_fired(name, timer_id) {
            return;
        }

        let Some(spec) = inner.directives.get(name).cloned() else {
            return;
        };

        log::info!("Relaunching process {}...", name);
        if let Err(e) = self.launch_locked(&mut inner, spec, false) {
            log::warn!("Relaunch of {} failed: {}", name, e);
        }
    }

    /// One health tick for a given incarnation; returns whether to keep probing.
    fn check_health(&self, name: &str, generation: u64) -> bool {
        if self.shared.cancel.is_cancelled() {
            return false;
        }

        let current = self
            .lock()
            .processes
            .get(name)
            .filter(|handle| handle.generation == generation)
            .map(|handle| handle.pid);
        // already reaped or replaced: the exit path owns it now
        let Some(pid) = current else {
            return false;
        };

        let reason = match pid.map(probe_liveness) {
            Some(Ok(())) => {
                log::debug!("💓 Process {} is alive (PID: {:?})", name, pid);
                return true;
            }
            Some(Err(reason)) => reason,
            None => "no PID recorded".to_string(),
        };

        let mut inner = self.lock();
        let Some(handle) = take_current(&mut inner, name, generation) else {
            return false;
        };

        let err = SupervisorError::HealthCheck {
            name: name.to_string(),
            reason,
        };
        log::warn!("⚠️ {}", err);

        handle.kill();
        if let Some(record) = inner.records.get_mut(name) {
            record.mark_exited(ProcessState::Stopped);
        }
        self.handle_abnormal(&mut inner, name);
        false
    }

    /// Stops `target` (or every known process for `"all"`) and clears its retry state.
    ///
    /// Does not relaunch: callers regenerate configuration and call
    /// [`Supervisor::start`] themselves. Returns the names that were reset.
    pub fn restart(&self, target: &str) -> Result<Vec<String>, SupervisorError> {
        let mut inner = self.lock();

        let names = if target == ALL {
            let mut names: Vec<String> = inner.records.keys().cloned().collect();
            names.sort();
            names
        } else if inner.records.contains_key(target) {
            vec![target.to_string()]
        } else {
            return Err(SupervisorError::NotFound(target.to_string()));
        };

        for name in &names {
            if let Some(handle) = inner.processes.remove(name) {
                log::info!("Stopping process {} (PID: {:?}) for restart", name, handle.pid);
                handle.kill();
            }
            inner.health.disarm(name);
            inner.restarts.cancel(name);

            if let Some(record) = inner.records.get_mut(name) {
                if record.running {
                    record.last_exit = Some(Utc::now());
                }
                record.retries = 0;
                record.set_state(ProcessState::Stopped);
            }
        }

        Ok(names)
    }

    pub fn set_tunnel_info(&self, tunnel_type: &str, domain: &str) {
        {
            let mut inner = self.lock();
            inner.tunnel = TunnelInfo {
                tunnel_type: tunnel_type.to_string(),
                domain: domain.to_string(),
            };

            if let Some(record) = inner.records.get_mut(TUNNEL) {
                record.tunnel_type = tunnel_type.to_string();
                record.domain = domain.to_string();
            }
        }

        log::info!("Tunnel info set: type={} domain={}", tunnel_type, domain);
        self.persist();
    }

    pub fn tunnel_info(&self) -> TunnelInfo {
        self.lock().tunnel.clone()
    }

    /// Names of processes as they are (re)launched, by explicit starts and
    /// by restart timers alike.
    pub fn subscribe_launches(&self) -> broadcast::Receiver<String> {
        self.shared.launches.subscribe()
    }

    /// Consistent copy of every record, taken under the lock.
    pub fn status(&self) -> StatusSnapshot {
        self.snapshot_locked(&self.lock())
    }

    fn snapshot_locked(&self, inner: &Inner) -> StatusSnapshot {
        StatusSnapshot {
            processes: inner
                .records
                .iter()
                .map(|(name, record)| (name.clone(), record.clone()))
                .collect(),
            tunnel_info: inner.tunnel.clone(),
            config: self.settings_view(),
            timestamp: Utc::now(),
            uptime: self.shared.started_at.elapsed().as_secs(),
        }
    }

    fn settings_view(&self) -> SettingsView {
        let settings = &self.shared.settings;
        SettingsView {
            check_interval: u64::try_from(settings.check_interval.as_millis()).unwrap_or(u64::MAX),
            max_retries: settings.max_retries,
            restart_delay: u64::try_from(settings.restart_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[cfg(test)]
    pub(crate) fn has_pending_restart(&self, name: &str) -> bool {
        self.lock().restarts.is_pending(name)
    }

    #[cfg(test)]
    pub(crate) fn has_pending_health_check(&self, name: &str) -> bool {
        self.lock().health.is_armed(name)
    }

    /// Token cancelled when the supervisor shuts down, for collaborator tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }

    /// Cancels every timer, kills every tracked child and waits for the
    /// exit-monitors to finish. Call at most once.
    pub async fn shutdown(&self) {
        log::info!("Shutting down process supervisor...");
        self.shared.cancel.cancel();

        let (handles, timers, mut monitors) = {
            let mut inner = self.lock();
            let mut timers = inner.restarts.cancel_all();
            timers.extend(inner.health.disarm_all());

            let handles: Vec<(String, ProcessHandle)> = inner.processes.drain().collect();
            let now = Utc::now();
            for record in inner.records.values_mut() {
                if record.running {
                    record.last_exit = Some(now);
                }
                record.set_state(ProcessState::Stopped);
            }

            (handles, timers, std::mem::take(&mut inner.monitors))
        };

        for (name, handle) in handles {
            let pid = handle.pid;
            handle.kill();
            log::info!("✓ Stopped process {} (PID: {:?})", name, pid);
        }

        for timer in timers {
            let _ = timer.await;
        }
        while monitors.join_next().await.is_some() {}

        if let Some(write) = self.persist() {
            let _ = write.await;
        }
        log::info!("Process supervisor shut down");
    }

    /// Queues a write of the current snapshot to the status cache.
    ///
    /// The write runs on the blocking pool when a runtime is available.
    fn persist(&self) -> Option<JoinHandle<()>> {
        let store = self.shared.store.clone()?;

        let (seq, snapshot) = {
            let mut inner = self.lock();
            inner.saves += 1;
            (inner.saves, self.snapshot_locked(&inner))
        };

        let write = move || {
            if let Err(e) = store.save_newer(seq, &snapshot) {
                log::warn!("Failed to write status cache {}: {:#}", store.path().display(), e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn_blocking(write)),
            Err(_) => {
                write();
                None
            }
        }
    }
}
