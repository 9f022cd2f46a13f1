//! Master controller.
//!
//! # Data Flow
//! ```text
//! start:   check pid file → reconcile listeners (failures fatal)
//!          → spawn pool → write pid file → "master process ready"
//!
//! loop:    wait for { signal, sweep interval }
//!          → drain EventQueue → handle each event
//!          → tick: upgrade poll → reap → heartbeat sweep → adjust pool
//!
//! stop:    graceful: QUIT workers, wait for empty table (bounded)
//!          immediate: TERM workers, exit at once
//! ```
//!
//! # States
//! `Starting → Running → {Reloading, Upgrading, Stopping} → Running | Stopped`
//!
//! # Design Decisions
//! - All master state lives in one owned struct; the OS is reached only
//!   through [`ProcessControl`]
//! - Replacement is decided at reap time from the current pool size and
//!   generation, so whichever of timeout-kill, reload or resize came last
//!   wins and repeating any of them is harmless
//! - Runtime failures (bad reload, bind error, spawn error, failed upgrade)
//!   are logged and the previous good state is kept

pub mod process;
pub mod table;

use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::{getpid, Pid};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ConfigError, ConfigSnapshot, ConfigSource, Hooks, ServerConfig, WorkerInfo};
use crate::lifecycle::pidfile::{PidFile, PidFileError};
use crate::lifecycle::signals::{Event, EventQueue, SignalDispatcher};
use crate::lifecycle::upgrade::{UpgradeCoordinator, UpgradeError, UpgradeOutcome, UpgradeState};
use crate::lifecycle::Heartbeat;
use crate::net::{BindError, ListenerRegistry};
use crate::observability::{metrics, LogHandle};
use crate::worker::WorkerEnv;

pub use process::{ExitStatus, ProcessControl, SpawnError, SystemProcesses};
pub use table::{WorkerRecord, WorkerTable};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that stop the master from starting.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Starting,
    Running,
    Reloading,
    Upgrading,
    /// Graceful shutdown: waiting for workers to drain.
    Stopping,
    Stopped,
}

pub struct Master<P, C> {
    processes: P,
    source: C,
    snapshot: ConfigSnapshot,
    registry: ListenerRegistry,
    workers: WorkerTable,
    queue: EventQueue,
    upgrade: UpgradeCoordinator,
    pid_file: Option<PidFile>,
    pid: Pid,
    state: MasterState,
    generation: u64,
    pool_size: usize,
    shutdown_deadline: Option<Instant>,
    log: Option<LogHandle>,
}

impl<P: ProcessControl, C: ConfigSource> Master<P, C> {
    /// Build a master around already-loaded settings and whatever listeners
    /// were inherited.
    pub fn new(
        processes: P,
        source: C,
        settings: ServerConfig,
        hooks: Hooks,
        registry: ListenerRegistry,
    ) -> Self {
        let pid_file = settings.pid.clone().map(PidFile::new);
        let upgrade = UpgradeCoordinator::new(settings.upgrade.ready_timeout());
        let pool_size = settings.worker_processes;
        Self {
            processes,
            source,
            snapshot: ConfigSnapshot::new(settings, hooks.into()),
            registry,
            workers: WorkerTable::new(),
            queue: EventQueue::default(),
            upgrade,
            pid_file,
            pid: getpid(),
            state: MasterState::Starting,
            generation: 1,
            pool_size,
            shutdown_deadline: None,
            log: None,
        }
    }

    pub fn with_log_handle(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.snapshot.settings
    }

    pub fn workers(&self) -> &WorkerTable {
        &self.workers
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn upgrade_state(&self) -> &UpgradeState {
        self.upgrade.state()
    }

    pub fn processes(&self) -> &P {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut P {
        &mut self.processes
    }

    pub fn is_stopped(&self) -> bool {
        self.state == MasterState::Stopped
    }

    /// How long the loop may block between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        (self.snapshot.settings.timeout() / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }

    /// Bind listeners, spawn the pool and claim the pid file.
    pub fn start(&mut self) -> Result<(), MasterError> {
        if let Some(pid_file) = &self.pid_file {
            pid_file.check_available(self.pid)?;
        }

        let report = self.registry.reconcile(&self.snapshot.settings.listen);
        if let Some(error) = report.failed.into_iter().next() {
            return Err(error.into());
        }

        self.state = MasterState::Running;
        self.adjust_pool();

        if let Some(pid_file) = &self.pid_file {
            pid_file.write(self.pid)?;
        }
        tracing::info!(
            pid = %self.pid,
            workers = self.pool_size,
            listeners = ?self.registry.addresses().iter().map(ToString::to_string).collect::<Vec<_>>(),
            "master process ready"
        );
        Ok(())
    }

    /// Queue an event for the next [`Master::process_pending`].
    pub fn push(&mut self, event: Event) {
        self.queue.push(event);
    }

    /// Handle every queued event, then run one maintenance pass.
    pub fn process_pending(&mut self) {
        while let Some(event) = self.queue.pop() {
            self.handle_event(event);
        }
        self.tick();
    }

    pub fn handle_event(&mut self, event: Event) {
        tracing::debug!(event = ?event, state = ?self.state, "Handling event");
        let running = self.state == MasterState::Running;
        match event {
            Event::GracefulQuit => self.stop_gracefully(),
            Event::Terminate => self.terminate(),
            Event::ReopenLogs => self.reopen_logs(),
            Event::ChildReaped => self.reap(),
            _ if !running => {
                tracing::info!(event = ?event, state = ?self.state, "Ignoring event while not running")
            }
            Event::Reload => self.reload(),
            Event::Upgrade => self.begin_upgrade(),
            Event::IncrementWorkers => {
                self.pool_size += 1;
                tracing::info!(workers = self.pool_size, "Increasing worker count");
                self.adjust_pool();
            }
            Event::DecrementWorkers => {
                self.pool_size = self.pool_size.saturating_sub(1);
                tracing::info!(workers = self.pool_size, "Decreasing worker count");
                self.adjust_pool();
            }
            Event::StopWorkers => {
                self.pool_size = 0;
                tracing::info!("Gracefully stopping all workers");
                self.adjust_pool();
            }
        }
    }

    /// Watch the upgrade, reap, sweep heartbeats and fix the pool size.
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.poll_upgrade(now);
        self.reap();
        self.sweep(now);

        match self.state {
            MasterState::Running => self.adjust_pool(),
            MasterState::Stopping => {
                if self.workers.is_empty() {
                    tracing::info!("All workers exited");
                    self.state = MasterState::Stopped;
                } else if self.shutdown_deadline.is_some_and(|deadline| now >= deadline) {
                    tracing::warn!(
                        remaining = self.workers.len(),
                        "Shutdown timeout reached, terminating remaining workers"
                    );
                    self.signal_all(Signal::SIGTERM);
                    self.state = MasterState::Stopped;
                }
            }
            _ => {}
        }
        metrics::set_worker_count(self.workers.len());
    }

    /// Drive the master until it stops.
    pub async fn run(mut self, mut signals: SignalDispatcher) {
        while !self.is_stopped() {
            let interval = self.sweep_interval();
            tokio::select! {
                _ = signals.wait(&mut self.queue) => {}
                _ = tokio::time::sleep(interval) => {}
            }
            signals.drain_ready(&mut self.queue);
            self.process_pending();
        }
        self.finish();
    }

    /// Release the pid file and listeners.
    pub fn finish(&mut self) {
        if let Some(pid_file) = &self.pid_file {
            pid_file.remove_if_owned(self.pid);
        }
        self.registry.close_all();
        tracing::info!(pid = %self.pid, "master complete");
    }

    fn stop_gracefully(&mut self) {
        if matches!(self.state, MasterState::Stopping | MasterState::Stopped) {
            return;
        }
        tracing::info!(workers = self.workers.len(), "Gracefully shutting down");
        self.signal_all(Signal::SIGQUIT);
        // An unrepresentable deadline means wait for the workers indefinitely.
        self.shutdown_deadline = Instant::now().checked_add(self.snapshot.settings.shutdown_timeout());
        self.state = MasterState::Stopping;
    }

    fn terminate(&mut self) {
        if self.state == MasterState::Stopped {
            return;
        }
        tracing::info!(workers = self.workers.len(), "Terminating immediately");
        self.signal_all(Signal::SIGTERM);
        self.state = MasterState::Stopped;
    }

    fn signal_all(&mut self, signal: Signal) {
        for record in self.workers.iter_mut() {
            self.processes.signal(record.pid, signal);
            if matches!(signal, Signal::SIGQUIT | Signal::SIGTERM) {
                record.quitting = true;
            }
        }
    }

    fn quit_worker(&mut self, pid: Pid) {
        if let Some(record) = self.workers.get_mut(pid) {
            record.quitting = true;
            self.processes.signal(pid, Signal::SIGQUIT);
        }
    }

    fn reap(&mut self) {
        for pid in self.workers.pids() {
            let Some(status) = self.processes.try_reap(pid) else {
                continue;
            };
            let Some(record) = self.workers.remove(pid) else {
                continue;
            };
            metrics::record_worker_reaped(status.success());
            if status.success() {
                tracing::info!(
                    pid = %pid,
                    worker = record.ordinal,
                    generation = record.generation,
                    status = %status,
                    "reaped worker"
                );
            } else {
                tracing::error!(
                    pid = %pid,
                    worker = record.ordinal,
                    generation = record.generation,
                    status = %status,
                    "reaped worker"
                );
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let timeout = self.snapshot.settings.timeout();
        let kill_grace = self.snapshot.settings.kill_grace();

        for record in self.workers.iter_mut() {
            record.observe(now);
            if record.killed {
                continue;
            }
            if let Some(terminated_at) = record.terminated_at {
                if now.saturating_duration_since(terminated_at) >= kill_grace {
                    tracing::error!(pid = %record.pid, worker = record.ordinal, "Worker ignored termination, killing");
                    self.processes.signal(record.pid, Signal::SIGKILL);
                    record.killed = true;
                }
                continue;
            }
            let silent = record.silent_for(now);
            if silent > timeout {
                tracing::error!(
                    pid = %record.pid,
                    worker = record.ordinal,
                    silent_secs = silent.as_secs_f64(),
                    timeout_secs = timeout.as_secs(),
                    "Worker timed out, terminating"
                );
                metrics::record_worker_timeout();
                self.processes.signal(record.pid, Signal::SIGTERM);
                record.terminated_at = Some(now);
            }
        }
    }

    fn adjust_pool(&mut self) {
        if self.state != MasterState::Running {
            return;
        }
        for pid in self.workers.excess(self.pool_size, self.generation) {
            tracing::info!(pid = %pid, workers = self.pool_size, "Worker beyond pool size, quitting");
            self.quit_worker(pid);
        }
        for ordinal in self.workers.missing_ordinals(self.pool_size, self.generation) {
            if let Err(e) = self.spawn_worker(ordinal) {
                // Retried on the next tick.
                tracing::error!(worker = ordinal, error = %e, "Failed to spawn worker");
                break;
            }
        }
    }

    fn spawn_worker(&mut self, ordinal: usize) -> Result<Pid, SpawnError> {
        let info = WorkerInfo {
            ordinal,
            generation: self.generation,
        };
        let heartbeat = Heartbeat::create().map_err(|source| SpawnError::Io {
            role: "worker",
            source,
        })?;
        let settings = &self.snapshot.settings;
        let env = WorkerEnv {
            ordinal,
            generation: self.generation,
            listen_fds: self.registry.fds_for_worker(ordinal),
            heartbeat_fd: heartbeat.as_raw_fd(),
            timeout_ms: settings.timeout().as_millis() as u64,
            logging: settings.logging.clone(),
            master_pid: self.pid.as_raw(),
        };

        self.snapshot.hooks.run_before_fork(&info);
        let pid = self.processes.spawn_worker(&env)?;
        tracing::debug!(pid = %pid, worker = ordinal, generation = self.generation, "Spawned worker");
        metrics::record_worker_spawned();
        self.workers
            .insert(WorkerRecord::new(pid, info, heartbeat, Instant::now()));
        Ok(pid)
    }

    fn reload(&mut self) {
        self.state = MasterState::Reloading;
        tracing::info!("reloading config");

        match self.source.load() {
            Err(e) => {
                tracing::error!(error = %e, "Error reloading config, keeping previous configuration");
                metrics::record_reload("error");
            }
            Ok(settings) => {
                let report = self.registry.reconcile(&settings.listen);
                if let Some(log) = &self.log {
                    log.apply(&settings.logging);
                }
                self.upgrade.set_ready_timeout(settings.upgrade.ready_timeout());
                self.pool_size = settings.worker_processes;
                self.snapshot = self.snapshot.replace(settings);
                self.generation += 1;

                for pid in self.workers.outdated(self.generation) {
                    self.quit_worker(pid);
                }
                tracing::info!(
                    generation = self.generation,
                    opened = report.opened.len(),
                    closed = report.closed.len(),
                    failed = report.failed.len(),
                    "done reloading config"
                );
                metrics::record_reload(if report.failed.is_empty() { "ok" } else { "partial" });
            }
        }

        self.state = MasterState::Running;
        self.adjust_pool();
    }

    fn begin_upgrade(&mut self) {
        self.state = MasterState::Upgrading;
        let fds = self.registry.export_fds();
        let result = self.upgrade.begin(
            &mut self.processes,
            self.pid_file.as_ref(),
            self.pid,
            &fds,
            &self.snapshot.hooks,
            Instant::now(),
        );
        match result {
            Ok(pid) => tracing::info!(pid = %pid, "Waiting for new master to become ready"),
            Err(UpgradeError::InProgress(pid)) => {
                tracing::warn!(pid = %pid, "Upgrade already in progress, ignoring")
            }
            Err(UpgradeError::AlreadyHandedOff(pid)) => {
                tracing::warn!(pid = %pid, "New master already running, ignoring upgrade")
            }
            Err(e) => tracing::error!(error = %e, "Upgrade failed, continuing to serve"),
        }
        self.state = MasterState::Running;
    }

    fn poll_upgrade(&mut self, now: Instant) {
        let Some(pid_file) = &self.pid_file else {
            return;
        };
        if let Some(UpgradeOutcome::Ready(pid)) = self.upgrade.poll(&mut self.processes, pid_file, now) {
            if self.snapshot.settings.upgrade.auto_quit_old {
                tracing::info!(new_master = %pid, "Upgrade complete, old master quitting");
                self.stop_gracefully();
            } else {
                tracing::info!(new_master = %pid, "Upgrade complete; send QUIT to the old master to finish");
            }
        }
    }

    fn reopen_logs(&mut self) {
        if let Some(log) = &self.log {
            log.reopen("master");
        }
        for record in self.workers.iter() {
            self.processes.signal(record.pid, Signal::SIGUSR1);
        }
    }
}

impl<P, C> std::fmt::Debug for Master<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("pool_size", &self.pool_size)
            .field("workers", &self.workers.len())
            .field("listeners", &self.registry.len())
            .finish()
    }
}
