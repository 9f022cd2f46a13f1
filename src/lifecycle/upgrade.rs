//! Live binary upgrade.
//!
//! # Responsibilities
//! - Move the PID file aside and start a successor master that inherits the
//!   listener fds
//! - Watch the successor until it claims the canonical PID file, exits, or
//!   runs out of time
//! - Allow a retry while the previous attempt is stalled, without ever
//!   creating a second `.oldbin`
//!
//! # Design Decisions
//! - The old master never self-terminates on failure; it keeps serving and
//!   waits for another upgrade signal
//! - Failure leaves `.oldbin` in place as the visible marker of a stalled
//!   upgrade
//! - Spawning is a plain function over [`ProcessControl`] so it is testable
//!   without replacing the test process

use std::os::fd::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::Hooks;
use crate::lifecycle::pidfile::{PidFile, PidFileError};
use crate::master::process::{ProcessControl, SpawnError};
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("live upgrade requires a pid file")]
    NoPidFile,

    #[error("new master {0} is still starting")]
    InProgress(Pid),

    #[error("new master {0} already took over")]
    AlreadyHandedOff(Pid),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    SpawningNew,
    AwaitingNewReady { pid: Pid, since: Instant },
    HandoffComplete { pid: Pid },
    RolledBack { reason: String },
}

/// Result of watching the successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Ready(Pid),
    Failed,
}

/// Rename the PID file and start a successor inheriting `fds`.
pub fn spawn_successor<P: ProcessControl>(
    processes: &mut P,
    pid_file: &PidFile,
    me: Pid,
    fds: &[RawFd],
    hooks: &Hooks,
) -> Result<Pid, UpgradeError> {
    pid_file.rename_to_oldbin(me)?;
    hooks.run_before_exec();
    let pid = processes.spawn_master(fds)?;
    Ok(pid)
}

#[derive(Debug)]
pub struct UpgradeCoordinator {
    state: UpgradeState,
    ready_timeout: Duration,
    /// Successors given up on that may still need reaping.
    abandoned: Vec<Pid>,
}

impl UpgradeCoordinator {
    pub fn new(ready_timeout: Duration) -> Self {
        Self {
            state: UpgradeState::Idle,
            ready_timeout,
            abandoned: Vec::new(),
        }
    }

    pub fn state(&self) -> &UpgradeState {
        &self.state
    }

    pub fn set_ready_timeout(&mut self, ready_timeout: Duration) {
        self.ready_timeout = ready_timeout;
    }

    /// The successor master, while one is pending or has taken over.
    pub fn successor(&self) -> Option<Pid> {
        match self.state {
            UpgradeState::AwaitingNewReady { pid, .. } | UpgradeState::HandoffComplete { pid } => {
                Some(pid)
            }
            _ => None,
        }
    }

    /// Handle an upgrade request.
    ///
    /// A pending successor that is still within its deadline makes this a
    /// no-op; a dead or overdue one is abandoned and the upgrade is retried.
    pub fn begin<P: ProcessControl>(
        &mut self,
        processes: &mut P,
        pid_file: Option<&PidFile>,
        me: Pid,
        fds: &[RawFd],
        hooks: &Hooks,
        now: Instant,
    ) -> Result<Pid, UpgradeError> {
        let pid_file = pid_file.ok_or(UpgradeError::NoPidFile)?;
        self.poll(processes, pid_file, now);

        match self.state {
            UpgradeState::AwaitingNewReady { pid, .. } => return Err(UpgradeError::InProgress(pid)),
            UpgradeState::HandoffComplete { pid } => {
                return Err(UpgradeError::AlreadyHandedOff(pid))
            }
            UpgradeState::RolledBack { .. } => {
                tracing::info!("Retrying upgrade after failed attempt");
            }
            UpgradeState::Idle | UpgradeState::SpawningNew => {}
        }

        self.state = UpgradeState::SpawningNew;
        match spawn_successor(processes, pid_file, me, fds, hooks) {
            Ok(pid) => {
                tracing::info!(pid = %pid, fds = ?fds, "Started new master");
                self.state = UpgradeState::AwaitingNewReady { pid, since: now };
                Ok(pid)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start new master");
                self.roll_back(e.to_string());
                Err(e)
            }
        }
    }

    /// Advance the state machine. Returns an outcome on the tick it happens.
    pub fn poll<P: ProcessControl>(
        &mut self,
        processes: &mut P,
        pid_file: &PidFile,
        now: Instant,
    ) -> Option<UpgradeOutcome> {
        self.abandoned
            .retain(|&pid| processes.try_reap(pid).is_none());

        match self.state {
            UpgradeState::AwaitingNewReady { pid, since } => {
                if let Some(status) = processes.try_reap(pid) {
                    tracing::error!(pid = %pid, status = %status, "New master exited before becoming ready");
                    self.roll_back(format!("new master exited with {}", status));
                    return Some(UpgradeOutcome::Failed);
                }
                if pid_file.read() == Some(pid) {
                    tracing::info!(pid = %pid, "New master is ready");
                    self.state = UpgradeState::HandoffComplete { pid };
                    metrics::record_upgrade("ok");
                    return Some(UpgradeOutcome::Ready(pid));
                }
                if now.saturating_duration_since(since) >= self.ready_timeout {
                    tracing::error!(
                        pid = %pid,
                        timeout_secs = self.ready_timeout.as_secs(),
                        "New master did not become ready in time, terminating it"
                    );
                    processes.signal(pid, Signal::SIGTERM);
                    self.abandoned.push(pid);
                    self.roll_back("new master did not become ready in time".to_string());
                    return Some(UpgradeOutcome::Failed);
                }
                None
            }
            UpgradeState::HandoffComplete { pid } => {
                if let Some(status) = processes.try_reap(pid) {
                    tracing::error!(pid = %pid, status = %status, "New master exited after taking over");
                    self.roll_back(format!("new master exited with {}", status));
                }
                None
            }
            _ => None,
        }
    }

    fn roll_back(&mut self, reason: String) {
        tracing::warn!(reason = %reason, "Upgrade rolled back; still serving, .oldbin kept");
        metrics::record_upgrade("failed");
        self.state = UpgradeState::RolledBack { reason };
    }
}
