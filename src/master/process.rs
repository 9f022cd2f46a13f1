//! Process control seam.
//!
//! Everything the master does to other processes (start, signal, reap) goes
//! through [`ProcessControl`] so the controller can be driven by a fake in
//! tests. [`SystemProcesses`] is the real implementation.
//!
//! Workers and successor masters are fresh executions of the current binary.
//! Only the descriptors named in the launch have close-on-exec cleared, and
//! only in the child, between fork and exec.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;

use crate::net::registry::{format_fd_list, INHERIT_FDS_ENV};
use crate::worker::{WorkerEnv, WORKER_ENV};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to start {role}: {source}")]
    Io {
        role: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode worker payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
    /// Already collected elsewhere; the status is lost.
    Unknown,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit {}", code),
            ExitStatus::Signaled(signal) => write!(f, "signal {}", signal),
            ExitStatus::Unknown => write!(f, "unknown"),
        }
    }
}

pub trait ProcessControl {
    /// Start a worker process. Never blocks on the child.
    fn spawn_worker(&mut self, env: &WorkerEnv) -> Result<Pid, SpawnError>;

    /// Start a successor master inheriting `fds`.
    fn spawn_master(&mut self, fds: &[RawFd]) -> Result<Pid, SpawnError>;

    /// Deliver `signal`. Returns false if the process no longer exists.
    fn signal(&mut self, pid: Pid, signal: Signal) -> bool;

    /// Non-blocking exit check. `None` while the child is still running.
    fn try_reap(&mut self, pid: Pid) -> Option<ExitStatus>;
}

/// Real process control: re-executes the current binary.
#[derive(Debug, Clone)]
pub struct SystemProcesses {
    exe: PathBuf,
    args: Vec<OsString>,
}

impl SystemProcesses {
    pub fn new(exe: PathBuf, args: Vec<OsString>) -> Self {
        Self { exe, args }
    }

    /// The running binary with its original arguments.
    ///
    /// Resolved once, at startup, so an upgrade picks up whatever binary is
    /// installed at that path later.
    pub fn current() -> io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            std::env::args_os().skip(1).collect(),
        ))
    }

    fn command(&self, inherit: Vec<RawFd>) -> Command {
        let mut command = Command::new(&self.exe);
        command.args(&self.args).stdin(Stdio::null());
        // SAFETY: the closure only issues fcntl(2), which is async-signal-safe,
        // and does not allocate.
        unsafe {
            command.pre_exec(move || {
                for &fd in &inherit {
                    crate::lifecycle::set_cloexec(fd, false)?;
                }
                Ok(())
            });
        }
        command
    }
}

impl ProcessControl for SystemProcesses {
    fn spawn_worker(&mut self, env: &WorkerEnv) -> Result<Pid, SpawnError> {
        let payload = env.encode()?;
        let mut inherit = env.listen_fds.clone();
        inherit.push(env.heartbeat_fd);

        let child = self
            .command(inherit)
            .env(WORKER_ENV, payload)
            .env_remove(INHERIT_FDS_ENV)
            .spawn()
            .map_err(|source| SpawnError::Io {
                role: "worker",
                source,
            })?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn spawn_master(&mut self, fds: &[RawFd]) -> Result<Pid, SpawnError> {
        let child = self
            .command(fds.to_vec())
            .env(INHERIT_FDS_ENV, format_fd_list(fds))
            .env_remove(WORKER_ENV)
            .spawn()
            .map_err(|source| SpawnError::Io {
                role: "master",
                source,
            })?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> bool {
        match kill(pid, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                tracing::warn!(pid = %pid, signal = %signal, error = %e, "Failed to signal process");
                false
            }
        }
    }

    fn try_reap(&mut self, pid: Pid) -> Option<ExitStatus> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => Some(ExitStatus::Signaled(signal)),
            Ok(_) => None,
            Err(Errno::ECHILD) => Some(ExitStatus::Unknown),
            Err(e) => {
                tracing::warn!(pid = %pid, error = %e, "waitpid failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> SystemProcesses {
        SystemProcesses::new("/bin/sh".into(), vec!["-c".into(), script.into()])
    }

    fn wait_for_exit(processes: &mut SystemProcesses, pid: Pid) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = processes.try_reap(pid) {
                return status;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn successor_sees_only_listed_fds() {
        let keep = tempfile::tempfile().unwrap();
        let drop_me = tempfile::tempfile().unwrap();
        let keep_fd = std::os::fd::AsRawFd::as_raw_fd(&keep);
        let drop_fd = std::os::fd::AsRawFd::as_raw_fd(&drop_me);

        let script = format!(
            "test \"${INHERIT_FDS_ENV}\" = {keep_fd} && test -e /proc/self/fd/{keep_fd} && ! test -e /proc/self/fd/{drop_fd}"
        );
        let mut processes = sh(&script);
        let pid = processes.spawn_master(&[keep_fd]).unwrap();
        assert_eq!(wait_for_exit(&mut processes, pid), ExitStatus::Exited(0));

        // Parent side is untouched.
        assert!(crate::lifecycle::is_cloexec(keep_fd).unwrap());
    }

    #[test]
    fn signal_and_reap() {
        let mut processes = sh("sleep 30");
        let pid = processes.spawn_master(&[]).unwrap();
        assert_eq!(processes.try_reap(pid), None);

        assert!(processes.signal(pid, Signal::SIGTERM));
        assert_eq!(
            wait_for_exit(&mut processes, pid),
            ExitStatus::Signaled(Signal::SIGTERM)
        );

        // Gone: signalling again is a harmless no-op and reaping reports unknown.
        assert!(!processes.signal(pid, Signal::SIGTERM));
        assert_eq!(processes.try_reap(pid), Some(ExitStatus::Unknown));
    }

    #[test]
    fn exit_status_display() {
        assert_eq!(ExitStatus::Exited(3).to_string(), "exit 3");
        assert_eq!(
            ExitStatus::Signaled(Signal::SIGKILL).to_string(),
            "signal SIGKILL"
        );
        assert!(ExitStatus::Exited(0).success());
    }
}
