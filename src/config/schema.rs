//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the supervisor.
//! All types derive Serde traits for deserialization from config files, and
//! unknown keys are rejected so a typo never silently falls back to a default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::listener::{ListenAddress, SocketOptions};

/// Root configuration for the supervisor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Number of worker processes in the pool.
    pub worker_processes: usize,

    /// Seconds a worker may stay silent before it is terminated.
    pub timeout_secs: u64,

    /// Seconds between the immediate-terminate signal and a forced kill.
    pub kill_grace_secs: u64,

    /// Seconds a graceful shutdown waits for workers before terminating them.
    pub shutdown_timeout_secs: u64,

    /// PID file path. Required for live upgrades.
    pub pid: Option<PathBuf>,

    /// Prometheus exporter bind address (master only).
    pub metrics_address: Option<String>,

    /// Listening sockets, in inheritance order.
    pub listen: Vec<ListenerConfig>,

    /// Log destination and format.
    pub logging: LoggingConfig,

    /// Live upgrade policy.
    pub upgrade: UpgradeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_processes: 1,
            timeout_secs: 60,
            kill_grace_secs: 5,
            shutdown_timeout_secs: 30,
            pid: None,
            metrics_address: None,
            listen: Vec::new(),
            logging: LoggingConfig::default(),
            upgrade: UpgradeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Per-worker heartbeat timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Parsed metrics exporter address, if one is configured and valid.
    pub fn metrics_socket_addr(&self) -> Option<SocketAddr> {
        self.metrics_address.as_deref().and_then(|a| a.parse().ok())
    }
}

/// One listening socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// `host:port`, bare `port`, `unix:/path` or an absolute socket path.
    pub address: ListenAddress,

    /// OS listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// SO_RCVBUF in bytes; the OS default when unset.
    #[serde(default)]
    pub receive_buffer_size: Option<usize>,

    /// SO_SNDBUF in bytes; the OS default when unset.
    #[serde(default)]
    pub send_buffer_size: Option<usize>,

    /// Enable SO_REUSEADDR.
    #[serde(default = "default_reuse")]
    pub reuse: bool,

    /// Restrict this listener to the given worker ordinals.
    #[serde(default)]
    pub workers: Option<Vec<usize>>,
}

impl ListenerConfig {
    /// Listener with default options on `address`.
    pub fn new(address: ListenAddress) -> Self {
        Self {
            address,
            backlog: default_backlog(),
            receive_buffer_size: None,
            send_buffer_size: None,
            reuse: default_reuse(),
            workers: None,
        }
    }

    /// Socket-level options for binding.
    pub fn options(&self) -> SocketOptions {
        SocketOptions {
            backlog: self.backlog,
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            reuse: self.reuse,
        }
    }
}

fn default_backlog() -> i32 {
    1024
}

fn default_reuse() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level directive (trace, debug, info, warn, error, or a filter).
    pub level: String,

    /// Pretty text or JSON lines.
    pub format: LogFormat,

    /// Append-mode log file. Logs go to stderr when unset.
    pub path: Option<PathBuf>,

    /// Redirect the process's stderr to this file.
    pub stderr_path: Option<PathBuf>,

    /// Redirect the process's stdout to this file.
    pub stdout_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            path: None,
            stderr_path: None,
            stdout_path: None,
        }
    }
}

/// Live upgrade policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeConfig {
    /// Gracefully quit the old master as soon as the new one claims the PID file.
    /// When false the old master waits for an explicit graceful-quit.
    pub auto_quit_old: bool,

    /// Seconds to wait for the new master to claim the PID file.
    pub ready_timeout_secs: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            auto_quit_old: false,
            ready_timeout_secs: 60,
        }
    }
}

impl UpgradeConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Information handed to lifecycle hooks about the worker being spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Ordinal within the generation (0..worker_processes).
    pub ordinal: usize,
    /// Generation the worker belongs to.
    pub generation: u64,
}

type WorkerHook = Box<dyn Fn(&WorkerInfo) + Send + Sync>;
type ExecHook = Box<dyn Fn() + Send + Sync>;

/// Lifecycle hook closures.
///
/// `before_fork` runs in the master just before a worker is started,
/// `after_fork` runs inside the worker before it starts accepting and
/// `before_exec` runs in the master just before a successor master is started.
#[derive(Default)]
pub struct Hooks {
    before_fork: Option<WorkerHook>,
    after_fork: Option<WorkerHook>,
    before_exec: Option<ExecHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_fork<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkerInfo) + Send + Sync + 'static,
    {
        self.before_fork = Some(Box::new(f));
        self
    }

    pub fn after_fork<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkerInfo) + Send + Sync + 'static,
    {
        self.after_fork = Some(Box::new(f));
        self
    }

    pub fn before_exec<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_exec = Some(Box::new(f));
        self
    }

    pub fn run_before_fork(&self, worker: &WorkerInfo) {
        if let Some(hook) = &self.before_fork {
            hook(worker);
        }
    }

    pub fn run_after_fork(&self, worker: &WorkerInfo) {
        if let Some(hook) = &self.after_fork {
            hook(worker);
        }
    }

    pub fn run_before_exec(&self) {
        if let Some(hook) = &self.before_exec {
            hook();
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_fork", &self.before_fork.is_some())
            .field("after_fork", &self.after_fork.is_some())
            .field("before_exec", &self.before_exec.is_some())
            .finish()
    }
}

/// Immutable configuration snapshot held by the master.
///
/// Replaced wholesale on reload; the hooks are carried over from the
/// previous snapshot since they are code, not configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub settings: Arc<ServerConfig>,
    pub hooks: Arc<Hooks>,
}

impl ConfigSnapshot {
    pub fn new(settings: ServerConfig, hooks: Arc<Hooks>) -> Self {
        Self {
            settings: Arc::new(settings),
            hooks,
        }
    }

    /// A new snapshot with fresh settings and the same hooks.
    pub fn replace(&self, settings: ServerConfig) -> Self {
        Self::new(settings, Arc::clone(&self.hooks))
    }
}
