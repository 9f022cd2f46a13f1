//! Process entry point.
//!
//! The same binary runs as master or worker. A `PREFORK_WORKER` payload in
//! the environment selects the worker role; otherwise this is a master,
//! fresh or (with `PREFORK_INHERIT_FDS` set) an upgrade successor.

use std::io;
use std::path::PathBuf;

use daemonize::Daemonize;
use thiserror::Error;

use crate::config::{ConfigError, ConfigSource, FileSource, Hooks, Overrides, WorkerInfo};
use crate::lifecycle::SignalDispatcher;
use crate::master::{Master, MasterError, SystemProcesses};
use crate::net::{ListenerRegistry, INHERIT_FDS_ENV};
use crate::observability::{logging, metrics};
use crate::worker::{Handler, Worker, WorkerEnv, WorkerError};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Master(#[from] MasterError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("failed to daemonize: {0}")]
    Daemonize(#[from] daemonize::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Startup options for the master role.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config: Option<PathBuf>,
    pub overrides: Overrides,
    pub daemonize: bool,
}

/// Run this process in whichever role its environment selects.
///
/// `make_handler` is only called in workers, after the after-fork hook.
pub fn run<H, F>(options: Options, hooks: Hooks, make_handler: F) -> Result<(), LaunchError>
where
    H: Handler,
    F: FnOnce(&WorkerInfo) -> H,
{
    match WorkerEnv::from_env()? {
        Some(env) => run_worker(env, hooks, make_handler),
        None => run_master(options, hooks),
    }
}

fn run_worker<H, F>(env: WorkerEnv, hooks: Hooks, make_handler: F) -> Result<(), LaunchError>
where
    H: Handler,
    F: FnOnce(&WorkerInfo) -> H,
{
    let log = logging::init(&env.logging)?;
    let info = env.info();
    hooks.run_after_fork(&info);
    let handler = make_handler(&info);

    // SAFETY: the master cleared close-on-exec on exactly these fds for this
    // process and nothing here has claimed them yet.
    let worker = unsafe { Worker::adopt(&env, handler)? };
    worker.with_log_handle(log).run()?;
    Ok(())
}

fn run_master(options: Options, hooks: Hooks) -> Result<(), LaunchError> {
    let source = FileSource::new(options.config, options.overrides);
    let settings = source.load()?;

    let successor = std::env::var_os(INHERIT_FDS_ENV).is_some();
    if options.daemonize && !successor {
        Daemonize::new()
            .working_directory(std::env::current_dir()?)
            .start()?;
    }

    let log = logging::init(&settings.logging)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        successor,
        "prefork master starting"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let registry = ListenerRegistry::from_env().map_err(MasterError::from)?;
        // Installed before any child exists so no CHLD is missed.
        let signals = SignalDispatcher::install().map_err(MasterError::Signals)?;

        if let Some(addr) = settings.metrics_socket_addr() {
            metrics::init_metrics(addr);
        }

        let processes = SystemProcesses::current()?;
        let mut master =
            Master::new(processes, source, settings, hooks, registry).with_log_handle(log);
        master.start()?;
        master.run(signals).await;
        Ok(())
    })
}
