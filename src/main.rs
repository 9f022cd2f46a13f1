//! Prefork supervisor
//!
//! # Architecture Overview
//!
//! ```text
//!                 signals (QUIT TERM INT HUP USR1 USR2 TTIN TTOU WINCH CHLD)
//!                                         │
//!                                         ▼
//!   ┌────────────────────────────── MASTER ───────────────────────────────┐
//!   │  SignalDispatcher → EventQueue → Master ──▶ ConfigSource (reload)    │
//!   │                                    │                                 │
//!   │          ListenerRegistry ◀────────┼────────▶ WorkerTable            │
//!   │          (bound / inherited fds)   │          (pid, ordinal, beat)   │
//!   │                                    ▼                                 │
//!   │                           UpgradeCoordinator ── PID file / .oldbin   │
//!   └──────────────┬───────────────────────────────────────┬──────────────┘
//!                  │ re-exec with PREFORK_WORKER            │ re-exec with
//!                  ▼                                        ▼ PREFORK_INHERIT_FDS
//!   ┌──────────┐ ┌──────────┐ ┌──────────┐           ┌──────────────┐
//!   │ worker 0 │ │ worker 1 │ │ worker N │           │  new master  │
//!   │ accept → │ │ accept → │ │ accept → │           └──────────────┘
//!   │ handler  │ │ handler  │ │ handler  │
//!   └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! The binary ships a small demo handler that reports which worker served
//! the request.

use std::path::PathBuf;

use clap::Parser;
use http::{header, Request, Response};

use prefork::config::Overrides;
use prefork::launch::{self, Options};
use prefork::net::ListenAddress;
use prefork::{Handler, HandlerError, Hooks, RequestContext, WorkerInfo};

#[derive(Parser)]
#[command(name = "prefork")]
#[command(about = "Prefork process supervisor", long_about = None)]
struct Cli {
    /// TOML configuration file, re-read on reload.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional listen address (repeatable).
    #[arg(short, long = "listen")]
    listen: Vec<ListenAddress>,

    /// PID file path.
    #[arg(short = 'P', long)]
    pid: Option<PathBuf>,

    /// Number of worker processes.
    #[arg(short = 'N', long)]
    workers: Option<usize>,

    /// Detach from the terminal.
    #[arg(short = 'D', long)]
    daemonize: bool,
}

fn demo_handler(info: &WorkerInfo) -> impl Handler {
    let info = *info;
    move |request: Request<Vec<u8>>| -> Result<Response<Vec<u8>>, HandlerError> {
        let worker = request
            .extensions()
            .get::<RequestContext>()
            .map(|ctx| ctx.worker)
            .unwrap_or(info);
        let body = format!(
            "worker={} generation={} pid={} path={}\n",
            worker.ordinal,
            worker.generation,
            std::process::id(),
            request.uri().path()
        );
        Response::builder()
            .header(header::CONTENT_TYPE, "text/plain")
            .body(body.into_bytes())
            .map_err(|e| HandlerError::Application(e.to_string()))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let options = Options {
        config: cli.config,
        overrides: Overrides {
            listen: cli.listen,
            pid: cli.pid,
            worker_processes: cli.workers,
        },
        daemonize: cli.daemonize,
    };

    let hooks = Hooks::new().after_fork(|worker| {
        tracing::debug!(worker = worker.ordinal, generation = worker.generation, "Worker started");
    });

    launch::run(options, hooks, demo_handler)?;
    Ok(())
}
