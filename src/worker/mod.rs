//! Worker process.
//!
//! # Data Flow
//! ```text
//! PREFORK_WORKER (JSON) → WorkerEnv
//!     → adopt inherited listener fds + heartbeat fd
//!     → after_fork hook → handler
//!     → loop:
//!         quit flag?  → finish, exit 0
//!         reopen flag? → reopen logs
//!         parent changed? → exit
//!         beat → poll listeners → accept → handle one request → beat
//! ```
//!
//! # Design Decisions
//! - Blocking, one request at a time; concurrency comes from the pool
//! - Signal handlers only set atomic flags; TERM/INT keep their default
//!   (immediate) disposition
//! - A panicking or failing handler costs one connection, not the worker,
//!   unless it reports [`HandlerError::Fatal`]

pub mod handler;
pub mod http1;

use std::io;
use std::os::fd::{AsFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{getppid, Pid};
use serde::{Deserialize, Serialize};
use signal_hook::consts::{SIGQUIT, SIGUSR1};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{LoggingConfig, WorkerInfo};
use crate::lifecycle::Heartbeat;
use crate::net::{BindError, Connection, Listener};
use crate::observability::LogHandle;

pub use handler::{Handler, HandlerError, RequestContext, REQUEST_ID_HEADER};

/// Environment variable carrying the [`WorkerEnv`] payload.
pub const WORKER_ENV: &str = "PREFORK_WORKER";

const MIN_IDLE_BEAT: Duration = Duration::from_millis(10);
const MAX_IDLE_BEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid {WORKER_ENV} payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Listener(#[from] BindError),

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error("worker I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("handler reported a fatal error: {0}")]
    Fatal(String),
}

/// Everything a worker needs from its master, passed through the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnv {
    pub ordinal: usize,
    pub generation: u64,
    /// Inherited listener fds, in registry order.
    pub listen_fds: Vec<RawFd>,
    pub heartbeat_fd: RawFd,
    pub timeout_ms: u64,
    pub logging: LoggingConfig,
    /// Pid of the spawning master. A different parent means it is gone.
    pub master_pid: i32,
}

impl WorkerEnv {
    /// Read and remove the payload. `None` means this process is a master.
    pub fn from_env() -> Result<Option<Self>, WorkerError> {
        let Ok(raw) = std::env::var(WORKER_ENV) else {
            return Ok(None);
        };
        std::env::remove_var(WORKER_ENV);
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            ordinal: self.ordinal,
            generation: self.generation,
        }
    }

    pub fn master(&self) -> Pid {
        Pid::from_raw(self.master_pid)
    }

    /// Longest the worker may sit idle between heartbeats.
    pub fn idle_beat_interval(&self) -> Duration {
        (Duration::from_millis(self.timeout_ms) / 4).clamp(MIN_IDLE_BEAT, MAX_IDLE_BEAT)
    }
}

/// A running worker.
pub struct Worker<H> {
    info: WorkerInfo,
    listeners: Vec<Listener>,
    heartbeat: Heartbeat,
    handler: H,
    quit: Arc<AtomicBool>,
    reopen: Arc<AtomicBool>,
    parent: Pid,
    idle_beat: Duration,
    log: Option<LogHandle>,
}

impl<H: Handler> Worker<H> {
    /// Adopt the inherited descriptors described by `env`.
    ///
    /// # Safety
    ///
    /// The fds in `env` must have been inherited from the master and not be
    /// owned by anything else in this process.
    pub unsafe fn adopt(env: &WorkerEnv, handler: H) -> Result<Self, WorkerError> {
        let listeners = env
            .listen_fds
            .iter()
            .map(|&fd| Listener::from_inherited_fd(fd))
            .collect::<Result<Vec<_>, _>>()?;
        let heartbeat = Heartbeat::from_raw_fd(env.heartbeat_fd);
        crate::lifecycle::set_cloexec(env.heartbeat_fd, true)?;

        let quit = Arc::new(AtomicBool::new(false));
        let reopen = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGQUIT, Arc::clone(&quit)).map_err(WorkerError::Signal)?;
        signal_hook::flag::register(SIGUSR1, Arc::clone(&reopen)).map_err(WorkerError::Signal)?;

        Ok(Self {
            info: env.info(),
            listeners,
            heartbeat,
            handler,
            quit,
            reopen,
            parent: env.master(),
            idle_beat: env.idle_beat_interval(),
            log: None,
        })
    }

    pub fn with_log_handle(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    /// Flag that stops the loop after the current request.
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit)
    }

    /// Serve until asked to quit or orphaned.
    pub fn run(mut self) -> Result<(), WorkerError> {
        let who = format!("worker={}", self.info.ordinal);
        tracing::info!(
            generation = self.info.generation,
            listeners = self.listeners.len(),
            "{} ready",
            who
        );

        let timeout = PollTimeout::from(self.idle_beat.as_millis().min(u128::from(u16::MAX)) as u16);
        loop {
            if self.quit.load(Ordering::SeqCst) {
                tracing::info!("{} exiting on graceful quit", who);
                break;
            }
            if self.reopen.swap(false, Ordering::SeqCst) {
                if let Some(log) = &self.log {
                    log.reopen(&who);
                }
            }
            if getppid() != self.parent {
                tracing::warn!(parent = %self.parent, "{} master went away, exiting", who);
                break;
            }
            self.heartbeat.beat()?;

            let ready = match self.wait_readable(timeout) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(WorkerError::Io(e.into())),
            };

            for index in ready {
                if self.quit.load(Ordering::SeqCst) {
                    break;
                }
                match self.listeners[index].accept() {
                    Ok(connection) => self.serve(connection)?,
                    // Another worker won the race.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        tracing::warn!(address = %self.listeners[index].address(), error = %e, "Accept failed")
                    }
                }
            }
        }

        tracing::info!("{} complete", who);
        Ok(())
    }

    fn wait_readable(&self, timeout: PollTimeout) -> Result<Vec<usize>, Errno> {
        let mut fds: Vec<PollFd<'_>> = self
            .listeners
            .iter()
            .map(|l| PollFd::new(l.as_fd(), PollFlags::POLLIN))
            .collect();
        if poll(&mut fds, timeout)? == 0 {
            return Ok(Vec::new());
        }
        Ok(fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| fd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN)))
            .map(|(index, _)| index)
            .collect())
    }

    fn serve(&mut self, mut connection: Connection) -> Result<(), WorkerError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "request",
            worker = self.info.ordinal,
            request_id = tracing::field::Empty,
            peer = %connection.peer(),
        );
        let _guard = span.enter();

        if let Err(e) = connection.set_nonblocking(false) {
            tracing::warn!(error = %e, "Failed to configure connection");
            return Ok(());
        }

        let context = RequestContext {
            listener: self.listener_for(&connection),
            worker: self.info,
            request_id,
        };
        let handler = &mut self.handler;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            http1::serve_connection(handler, &mut connection, context)
        }));

        match outcome {
            Ok(Ok(status)) => tracing::debug!(status = status.as_u16(), "Request complete"),
            Ok(Err(HandlerError::Fatal(reason))) => {
                tracing::error!(reason = %reason, "Handler reported a fatal error");
                return Err(WorkerError::Fatal(reason));
            }
            Ok(Err(HandlerError::Io(e))) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Client closed before sending a request")
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Request failed"),
            Err(_) => tracing::error!("Handler panicked; connection closed"),
        }
        drop(connection);

        self.heartbeat.beat()?;
        Ok(())
    }

    fn listener_for(&self, connection: &Connection) -> crate::net::ListenAddress {
        let local = match connection {
            Connection::Tcp(stream, _) => stream
                .local_addr()
                .ok()
                .map(crate::net::ListenAddress::Tcp),
            Connection::Unix(stream) => stream
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| crate::net::ListenAddress::Unix(p.to_path_buf()))),
        };
        local
            .or_else(|| self.listeners.first().map(|l| l.address().clone()))
            .unwrap_or_else(|| crate::net::ListenAddress::Unix(Default::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SocketOptions;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    fn env(listen_fds: Vec<RawFd>, heartbeat_fd: RawFd) -> WorkerEnv {
        WorkerEnv {
            ordinal: 2,
            generation: 7,
            listen_fds,
            heartbeat_fd,
            timeout_ms: 400,
            logging: LoggingConfig::default(),
            master_pid: getppid().as_raw(),
        }
    }

    #[test]
    fn payload_round_trip_and_beat_interval() {
        let env = env(vec![3, 4], 5);
        let decoded: WorkerEnv = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.info(), WorkerInfo { ordinal: 2, generation: 7 });
        assert_eq!(decoded.idle_beat_interval(), Duration::from_millis(100));

        let slow = WorkerEnv {
            timeout_ms: 60_000,
            ..decoded
        };
        assert_eq!(slow.idle_beat_interval(), MAX_IDLE_BEAT);
    }

    #[test]
    fn serves_then_quits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        let listener =
            Listener::bind(&crate::net::ListenAddress::Unix(path.clone()), SocketOptions::default())
                .unwrap();
        let listen_fd = nix::unistd::dup(listener.as_raw_fd()).unwrap();
        let master_beat = Heartbeat::create().unwrap();
        let beat_fd = nix::unistd::dup(master_beat.as_raw_fd()).unwrap();

        let handler = |req: http::Request<Vec<u8>>| -> Result<http::Response<Vec<u8>>, HandlerError> {
            let ctx = req.extensions().get::<RequestContext>().cloned().unwrap();
            Ok(http::Response::new(
                format!("worker={} gen={}", ctx.worker.ordinal, ctx.worker.generation).into_bytes(),
            ))
        };
        let worker = unsafe { Worker::adopt(&env(vec![listen_fd], beat_fd), handler) }.unwrap();
        let quit = worker.quit_flag();
        let thread = std::thread::spawn(move || worker.run());

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.ends_with("worker=2 gen=7"), "{reply}");

        quit.store(true, Ordering::SeqCst);
        thread.join().unwrap().unwrap();
        assert!(master_beat.read().unwrap() >= 2);
    }

    #[test]
    fn panicking_handler_costs_one_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let listen_fd = listener.into_raw_fd();
        let master_beat = Heartbeat::create().unwrap();
        let beat_fd = nix::unistd::dup(master_beat.as_raw_fd()).unwrap();

        let mut calls = 0;
        let handler = move |_req: http::Request<Vec<u8>>| -> Result<http::Response<Vec<u8>>, HandlerError> {
            calls += 1;
            if calls == 1 {
                panic!("first request explodes");
            }
            Ok(http::Response::new(b"fine".to_vec()))
        };
        let worker = unsafe { Worker::adopt(&env(vec![listen_fd], beat_fd), handler) }.unwrap();
        let quit = worker.quit_flag();
        let thread = std::thread::spawn(move || worker.run());

        let mut first = std::net::TcpStream::connect(addr).unwrap();
        first.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut reply = Vec::new();
        let _ = first.read_to_end(&mut reply);
        assert!(reply.is_empty());

        let mut second = std::net::TcpStream::connect(addr).unwrap();
        second.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut reply = String::new();
        second.read_to_string(&mut reply).unwrap();
        assert!(reply.ends_with("fine"));

        quit.store(true, Ordering::SeqCst);
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn fatal_handler_error_ends_worker() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let listen_fd = listener.into_raw_fd();
        let beat_fd = nix::unistd::dup(Heartbeat::create().unwrap().as_raw_fd()).unwrap();

        let handler = |_req: http::Request<Vec<u8>>| -> Result<http::Response<Vec<u8>>, HandlerError> {
            Err(HandlerError::Fatal("corrupted state".into()))
        };
        let worker = unsafe { Worker::adopt(&env(vec![listen_fd], beat_fd), handler) }.unwrap();
        let thread = std::thread::spawn(move || worker.run());

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let result = thread.join().unwrap();
        assert!(matches!(result, Err(WorkerError::Fatal(_))));
    }

    #[test]
    fn worker_whose_master_is_gone_exits_without_serving() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen_fd = listener.into_raw_fd();
        let master_beat = Heartbeat::create().unwrap();
        let beat_fd = nix::unistd::dup(master_beat.as_raw_fd()).unwrap();

        // Reparented before adopting: the recorded master is not our parent.
        let orphaned = WorkerEnv {
            master_pid: i32::MAX,
            ..env(vec![listen_fd], beat_fd)
        };
        let handler = |_req: http::Request<Vec<u8>>| -> Result<http::Response<Vec<u8>>, HandlerError> {
            panic!("an orphaned worker must not serve");
        };
        let worker = unsafe { Worker::adopt(&orphaned, handler) }.unwrap();
        worker.run().unwrap();
        assert_eq!(master_beat.read().unwrap(), 0);
    }
}
