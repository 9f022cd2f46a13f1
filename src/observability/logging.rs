//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber for master and workers
//! - Route output to stderr or an append-mode file that can be reopened
//! - Redirect the process's standard streams when configured
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level
//! - The writer looks up its target on every event, so reopening and
//!   retargeting swap the file underneath a live subscriber

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug)]
enum Target {
    Stderr,
    File { path: PathBuf, file: File },
}

impl Target {
    fn open(path: Option<&Path>) -> io::Result<Self> {
        match path {
            Some(path) => Ok(Target::File {
                path: path.to_path_buf(),
                file: open_append(path)?,
            }),
            None => Ok(Target::Stderr),
        }
    }
}

/// Reopenable log destination.
#[derive(Debug, Clone)]
pub struct LogSink {
    target: Arc<Mutex<Target>>,
}

impl LogSink {
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        Ok(Self {
            target: Arc::new(Mutex::new(Target::open(path)?)),
        })
    }

    /// Reopen the current file at its path, e.g. after rotation.
    pub fn reopen(&self) -> io::Result<()> {
        let mut target = self.lock();
        if let Target::File { path, file } = &mut *target {
            *file = open_append(path)?;
        }
        Ok(())
    }

    /// Switch to a different destination.
    pub fn retarget(&self, path: Option<&Path>) -> io::Result<()> {
        let next = Target::open(path)?;
        *self.lock() = next;
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        match &*self.lock() {
            Target::File { path, .. } => Some(path.clone()),
            Target::Stderr => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Target> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writer handed out per event.
pub struct SinkWriter {
    target: Arc<Mutex<Target>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock().unwrap_or_else(PoisonError::into_inner) {
            Target::Stderr => io::stderr().write(buf),
            Target::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock().unwrap_or_else(PoisonError::into_inner) {
            Target::Stderr => io::stderr().flush(),
            Target::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            target: Arc::clone(&self.target),
        }
    }
}

/// Handle kept by the master and each worker for log rotation.
#[derive(Debug, Clone)]
pub struct LogHandle {
    sink: LogSink,
    config: Arc<Mutex<LoggingConfig>>,
}

impl LogHandle {
    /// Reopen the log file and re-apply standard stream redirection.
    ///
    /// `who` prefixes the two log lines, e.g. `master` or `worker=3`.
    pub fn reopen(&self, who: &str) {
        tracing::info!("{} reopening logs...", who);
        if let Err(e) = self.sink.reopen() {
            tracing::error!(error = %e, "Failed to reopen log file");
        }
        let config = self.config.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Err(e) = redirect_std_streams(&config) {
            tracing::error!(error = %e, "Failed to redirect standard streams");
        }
        tracing::info!("{} done reopening logs", who);
    }

    /// Apply a reloaded logging configuration. Level and format are fixed
    /// at startup; destinations follow the new settings.
    pub fn apply(&self, next: &LoggingConfig) {
        let mut current = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        if current.path != next.path {
            match self.sink.retarget(next.path.as_deref()) {
                Ok(()) => tracing::info!(path = ?next.path, "Log destination changed"),
                Err(e) => {
                    tracing::error!(path = ?next.path, error = %e, "Failed to open new log destination");
                    return;
                }
            }
        }
        if current.stderr_path != next.stderr_path || current.stdout_path != next.stdout_path {
            if let Err(e) = redirect_std_streams(next) {
                tracing::error!(error = %e, "Failed to redirect standard streams");
            }
        }
        *current = next.clone();
    }
}

/// Initialize logging for this process.
///
/// A subscriber that is already installed (tests) is left in place; the
/// returned handle still controls its own sink.
pub fn init(config: &LoggingConfig) -> io::Result<LogHandle> {
    redirect_std_streams(config)?;
    let sink = LogSink::open(config.path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let ansi = config.path.is_none() && config.stderr_path.is_none();
    let (pretty, json) = match config.format {
        LogFormat::Pretty => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(sink.clone())
                    .with_ansi(ansi),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(sink.clone()),
            ),
        ),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init();

    Ok(LogHandle {
        sink,
        config: Arc::new(Mutex::new(config.clone())),
    })
}

/// Point fd 2 / fd 1 at the configured files.
pub fn redirect_std_streams(config: &LoggingConfig) -> io::Result<()> {
    if let Some(path) = &config.stderr_path {
        redirect(path, 2)?;
    }
    if let Some(path) = &config.stdout_path {
        redirect(path, 1)?;
    }
    Ok(())
}

fn redirect(path: &Path, target: i32) -> io::Result<()> {
    let file = open_append(path)?;
    nix::unistd::dup2(file.as_raw_fd(), target).map_err(io::Error::from)?;
    Ok(())
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let sink = LogSink::open(Some(&path)).unwrap();

        sink.make_writer().write_all(b"before\n").unwrap();
        let rotated = dir.path().join("app.log.1");
        std::fs::rename(&path, &rotated).unwrap();

        // Still writing to the rotated file until reopened.
        sink.make_writer().write_all(b"still old\n").unwrap();
        sink.reopen().unwrap();
        sink.make_writer().write_all(b"after\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(&rotated).unwrap(),
            "before\nstill old\n"
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn retarget_switches_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.log");
        let second = dir.path().join("b.log");
        let sink = LogSink::open(Some(&first)).unwrap();

        sink.retarget(Some(&second)).unwrap();
        sink.make_writer().write_all(b"line\n").unwrap();
        assert_eq!(sink.path(), Some(second.clone()));
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "line\n");
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "");
    }

    #[test]
    fn stderr_sink_has_no_path() {
        let sink = LogSink::open(None).unwrap();
        assert_eq!(sink.path(), None);
        assert!(sink.reopen().is_ok());
    }
}
