//! PID file management.
//!
//! The canonical file holds the decimal pid of the authoritative master.
//! During an upgrade the predecessor's file is renamed with an `.oldbin`
//! suffix; at most one such file exists at a time.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::NamedTempFile;
use thiserror::Error;

const OLDBIN_SUFFIX: &str = ".oldbin";

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("pid file {path} names running process {pid}")]
    AlreadyRunning { path: PathBuf, pid: Pid },

    #[error("{0} belongs to a live master; an upgrade is already in progress")]
    OldbinInUse(PathBuf),

    #[error("pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle on a PID file path and its `.oldbin` sibling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn oldbin_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(OLDBIN_SUFFIX);
        PathBuf::from(name)
    }

    /// Pid recorded in the canonical file, if readable.
    pub fn read(&self) -> Option<Pid> {
        read_pid(&self.path)
    }

    pub fn read_oldbin(&self) -> Option<Pid> {
        read_pid(&self.oldbin_path())
    }

    /// Fail if the file names a live process other than `me`.
    pub fn check_available(&self, me: Pid) -> Result<(), PidFileError> {
        match self.read() {
            Some(pid) if pid != me && process_alive(pid) => Err(PidFileError::AlreadyRunning {
                path: self.path.clone(),
                pid,
            }),
            _ => Ok(()),
        }
    }

    /// Write `pid` atomically: temp file in the same directory, then rename.
    pub fn write(&self, pid: Pid) -> Result<(), PidFileError> {
        let err = |source| PidFileError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(err)?;
        writeln!(tmp, "{}", pid).map_err(err)?;
        tmp.persist(&self.path).map_err(|e| err(e.error))?;
        tracing::debug!(path = %self.path.display(), pid = %pid, "Wrote pid file");
        Ok(())
    }

    /// Move the canonical file aside for an upgrade.
    ///
    /// Idempotent for `me`: an `.oldbin` that already names this process is
    /// reused, so a retried upgrade never creates a second one. An `.oldbin`
    /// left behind by a dead process is replaced.
    pub fn rename_to_oldbin(&self, me: Pid) -> Result<PathBuf, PidFileError> {
        let oldbin = self.oldbin_path();
        match self.read_oldbin() {
            Some(pid) if pid == me => return Ok(oldbin),
            Some(pid) if process_alive(pid) => return Err(PidFileError::OldbinInUse(oldbin)),
            _ => {}
        }

        if self.read() == Some(me) {
            fs::rename(&self.path, &oldbin).map_err(|source| PidFileError::Io {
                path: oldbin.clone(),
                source,
            })?;
        } else {
            // Canonical file is missing or foreign; record ourselves directly.
            PidFile::new(oldbin.clone()).write(me)?;
        }
        tracing::info!(path = %oldbin.display(), "Renamed pid file for upgrade");
        Ok(oldbin)
    }

    /// Remove the canonical and `.oldbin` files that still name `me`.
    pub fn remove_if_owned(&self, me: Pid) {
        for path in [self.path.clone(), self.oldbin_path()] {
            if read_pid(&path) == Some(me) {
                match fs::remove_file(&path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "Removed pid file"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove pid file")
                    }
                }
            }
        }
    }
}

pub fn read_pid(path: &Path) -> Option<Pid> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|&pid| pid > 0)
        .map(Pid::from_raw)
}

/// Whether `pid` names an existing process.
pub fn process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    fn pidfile(dir: &tempfile::TempDir) -> PidFile {
        PidFile::new(dir.path().join("prefork.pid"))
    }

    /// A pid that is very unlikely to exist.
    fn dead_pid() -> Pid {
        Pid::from_raw(i32::MAX - 7)
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pidfile(&dir);
        pid_file.write(getpid()).unwrap();
        assert_eq!(pid_file.read(), Some(getpid()));
        assert_eq!(
            fs::read_to_string(pid_file.path()).unwrap(),
            format!("{}\n", getpid())
        );
    }

    #[test]
    fn live_foreign_pid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pidfile(&dir);
        pid_file.write(getpid()).unwrap();

        // Another master would see our pid as alive.
        let err = pid_file.check_available(dead_pid()).unwrap_err();
        assert!(matches!(err, PidFileError::AlreadyRunning { .. }));
        assert!(pid_file.check_available(getpid()).is_ok());
    }

    #[test]
    fn stale_pid_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pidfile(&dir);
        pid_file.write(dead_pid()).unwrap();
        assert!(pid_file.check_available(getpid()).is_ok());
    }

    #[test]
    fn oldbin_rename_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pidfile(&dir);
        pid_file.write(getpid()).unwrap();

        let oldbin = pid_file.rename_to_oldbin(getpid()).unwrap();
        assert!(!pid_file.path().exists());
        assert_eq!(read_pid(&oldbin), Some(getpid()));

        // Retry keeps the single .oldbin.
        let again = pid_file.rename_to_oldbin(getpid()).unwrap();
        assert_eq!(again, oldbin);
        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn oldbin_of_live_master_blocks_a_second_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pidfile(&dir);
        PidFile::new(pid_file.oldbin_path()).write(getpid()).unwrap();
        pid_file.write(dead_pid()).unwrap();

        let err = pid_file.rename_to_oldbin(dead_pid()).unwrap_err();
        assert!(matches!(err, PidFileError::OldbinInUse(_)));
    }

    #[test]
    fn remove_only_what_we_own() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pidfile(&dir);
        pid_file.write(dead_pid()).unwrap();
        PidFile::new(pid_file.oldbin_path()).write(getpid()).unwrap();

        pid_file.remove_if_owned(getpid());
        assert!(pid_file.path().exists());
        assert!(!pid_file.oldbin_path().exists());
    }
}
