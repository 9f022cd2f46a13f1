//! Worker liveness channel.
//!
//! Each worker owns one unlinked temp file created by the master. The worker
//! writes a monotonically increasing counter into the first eight bytes; the
//! master compares successive reads. Positional I/O on a fixed slot means
//! neither side ever blocks on the other.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::FileExt;

const SLOT: u64 = 0;

#[derive(Debug)]
pub struct Heartbeat {
    file: File,
    counter: u64,
}

impl Heartbeat {
    /// Create a fresh channel (master side). The file has no name on disk.
    pub fn create() -> io::Result<Self> {
        let file = tempfile::tempfile()?;
        file.write_all_at(&0u64.to_le_bytes(), SLOT)?;
        Ok(Self { file, counter: 0 })
    }

    /// Adopt an inherited channel (worker side).
    ///
    /// # Safety
    ///
    /// `fd` must be an open file descriptor owned by nothing else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            file: File::from_raw_fd(fd),
            counter: 0,
        }
    }

    /// Record liveness.
    pub fn beat(&mut self) -> io::Result<()> {
        self.counter = self.counter.wrapping_add(1);
        self.file.write_all_at(&self.counter.to_le_bytes(), SLOT)
    }

    /// Current counter value as last written by the worker.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, SLOT)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl AsRawFd for Heartbeat {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
