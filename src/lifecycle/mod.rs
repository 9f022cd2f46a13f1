//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     OS signal → SignalDispatcher → EventQueue → master loop
//!     QUIT/TERM/INT coalesce into one pending terminal action
//!
//! PID file (pidfile.rs):
//!     start: refuse if a live master owns it → write atomically
//!     upgrade: rename to <pid>.oldbin → successor writes canonical file
//!     exit: unlink only if it still names this process
//!
//! Heartbeat (heartbeat.rs):
//!     worker bumps a counter in an unlinked temp file → master polls it
//!
//! Upgrade (upgrade.rs):
//!     Idle → SpawningNew → AwaitingNewReady → HandoffComplete | RolledBack
//! ```
//!
//! # Design Decisions
//! - Signal handlers never run user logic; they only feed the queue
//! - Listener and heartbeat fds keep close-on-exec except in the exact child
//!   that should inherit them
//! - The upgrade spawn is a plain function over the process-control seam

pub mod heartbeat;
pub mod pidfile;
pub mod signals;
pub mod upgrade;

use std::io;
use std::os::fd::RawFd;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

pub use heartbeat::Heartbeat;
pub use pidfile::{PidFile, PidFileError};
pub use signals::{Event, EventQueue, SignalDispatcher, TerminalAction};
pub use upgrade::{UpgradeCoordinator, UpgradeError, UpgradeState};

/// Set or clear `FD_CLOEXEC` on `fd`.
pub fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let flags = if cloexec {
        FdFlag::FD_CLOEXEC
    } else {
        FdFlag::empty()
    };
    fcntl(fd, FcntlArg::F_SETFD(flags))
        .map(drop)
        .map_err(io::Error::from)
}

/// Whether `fd` is currently marked close-on-exec.
pub fn is_cloexec(fd: RawFd) -> io::Result<bool> {
    let raw = fcntl(fd, FcntlArg::F_GETFD).map_err(io::Error::from)?;
    Ok(FdFlag::from_bits_truncate(raw).contains(FdFlag::FD_CLOEXEC))
}
