//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ServerConfig.listen
//!     → registry.rs (diff against live set, bind / close / keep)
//!     → listener.rs (bind with options, stale Unix path cleanup)
//!     → ordered fd list
//!         → workers (per-worker subset)
//!         → successor master (full list, PREFORK_INHERIT_FDS)
//! ```
//!
//! # Design Decisions
//! - Sockets are bound only in the master; workers accept on inherited fds
//! - The kernel accept queue is the only state shared between workers
//! - Listener identity is (family, address)

pub mod listener;
pub mod registry;

pub use listener::{BindError, Connection, ListenAddress, Listener, SocketOptions};
pub use registry::{ListenerDiff, ListenerRegistry, INHERIT_FDS_ENV};
