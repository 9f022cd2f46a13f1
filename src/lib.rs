//! Prefork process supervisor library.
//!
//! A master process owns the listening sockets and a pool of worker
//! processes that accept on them. The master reloads configuration, resizes
//! the pool, replaces hung workers and hands its sockets to a new binary for
//! zero-downtime upgrades, all driven by Unix signals.

// Core subsystems
pub mod config;
pub mod net;

// Process roles
pub mod master;
pub mod worker;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub mod launch;

pub use config::{ConfigSnapshot, Hooks, ServerConfig, WorkerInfo};
pub use master::{Master, MasterState};
pub use worker::{Handler, HandlerError, RequestContext};
