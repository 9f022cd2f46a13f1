//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Master and workers produce:
//!     → logging.rs (structured log events, reopenable sink)
//!     → metrics.rs (counters, gauges; master only)
//!
//! Consumers:
//!     → Log file or stderr, rotated externally and reopened on signal
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID is attached to every request span in workers
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use logging::{LogHandle, LogSink};
