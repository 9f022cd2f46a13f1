//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + command-line overrides
//!     → loader.rs (parse, deserialize, apply overrides)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → ConfigSnapshot (settings + lifecycle hooks) owned by the master
//!
//! On reload signal:
//!     master asks its ConfigSource for a fresh ServerConfig
//!     → on error: log, keep the previous snapshot
//!     → on success: replace the snapshot wholesale
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Unknown keys are errors
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{ConfigError, ConfigSource, FileSource, Overrides};
pub use schema::{
    ConfigSnapshot, Hooks, ListenerConfig, LogFormat, LoggingConfig, ServerConfig, UpgradeConfig,
    WorkerInfo,
};
