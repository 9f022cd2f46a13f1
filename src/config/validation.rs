//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, backlog > 0, pool size > 0)
//! - Detect duplicate listener identities
//! - Check per-worker listener assignments fit the pool
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("worker_processes must be at least 1")]
    NoWorkers,

    #[error("timeout_secs must be greater than 0")]
    ZeroTimeout,

    #[error("at least one listener is required")]
    NoListeners,

    #[error("listener {0} is configured more than once")]
    DuplicateListener(String),

    #[error("listener {address}: backlog must be positive, got {backlog}")]
    InvalidBacklog { address: String, backlog: i32 },

    #[error("listener {0}: buffer sizes must be greater than 0")]
    InvalidBufferSize(String),

    #[error("listener {address}: worker ordinal {ordinal} is outside the pool of {pool}")]
    WorkerOutOfRange {
        address: String,
        ordinal: usize,
        pool: usize,
    },

    #[error("invalid log level directive: {0}")]
    InvalidLogLevel(String),

    #[error("invalid metrics address: {0}")]
    InvalidMetricsAddress(String),

    #[error("{field} must be at most {MAX_DURATION_SECS} seconds, got {secs}")]
    DurationTooLarge { field: &'static str, secs: u64 },
}

/// Upper bound for every duration setting (one week).
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.worker_processes == 0 {
        errors.push(ValidationError::NoWorkers);
    }
    if config.timeout_secs == 0 {
        errors.push(ValidationError::ZeroTimeout);
    }
    if config.listen.is_empty() {
        errors.push(ValidationError::NoListeners);
    }
    for (field, secs) in [
        ("timeout_secs", config.timeout_secs),
        ("kill_grace_secs", config.kill_grace_secs),
        ("shutdown_timeout_secs", config.shutdown_timeout_secs),
        ("upgrade.ready_timeout_secs", config.upgrade.ready_timeout_secs),
    ] {
        if secs > MAX_DURATION_SECS {
            errors.push(ValidationError::DurationTooLarge { field, secs });
        }
    }

    let mut seen = HashSet::new();
    for listener in &config.listen {
        let address = listener.address.to_string();
        if !seen.insert(listener.address.clone()) {
            errors.push(ValidationError::DuplicateListener(address.clone()));
        }
        if listener.backlog <= 0 {
            errors.push(ValidationError::InvalidBacklog {
                address: address.clone(),
                backlog: listener.backlog,
            });
        }
        if listener.receive_buffer_size == Some(0) || listener.send_buffer_size == Some(0) {
            errors.push(ValidationError::InvalidBufferSize(address.clone()));
        }
        for &ordinal in listener.workers.iter().flatten() {
            if ordinal >= config.worker_processes {
                errors.push(ValidationError::WorkerOutOfRange {
                    address: address.clone(),
                    ordinal,
                    pool: config.worker_processes,
                });
            }
        }
    }

    if EnvFilter::try_new(&config.logging.level).is_err() {
        errors.push(ValidationError::InvalidLogLevel(config.logging.level.clone()));
    }

    if let Some(addr) = &config.metrics_address {
        if config.metrics_socket_addr().is_none() {
            errors.push(ValidationError::InvalidMetricsAddress(addr.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ListenerConfig;

    fn listener(addr: &str) -> ListenerConfig {
        ListenerConfig::new(addr.parse().unwrap())
    }

    #[test]
    fn valid_config_passes() {
        let config = ServerConfig {
            listen: vec![listener("127.0.0.1:8080")],
            ..ServerConfig::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut bad = listener("127.0.0.1:8080");
        bad.backlog = 0;
        bad.workers = Some(vec![3]);
        let config = ServerConfig {
            worker_processes: 2,
            timeout_secs: 0,
            listen: vec![bad, listener("127.0.0.1:8080")],
            ..ServerConfig::default()
        };

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::ZeroTimeout));
        assert!(errors.contains(&ValidationError::DuplicateListener("127.0.0.1:8080".into())));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidBacklog { backlog: 0, .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::WorkerOutOfRange { ordinal: 3, .. })));
    }

    #[test]
    fn empty_listener_set_is_rejected() {
        let errors = validate_config(&ServerConfig::default()).unwrap_err();
        assert_eq!(errors, vec![ValidationError::NoListeners]);
    }

    #[test]
    fn huge_durations_are_rejected() {
        let mut config = ServerConfig {
            shutdown_timeout_secs: i64::MAX as u64,
            listen: vec![listener("127.0.0.1:8080")],
            ..ServerConfig::default()
        };
        config.upgrade.ready_timeout_secs = MAX_DURATION_SECS + 1;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::DurationTooLarge {
                    field: "shutdown_timeout_secs",
                    secs: i64::MAX as u64,
                },
                ValidationError::DurationTooLarge {
                    field: "upgrade.ready_timeout_secs",
                    secs: MAX_DURATION_SECS + 1,
                },
            ]
        );

        config.shutdown_timeout_secs = MAX_DURATION_SECS;
        config.upgrade.ready_timeout_secs = MAX_DURATION_SECS;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn bad_metrics_address_is_rejected() {
        let config = ServerConfig {
            listen: vec![listener("127.0.0.1:8080")],
            metrics_address: Some("not-an-address".into()),
            ..ServerConfig::default()
        };
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::InvalidMetricsAddress("not-an-address".into())]
        );
    }
}
