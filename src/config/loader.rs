//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::{ListenerConfig, ServerConfig};
use crate::config::validation::{validate_config, ValidationError};
use crate::net::listener::ListenAddress;

/// Listener used when neither the file nor the command line names one.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Read and deserialize a TOML file. Validation happens after overrides.
pub fn read_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Command-line settings layered on top of the file on every load.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Extra listeners; augment the file's set.
    pub listen: Vec<ListenAddress>,
    pub pid: Option<PathBuf>,
    pub worker_processes: Option<usize>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ServerConfig) {
        for address in &self.listen {
            if !config.listen.iter().any(|l| &l.address == address) {
                config.listen.push(ListenerConfig::new(address.clone()));
            }
        }
        if let Some(pid) = &self.pid {
            config.pid = Some(pid.clone());
        }
        if let Some(workers) = self.worker_processes {
            config.worker_processes = workers;
        }
    }
}

/// Where the master gets configuration from, at startup and on every reload.
pub trait ConfigSource {
    fn load(&self) -> Result<ServerConfig, ConfigError>;
}

/// Reads an optional TOML file and applies command-line overrides.
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    path: Option<PathBuf>,
    overrides: Overrides,
}

impl FileSource {
    pub fn new(path: Option<PathBuf>, overrides: Overrides) -> Self {
        Self { path, overrides }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.path {
            Some(path) => read_config(path)?,
            None => ServerConfig::default(),
        };

        self.overrides.apply(&mut config);
        if config.listen.is_empty() {
            if let Ok(address) = DEFAULT_LISTEN.parse() {
                config.listen.push(ListenerConfig::new(address));
            }
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_full_config() {
        let config = parse_config(
            r#"
            worker_processes = 4
            timeout_secs = 30
            pid = "/tmp/prefork.pid"

            [[listen]]
            address = "127.0.0.1:8080"
            backlog = 512
            receive_buffer_size = 4096
            send_buffer_size = 4096

            [[listen]]
            address = "unix:/tmp/prefork.sock"
            workers = [0]

            [logging]
            level = "debug"
            format = "json"

            [upgrade]
            auto_quit_old = true
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_processes, 4);
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].backlog, 512);
        assert_eq!(config.listen[1].workers, Some(vec![0]));
        assert!(config.upgrade.auto_quit_old);
    }

    #[test]
    fn malformed_config_is_a_parse_error() {
        let err = parse_config("worker_processes = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_values_are_a_validation_error() {
        let err = parse_config(
            r#"
            timeout_secs = 0
            [[listen]]
            address = "127.0.0.1:8080"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn command_line_listeners_augment_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[listen]]\naddress = \"127.0.0.1:8080\"").unwrap();

        let overrides = Overrides {
            listen: vec![
                "127.0.0.1:8080".parse().unwrap(),
                "127.0.0.1:8081".parse().unwrap(),
            ],
            pid: Some("/tmp/x.pid".into()),
            worker_processes: Some(3),
        };
        let config = FileSource::new(Some(file.path().to_path_buf()), overrides)
            .load()
            .unwrap();

        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.worker_processes, 3);
        assert_eq!(config.pid, Some(PathBuf::from("/tmp/x.pid")));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let source = FileSource::new(Some("/nonexistent/prefork.toml".into()), Overrides::default());
        assert!(matches!(source.load(), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn default_listener_when_none_given() {
        let config = FileSource::default().load().unwrap();
        assert_eq!(config.listen.len(), 1);
        assert_eq!(config.listen[0].address.to_string(), DEFAULT_LISTEN);
    }
}
