//! Application configuration
//!
//! `AppConfig` carries process-wide settings from the command line;
//! `ServerConfig` is the bridge's TOML configuration.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::streaming::StreamingConfig;

/// Application configuration structure
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
}

impl AppConfig {
    pub fn new(verbose: u8) -> Self {
        Self { verbose }
    }

    /// Get the log level string based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            2 => "trace",
            _ => "trace,hyper=debug,tower=debug",
        }
    }
}

/// Server configuration, usually loaded from a TOML file.
///
/// ```toml
/// listen = "0.0.0.0:8765"
/// default_timeout = "2m"
/// allowed_programs = ["python3", "node"]
///
/// [streaming]
/// read_buffer_size = 65536
///
/// [streaming.reorder]
/// deferred_types = ["callConfirm"]
/// flush_on_close = true
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Applied to requests that do not carry their own timeout.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Option<Duration>,
    /// Programs a request may run. Empty allows any program.
    pub allowed_programs: Vec<String>,
    pub streaming: StreamingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8765)),
            default_timeout: None,
            allowed_programs: Vec::new(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streaming.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "streaming.read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "streaming.channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "default_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn allows(&self, program: &str) -> bool {
        self.allowed_programs.is_empty() || self.allowed_programs.iter().any(|p| p == program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(AppConfig::new(0).log_level(), "info");
        assert_eq!(AppConfig::new(1).log_level(), "debug");
        assert_eq!(AppConfig::new(2).log_level(), "trace");
        assert!(AppConfig::new(5).log_level().contains("hyper=debug"));
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
            listen = "0.0.0.0:9000"
            default_timeout = "90s"
            allowed_programs = ["python3"]

            [streaming]
            read_buffer_size = 4096
            channel_capacity = 8

            [streaming.reorder]
            deferred_types = ["callConfirm", "callPrompt"]
            flush_on_close = false
            "#,
        );

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.default_timeout, Some(Duration::from_secs(90)));
        assert!(config.allows("python3"));
        assert!(!config.allows("bash"));
        assert_eq!(config.streaming.read_buffer_size, 4096);
        assert_eq!(config.streaming.channel_capacity, 8);
        assert_eq!(config.streaming.reorder.deferred_types.len(), 2);
        assert!(!config.streaming.reorder.flush_on_close);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let file = write_config("");
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert!(config.allows("anything"));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let file = write_config("[streaming]\nread_buffer_size = 0\n");
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_config_reports_path() {
        let file = write_config("listen = [");
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err
            .to_string()
            .contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/toolstream.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
