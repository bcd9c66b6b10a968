//! Configuration loading for sync-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and field is optional.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for sync-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Maintenance task configuration.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the signaling listener (default: 0.0.0.0:7878).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Outbound messages buffered per connection before forwards are
    /// reported undelivered (default: 64).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Maximum frame body in bytes (default: 64 KiB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connections per IP address per minute (default: 30).
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
    /// Maximum signals per device per minute (default: 300).
    #[serde(default = "default_signals_per_minute")]
    pub signals_per_minute: u32,
    /// Aggregate signals per second across all devices (default: 2000).
    #[serde(default = "default_global_signals_per_second")]
    pub global_signals_per_second: u32,
    /// Timeout in seconds for receiving JOIN after connection (default: 10).
    /// Connections that don't join within this time are dropped.
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    /// Maximum simultaneously open connections (default: 10000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Serve `/health` and `/metrics` (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Maintenance task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Maintenance interval in seconds (default: 60).
    #[serde(default = "default_maintenance_interval")]
    pub interval_secs: u64,
    /// Enable maintenance task (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7878".to_string()
}

fn default_outbound_queue() -> usize {
    64
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_connections_per_ip() -> u32 {
    30
}

fn default_signals_per_minute() -> u32 {
    300
}

fn default_global_signals_per_second() -> u32 {
    2000
}

fn default_join_timeout_secs() -> u64 {
    10
}

fn default_max_connections() -> usize {
    10_000
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            outbound_queue: default_outbound_queue(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: default_connections_per_ip(),
            signals_per_minute: default_signals_per_minute(),
            global_signals_per_second: default_global_signals_per_second(),
            join_timeout_secs: default_join_timeout_secs(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            enabled: default_true(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval(),
            enabled: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("server.outbound_queue", self.server.outbound_queue == 0),
            ("server.max_frame_size", self.server.max_frame_size == 0),
            ("limits.connections_per_ip", self.limits.connections_per_ip == 0),
            ("limits.signals_per_minute", self.limits.signals_per_minute == 0),
            (
                "limits.global_signals_per_second",
                self.limits.global_signals_per_second == 0,
            ),
            ("maintenance.interval_secs", self.maintenance.interval_secs == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field: (*field).to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:7878");
        assert_eq!(config.server.max_frame_size, 64 * 1024);
        assert_eq!(config.limits.join_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"
outbound_queue = 8

[limits]
signals_per_minute = 60
join_timeout_secs = 3

[http]
bind_address = "0.0.0.0:9090"
enabled = false

[maintenance]
interval_secs = 30
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.server.outbound_queue, 8);
        assert_eq!(config.limits.signals_per_minute, 60);
        assert_eq!(config.limits.join_timeout_secs, 3);
        assert_eq!(config.http.bind_address, "0.0.0.0:9090");
        assert!(!config.http.enabled);
        assert_eq!(config.maintenance.interval_secs, 30);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.limits.max_connections, 10_000);
        assert!(config.maintenance.enabled);
    }

    #[test]
    fn zero_values_are_rejected() {
        let config: Config = toml::from_str("[limits]\nsignals_per_minute = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "limits.signals_per_minute"
        ));
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_address = \"127.0.0.1:0\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:0");
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
