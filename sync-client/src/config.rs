//! Configuration loading for a syncstuff node.
//!
//! Configuration is loaded from a TOML file. Every section and field is
//! optional.

use crate::discovery::{DiscoveryConfig, DEFAULT_DISCOVERY_PORT};
use crate::session::SessionConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{PairingConfig, DEFAULT_LINK_SCHEME};
use sync_types::{DeviceId, Platform, MAX_PEER_FRAME_SIZE};

/// Room left in a peer frame for the `FileChunk` envelope around the data.
const CHUNK_FRAME_OVERHEAD: usize = 1024;

/// Root configuration for a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// This device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// LAN discovery.
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// Signaling relay.
    #[serde(default)]
    pub relay: RelaySettings,
    /// Pairing handshakes.
    #[serde(default)]
    pub pairing: PairingSettings,
    /// Sync sessions and storage.
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Device identity.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Display name (default: "syncstuff").
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Stable device ID. A random one is generated per run when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Form factor (default: unknown).
    #[serde(default)]
    pub platform: Platform,
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    /// UDP port for advertisements and probes (default: 47474).
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Broadcast address (default: 255.255.255.255).
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,
    /// Advertisement period in milliseconds (default: 3000).
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    /// Silence before a device is marked offline, in seconds (default: 15).
    #[serde(default = "default_offline_timeout_secs")]
    pub offline_timeout_secs: u64,
    /// Registry sweep period in milliseconds (default: 1000).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    /// Relay address (`host:port`). Remote pairing is off without one.
    #[serde(default)]
    pub address: Option<String>,
    /// Seconds to wait for a forward result (default: 10).
    #[serde(default = "default_forward_timeout_secs")]
    pub forward_timeout_secs: u64,
}

/// Pairing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingSettings {
    /// Wrong codes allowed before the handshake is cancelled (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Idle seconds before a handshake times out (default: 60).
    #[serde(default = "default_pairing_timeout_secs")]
    pub timeout_secs: u64,
    /// Deep link scheme (default: "syncstuff").
    #[serde(default = "default_link_scheme")]
    pub link_scheme: String,
}

/// Sync session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Peer channel listener (default: 0.0.0.0:47480).
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    /// File chunk size in bytes (default: 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Minimum milliseconds between progress events (default: 250).
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Jobs per peer, queued and active (default: 256).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Where received files land (default: ./downloads).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Paired device file (default: ./devices.json).
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

// Default value functions
fn default_device_name() -> String {
    "syncstuff".to_string()
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_advertise_interval_ms() -> u64 {
    3000
}

fn default_offline_timeout_secs() -> u64 {
    15
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_forward_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    sync_core::DEFAULT_MAX_RETRIES
}

fn default_pairing_timeout_secs() -> u64 {
    60
}

fn default_link_scheme() -> String {
    DEFAULT_LINK_SCHEME.to_string()
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 47480))
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_queue_capacity() -> usize {
    256
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_store_path() -> PathBuf {
    PathBuf::from("devices.json")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            id: None,
            platform: Platform::default(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            broadcast_address: default_broadcast_address(),
            advertise_interval_ms: default_advertise_interval_ms(),
            offline_timeout_secs: default_offline_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            address: None,
            forward_timeout_secs: default_forward_timeout_secs(),
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_secs: default_pairing_timeout_secs(),
            link_scheme: default_link_scheme(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            chunk_size: default_chunk_size(),
            progress_interval_ms: default_progress_interval_ms(),
            queue_capacity: default_queue_capacity(),
            download_dir: default_download_dir(),
            store_path: default_store_path(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: ClientConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.name.trim().is_empty() {
            return Err(invalid("device.name", "must not be empty"));
        }
        if let Some(id) = &self.device.id {
            if id.is_empty() {
                return Err(invalid("device.id", "must not be empty"));
            }
        }

        let zero = [
            (
                "discovery.advertise_interval_ms",
                self.discovery.advertise_interval_ms == 0,
            ),
            (
                "discovery.offline_timeout_secs",
                self.discovery.offline_timeout_secs == 0,
            ),
            ("discovery.sweep_interval_ms", self.discovery.sweep_interval_ms == 0),
            ("relay.forward_timeout_secs", self.relay.forward_timeout_secs == 0),
            ("pairing.max_retries", self.pairing.max_retries == 0),
            ("pairing.timeout_secs", self.pairing.timeout_secs == 0),
            ("sync.chunk_size", self.sync.chunk_size == 0),
            ("sync.queue_capacity", self.sync.queue_capacity == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(invalid(field, "must be greater than zero"));
        }

        let max_chunk = MAX_PEER_FRAME_SIZE - CHUNK_FRAME_OVERHEAD;
        if self.sync.chunk_size > max_chunk {
            return Err(invalid(
                "sync.chunk_size",
                &format!("must be at most {} bytes", max_chunk),
            ));
        }
        Ok(())
    }

    /// Configured device ID, or a freshly generated one.
    pub fn device_id(&self) -> DeviceId {
        match &self.device.id {
            Some(id) => DeviceId::new(id.clone()),
            None => DeviceId::generate(),
        }
    }

    /// Socket settings for the discovery listener.
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_address: SocketAddr::from(([0, 0, 0, 0], self.discovery.port)),
            broadcast_target: self.broadcast_target(),
            sweep_interval: Duration::from_millis(self.discovery.sweep_interval_ms),
        }
    }

    /// Where advertisements and probes are sent.
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.discovery.broadcast_address, self.discovery.port)
    }

    /// Advertisement period.
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.discovery.advertise_interval_ms)
    }

    /// Silence before a device is marked offline.
    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.offline_timeout_secs)
    }

    /// Forward result timeout for the relay client.
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.forward_timeout_secs)
    }

    /// Pairing coordinator tunables.
    pub fn pairing_config(&self) -> PairingConfig {
        PairingConfig {
            max_retries: self.pairing.max_retries,
            timeout: Duration::from_secs(self.pairing.timeout_secs),
        }
    }

    /// Session manager tunables.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.sync.chunk_size,
            progress_interval: Duration::from_millis(self.sync.progress_interval_ms),
            queue_capacity: self.sync.queue_capacity,
            ..SessionConfig::default()
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
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
        let config = ClientConfig::default();
        assert_eq!(config.discovery.port, 47474);
        assert_eq!(config.advertise_interval(), Duration::from_secs(3));
        assert_eq!(config.offline_timeout(), Duration::from_secs(15));
        assert_eq!(config.pairing.max_retries, 5);
        assert_eq!(config.sync.chunk_size, 64 * 1024);
        assert!(config.relay.address.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[device]
name = "Pixel"
id = "abc123"
platform = "mobile"

[discovery]
port = 5000
broadcast_address = "192.168.1.255"

[relay]
address = "relay.example.com:7878"

[pairing]
max_retries = 3
link_scheme = "myapp"

[sync]
listen_address = "127.0.0.1:6000"
chunk_size = 4096
"#;

        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.device.name, "Pixel");
        assert_eq!(config.device_id(), DeviceId::new("abc123"));
        assert_eq!(config.device.platform, Platform::Mobile);
        assert_eq!(
            config.broadcast_target(),
            "192.168.1.255:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.discovery_config().bind_address.port(), 5000);
        assert_eq!(config.relay.address.as_deref(), Some("relay.example.com:7878"));
        assert_eq!(config.pairing_config().max_retries, 3);
        assert_eq!(config.pairing.link_scheme, "myapp");
        assert_eq!(config.session_config().chunk_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_id_generates_one() {
        let config = ClientConfig::default();
        let a = config.device_id();
        let b = config.device_id();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn oversize_chunk_is_rejected() {
        let config: ClientConfig = toml::from_str("[sync]\nchunk_size = 2000000\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "sync.chunk_size"
        ));
    }

    #[test]
    fn zero_values_are_rejected() {
        let config: ClientConfig = toml::from_str("[pairing]\nmax_retries = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "pairing.max_retries"
        ));
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[device]\nname = \"Laptop\"").unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.device.name, "Laptop");
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[device\nname = ").unwrap();

        let err = ClientConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
