//! Device descriptor shared by discovery, pairing and the device store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::DeviceId;

/// Form factor reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Phone
    Mobile,
    /// Tablet
    Tablet,
    /// Desktop computer
    Desktop,
    /// Laptop computer
    Laptop,
    /// Television / set-top box
    Tv,
    /// Headless command-line install
    Cli,
    /// Anything else
    #[default]
    Unknown,
}

impl Platform {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mobile => "mobile",
            Platform::Tablet => "tablet",
            Platform::Desktop => "desktop",
            Platform::Laptop => "laptop",
            Platform::Tv => "tv",
            Platform::Cli => "cli",
            Platform::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = std::convert::Infallible;

    /// Case-insensitive; unrecognised names map to [`Platform::Unknown`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "mobile" => Platform::Mobile,
            "tablet" => Platform::Tablet,
            "desktop" => Platform::Desktop,
            "laptop" => Platform::Laptop,
            "tv" => Platform::Tv,
            "cli" => Platform::Cli,
            _ => Platform::Unknown,
        })
    }
}

/// A known device, discovered locally or restored from the device store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable per-install identifier.
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
    /// Reported form factor.
    pub platform: Platform,
    /// Address the device was last reached at.
    pub address: IpAddr,
    /// Port the device accepts peer channels on.
    pub port: u16,
    /// Protocol version from the advertisement.
    pub protocol_version: u32,
    /// Unix millis of the last advertisement or relay heartbeat.
    pub last_seen: u64,
    /// Derived from `last_seen` by the registry sweep.
    pub is_online: bool,
    /// Whether the device completed pairing with this install.
    #[serde(default)]
    pub paired: bool,
}

impl Device {
    /// Socket address for opening a peer channel.
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address, self.port)
    }
}
