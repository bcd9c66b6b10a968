//! Local-network discovery datagrams.
//!
//! Advertisements are broadcast as JSON so any platform's discovery stack can
//! read them:
//!
//! ```text
//! {"type":"announce","serviceType":"syncstuff","protocol":"tcp","port":3000,
//!  "txt":{"version":"1","platform":"mobile","deviceId":"abc123","deviceName":"Pixel"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::{DeviceId, Platform, SyncError};

/// Service type every syncstuff advertisement carries.
pub const SERVICE_TYPE: &str = "syncstuff";

/// Transport protocol peers accept channels on.
pub const SERVICE_PROTOCOL: &str = "tcp";

/// Protocol version this build advertises.
pub const PROTOCOL_VERSION: u32 = 1;

/// TXT-style key/value attributes of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxtRecord {
    /// Protocol version, as a decimal string.
    pub version: String,
    /// Platform wire name.
    pub platform: String,
    /// Advertising device's ID.
    pub device_id: String,
    /// Advertising device's display name.
    pub device_name: String,
}

/// A broadcast descriptor announcing a device's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    /// Always [`SERVICE_TYPE`].
    pub service_type: String,
    /// Always [`SERVICE_PROTOCOL`].
    pub protocol: String,
    /// Port the device accepts peer channels on.
    pub port: u16,
    /// Device attributes.
    pub txt: TxtRecord,
}

impl Advertisement {
    /// Build the descriptor for this device.
    pub fn new(device_id: &DeviceId, name: &str, platform: Platform, port: u16) -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            protocol: SERVICE_PROTOCOL.to_string(),
            port,
            txt: TxtRecord {
                version: PROTOCOL_VERSION.to_string(),
                platform: platform.as_str().to_string(),
                device_id: device_id.as_str().to_string(),
                device_name: name.to_string(),
            },
        }
    }

    /// The advertising device's ID.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.txt.device_id.clone())
    }

    /// Reported platform (unknown names map to [`Platform::Unknown`]).
    pub fn platform(&self) -> Platform {
        self.txt.platform.parse().unwrap_or_default()
    }

    /// Parsed protocol version.
    pub fn protocol_version(&self) -> Result<u32, SyncError> {
        self.txt
            .version
            .trim()
            .parse()
            .map_err(|_| SyncError::InvalidData(format!("bad version: {:?}", self.txt.version)))
    }
}

/// Datagrams exchanged on the discovery port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryMessage {
    /// Periodic or probe-triggered presence announcement.
    Announce(Advertisement),
    /// Request for every advertiser to answer unicast.
    Probe {
        /// Service being probed for.
        #[serde(rename = "serviceType")]
        service_type: String,
    },
}

impl DiscoveryMessage {
    /// A probe for syncstuff advertisers.
    pub fn probe() -> Self {
        Self::Probe {
            service_type: SERVICE_TYPE.to_string(),
        }
    }

    /// Encode as a JSON datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel() -> Advertisement {
        Advertisement::new(&DeviceId::new("abc123"), "Pixel", Platform::Mobile, 3000)
    }

    #[test]
    fn announce_wire_shape() {
        let bytes = DiscoveryMessage::Announce(pixel()).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "announce");
        assert_eq!(value["serviceType"], "syncstuff");
        assert_eq!(value["protocol"], "tcp");
        assert_eq!(value["port"], 3000);
        assert_eq!(value["txt"]["deviceId"], "abc123");
        assert_eq!(value["txt"]["deviceName"], "Pixel");
        assert_eq!(value["txt"]["platform"], "mobile");
        assert_eq!(value["txt"]["version"], "1");
    }

    #[test]
    fn probe_wire_shape() {
        let bytes = DiscoveryMessage::probe().to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "probe");
        assert_eq!(value["serviceType"], "syncstuff");
    }

    #[test]
    fn garbage_datagram_is_an_error() {
        assert!(DiscoveryMessage::from_bytes(b"\x00\x01not json").is_err());
        assert!(DiscoveryMessage::from_bytes(br#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn version_must_be_numeric() {
        let mut ad = pixel();
        assert_eq!(ad.protocol_version().unwrap(), 1);
        ad.txt.version = "one".into();
        assert!(ad.protocol_version().is_err());
    }
}
