//! Discovery registry - the process-local view of reachable devices.
//!
//! Devices enter the table only through [`DiscoveryRegistry::on_advertisement`]
//! (or [`DiscoveryRegistry::mark_paired`] from a completed pairing). Nothing
//! inside the registry runs on a timer: online state is re-derived from
//! `last_seen` whenever the caller's event loop invokes
//! [`DiscoveryRegistry::sweep`].
//!
//! Mutations lock a single DashMap shard (one writer per device ID); readers
//! receive owned snapshots and never hold references into the table.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::Duration;
use sync_types::{Advertisement, Device, DeviceId, SERVICE_PROTOCOL, SERVICE_TYPE};
use thiserror::Error;

/// Default offline threshold (3x the default advertisement interval).
pub const DEFAULT_OFFLINE_TIMEOUT: Duration = Duration::from_secs(15);

/// Why an advertisement was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// Service type is not ours.
    #[error("foreign service type: {0:?}")]
    ForeignService(String),
    /// Transport protocol is not supported.
    #[error("unsupported protocol: {0:?}")]
    UnsupportedProtocol(String),
    /// Record is structurally broken.
    #[error("malformed advertisement: {0}")]
    Malformed(String),
}

/// What an accepted advertisement did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sighting of this device.
    Added,
    /// Known device that was offline is back.
    CameOnline,
    /// Known online device refreshed.
    Refreshed,
}

/// In-memory table of known local devices.
#[derive(Debug)]
pub struct DiscoveryRegistry {
    devices: DashMap<DeviceId, Device>,
    offline_timeout: Duration,
}

impl DiscoveryRegistry {
    /// Create an empty registry with the given offline threshold.
    pub fn new(offline_timeout: Duration) -> Self {
        Self {
            devices: DashMap::new(),
            offline_timeout,
        }
    }

    /// The configured offline threshold.
    pub fn offline_timeout(&self) -> Duration {
        self.offline_timeout
    }

    /// Validate an advertisement and upsert the device it describes.
    ///
    /// `source` is the address the datagram arrived from; `now` is unix millis.
    /// The `paired` flag of an existing entry is preserved.
    pub fn on_advertisement(
        &self,
        record: &Advertisement,
        source: IpAddr,
        now: u64,
    ) -> Result<Upsert, DiscoveryError> {
        validate(record)?;
        let protocol_version = record
            .protocol_version()
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
        let id = record.device_id();

        let mut outcome = Upsert::Added;
        self.devices
            .entry(id.clone())
            .and_modify(|device| {
                outcome = if device.is_online {
                    Upsert::Refreshed
                } else {
                    Upsert::CameOnline
                };
                device.name = record.txt.device_name.clone();
                device.platform = record.platform();
                device.address = source;
                device.port = record.port;
                device.protocol_version = protocol_version;
                device.last_seen = now;
                device.is_online = true;
            })
            .or_insert_with(|| Device {
                id,
                name: record.txt.device_name.clone(),
                platform: record.platform(),
                address: source,
                port: record.port,
                protocol_version,
                last_seen: now,
                is_online: true,
                paired: false,
            });

        Ok(outcome)
    }

    /// Refresh `last_seen` for a known device (relay heartbeat).
    ///
    /// Returns false for unknown IDs; this path never creates entries.
    pub fn touch(&self, id: &DeviceId, now: u64) -> bool {
        match self.devices.get_mut(id) {
            Some(mut device) => {
                device.last_seen = now;
                device.is_online = true;
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of every known device, ordered by ID.
    pub fn list_devices(&self) -> Vec<Device> {
        let mut snapshot: Vec<Device> = self.devices.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Copy of a single device.
    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    /// Mark devices not heard from within the timeout as offline.
    ///
    /// Never deletes. Returns the IDs that transitioned to offline.
    pub fn sweep(&self, now: u64) -> Vec<DeviceId> {
        let timeout_ms = self.offline_timeout.as_millis() as u64;
        let mut went_offline = Vec::new();

        for mut entry in self.devices.iter_mut() {
            let stale = now.saturating_sub(entry.last_seen) > timeout_ms;
            if stale && entry.is_online {
                entry.is_online = false;
                went_offline.push(entry.id.clone());
            }
        }

        went_offline.sort();
        went_offline
    }

    /// Insert or update a device that completed pairing.
    pub fn mark_paired(&self, device: Device) {
        let id = device.id.clone();
        self.devices
            .entry(id)
            .and_modify(|existing| existing.paired = true)
            .or_insert(Device {
                paired: true,
                ..device
            });
    }

    /// Explicitly forget a device (unpair).
    pub fn remove(&self, id: &DeviceId) -> Option<Device> {
        self.devices.remove(id).map(|(_, d)| d)
    }

    /// Drop every entry (service shutdown).
    pub fn clear(&self) {
        self.devices.clear();
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no devices are known.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OFFLINE_TIMEOUT)
    }
}

fn validate(record: &Advertisement) -> Result<(), DiscoveryError> {
    if record.service_type != SERVICE_TYPE {
        return Err(DiscoveryError::ForeignService(record.service_type.clone()));
    }
    if record.protocol != SERVICE_PROTOCOL {
        return Err(DiscoveryError::UnsupportedProtocol(record.protocol.clone()));
    }
    if record.txt.device_id.trim().is_empty() {
        return Err(DiscoveryError::Malformed("empty device id".into()));
    }
    if record.port == 0 {
        return Err(DiscoveryError::Malformed("port 0".into()));
    }
    Ok(())
}
