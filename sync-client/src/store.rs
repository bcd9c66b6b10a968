//! Paired device persistence.
//!
//! The pairing service writes a [`Device`] here once a handshake completes
//! and removes it on unpair. On start-up the node reloads every stored
//! device into the discovery registry.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use sync_types::{Device, DeviceId};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File could not be read or written.
    #[error("device store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File contents are not a device list.
    #[error("device store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Persists paired devices.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Every stored device, ordered by ID.
    async fn load(&self) -> Result<Vec<Device>, StoreError>;

    /// One stored device.
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>, StoreError>;

    /// Insert or replace a device.
    async fn save(&self, device: &Device) -> Result<(), StoreError>;

    /// Remove a device. Returns whether it was stored.
    async fn remove(&self, id: &DeviceId) -> Result<bool, StoreError>;
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: StdMutex<BTreeMap<DeviceId, Device>>,
}

impl MemoryDeviceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, BTreeMap<DeviceId, Device>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn load(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.devices().values().cloned().collect())
    }

    async fn get(&self, id: &DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.devices().get(id).cloned())
    }

    async fn save(&self, device: &Device) -> Result<(), StoreError> {
        self.devices().insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn remove(&self, id: &DeviceId) -> Result<bool, StoreError> {
        Ok(self.devices().remove(id).is_some())
    }
}

/// JSON file store. The whole list is rewritten on every change.
///
/// The file holds device addresses, so it is created owner-only (0600) on
/// Unix.
#[derive(Debug)]
pub struct JsonDeviceStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonDeviceStore {
    /// Use the file at `path`. It is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<DeviceId, Device>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let devices: Vec<Device> = serde_json::from_str(&contents)?;
        Ok(devices.into_iter().map(|d| (d.id.clone(), d)).collect())
    }

    async fn write_all(&self, devices: &BTreeMap<DeviceId, Device>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let list: Vec<&Device> = devices.values().collect();
        let contents = serde_json::to_string_pretty(&list)?;

        let tmp = self.path.with_extension("json.tmp");
        // A leftover from an interrupted write may carry wider permissions
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut file = create_owner_only(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn load(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.read_all().await?.into_values().collect())
    }

    async fn get(&self, id: &DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.read_all().await?.remove(id))
    }

    async fn save(&self, device: &Device) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut devices = self.read_all().await?;
        devices.insert(device.id.clone(), device.clone());
        self.write_all(&devices).await?;
        tracing::debug!("Stored paired device {}", device.id);
        Ok(())
    }

    async fn remove(&self, id: &DeviceId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut devices = self.read_all().await?;
        if devices.remove(id).is_none() {
            return Ok(false);
        }
        self.write_all(&devices).await?;
        tracing::debug!("Removed paired device {}", id);
        Ok(true)
    }
}

/// Create `path`, failing if it exists. On Unix the file is born 0600
/// (owner read/write only), so its contents are never readable by others.
async fn create_owner_only(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}
