//! Persistence of paired devices.

use crate::device::SavedDevice;
use crate::error::{KuromeError, Result};
use crate::security::write_private_file;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const SAVED_DEVICES_FILE: &str = "saved_devices.json";

pub trait SavedDeviceStore: Send + Sync {
    fn get(&self, id: &str) -> Option<SavedDevice>;
    fn save(&self, device: SavedDevice) -> Result<()>;
    fn remove(&self, id: &str) -> Result<()>;
    fn all(&self) -> Vec<SavedDevice>;
}

#[derive(Serialize, Deserialize, Default, Debug)]
struct SavedDevices {
    // device id -> record
    devices: HashMap<String, SavedDevice>,
}

/// Keeps saved devices in a JSON file in the storage directory.
#[derive(Debug)]
pub struct JsonDeviceStore {
    path: PathBuf,
    devices: RwLock<SavedDevices>,
}

impl JsonDeviceStore {
    pub fn open(storage_dir: &Path) -> Result<Self> {
        if !storage_dir.exists() {
            std::fs::create_dir_all(storage_dir).map_err(KuromeError::Io)?;
        }
        let path = storage_dir.join(SAVED_DEVICES_FILE);
        let devices = Self::load(storage_dir, &path)?;
        debug!("Loaded {} saved devices", devices.devices.len());
        Ok(Self {
            path,
            devices: RwLock::new(devices),
        })
    }

    fn load(storage_dir: &Path, path: &Path) -> Result<SavedDevices> {
        if !path.exists() {
            return Ok(SavedDevices::default());
        }
        let data = std::fs::read(path).map_err(KuromeError::Io)?;
        match serde_json::from_slice(&data) {
            Ok(devices) => Ok(devices),
            Err(e) => {
                warn!("Failed to parse saved devices file: {}", e);
                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let corrupt_path = storage_dir.join(format!("saved_devices.corrupt.{}.json", ts));
                if let Err(err) = std::fs::rename(path, &corrupt_path) {
                    warn!(
                        "Failed to backup corrupt saved devices file to {}: {}",
                        corrupt_path.display(),
                        err
                    );
                }
                Ok(SavedDevices::default())
            }
        }
    }

    fn persist(&self, devices: &SavedDevices) -> Result<()> {
        let data = serde_json::to_vec_pretty(devices)
            .map_err(|e| KuromeError::Storage(e.to_string()))?;
        write_private_file(&self.path, &data)
    }
}

impl SavedDeviceStore for JsonDeviceStore {
    fn get(&self, id: &str) -> Option<SavedDevice> {
        self.devices.read().devices.get(id).cloned()
    }

    fn save(&self, device: SavedDevice) -> Result<()> {
        let mut devices = self.devices.write();
        devices.devices.insert(device.id.clone(), device);
        self.persist(&devices)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.devices.remove(id).is_some() {
            self.persist(&devices)
        } else {
            Ok(())
        }
    }

    fn all(&self) -> Vec<SavedDevice> {
        self.devices.read().devices.values().cloned().collect()
    }
}

/// Volatile store, for tests and for peers that should never be remembered.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<String, SavedDevice>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SavedDeviceStore for MemoryDeviceStore {
    fn get(&self, id: &str) -> Option<SavedDevice> {
        self.devices.read().get(id).cloned()
    }

    fn save(&self, device: SavedDevice) -> Result<()> {
        self.devices.write().insert(device.id.clone(), device);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.devices.write().remove(id);
        Ok(())
    }

    fn all(&self) -> Vec<SavedDevice> {
        self.devices.read().values().cloned().collect()
    }
}
