// Manually registered devices
//
// Kept as a JSON array under its own key, next to the consent ledger.
// Registrations are appended in order; the same MAC may be registered
// more than once.

use super::backend::StorageBackend;
use super::PersistenceError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Storage key of the registrations document
pub const REGISTRATIONS_KEY: &str = "registeredDevices";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    pub mac_address: String,
    pub device_name: String,
    pub device_type: String,
    pub serial_number: String,
}

impl RegisteredDevice {
    pub fn new(
        mac_address: impl Into<String>,
        device_name: impl Into<String>,
        device_type: impl Into<String>,
        serial_number: impl Into<String>,
    ) -> Self {
        Self {
            mac_address: mac_address.into(),
            device_name: device_name.into(),
            device_type: device_type.into(),
            serial_number: serial_number.into(),
        }
    }

    /// Every field must carry non-whitespace text
    pub fn validate(&self) -> Result<(), PersistenceError> {
        let fields = [
            ("macAddress", &self.mac_address),
            ("deviceName", &self.device_name),
            ("deviceType", &self.device_type),
            ("serialNumber", &self.serial_number),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(PersistenceError::InvalidRegistration(format!(
                    "{} is required",
                    name
                )));
            }
        }
        Ok(())
    }
}

pub struct DeviceRegistry {
    backend: Arc<dyn StorageBackend>,
    // Serializes the load-append-save cycle
    write_lock: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    pub fn register(&self, device: RegisteredDevice) -> Result<(), PersistenceError> {
        device.validate()?;

        let _guard = self.write_lock.lock();
        let mut devices = self.try_list()?;
        info!(mac = %device.mac_address, name = %device.device_name, "device registered");
        devices.push(device);

        let bytes = serde_json::to_vec(&devices)
            .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
        self.backend.put(REGISTRATIONS_KEY.as_bytes(), &bytes)?;
        self.backend.flush()
    }

    /// All registrations in insertion order
    pub fn list(&self) -> Vec<RegisteredDevice> {
        self.try_list().unwrap_or_else(|e| {
            warn!("registered devices unavailable: {}", e);
            Vec::new()
        })
    }

    fn try_list(&self) -> Result<Vec<RegisteredDevice>, PersistenceError> {
        match self.backend.get(REGISTRATIONS_KEY.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PersistenceError::Corrupt(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.list().len()
    }
}
