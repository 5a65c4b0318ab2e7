//! Device registry seam
//!
//! Drivers register and unregister devices as they are plugged in; the
//! kernel lists them and republishes hot-plug events on the bus.

use super::bus::{EventBus, KernelEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub const DEVICE_CONNECTED: &str = "kairo.system.device.connected";
pub const DEVICE_DISCONNECTED: &str = "kairo.system.device.disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Serial,
    Camera,
    AudioIn,
    AudioOut,
    Gpio,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Available,
    Busy,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub path: String,
    #[serde(default)]
    pub hardware_id: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device {id} is already claimed by {owner}")]
    Busy { id: String, owner: String },

    #[error("Device {id} is not claimed by {owner}")]
    NotOwner { id: String, owner: String },
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    fn list(&self) -> Vec<DeviceInfo>;

    /// Take exclusive ownership of a device. At most one claim succeeds.
    async fn claim(&self, id: &str, owner: &str) -> Result<(), DeviceError>;

    async fn release(&self, id: &str, owner: &str) -> Result<(), DeviceError>;
}

#[derive(Default)]
struct Devices {
    devices: BTreeMap<String, DeviceInfo>,
    claims: HashMap<String, String>,
}

/// In-memory registry with exclusive device claims
pub struct MemoryDeviceRegistry {
    inner: Mutex<Devices>,
    claim_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    bus: Option<Arc<dyn EventBus>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Devices::default()),
            claim_locks: Mutex::new(HashMap::new()),
            bus: None,
        }
    }

    /// Publish hot-plug events on `bus`
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn devices(&self) -> MutexGuard<'_, Devices> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, device: DeviceInfo) {
        info!("Registered device {} ({:?})", device.id, device.kind);
        let data = serde_json::to_value(&device).unwrap_or_default();
        self.devices().devices.insert(device.id.clone(), device);
        if let Some(ref bus) = self.bus {
            bus.publish(KernelEvent::new(DEVICE_CONNECTED, "kernel:devices", data));
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = {
            let mut devices = self.devices();
            devices.claims.remove(id);
            devices.devices.remove(id).is_some()
        };
        if removed {
            info!("Unregistered device {}", id);
            if let Some(ref bus) = self.bus {
                bus.publish(KernelEvent::new(
                    DEVICE_DISCONNECTED,
                    "kernel:devices",
                    serde_json::json!({ "id": id }),
                ));
            }
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<DeviceInfo> {
        self.devices().devices.get(id).cloned()
    }

    fn claim_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.claim_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

impl Default for MemoryDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    fn list(&self) -> Vec<DeviceInfo> {
        self.devices().devices.values().cloned().collect()
    }

    async fn claim(&self, id: &str, owner: &str) -> Result<(), DeviceError> {
        let lock = self.claim_lock(id);
        let _guard = lock.lock().await;

        let mut devices = self.devices();
        if !devices.devices.contains_key(id) {
            return Err(DeviceError::NotFound(id.to_string()));
        }
        if let Some(current) = devices.claims.get(id) {
            if current != owner {
                return Err(DeviceError::Busy {
                    id: id.to_string(),
                    owner: current.clone(),
                });
            }
            return Ok(());
        }
        devices.claims.insert(id.to_string(), owner.to_string());
        if let Some(device) = devices.devices.get_mut(id) {
            device.status = DeviceStatus::Busy;
        }
        debug!(device = %id, owner = %owner, "Device claimed");
        Ok(())
    }

    async fn release(&self, id: &str, owner: &str) -> Result<(), DeviceError> {
        let lock = self.claim_lock(id);
        let _guard = lock.lock().await;

        let mut devices = self.devices();
        match devices.claims.get(id) {
            Some(current) if current == owner => {}
            _ => {
                return Err(DeviceError::NotOwner {
                    id: id.to_string(),
                    owner: owner.to_string(),
                })
            }
        }
        devices.claims.remove(id);
        if let Some(device) = devices.devices.get_mut(id) {
            device.status = DeviceStatus::Available;
        }
        debug!(device = %id, owner = %owner, "Device released");
        Ok(())
    }
}
