//! Device/gateway registry seam.
//!
//! Device and gateway records are owned by the CRUD side of the system; the
//! control loop only needs to resolve identifiers, look up a device's gateway
//! and safety profile, and forward status messages.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wattloop_core::{DeviceId, GatewayId};
use wattloop_energy::SafetyProfile;
use wattloop_telemetry::{StatusSubject, StatusUpdate};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub gateway_id: GatewayId,
    pub safety_profile: SafetyProfile,
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn device(&self, id: DeviceId) -> Result<Option<DeviceRecord>, RegistryError>;

    async fn has_gateway(&self, id: GatewayId) -> Result<bool, RegistryError>;
}

/// Receiver of device and gateway status messages.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn apply(&self, update: StatusUpdate) -> Result<(), RegistryError>;
}

#[derive(Debug, Default)]
struct RegistryState {
    devices: HashMap<DeviceId, DeviceRecord>,
    gateways: HashSet<GatewayId>,
    last_status: HashMap<String, StatusUpdate>,
}

/// In-memory registry; also records the last status per device/gateway.
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> RegistryError {
        RegistryError::Unavailable("lock poisoned".to_string())
    }

    pub fn add_gateway(&self, gateway_id: GatewayId) {
        if let Ok(mut state) = self.state.write() {
            state.gateways.insert(gateway_id);
        }
    }

    /// Register a device (and its gateway).
    pub fn add_device(&self, record: DeviceRecord) {
        if let Ok(mut state) = self.state.write() {
            state.gateways.insert(record.gateway_id);
            state.devices.insert(record.id, record);
        }
    }

    pub fn last_status(&self, subject: &StatusSubject) -> Option<StatusUpdate> {
        let state = self.state.read().ok()?;
        state.last_status.get(&subject_key(subject)).cloned()
    }
}

fn subject_key(subject: &StatusSubject) -> String {
    match subject {
        StatusSubject::Device(id) => format!("device:{id}"),
        StatusSubject::Gateway(id) => format!("gateway:{id}"),
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn device(&self, id: DeviceId) -> Result<Option<DeviceRecord>, RegistryError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.devices.get(&id).copied())
    }

    async fn has_gateway(&self, id: GatewayId) -> Result<bool, RegistryError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.gateways.contains(&id))
    }
}

#[async_trait]
impl StatusSink for InMemoryDeviceRegistry {
    async fn apply(&self, update: StatusUpdate) -> Result<(), RegistryError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        state.last_status.insert(subject_key(&update.subject), update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_registered_devices_and_keeps_last_status() {
        let registry = InMemoryDeviceRegistry::new();
        let gateway = GatewayId::new();
        let device = DeviceRecord {
            id: DeviceId::new(),
            gateway_id: gateway,
            safety_profile: SafetyProfile::High,
        };
        registry.add_device(device);

        assert_eq!(registry.device(device.id).await.unwrap(), Some(device));
        assert!(registry.device(DeviceId::new()).await.unwrap().is_none());
        assert!(registry.has_gateway(gateway).await.unwrap());

        let subject = StatusSubject::Gateway(gateway);
        for online in [true, false] {
            registry
                .apply(StatusUpdate {
                    subject: subject.clone(),
                    payload: json!({ "online": online }),
                    received_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let last = registry.last_status(&subject).unwrap();
        assert_eq!(last.payload["online"], false);
    }
}
