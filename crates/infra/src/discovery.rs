//! Devices a gateway reported during setup, cached until the user claims them.
//!
//! Entries expire after a TTL and each gateway keeps at most `max_per_gateway`
//! devices; the oldest discovery is evicted first.
//!
//! Gateways announce discoveries in their status payload under `discovered`:
//! `{"discovered": [{"id": "plug-1", "model": "..."}]}`. [`DiscoveringStatusSink`]
//! records those entries before forwarding the update to the registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use tracing::debug;

use wattloop_core::GatewayId;
use wattloop_telemetry::{StatusSubject, StatusUpdate};

use crate::ingestion::{RegistryError, StatusSink};

pub const DEFAULT_MAX_PER_GATEWAY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Identifier as reported by the gateway (not yet a registered device).
    pub external_id: String,
    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DiscoveryCache {
    ttl: chrono::Duration,
    max_per_gateway: usize,
    entries: RwLock<HashMap<GatewayId, Vec<DiscoveredDevice>>>,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration, max_per_gateway: usize) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
            max_per_gateway: max_per_gateway.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<GatewayId, Vec<DiscoveredDevice>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<GatewayId, Vec<DiscoveredDevice>>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, device: &DiscoveredDevice, now: DateTime<Utc>) -> bool {
        device.discovered_at + self.ttl > now
    }

    /// Record a discovery. A device seen again replaces its previous entry.
    pub fn record(&self, gateway_id: GatewayId, device: DiscoveredDevice) {
        let mut entries = self.write();
        let now = device.discovered_at;
        let devices = entries.entry(gateway_id).or_default();
        devices.retain(|d| d.external_id != device.external_id && self.is_live(d, now));
        devices.push(device);
        if devices.len() > self.max_per_gateway {
            let excess = devices.len() - self.max_per_gateway;
            devices.drain(..excess);
        }
    }

    /// Unexpired discoveries for a gateway, oldest first.
    pub fn list(&self, gateway_id: GatewayId, now: DateTime<Utc>) -> Vec<DiscoveredDevice> {
        self.read()
            .get(&gateway_id)
            .map(|devices| {
                devices
                    .iter()
                    .filter(|d| self.is_live(d, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove and return a discovery once the device has been claimed.
    pub fn take(
        &self,
        gateway_id: GatewayId,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Option<DiscoveredDevice> {
        let mut entries = self.write();
        let devices = entries.get_mut(&gateway_id)?;
        let index = devices.iter().position(|d| d.external_id == external_id)?;
        let device = devices.remove(index);
        self.is_live(&device, now).then_some(device)
    }

    /// Drop expired entries and empty gateways. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.write();
        let mut removed = 0;
        entries.retain(|_, devices| {
            let before = devices.len();
            devices.retain(|d| self.is_live(d, now));
            removed += before - devices.len();
            !devices.is_empty()
        });
        removed
    }
}

/// Pull discovered devices out of a gateway status payload.
///
/// Entries without a string `id` (or `external_id`) are skipped; every other
/// field is kept as an attribute.
pub fn discovered_devices(update: &StatusUpdate) -> Vec<DiscoveredDevice> {
    let Some(list) = update.payload.get("discovered").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(JsonValue::as_object)
        .filter_map(|entry| {
            let mut attributes = entry.clone();
            let external_id = ["id", "external_id"]
                .iter()
                .find_map(|key| match attributes.remove(*key) {
                    Some(JsonValue::String(id)) if !id.is_empty() => Some(id),
                    _ => None,
                })?;
            attributes.remove("id");
            attributes.remove("external_id");
            Some(DiscoveredDevice {
                external_id,
                attributes,
                discovered_at: update.received_at,
            })
        })
        .collect()
}

/// Status sink that records gateway discoveries, then forwards to `inner`.
pub struct DiscoveringStatusSink {
    cache: Arc<DiscoveryCache>,
    inner: Arc<dyn StatusSink>,
}

impl DiscoveringStatusSink {
    pub fn new(cache: Arc<DiscoveryCache>, inner: Arc<dyn StatusSink>) -> Self {
        Self { cache, inner }
    }
}

#[async_trait]
impl StatusSink for DiscoveringStatusSink {
    async fn apply(&self, update: StatusUpdate) -> Result<(), RegistryError> {
        if let StatusSubject::Gateway(gateway_id) = update.subject {
            let devices = discovered_devices(&update);
            if !devices.is_empty() {
                debug!(%gateway_id, count = devices.len(), "gateway reported discovered devices");
            }
            for device in devices {
                self.cache.record(gateway_id, device);
            }
        }
        self.inner.apply(update).await
    }
}
