//! Ingestion listener: broker subscription loop feeding the telemetry buffer.
//!
//! One long-lived task owns the broker subscription. Every message is handled to
//! completion before the next one is read or a stop request is observed. A
//! message that cannot be parsed or resolved is counted and dropped; nothing a
//! device sends can end the loop. When the subscription ends the listener waits
//! the reconnect delay and subscribes again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use wattloop_core::{DeviceId, GatewayId};
use wattloop_telemetry::{StatusSubject, StatusUpdate, TelemetryPayload, Topic};

use super::broker::{Broker, BrokerMessage};
use super::registry::{DeviceRegistry, StatusSink};
use crate::buffer::TelemetryBuffer;
use crate::retry::RetryPolicy;
use crate::worker::{StopSignal, WorkerHandle};

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    readings: AtomicU64,
    status_updates: AtomicU64,
    malformed: AtomicU64,
    unknown_devices: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    /// Messages accepted (telemetry and status).
    pub messages: u64,
    /// Readings handed to the buffer.
    pub readings: u64,
    pub status_updates: u64,
    pub malformed: u64,
    pub unknown_devices: u64,
    pub reconnects: u64,
}

/// What happened to a single inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Buffered(usize),
    StatusForwarded,
    Malformed,
    UnknownSource,
}

pub struct IngestionListener {
    broker: Arc<dyn Broker>,
    registry: Arc<dyn DeviceRegistry>,
    status: Arc<dyn StatusSink>,
    buffer: Arc<TelemetryBuffer>,
    reconnect: RetryPolicy,
    counters: Counters,
}

impl IngestionListener {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<dyn DeviceRegistry>,
        status: Arc<dyn StatusSink>,
        buffer: Arc<TelemetryBuffer>,
        reconnect: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            registry,
            status,
            buffer,
            reconnect,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> IngestionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngestionStats {
            messages: load(&self.counters.messages),
            readings: load(&self.counters.readings),
            status_updates: load(&self.counters.status_updates),
            malformed: load(&self.counters.malformed),
            unknown_devices: load(&self.counters.unknown_devices),
            reconnects: load(&self.counters.reconnects),
        }
    }

    /// Start the subscription loop and the buffer's periodic flusher.
    pub fn start(self: &Arc<Self>) -> IngestionHandle {
        let flusher = self.buffer.spawn_flusher();
        let listener = Arc::clone(self);
        let subscription =
            WorkerHandle::spawn("ingestion-listener", move |stop| listener.run(stop));
        IngestionHandle {
            subscription,
            flusher,
        }
    }

    async fn run(self: Arc<Self>, mut stop: StopSignal) {
        let patterns = Topic::subscriptions();
        let mut failures = 0u32;

        loop {
            let subscribed = tokio::select! {
                _ = stop.stopped() => return,
                subscribed = self.broker.subscribe(&patterns) => subscribed,
            };

            match subscribed {
                Ok(mut stream) => {
                    failures = 0;
                    info!(?patterns, "ingestion listener subscribed");
                    loop {
                        let next = tokio::select! {
                            _ = stop.stopped() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(message) => {
                                self.handle_message(message).await;
                            }
                            None => break,
                        }
                    }
                    warn!("broker subscription ended");
                }
                Err(err) => {
                    failures += 1;
                    warn!(error = %err, failures, "broker subscribe failed");
                }
            }

            let delay = self.reconnect.delay_for_attempt(failures.max(1));
            info!(delay_ms = delay.as_millis() as u64, "reconnecting to broker");
            tokio::select! {
                _ = stop.stopped() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Parse, resolve and route one message.
    pub async fn handle_message(&self, message: BrokerMessage) -> MessageOutcome {
        let outcome = self.route(&message).await;
        let counter = match outcome {
            MessageOutcome::Buffered(_) | MessageOutcome::StatusForwarded => {
                &self.counters.messages
            }
            MessageOutcome::Malformed => &self.counters.malformed,
            MessageOutcome::UnknownSource => &self.counters.unknown_devices,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn route(&self, message: &BrokerMessage) -> MessageOutcome {
        let Some(topic) = Topic::parse(&message.topic) else {
            warn!(topic = %message.topic, "dropping message on unrecognised topic");
            return MessageOutcome::Malformed;
        };

        match topic {
            Topic::DeviceTelemetry(raw) => {
                let Some(device_id) = self.resolve_device(raw).await else {
                    return MessageOutcome::UnknownSource;
                };
                self.buffer_telemetry(device_id, &message.payload)
            }
            Topic::DeviceStatus(raw) => match self.resolve_device(raw).await {
                Some(id) => self.forward_status(StatusSubject::Device(id), &message.payload).await,
                None => MessageOutcome::UnknownSource,
            },
            Topic::GatewayStatus(raw) => match self.resolve_gateway(raw).await {
                Some(id) => self.forward_status(StatusSubject::Gateway(id), &message.payload).await,
                None => MessageOutcome::UnknownSource,
            },
        }
    }

    async fn resolve_device(&self, raw: &str) -> Option<DeviceId> {
        let id = match raw.parse::<DeviceId>() {
            Ok(id) => id,
            Err(err) => {
                warn!(device = raw, error = %err, "dropping message: unparseable device id");
                return None;
            }
        };
        match self.registry.device(id).await {
            Ok(Some(record)) => Some(record.id),
            Ok(None) => {
                warn!(device_id = %id, "dropping message: unknown device");
                None
            }
            Err(err) => {
                warn!(device_id = %id, error = %err, "dropping message: registry lookup failed");
                None
            }
        }
    }

    async fn resolve_gateway(&self, raw: &str) -> Option<GatewayId> {
        let id = match raw.parse::<GatewayId>() {
            Ok(id) => id,
            Err(err) => {
                warn!(gateway = raw, error = %err, "dropping message: unparseable gateway id");
                return None;
            }
        };
        match self.registry.has_gateway(id).await {
            Ok(true) => Some(id),
            Ok(false) => {
                warn!(gateway_id = %id, "dropping message: unknown gateway");
                None
            }
            Err(err) => {
                warn!(gateway_id = %id, error = %err, "dropping message: registry lookup failed");
                None
            }
        }
    }

    fn buffer_telemetry(&self, device_id: DeviceId, payload: &[u8]) -> MessageOutcome {
        let readings = TelemetryPayload::parse(payload)
            .and_then(|p| p.into_readings(device_id, Utc::now()));

        match readings {
            Ok(readings) => {
                let count = readings.len();
                self.buffer.extend(readings);
                self.counters
                    .readings
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(device_id = %device_id, count, "telemetry buffered");
                MessageOutcome::Buffered(count)
            }
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "dropping malformed telemetry");
                MessageOutcome::Malformed
            }
        }
    }

    async fn forward_status(&self, subject: StatusSubject, payload: &[u8]) -> MessageOutcome {
        let update = match StatusUpdate::parse(subject, payload, Utc::now()) {
            Ok(update) => update,
            Err(err) => {
                warn!(error = %err, "dropping malformed status message");
                return MessageOutcome::Malformed;
            }
        };

        if let Err(err) = self.status.apply(update).await {
            // The message was well-formed; the registry is what failed.
            warn!(error = %err, "status update not applied");
        }
        self.counters.status_updates.fetch_add(1, Ordering::Relaxed);
        MessageOutcome::StatusForwarded
    }
}

/// Running listener plus its flusher.
#[derive(Debug)]
pub struct IngestionHandle {
    subscription: WorkerHandle,
    flusher: WorkerHandle,
}

impl IngestionHandle {
    /// Stop after the in-progress message, then flush the buffer one last time.
    pub async fn shutdown(self) {
        self.subscription.shutdown().await;
        self.flusher.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::buffer::BufferConfig;
    use crate::ingestion::{DeviceRecord, InMemoryBroker, InMemoryDeviceRegistry};
    use crate::telemetry_store::InMemoryTelemetryStore;
    use wattloop_energy::SafetyProfile;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        registry: Arc<InMemoryDeviceRegistry>,
        store: Arc<InMemoryTelemetryStore>,
        listener: Arc<IngestionListener>,
        device: DeviceRecord,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        let store = Arc::new(InMemoryTelemetryStore::new());
        let buffer = Arc::new(TelemetryBuffer::new(store.clone(), BufferConfig::default()));
        let device = DeviceRecord {
            id: DeviceId::new(),
            gateway_id: GatewayId::new(),
            safety_profile: SafetyProfile::Normal,
        };
        registry.add_device(device);

        let listener = Arc::new(IngestionListener::new(
            broker.clone(),
            registry.clone(),
            registry.clone(),
            buffer,
            RetryPolicy::fixed(u32::MAX, Duration::from_secs(5)),
        ));
        Fixture {
            broker,
            registry,
            store,
            listener,
            device,
        }
    }

    fn telemetry_topic(device: DeviceId) -> String {
        format!("devices/{device}/telemetry")
    }

    #[tokio::test]
    async fn bad_messages_are_isolated() {
        let f = fixture();
        let good = br#"{"readings":[{"metric_name":"power","value":1.0,"unit":"W"}]}"#;

        let outcomes = [
            f.listener
                .handle_message(BrokerMessage::new("devices/not-a-uuid/telemetry", good.to_vec()))
                .await,
            f.listener
                .handle_message(BrokerMessage::new(telemetry_topic(DeviceId::new()), good.to_vec()))
                .await,
            f.listener
                .handle_message(BrokerMessage::new(telemetry_topic(f.device.id), b"{oops".to_vec()))
                .await,
            f.listener
                .handle_message(BrokerMessage::new("devices/x", good.to_vec()))
                .await,
            f.listener
                .handle_message(BrokerMessage::new(telemetry_topic(f.device.id), good.to_vec()))
                .await,
        ];

        assert_eq!(
            outcomes,
            [
                MessageOutcome::UnknownSource,
                MessageOutcome::UnknownSource,
                MessageOutcome::Malformed,
                MessageOutcome::Malformed,
                MessageOutcome::Buffered(1),
            ]
        );
        let stats = f.listener.stats();
        assert_eq!((stats.messages, stats.malformed, stats.unknown_devices), (1, 2, 2));
    }

    #[tokio::test]
    async fn status_messages_reach_the_registry() {
        let f = fixture();
        let topic = format!("gateways/{}/status", f.device.gateway_id);
        let outcome = f
            .listener
            .handle_message(BrokerMessage::new(topic, br#"{"online":true}"#.to_vec()))
            .await;

        assert_eq!(outcome, MessageOutcome::StatusForwarded);
        let last = f
            .registry
            .last_status(&StatusSubject::Gateway(f.device.gateway_id))
            .unwrap();
        assert_eq!(last.payload["online"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_disconnect_and_flushes_on_stop() {
        let f = fixture();
        let handle = f.listener.start();
        f.broker.wait_for_connections(1).await;

        f.broker.disconnect();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(f.broker.connection_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        f.broker.wait_for_connections(2).await;
        assert_eq!(f.listener.stats().reconnects, 1);

        let payload = br#"{"readings":[{"metric_name":"power","value":42.0,"unit":"W"}]}"#;
        assert_eq!(f.broker.send(&telemetry_topic(f.device.id), payload), 1);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(f.store.len(), 0);
        handle.shutdown().await;
        assert_eq!(f.store.len(), 1);
    }
}
