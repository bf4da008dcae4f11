//! Telemetry ingestion: broker subscription, device resolution, buffering.

pub mod broker;
pub mod listener;
#[cfg(feature = "redis")]
pub mod redis_pubsub;
pub mod registry;

pub use broker::{Broker, BrokerError, BrokerMessage, BrokerStream, InMemoryBroker};
pub use listener::{IngestionHandle, IngestionListener, IngestionStats, MessageOutcome};
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisBroker;
pub use registry::{DeviceRecord, DeviceRegistry, InMemoryDeviceRegistry, RegistryError, StatusSink};
