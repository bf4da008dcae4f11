//! Durable time-series persistence for device readings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use wattloop_core::{DeviceId, DomainError};
use wattloop_telemetry::{TelemetryAggregation, TelemetryBatch, TelemetryQuery, TelemetryReading};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryTelemetryStore;
pub use postgres::PostgresTelemetryStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryStoreError {
    /// The request was rejected before touching storage.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The storage engine failed; safe to retry.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for TelemetryStoreError {
    fn from(value: DomainError) -> Self {
        TelemetryStoreError::Validation(value.to_string())
    }
}

/// Telemetry store boundary.
///
/// Readings are append-only. Writes are at-least-once: a batch retried after a
/// partial failure may store some readings twice.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Persist a validated batch. Returns the number of rows written.
    async fn insert_batch(&self, batch: &TelemetryBatch) -> Result<usize, TelemetryStoreError>;

    /// Readings for one device in an inclusive time range, newest first.
    async fn query(&self, query: &TelemetryQuery)
    -> Result<Vec<TelemetryReading>, TelemetryStoreError>;

    /// Most recent reading for a device, optionally restricted to one metric.
    async fn latest(
        &self,
        device_id: DeviceId,
        metric_name: Option<&str>,
    ) -> Result<Option<TelemetryReading>, TelemetryStoreError>;

    /// Summary statistics for one metric; `None` when the range holds no readings.
    async fn aggregate(
        &self,
        device_id: DeviceId,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<TelemetryAggregation>, TelemetryStoreError>;

    /// Retention primitive: drop readings strictly older than `cutoff`.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TelemetryStoreError>;
}

#[async_trait]
impl<T> TelemetryStore for Arc<T>
where
    T: TelemetryStore + ?Sized,
{
    async fn insert_batch(&self, batch: &TelemetryBatch) -> Result<usize, TelemetryStoreError> {
        (**self).insert_batch(batch).await
    }

    async fn query(
        &self,
        query: &TelemetryQuery,
    ) -> Result<Vec<TelemetryReading>, TelemetryStoreError> {
        (**self).query(query).await
    }

    async fn latest(
        &self,
        device_id: DeviceId,
        metric_name: Option<&str>,
    ) -> Result<Option<TelemetryReading>, TelemetryStoreError> {
        (**self).latest(device_id, metric_name).await
    }

    async fn aggregate(
        &self,
        device_id: DeviceId,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<TelemetryAggregation>, TelemetryStoreError> {
        (**self).aggregate(device_id, metric_name, start, end).await
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TelemetryStoreError> {
        (**self).delete_before(cutoff).await
    }
}
