use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wattloop_core::DeviceId;
use wattloop_telemetry::{TelemetryAggregation, TelemetryBatch, TelemetryQuery, TelemetryReading};

use super::{TelemetryStore, TelemetryStoreError};

/// In-memory telemetry store.
///
/// Intended for tests/dev. `set_available(false)` makes every write fail with a
/// storage error, which is how outages are simulated.
#[derive(Debug)]
pub struct InMemoryTelemetryStore {
    readings: RwLock<Vec<TelemetryReading>>,
    available: AtomicBool,
    writes: AtomicUsize,
}

impl Default for InMemoryTelemetryStore {
    fn default() -> Self {
        Self {
            readings: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `insert_batch` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Total readings held.
    pub fn len(&self) -> usize {
        self.readings.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> TelemetryStoreError {
        TelemetryStoreError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn insert_batch(&self, batch: &TelemetryBatch) -> Result<usize, TelemetryStoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TelemetryStoreError::Storage(
                "telemetry store unavailable".to_string(),
            ));
        }

        let mut readings = self.readings.write().map_err(|_| Self::poisoned())?;
        readings.extend_from_slice(batch.readings());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(batch.len())
    }

    async fn query(
        &self,
        query: &TelemetryQuery,
    ) -> Result<Vec<TelemetryReading>, TelemetryStoreError> {
        query.validate()?;

        let readings = self.readings.read().map_err(|_| Self::poisoned())?;
        let mut matched: Vec<TelemetryReading> = readings
            .iter()
            .filter(|r| query.matches(r.device_id, &r.metric_name, r.timestamp))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(query.limit);
        Ok(matched)
    }

    async fn latest(
        &self,
        device_id: DeviceId,
        metric_name: Option<&str>,
    ) -> Result<Option<TelemetryReading>, TelemetryStoreError> {
        let readings = self.readings.read().map_err(|_| Self::poisoned())?;
        Ok(readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .filter(|r| metric_name.is_none_or(|m| r.metric_name == m))
            .max_by_key(|r| r.timestamp)
            .cloned())
    }

    async fn aggregate(
        &self,
        device_id: DeviceId,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<TelemetryAggregation>, TelemetryStoreError> {
        if start > end {
            return Err(TelemetryStoreError::Validation(
                "start must not be after end".to_string(),
            ));
        }

        let readings = self.readings.read().map_err(|_| Self::poisoned())?;
        let values = readings
            .iter()
            .filter(|r| {
                r.device_id == device_id
                    && r.metric_name == metric_name
                    && r.timestamp >= start
                    && r.timestamp <= end
            })
            .map(|r| r.value);

        Ok(TelemetryAggregation::from_values(
            device_id,
            metric_name,
            start,
            end,
            values,
        ))
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TelemetryStoreError> {
        let mut readings = self.readings.write().map_err(|_| Self::poisoned())?;
        let before = readings.len();
        readings.retain(|r| r.timestamp >= cutoff);
        Ok((before - readings.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reading(device: DeviceId, at: DateTime<Utc>, metric: &str, value: f64) -> TelemetryReading {
        TelemetryReading::new(device, at, metric, value, "W").unwrap()
    }

    #[tokio::test]
    async fn query_is_newest_first_and_limited() {
        let store = InMemoryTelemetryStore::new();
        let device = DeviceId::new();
        let t0 = Utc::now();
        let batch = TelemetryBatch::new(
            (0..5)
                .map(|i| reading(device, t0 + Duration::seconds(i), "power", i as f64))
                .chain([reading(device, t0, "voltage", 230.0)])
                .chain([reading(DeviceId::new(), t0, "power", 99.0)])
                .collect(),
        )
        .unwrap();
        store.insert_batch(&batch).await.unwrap();

        let q = TelemetryQuery::new(device, t0, t0 + Duration::seconds(10))
            .with_metric("power")
            .with_limit(3);
        let values: Vec<f64> = store.query(&q).await.unwrap().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![4.0, 3.0, 2.0]);

        let latest = store.latest(device, None).await.unwrap().unwrap();
        assert_eq!(latest.value, 4.0);
        let latest_voltage = store.latest(device, Some("voltage")).await.unwrap().unwrap();
        assert_eq!(latest_voltage.value, 230.0);
    }

    #[tokio::test]
    async fn aggregate_and_retention() {
        let store = InMemoryTelemetryStore::new();
        let device = DeviceId::new();
        let t0 = Utc::now() - Duration::days(10);
        let batch = TelemetryBatch::new(vec![
            reading(device, t0, "power", 10.0),
            reading(device, t0 + Duration::days(9), "power", 20.0),
            reading(device, t0 + Duration::days(9), "power", 30.0),
        ])
        .unwrap();
        store.insert_batch(&batch).await.unwrap();

        let agg = store
            .aggregate(device, "power", t0, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((agg.count, agg.min, agg.max, agg.sum), (3, 10.0, 30.0, 60.0));

        let removed = store.delete_before(t0 + Duration::days(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(
            store
                .aggregate(device, "energy", t0, Utc::now())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes() {
        let store = InMemoryTelemetryStore::new();
        store.set_available(false);
        let batch = TelemetryBatch::new(vec![reading(DeviceId::new(), Utc::now(), "p", 1.0)]).unwrap();
        assert!(matches!(
            store.insert_batch(&batch).await,
            Err(TelemetryStoreError::Storage(_))
        ));
        assert!(store.is_empty());
        assert_eq!(store.write_count(), 0);
    }
}
