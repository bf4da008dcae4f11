//! Postgres-backed telemetry store.
//!
//! Batches are written with a single multi-row `INSERT` so a flush costs one round
//! trip regardless of its size.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use wattloop_core::DeviceId;
use wattloop_telemetry::{TelemetryAggregation, TelemetryBatch, TelemetryQuery, TelemetryReading};

use super::{TelemetryStore, TelemetryStoreError};
use crate::pg::describe;

#[derive(Debug, Clone)]
pub struct PostgresTelemetryStore {
    pool: Arc<PgPool>,
}

impl PostgresTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage(operation: &str) -> impl Fn(sqlx::Error) -> TelemetryStoreError + '_ {
    move |e| TelemetryStoreError::Storage(describe(operation, &e))
}

fn reading_from_row(row: &PgRow) -> Result<TelemetryReading, sqlx::Error> {
    let quality: i16 = row.try_get("quality")?;
    let metadata: Option<JsonValue> = row.try_get("metadata")?;
    let device_id: uuid::Uuid = row.try_get("device_id")?;

    Ok(TelemetryReading {
        device_id: DeviceId::from_uuid(device_id),
        timestamp: row.try_get("timestamp")?,
        metric_name: row.try_get("metric_name")?,
        value: row.try_get("value")?,
        unit: row.try_get("unit")?,
        quality: quality.clamp(0, 100) as u8,
        metadata: metadata.and_then(|m| match m {
            JsonValue::Object(map) => Some(map),
            _ => None,
        }),
    })
}

#[async_trait]
impl TelemetryStore for PostgresTelemetryStore {
    #[instrument(skip(self, batch), fields(readings = batch.len()), err)]
    async fn insert_batch(&self, batch: &TelemetryBatch) -> Result<usize, TelemetryStoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO telemetry (device_id, timestamp, metric_name, value, unit, quality, metadata) ",
        );
        builder.push_values(batch.readings(), |mut row, r| {
            row.push_bind(*r.device_id.as_uuid())
                .push_bind(r.timestamp)
                .push_bind(&r.metric_name)
                .push_bind(r.value)
                .push_bind(&r.unit)
                .push_bind(i16::from(r.quality))
                .push_bind(r.metadata.clone().map(JsonValue::Object));
        });

        let result = builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(storage("insert_batch"))?;

        debug!(rows = result.rows_affected(), "telemetry batch inserted");
        Ok(result.rows_affected() as usize)
    }

    async fn query(
        &self,
        query: &TelemetryQuery,
    ) -> Result<Vec<TelemetryReading>, TelemetryStoreError> {
        query.validate()?;

        let rows = sqlx::query(
            r#"
            SELECT device_id, timestamp, metric_name, value, unit, quality, metadata
            FROM telemetry
            WHERE device_id = $1
              AND ($2::text IS NULL OR metric_name = $2)
              AND timestamp >= $3 AND timestamp <= $4
            ORDER BY timestamp DESC
            LIMIT $5
            "#,
        )
        .bind(query.device_id.as_uuid())
        .bind(query.metric_name.as_deref())
        .bind(query.start)
        .bind(query.end)
        .bind(query.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage("query"))?;

        rows.iter()
            .map(reading_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage("query"))
    }

    async fn latest(
        &self,
        device_id: DeviceId,
        metric_name: Option<&str>,
    ) -> Result<Option<TelemetryReading>, TelemetryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT device_id, timestamp, metric_name, value, unit, quality, metadata
            FROM telemetry
            WHERE device_id = $1 AND ($2::text IS NULL OR metric_name = $2)
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(device_id.as_uuid())
        .bind(metric_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("latest"))?;

        row.as_ref()
            .map(reading_from_row)
            .transpose()
            .map_err(storage("latest"))
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

        let row = sqlx::query(
            r#"
            SELECT
                MIN(value) AS min,
                MAX(value) AS max,
                AVG(value) AS avg,
                SUM(value) AS sum,
                COUNT(*) AS count,
                COALESCE(STDDEV_SAMP(value), 0) AS stddev
            FROM telemetry
            WHERE device_id = $1 AND metric_name = $2 AND timestamp >= $3 AND timestamp <= $4
            "#,
        )
        .bind(device_id.as_uuid())
        .bind(metric_name)
        .bind(start)
        .bind(end)
        .fetch_one(&*self.pool)
        .await
        .map_err(storage("aggregate"))?;

        let count: i64 = row.try_get("count").map_err(storage("aggregate"))?;
        if count == 0 {
            return Ok(None);
        }

        let get = |col: &str| -> Result<f64, TelemetryStoreError> {
            row.try_get::<Option<f64>, _>(col)
                .map(|v| v.unwrap_or_default())
                .map_err(storage("aggregate"))
        };

        Ok(Some(TelemetryAggregation {
            device_id,
            metric_name: metric_name.to_string(),
            start,
            end,
            min: get("min")?,
            max: get("max")?,
            avg: get("avg")?,
            sum: get("sum")?,
            count: count as u64,
            stddev: get("stddev")?,
        }))
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TelemetryStoreError> {
        let result = sqlx::query("DELETE FROM telemetry WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(storage("delete_before"))?;
        Ok(result.rows_affected())
    }
}
