//! Query and aggregation value types for the telemetry store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wattloop_core::{DeviceId, DomainError, DomainResult};

pub const DEFAULT_QUERY_LIMIT: usize = 1000;
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Range query over one device's readings (inclusive bounds, newest first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryQuery {
    pub device_id: DeviceId,
    pub metric_name: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: usize,
}

impl TelemetryQuery {
    pub fn new(device_id: DeviceId, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            device_id,
            metric_name: None,
            start,
            end,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn with_metric(mut self, metric_name: impl Into<String>) -> Self {
        self.metric_name = Some(metric_name.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.start > self.end {
            return Err(DomainError::validation("start must not be after end"));
        }
        if self.limit == 0 || self.limit > MAX_QUERY_LIMIT {
            return Err(DomainError::validation(format!(
                "limit must be 1..={MAX_QUERY_LIMIT}"
            )));
        }
        Ok(())
    }

    pub fn matches(&self, device_id: DeviceId, metric_name: &str, timestamp: DateTime<Utc>) -> bool {
        device_id == self.device_id
            && self.metric_name.as_deref().is_none_or(|m| m == metric_name)
            && timestamp >= self.start
            && timestamp <= self.end
    }
}

/// Summary statistics for one metric over a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryAggregation {
    pub device_id: DeviceId,
    pub metric_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub sum: f64,
    pub count: u64,
    /// Sample standard deviation; 0 when fewer than two samples.
    pub stddev: f64,
}

impl TelemetryAggregation {
    /// Fold raw values into an aggregation. Returns `None` for an empty range.
    pub fn from_values(
        device_id: DeviceId,
        metric_name: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        values: impl IntoIterator<Item = f64>,
    ) -> Option<Self> {
        let values: Vec<f64> = values.into_iter().collect();
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let sum: f64 = values.iter().sum();
        let avg = sum / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let stddev = if count < 2 {
            0.0
        } else {
            let var = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (count - 1) as f64;
            var.sqrt()
        };

        Some(Self {
            device_id,
            metric_name: metric_name.into(),
            start,
            end,
            min,
            max,
            avg,
            sum,
            count: count as u64,
            stddev,
        })
    }

    /// Standard score of `value` against this window; `None` when the spread is zero.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.stddev <= f64::EPSILON {
            None
        } else {
            Some((value - self.avg) / self.stddev)
        }
    }
}
