use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use wattloop_core::{DeviceId, DomainError, DomainResult};

/// Upper bound on readings accepted by a single batch write.
pub const MAX_BATCH_SIZE: usize = 1000;

const MAX_METRIC_NAME_LEN: usize = 50;
const MAX_UNIT_LEN: usize = 20;
const MAX_QUALITY: u8 = 100;

/// A single normalized device reading.
///
/// Immutable once stored. The store keys readings by `(device_id, timestamp)` and
/// indexes `(metric_name, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    /// Quality score, 0..=100. Defaults to 100 when omitted.
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, JsonValue>>,
}

fn default_quality() -> u8 {
    MAX_QUALITY
}

impl TelemetryReading {
    pub fn new(
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
        metric_name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> DomainResult<Self> {
        let reading = Self {
            device_id,
            timestamp,
            metric_name: metric_name.into(),
            value,
            unit: unit.into(),
            quality: MAX_QUALITY,
            metadata: None,
        };
        reading.validate()?;
        Ok(reading)
    }

    pub fn with_quality(mut self, quality: u8) -> DomainResult<Self> {
        if quality > MAX_QUALITY {
            return Err(DomainError::validation(format!(
                "quality must be 0..={MAX_QUALITY}, got {quality}"
            )));
        }
        self.quality = quality;
        Ok(self)
    }

    pub fn with_metadata(mut self, metadata: Map<String, JsonValue>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check field-level constraints.
    ///
    /// Readings can also arrive through deserialization (batch API), so the batch
    /// constructor re-validates every element.
    pub fn validate(&self) -> DomainResult<()> {
        let metric = self.metric_name.trim();
        if metric.is_empty() {
            return Err(DomainError::validation("metric_name cannot be empty"));
        }
        if self.metric_name.len() > MAX_METRIC_NAME_LEN {
            return Err(DomainError::validation(format!(
                "metric_name longer than {MAX_METRIC_NAME_LEN} characters"
            )));
        }
        if self.unit.len() > MAX_UNIT_LEN {
            return Err(DomainError::validation(format!(
                "unit longer than {MAX_UNIT_LEN} characters"
            )));
        }
        if !self.value.is_finite() {
            return Err(DomainError::validation(format!(
                "value for '{}' must be finite",
                self.metric_name
            )));
        }
        if self.quality > MAX_QUALITY {
            return Err(DomainError::validation(format!(
                "quality must be 0..={MAX_QUALITY}, got {}",
                self.quality
            )));
        }
        Ok(())
    }
}

/// A validated, non-empty group of at most [`MAX_BATCH_SIZE`] readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TelemetryBatch {
    readings: Vec<TelemetryReading>,
}

impl TelemetryBatch {
    pub fn new(readings: Vec<TelemetryReading>) -> DomainResult<Self> {
        if readings.is_empty() {
            return Err(DomainError::validation("batch must contain at least one reading"));
        }
        if readings.len() > MAX_BATCH_SIZE {
            return Err(DomainError::validation(format!(
                "batch of {} readings exceeds the limit of {MAX_BATCH_SIZE}",
                readings.len()
            )));
        }
        for (idx, r) in readings.iter().enumerate() {
            r.validate().map_err(|e| match e {
                DomainError::Validation(msg) => {
                    DomainError::validation(format!("reading {idx}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(Self { readings })
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn readings(&self) -> &[TelemetryReading] {
        &self.readings
    }

    pub fn into_readings(self) -> Vec<TelemetryReading> {
        self.readings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(value: f64) -> TelemetryReading {
        TelemetryReading::new(DeviceId::new(), Utc::now(), "power", value, "W").unwrap()
    }

    #[test]
    fn rejects_empty_metric_and_non_finite_values() {
        let device = DeviceId::new();
        assert!(TelemetryReading::new(device, Utc::now(), "  ", 1.0, "W").is_err());
        assert!(TelemetryReading::new(device, Utc::now(), "power", f64::NAN, "W").is_err());
        assert!(TelemetryReading::new(device, Utc::now(), "power", f64::INFINITY, "W").is_err());
    }

    #[test]
    fn quality_is_capped_at_one_hundred() {
        assert!(reading(1.0).with_quality(100).is_ok());
        assert!(reading(1.0).with_quality(101).is_err());
    }

    #[test]
    fn missing_quality_deserializes_as_full_quality() {
        let raw = serde_json::json!({
            "device_id": DeviceId::new(),
            "timestamp": Utc::now(),
            "metric_name": "power",
            "value": 120.5,
            "unit": "W",
        });
        let reading: TelemetryReading = serde_json::from_value(raw).unwrap();
        assert_eq!(reading.quality, 100);
        assert!(reading.validate().is_ok());
    }

    #[test]
    fn batch_accepts_exactly_the_cap() {
        let readings = (0..MAX_BATCH_SIZE).map(|i| reading(i as f64)).collect();
        let batch = TelemetryBatch::new(readings).unwrap();
        assert_eq!(batch.len(), MAX_BATCH_SIZE);
    }

    #[test]
    fn batch_rejects_over_cap_and_empty() {
        let readings: Vec<_> = (0..=MAX_BATCH_SIZE).map(|i| reading(i as f64)).collect();
        assert!(matches!(
            TelemetryBatch::new(readings),
            Err(DomainError::Validation(_))
        ));
        assert!(TelemetryBatch::new(vec![]).is_err());
    }

    #[test]
    fn batch_revalidates_deserialized_readings() {
        let mut bad = reading(1.0);
        bad.quality = 150;
        let err = TelemetryBatch::new(vec![reading(2.0), bad]).unwrap_err();
        assert!(err.to_string().contains("reading 1"));
    }

    proptest::proptest! {
        #[test]
        fn batch_size_rule_holds(n in 0usize..1100) {
            let readings: Vec<_> = (0..n).map(|i| reading(i as f64)).collect();
            let ok = TelemetryBatch::new(readings).is_ok();
            proptest::prop_assert_eq!(ok, n >= 1 && n <= MAX_BATCH_SIZE);
        }
    }
}
