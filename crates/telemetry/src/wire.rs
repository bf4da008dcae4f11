//! Pub/sub wire format.
//!
//! Topics:
//! - `devices/{device_id}/telemetry`: `{timestamp?, readings: [{metric_name, value, unit?, quality?}]}`
//! - `devices/{device_id}/status`
//! - `gateways/{gateway_id}/status`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use wattloop_core::{DeviceId, DomainError, DomainResult, GatewayId};

use crate::reading::TelemetryReading;

/// A parsed topic name. Borrowed segments are the wire identifiers, not yet resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic<'a> {
    DeviceTelemetry(&'a str),
    DeviceStatus(&'a str),
    GatewayStatus(&'a str),
}

impl<'a> Topic<'a> {
    pub const DEVICE_TELEMETRY_PATTERN: &'static str = "devices/*/telemetry";
    pub const DEVICE_STATUS_PATTERN: &'static str = "devices/*/status";
    pub const GATEWAY_STATUS_PATTERN: &'static str = "gateways/*/status";

    /// The three subscription patterns the ingestion listener needs.
    pub fn subscriptions() -> [&'static str; 3] {
        [
            Self::DEVICE_TELEMETRY_PATTERN,
            Self::DEVICE_STATUS_PATTERN,
            Self::GATEWAY_STATUS_PATTERN,
        ]
    }

    /// Parse a concrete topic. Unknown shapes return `None`.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let mut parts = topic.split('/');
        let (root, id, leaf) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || id.is_empty() {
            return None;
        }
        match (root, leaf) {
            ("devices", "telemetry") => Some(Topic::DeviceTelemetry(id)),
            ("devices", "status") => Some(Topic::DeviceStatus(id)),
            ("gateways", "status") => Some(Topic::GatewayStatus(id)),
            _ => None,
        }
    }
}

/// Single-segment wildcard match (`*` matches exactly one `/`-separated segment).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('/');
    let mut t = topic.split('/');
    loop {
        match (p.next(), t.next()) {
            (None, None) => return true,
            (Some("*"), Some(seg)) if !seg.is_empty() => continue,
            (Some(a), Some(b)) if a == b => continue,
            _ => return false,
        }
    }
}

/// A reading as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReading {
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub metadata: Option<Map<String, JsonValue>>,
}

/// Telemetry message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub readings: Vec<WireReading>,
}

impl TelemetryPayload {
    pub fn parse(payload: &[u8]) -> DomainResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| DomainError::validation(format!("invalid telemetry payload: {e}")))
    }

    /// Decompose into normalized readings.
    ///
    /// All readings share the message timestamp, falling back to `received_at`.
    /// A single invalid reading rejects the whole message.
    pub fn into_readings(
        self,
        device_id: DeviceId,
        received_at: DateTime<Utc>,
    ) -> DomainResult<Vec<TelemetryReading>> {
        let timestamp = self.timestamp.unwrap_or(received_at);
        self.readings
            .into_iter()
            .map(|r| {
                let mut reading =
                    TelemetryReading::new(device_id, timestamp, r.metric_name, r.value, r.unit)?;
                if let Some(q) = r.quality {
                    reading = reading.with_quality(q)?;
                }
                if let Some(meta) = r.metadata {
                    reading = reading.with_metadata(meta);
                }
                Ok(reading)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSubject {
    Device(DeviceId),
    Gateway(GatewayId),
}

/// A status message forwarded to the device/gateway registries.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub subject: StatusSubject,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn parse(subject: StatusSubject, payload: &[u8], received_at: DateTime<Utc>) -> DomainResult<Self> {
        let payload: JsonValue = serde_json::from_slice(payload)
            .map_err(|e| DomainError::validation(format!("invalid status payload: {e}")))?;
        if !payload.is_object() {
            return Err(DomainError::validation("status payload must be a JSON object"));
        }
        Ok(Self {
            subject,
            payload,
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_the_three_topic_families() {
        assert_eq!(
            Topic::parse("devices/abc/telemetry"),
            Some(Topic::DeviceTelemetry("abc"))
        );
        assert_eq!(Topic::parse("devices/abc/status"), Some(Topic::DeviceStatus("abc")));
        assert_eq!(Topic::parse("gateways/gw1/status"), Some(Topic::GatewayStatus("gw1")));
        assert_eq!(Topic::parse("devices//telemetry"), None);
        assert_eq!(Topic::parse("devices/abc/telemetry/extra"), None);
        assert_eq!(Topic::parse("gateways/gw1/telemetry"), None);
    }

    #[test]
    fn wildcard_matches_one_segment() {
        assert!(topic_matches("devices/*/telemetry", "devices/d1/telemetry"));
        assert!(!topic_matches("devices/*/telemetry", "devices/d1/status"));
        assert!(!topic_matches("devices/*/telemetry", "devices/a/b/telemetry"));
        assert!(!topic_matches("devices/*/telemetry", "devices//telemetry"));
    }

    #[test]
    fn payload_timestamp_wins_over_receive_time() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let raw = br#"{"timestamp":"2024-01-15T10:30:00Z","readings":[
            {"metric_name":"power","value":120.5,"unit":"W"},
            {"metric_name":"voltage","value":229.1,"unit":"V","quality":80}
        ]}"#;
        let device = DeviceId::new();
        let readings = TelemetryPayload::parse(raw)
            .unwrap()
            .into_readings(device, Utc::now())
            .unwrap();

        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.timestamp == ts && r.device_id == device));
        assert_eq!(readings[0].quality, 100);
        assert_eq!(readings[1].quality, 80);
    }

    #[test]
    fn missing_timestamp_uses_receive_time() {
        let now = Utc::now();
        let raw = br#"{"readings":[{"metric_name":"power","value":1.0}]}"#;
        let readings = TelemetryPayload::parse(raw)
            .unwrap()
            .into_readings(DeviceId::new(), now)
            .unwrap();
        assert_eq!(readings[0].timestamp, now);
        assert_eq!(readings[0].unit, "");
    }

    #[test]
    fn malformed_payloads_are_validation_errors() {
        assert!(TelemetryPayload::parse(b"not json").is_err());
        assert!(TelemetryPayload::parse(br#"{"readings":[{"value":1.0}]}"#).is_err());

        let bad_quality = br#"{"readings":[{"metric_name":"p","value":1.0,"quality":200}]}"#;
        let parsed = TelemetryPayload::parse(bad_quality).unwrap();
        assert!(parsed.into_readings(DeviceId::new(), Utc::now()).is_err());
    }

    #[test]
    fn status_payload_must_be_an_object() {
        let subject = StatusSubject::Gateway(GatewayId::new());
        assert!(StatusUpdate::parse(subject.clone(), br#"{"online":true}"#, Utc::now()).is_ok());
        assert!(StatusUpdate::parse(subject, b"[1,2]", Utc::now()).is_err());
    }
}
