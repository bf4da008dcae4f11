use std::str::FromStr;

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use wattloop_core::{DeviceId, UserId};
use wattloop_energy::SafetyProfile;
use wattloop_infra::store::PageRequest;
use wattloop_telemetry::TelemetryReading;

use crate::app::errors;

/// Window used when a telemetry query omits `start`.
pub const DEFAULT_QUERY_WINDOW_HOURS: i64 = 24;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct TelemetryBatchRequest {
    pub readings: Vec<TelemetryReading>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryRangeQuery {
    pub metric: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TelemetryRangeQuery {
    /// `end` defaults to now, `start` to one window before `end`.
    pub fn range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = self
            .start
            .unwrap_or(end - Duration::hours(DEFAULT_QUERY_WINDOW_HOURS));
        (start, end)
    }
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub action: String,
    #[serde(default)]
    pub params: Map<String, JsonValue>,
    #[serde(default)]
    pub requested_by: Option<UserId>,
}

/// Body of a discovery claim. Both fields are optional.
#[derive(Debug, Default, Deserialize)]
pub struct ClaimDeviceRequest {
    /// Id to register the device under; a fresh one is minted when absent.
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub safety_profile: SafetyProfile,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    pub fn to_request(&self) -> PageRequest {
        let defaults = PageRequest::default();
        PageRequest::new(
            self.page.unwrap_or(defaults.page),
            self.page_size.unwrap_or(defaults.page_size),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RecommendationListQuery {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

// -------------------------
// Parsing helpers
// -------------------------

/// Parse a path identifier, mapping failure to a 400 naming the kind of id.
pub fn parse_id<T: FromStr>(raw: &str, what: &'static str) -> Result<T, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("invalid {what} id: {raw}"),
        )
    })
}
