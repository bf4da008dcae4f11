//! Recommendation engine: trigger evaluation and the recommendation lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use wattloop_core::{AssetId, DeviceId, ExpectedVersion, RecommendationId, UserId};
use wattloop_energy::{
    ExpectedSavings, NewRecommendation, Recommendation, RecommendationAction,
    RecommendationReason, RecommendationStatus,
};

use super::ServiceError;
use crate::events::{ControlLoopEvent, EventSink};
use crate::store::{Page, PageRequest, RecommendationStore};
use crate::telemetry_store::TelemetryStore;

pub const POWER_METRIC: &str = "power";
pub const ANOMALY_LOOKBACK_DAYS: i64 = 7;
pub const ANOMALY_MIN_SAMPLES: u64 = 10;
pub const ANOMALY_Z_THRESHOLD: f64 = 3.0;
/// Longest load-shedding window a price spike may ask for.
pub const MAX_PRICE_WINDOW_HOURS: f64 = 168.0;

/// Signal the engine evaluates against device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Energy price above a threshold: shed load for `window_hours`.
    PriceSpike {
        asset_id: AssetId,
        device_id: DeviceId,
        #[serde(default)]
        user_id: Option<UserId>,
        price_per_kwh: f64,
        threshold: f64,
        window_hours: f64,
    },
    /// A reading far outside the device's recent distribution.
    Anomaly {
        asset_id: AssetId,
        device_id: DeviceId,
        #[serde(default)]
        user_id: Option<UserId>,
        metric_name: String,
        value: f64,
    },
    Schedule {
        asset_id: AssetId,
        #[serde(default)]
        device_id: Option<DeviceId>,
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
}

pub struct RecommendationService {
    store: Arc<dyn RecommendationStore>,
    telemetry: Arc<dyn TelemetryStore>,
    events: Arc<dyn EventSink>,
}

impl RecommendationService {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        telemetry: Arc<dyn TelemetryStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            telemetry,
            events,
        }
    }

    #[instrument(skip(self, input), fields(asset_id = %input.asset_id, reason = %input.reason), err)]
    pub async fn create(&self, input: NewRecommendation) -> Result<Recommendation, ServiceError> {
        let recommendation = Recommendation::create(input, Utc::now())?;
        self.store.insert(&recommendation).await?;

        info!(recommendation_id = %recommendation.id, "recommendation created");
        self.events
            .emit(ControlLoopEvent::RecommendationCreated {
                recommendation_id: recommendation.id,
                asset_id: recommendation.asset_id,
                user_id: recommendation.user_id,
                reason: recommendation.reason,
            })
            .await;
        Ok(recommendation)
    }

    pub async fn get(&self, id: RecommendationId) -> Result<Recommendation, ServiceError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("recommendation {id}")))
    }

    /// Apply a user response. Approve and reject are final; defer keeps it open.
    #[instrument(skip(self), err)]
    pub async fn respond(
        &self,
        id: RecommendationId,
        action: RecommendationAction,
    ) -> Result<Recommendation, ServiceError> {
        let updated = self
            .transition(id, |rec, now| rec.respond(action, now))
            .await?;
        info!(recommendation_id = %id, status = %updated.status, "recommendation answered");
        Ok(updated)
    }

    pub async fn mark_notified(&self, id: RecommendationId) -> Result<Recommendation, ServiceError> {
        self.transition(id, |rec, now| rec.mark_notified(now)).await
    }

    pub async fn expire(&self, id: RecommendationId) -> Result<Recommendation, ServiceError> {
        self.transition(id, |rec, now| rec.expire(now)).await
    }

    pub async fn list_for_asset(
        &self,
        asset_id: AssetId,
        status: Option<RecommendationStatus>,
        page: PageRequest,
    ) -> Result<Page<Recommendation>, ServiceError> {
        Ok(self.store.list_for_asset(asset_id, status, page).await?)
    }

    async fn transition<F>(
        &self,
        id: RecommendationId,
        apply: F,
    ) -> Result<Recommendation, ServiceError>
    where
        F: FnOnce(&mut Recommendation, DateTime<Utc>) -> wattloop_core::DomainResult<()>,
    {
        let mut recommendation = self.get(id).await?;
        let expected = ExpectedVersion::Exact(recommendation.version);
        apply(&mut recommendation, Utc::now())?;
        Ok(self.store.update(&recommendation, expected).await?)
    }

    /// Evaluate a trigger. `None` means the trigger did not fire.
    #[instrument(skip(self, trigger), err)]
    pub async fn evaluate(&self, trigger: Trigger) -> Result<Option<Recommendation>, ServiceError> {
        let now = Utc::now();
        let input = match trigger {
            Trigger::PriceSpike {
                asset_id,
                device_id,
                user_id,
                price_per_kwh,
                threshold,
                window_hours,
            } => {
                if !(price_per_kwh > threshold) {
                    debug!(price_per_kwh, threshold, "price below threshold");
                    return Ok(None);
                }
                if !window_hours.is_finite()
                    || window_hours <= 0.0
                    || window_hours > MAX_PRICE_WINDOW_HOURS
                {
                    return Err(ServiceError::Validation(format!(
                        "window_hours must be in (0, {MAX_PRICE_WINDOW_HOURS}], got {window_hours}"
                    )));
                }
                let expires_at = after_hours(now, window_hours).ok_or_else(|| {
                    ServiceError::Validation(format!("window_hours {window_hours} is out of range"))
                })?;

                let average_watts = self
                    .telemetry
                    .aggregate(device_id, POWER_METRIC, now - Duration::hours(1), now)
                    .await?
                    .map(|agg| agg.avg.max(0.0))
                    .unwrap_or(0.0);
                let energy_kwh = average_watts / 1000.0 * window_hours;
                let savings = ExpectedSavings::new(energy_kwh * price_per_kwh, energy_kwh)?;

                with_user(
                    NewRecommendation::new(asset_id, RecommendationReason::PriceHigh)
                        .for_device(device_id)
                        .with_savings(savings)
                        .expires_at(expires_at)
                        .with_context("price_per_kwh", json!(price_per_kwh))
                        .with_context("threshold", json!(threshold))
                        .with_context("average_power_w", json!(average_watts)),
                    user_id,
                )
            }
            Trigger::Anomaly {
                asset_id,
                device_id,
                user_id,
                metric_name,
                value,
            } => {
                let lookback = now - Duration::days(ANOMALY_LOOKBACK_DAYS);
                let Some(stats) = self
                    .telemetry
                    .aggregate(device_id, &metric_name, lookback, now)
                    .await?
                else {
                    return Ok(None);
                };
                if stats.count < ANOMALY_MIN_SAMPLES {
                    debug!(samples = stats.count, "not enough history for anomaly detection");
                    return Ok(None);
                }
                let Some(z) = stats.z_score(value) else {
                    return Ok(None);
                };
                if z.abs() < ANOMALY_Z_THRESHOLD {
                    return Ok(None);
                }

                with_user(
                    NewRecommendation::new(asset_id, RecommendationReason::Anomaly)
                        .for_device(device_id)
                        .with_context("metric_name", json!(metric_name))
                        .with_context("value", json!(value))
                        .with_context("mean", json!(stats.avg))
                        .with_context("stddev", json!(stats.stddev))
                        .with_context("z_score", json!(z)),
                    user_id,
                )
            }
            Trigger::Schedule {
                asset_id,
                device_id,
                user_id,
                expires_at,
            } => {
                let mut input = NewRecommendation::new(asset_id, RecommendationReason::Schedule);
                if let Some(device_id) = device_id {
                    input = input.for_device(device_id);
                }
                if let Some(at) = expires_at {
                    input = input.expires_at(at);
                }
                with_user(input, user_id)
            }
        };

        self.create(input).await.map(Some)
    }
}

fn with_user(input: NewRecommendation, user_id: Option<UserId>) -> NewRecommendation {
    match user_id {
        Some(user_id) => input.for_user(user_id),
        None => input,
    }
}

/// `now + value` hours, or `None` when the result is not representable.
fn after_hours(now: DateTime<Utc>, value: f64) -> Option<DateTime<Utc>> {
    let secs = (value * 3600.0).round();
    if !secs.is_finite() || secs.abs() > i64::MAX as f64 {
        return None;
    }
    now.checked_add_signed(Duration::try_seconds(secs as i64)?)
}
