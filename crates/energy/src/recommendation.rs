use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use wattloop_core::{
    AssetId, DeviceId, DomainError, DomainResult, Entity, RecommendationId, UserId,
};

/// Why a recommendation was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationReason {
    PriceHigh,
    Anomaly,
    Schedule,
    Predictive,
    UserPattern,
}

impl_str_enum!(RecommendationReason, "recommendation reason" {
    PriceHigh => "price_high",
    Anomaly => "anomaly",
    Schedule => "schedule",
    Predictive => "predictive",
    UserPattern => "user_pattern",
});

/// Recommendation lifecycle.
///
/// `created → notified → approved | deferred | rejected`, with `expired` reachable
/// from any state that has not been approved or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Created,
    Notified,
    Approved,
    Deferred,
    Rejected,
    Expired,
}

impl_str_enum!(RecommendationStatus, "recommendation status" {
    Created => "created",
    Notified => "notified",
    Approved => "approved",
    Deferred => "deferred",
    Rejected => "rejected",
    Expired => "expired",
});

impl RecommendationStatus {
    /// Whether the user can still act on the recommendation.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            RecommendationStatus::Created
                | RecommendationStatus::Notified
                | RecommendationStatus::Deferred
        )
    }
}

/// A user's response to a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationAction {
    Approve,
    Defer,
    Reject,
}

impl RecommendationAction {
    pub fn target_status(self) -> RecommendationStatus {
        match self {
            RecommendationAction::Approve => RecommendationStatus::Approved,
            RecommendationAction::Defer => RecommendationStatus::Deferred,
            RecommendationAction::Reject => RecommendationStatus::Rejected,
        }
    }
}

impl core::str::FromStr for RecommendationAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(RecommendationAction::Approve),
            "defer" => Ok(RecommendationAction::Defer),
            "reject" => Ok(RecommendationAction::Reject),
            other => Err(DomainError::invalid_action(other)),
        }
    }
}

/// Expected savings if the recommendation is carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedSavings {
    /// Currency amount (TRY).
    pub currency: f64,
    pub energy_kwh: f64,
}

impl ExpectedSavings {
    pub fn new(currency: f64, energy_kwh: f64) -> DomainResult<Self> {
        if !currency.is_finite() || !energy_kwh.is_finite() {
            return Err(DomainError::validation("expected savings must be finite"));
        }
        if currency < 0.0 || energy_kwh < 0.0 {
            return Err(DomainError::validation("expected savings cannot be negative"));
        }
        Ok(Self {
            currency,
            energy_kwh,
        })
    }
}

/// Input for creating a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecommendation {
    pub asset_id: AssetId,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    /// User who receives the recommendation and any reward it leads to.
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub reason: RecommendationReason,
    #[serde(default)]
    pub expected_savings: ExpectedSavings,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Map<String, JsonValue>,
}

impl NewRecommendation {
    pub fn new(asset_id: AssetId, reason: RecommendationReason) -> Self {
        Self {
            asset_id,
            device_id: None,
            user_id: None,
            reason,
            expected_savings: ExpectedSavings::default(),
            expires_at: None,
            context: Map::new(),
        }
    }

    pub fn for_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_savings(mut self, savings: ExpectedSavings) -> Self {
        self.expected_savings = savings;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// An energy-saving suggestion for an asset. Never deleted; status changes only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: RecommendationId,
    pub asset_id: AssetId,
    pub device_id: Option<DeviceId>,
    pub user_id: Option<UserId>,
    pub reason: RecommendationReason,
    pub expected_savings: ExpectedSavings,
    pub status: RecommendationStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub context: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Recommendation {
    pub fn create(input: NewRecommendation, now: DateTime<Utc>) -> DomainResult<Self> {
        if let Some(expires_at) = input.expires_at {
            if expires_at <= now {
                return Err(DomainError::validation("expires_at must be in the future"));
            }
        }
        ExpectedSavings::new(input.expected_savings.currency, input.expected_savings.energy_kwh)?;

        Ok(Self {
            id: RecommendationId::new(),
            asset_id: input.asset_id,
            device_id: input.device_id,
            user_id: input.user_id,
            reason: input.reason,
            expected_savings: input.expected_savings,
            status: RecommendationStatus::Created,
            expires_at: input.expires_at,
            context: input.context,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    pub fn is_approved(&self) -> bool {
        self.status == RecommendationStatus::Approved
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn mark_notified(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != RecommendationStatus::Created {
            return Err(DomainError::invalid_transition(
                self.status,
                RecommendationStatus::Notified,
            ));
        }
        self.transition(RecommendationStatus::Notified, now);
        Ok(())
    }

    /// Apply a user response. Approve and reject are final; defer keeps it open.
    pub fn respond(&mut self, action: RecommendationAction, now: DateTime<Utc>) -> DomainResult<()> {
        let target = action.target_status();
        if !self.status.is_open() {
            return Err(DomainError::invalid_transition(self.status, target));
        }
        if self.is_past_expiry(now) {
            return Err(DomainError::invalid_transition(
                RecommendationStatus::Expired,
                target,
            ));
        }
        self.transition(target, now);
        Ok(())
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_open() {
            return Err(DomainError::invalid_transition(
                self.status,
                RecommendationStatus::Expired,
            ));
        }
        self.transition(RecommendationStatus::Expired, now);
        Ok(())
    }

    fn transition(&mut self, status: RecommendationStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

impl Entity for Recommendation {
    type Id = RecommendationId;

    fn id(&self) -> Self::Id {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
