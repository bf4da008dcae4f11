//! Application services for the control loop.
//!
//! Each service owns its collaborators behind trait objects and is built once at
//! process start. Mutations follow load → domain transition → compare-and-swap
//! update; a lost race surfaces as `ServiceError::Conflict`.

use thiserror::Error;

use wattloop_core::DomainError;

use crate::ingestion::RegistryError;
use crate::store::StoreError;
use crate::telemetry_store::TelemetryStoreError;
use crate::transport::TransportError;

pub mod dispatcher;
pub mod recommendation;
pub mod reward;
pub mod streak;

pub use dispatcher::{CommandDispatcher, Completion, DispatcherConfig, SweepReport};
pub use recommendation::{RecommendationService, Trigger};
pub use reward::{RewardService, SAVING_REWARD_MULTIPLIER};
pub use streak::StreakService;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("safety profile violation: {0}")]
    SafetyViolation(String),
    #[error("approval required: {0}")]
    ApprovalRequired(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// A downstream dependency (gateway transport, registry) is unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::InvalidAction(_) => "invalid_action",
            ServiceError::InvalidTransition(_) => "invalid_transition",
            ServiceError::SafetyViolation(_) => "safety_violation",
            ServiceError::ApprovalRequired(_) => "approval_required",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Unavailable(_) => "unavailable",
            ServiceError::Storage(_) => "storage",
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                ServiceError::Validation(msg)
            }
            DomainError::InvalidAction(action) => ServiceError::InvalidAction(action),
            DomainError::InvalidTransition { from, to } => {
                ServiceError::InvalidTransition(format!("{from} -> {to}"))
            }
            DomainError::SafetyViolation(msg) => ServiceError::SafetyViolation(msg),
            DomainError::ApprovalRequired(msg) => ServiceError::ApprovalRequired(msg),
            DomainError::NotFound(what) => ServiceError::NotFound(what),
            DomainError::Conflict(msg) => ServiceError::Conflict(msg),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::Storage(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<TelemetryStoreError> for ServiceError {
    fn from(value: TelemetryStoreError) -> Self {
        match value {
            TelemetryStoreError::Validation(msg) => ServiceError::Validation(msg),
            TelemetryStoreError::Storage(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<TransportError> for ServiceError {
    fn from(value: TransportError) -> Self {
        ServiceError::Unavailable(value.to_string())
    }
}

impl From<RegistryError> for ServiceError {
    fn from(value: RegistryError) -> Self {
        ServiceError::Unavailable(value.to_string())
    }
}
