//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic, business/domain failures only (validation, rule violations,
/// conflicts). Infrastructure failures are modelled by the store/service layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input, batch over the cap).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An action name that is not part of the closed action set.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The target device's safety profile forbids the command.
    #[error("safety profile violation: {0}")]
    SafetyViolation(String),

    /// The device requires an approved recommendation before commands may be issued.
    #[error("approval required: {0}")]
    ApprovalRequired(String),

    /// A requested resource was not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness or optimistic-concurrency conflict.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_action(action: impl Into<String>) -> Self {
        Self::InvalidAction(action.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Display, to: impl core::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn safety(msg: impl Into<String>) -> Self {
        Self::SafetyViolation(msg.into())
    }

    pub fn approval_required(msg: impl Into<String>) -> Self {
        Self::ApprovalRequired(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
