//! `wattloop-core`: shared domain building blocks.
//!
//! Identifiers, the domain error model and optimistic-concurrency primitives used by
//! the telemetry and energy crates. No infrastructure concerns live here.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::{Entity, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{
    AssetId, CommandId, DeviceId, GatewayId, ProofId, RecommendationId, RewardEntryId, UserId,
};
