//! Persistence boundary for the control loop records.
//!
//! Mutable records (recommendations, commands, streaks) are updated with a
//! compare-and-swap on their `version`; the store bumps the version on every
//! successful write. Uniqueness rules live in the store, not in the services:
//! - commands are unique on their idempotency key;
//! - ledger entries are unique on `(event_type, reference_type, reference_id)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wattloop_core::{
    AssetId, CommandId, DomainError, ExpectedVersion, RecommendationId, UserId,
};
use wattloop_energy::{
    Command, CommandProof, CommandStatus, IdempotencyKey, Recommendation, RecommendationStatus,
    RewardBalance, RewardEventType, RewardLedgerEntry, RewardReference, Streak, StreakType,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{
    InMemoryCommandStore, InMemoryRecommendationStore, InMemoryRewardLedgerStore,
    InMemoryStreakStore,
};
pub use postgres::{
    PostgresCommandStore, PostgresRecommendationStore, PostgresRewardLedgerStore,
    PostgresStreakStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Uniqueness or optimistic-concurrency violation.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
            DomainError::NotFound(what) => StoreError::NotFound(what),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Clamp to a valid page: `page >= 1`, `1 <= page_size <= MAX_PAGE_SIZE`.
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }

    pub fn limit(&self) -> usize {
        self.page_size as usize
    }

    /// Slice an already-ordered collection.
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let items = items.into_iter().skip(self.offset()).take(self.limit()).collect();
        Page {
            items,
            total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn insert(&self, recommendation: &Recommendation) -> Result<(), StoreError>;

    async fn get(&self, id: RecommendationId) -> Result<Option<Recommendation>, StoreError>;

    /// Compare-and-swap update. Returns the stored record with its new version.
    async fn update(
        &self,
        recommendation: &Recommendation,
        expected: ExpectedVersion,
    ) -> Result<Recommendation, StoreError>;

    /// Newest first.
    async fn list_for_asset(
        &self,
        asset_id: AssetId,
        status: Option<RecommendationStatus>,
        page: PageRequest,
    ) -> Result<Page<Recommendation>, StoreError>;
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a new command. A reused idempotency key is a `Conflict` naming the
    /// command that already holds it.
    async fn insert(&self, command: &Command) -> Result<(), StoreError>;

    async fn get(&self, id: CommandId) -> Result<Option<Command>, StoreError>;

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Command>, StoreError>;

    /// Compare-and-swap update. Returns the stored record with its new version.
    async fn update(&self, command: &Command, expected: ExpectedVersion)
    -> Result<Command, StoreError>;

    /// Persist a finished command and its proof in one atomic step.
    async fn complete(
        &self,
        command: &Command,
        expected: ExpectedVersion,
        proof: Option<&CommandProof>,
    ) -> Result<Command, StoreError>;

    /// `sent`/`acked` commands whose `sent_at` is at or before `sent_before`.
    async fn list_overdue(
        &self,
        sent_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError>;

    async fn list_by_status(
        &self,
        status: CommandStatus,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError>;

    /// `timeout` commands with re-dispatch budget left, longest-finished first.
    async fn list_redispatchable(
        &self,
        max_redispatch: u32,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError>;

    async fn proofs_for(&self, id: CommandId) -> Result<Vec<CommandProof>, StoreError>;
}

#[async_trait]
pub trait RewardLedgerStore: Send + Sync {
    /// Append an entry. A second entry for the same `(event_type, reference)` is a
    /// `Conflict`; this is the only guard against double crediting.
    async fn append(&self, entry: &RewardLedgerEntry) -> Result<(), StoreError>;

    async fn find_by_reference(
        &self,
        event_type: RewardEventType,
        reference: RewardReference,
    ) -> Result<Option<RewardLedgerEntry>, StoreError>;

    /// Read-time aggregate over the user's entries.
    async fn balance(&self, user_id: UserId, now: DateTime<Utc>)
    -> Result<RewardBalance, StoreError>;

    /// Newest first.
    async fn page(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<RewardLedgerEntry>, StoreError>;
}

#[async_trait]
pub trait StreakStore: Send + Sync {
    async fn get(
        &self,
        user_id: UserId,
        streak_type: StreakType,
    ) -> Result<Option<Streak>, StoreError>;

    /// Insert a new streak row. `Conflict` if one already exists for the pair.
    async fn insert(&self, streak: &Streak) -> Result<(), StoreError>;

    async fn update(&self, streak: &Streak, expected: ExpectedVersion)
    -> Result<Streak, StoreError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Streak>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_clamps_and_slices() {
        let req = PageRequest::new(0, 500);
        assert_eq!((req.page, req.page_size), (1, MAX_PAGE_SIZE));

        let page = PageRequest::new(2, 3).apply((1..=8).collect::<Vec<_>>());
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 8);

        let past_end = PageRequest::new(4, 3).apply((1..=8).collect::<Vec<_>>());
        assert!(past_end.items.is_empty());
    }
}
