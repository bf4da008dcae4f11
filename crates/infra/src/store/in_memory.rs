//! In-memory control loop stores.
//!
//! Intended for tests/dev. Each store keeps its uniqueness indexes under the same
//! lock as its rows, so insert-if-absent is atomic.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wattloop_core::{AssetId, CommandId, ExpectedVersion, RecommendationId, UserId};
use wattloop_energy::{
    Command, CommandProof, CommandStatus, IdempotencyKey, Recommendation, RecommendationStatus,
    RewardBalance, RewardEventType, RewardLedgerEntry, RewardReference, Streak, StreakType,
};

use super::{
    CommandStore, Page, PageRequest, RecommendationStore, RewardLedgerStore, StoreError,
    StreakStore,
};

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

fn check_version(
    what: &str,
    expected: ExpectedVersion,
    actual: u64,
) -> Result<(), StoreError> {
    if expected.matches(actual) {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "{what} was modified concurrently (expected {expected:?}, found {actual})"
        )))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecommendationStore {
    rows: RwLock<HashMap<RecommendationId, Recommendation>>,
}

impl InMemoryRecommendationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecommendationStore for InMemoryRecommendationStore {
    async fn insert(&self, recommendation: &Recommendation) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        if rows.contains_key(&recommendation.id) {
            return Err(StoreError::Conflict(format!(
                "recommendation {} already exists",
                recommendation.id
            )));
        }
        rows.insert(recommendation.id, recommendation.clone());
        Ok(())
    }

    async fn get(&self, id: RecommendationId) -> Result<Option<Recommendation>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).cloned())
    }

    async fn update(
        &self,
        recommendation: &Recommendation,
        expected: ExpectedVersion,
    ) -> Result<Recommendation, StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let stored = rows
            .get_mut(&recommendation.id)
            .ok_or_else(|| StoreError::NotFound(format!("recommendation {}", recommendation.id)))?;
        check_version("recommendation", expected, stored.version)?;

        let mut next = recommendation.clone();
        next.version = stored.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_for_asset(
        &self,
        asset_id: AssetId,
        status: Option<RecommendationStatus>,
        page: PageRequest,
    ) -> Result<Page<Recommendation>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut matched: Vec<Recommendation> = rows
            .values()
            .filter(|r| r.asset_id == asset_id)
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page.apply(matched))
    }
}

#[derive(Debug, Default)]
struct CommandTables {
    commands: HashMap<CommandId, Command>,
    keys: HashMap<IdempotencyKey, CommandId>,
    proofs: HashMap<CommandId, Vec<CommandProof>>,
}

#[derive(Debug, Default)]
pub struct InMemoryCommandStore {
    tables: RwLock<CommandTables>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn insert(&self, command: &Command) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if let Some(existing) = tables.keys.get(&command.idempotency_key) {
            return Err(StoreError::Conflict(format!(
                "idempotency key '{}' already used by command {existing}",
                command.idempotency_key
            )));
        }
        if tables.commands.contains_key(&command.id) {
            return Err(StoreError::Conflict(format!(
                "command {} already exists",
                command.id
            )));
        }
        tables
            .keys
            .insert(command.idempotency_key.clone(), command.id);
        tables.commands.insert(command.id, command.clone());
        Ok(())
    }

    async fn get(&self, id: CommandId) -> Result<Option<Command>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.commands.get(&id).cloned())
    }

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Command>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .keys
            .get(key)
            .and_then(|id| tables.commands.get(id))
            .cloned())
    }

    async fn update(
        &self,
        command: &Command,
        expected: ExpectedVersion,
    ) -> Result<Command, StoreError> {
        self.complete(command, expected, None).await
    }

    async fn complete(
        &self,
        command: &Command,
        expected: ExpectedVersion,
        proof: Option<&CommandProof>,
    ) -> Result<Command, StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let stored = tables
            .commands
            .get_mut(&command.id)
            .ok_or_else(|| StoreError::NotFound(format!("command {}", command.id)))?;
        check_version("command", expected, stored.version)?;
        if stored.idempotency_key != command.idempotency_key {
            return Err(StoreError::Conflict(format!(
                "idempotency key of command {} is immutable",
                command.id
            )));
        }

        let mut next = command.clone();
        next.version = stored.version + 1;
        *stored = next.clone();

        if let Some(proof) = proof {
            tables
                .proofs
                .entry(command.id)
                .or_default()
                .push(proof.clone());
        }
        Ok(next)
    }

    async fn list_overdue(
        &self,
        sent_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut overdue: Vec<Command> = tables
            .commands
            .values()
            .filter(|c| c.status.is_in_flight())
            .filter(|c| c.sent_at.is_some_and(|at| at <= sent_before))
            .cloned()
            .collect();
        overdue.sort_by_key(|c| c.sent_at);
        overdue.truncate(limit);
        Ok(overdue)
    }

    async fn list_by_status(
        &self,
        status: CommandStatus,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut matched: Vec<Command> = tables
            .commands
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        matched.sort_by_key(|c| c.created_at);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn list_redispatchable(
        &self,
        max_redispatch: u32,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut matched: Vec<Command> = tables
            .commands
            .values()
            .filter(|c| c.can_redispatch(max_redispatch))
            .cloned()
            .collect();
        matched.sort_by_key(|c| c.finished_at);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn proofs_for(&self, id: CommandId) -> Result<Vec<CommandProof>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.proofs.get(&id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct LedgerTables {
    entries: Vec<RewardLedgerEntry>,
    references: HashMap<(RewardEventType, RewardReference), usize>,
}

#[derive(Debug, Default)]
pub struct InMemoryRewardLedgerStore {
    tables: RwLock<LedgerTables>,
}

impl InMemoryRewardLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RewardLedgerStore for InMemoryRewardLedgerStore {
    async fn append(&self, entry: &RewardLedgerEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if let Some(reference) = entry.reference {
            let key = (entry.event_type, reference);
            if tables.references.contains_key(&key) {
                return Err(StoreError::Conflict(format!(
                    "{} already credited for {reference}",
                    entry.event_type
                )));
            }
            let idx = tables.entries.len();
            tables.references.insert(key, idx);
        }
        tables.entries.push(entry.clone());
        Ok(())
    }

    async fn find_by_reference(
        &self,
        event_type: RewardEventType,
        reference: RewardReference,
    ) -> Result<Option<RewardLedgerEntry>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .references
            .get(&(event_type, reference))
            .and_then(|idx| tables.entries.get(*idx))
            .cloned())
    }

    async fn balance(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<RewardBalance, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(RewardBalance::fold(user_id, &tables.entries, now))
    }

    async fn page(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<RewardLedgerEntry>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut matched: Vec<RewardLedgerEntry> = tables
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page.apply(matched))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStreakStore {
    rows: RwLock<HashMap<(UserId, StreakType), Streak>>,
}

impl InMemoryStreakStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreakStore for InMemoryStreakStore {
    async fn get(
        &self,
        user_id: UserId,
        streak_type: StreakType,
    ) -> Result<Option<Streak>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&(user_id, streak_type)).cloned())
    }

    async fn insert(&self, streak: &Streak) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let key = (streak.user_id, streak.streak_type);
        if rows.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{} streak already exists for user {}",
                streak.streak_type, streak.user_id
            )));
        }
        rows.insert(key, streak.clone());
        Ok(())
    }

    async fn update(
        &self,
        streak: &Streak,
        expected: ExpectedVersion,
    ) -> Result<Streak, StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let stored = rows
            .get_mut(&(streak.user_id, streak.streak_type))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "{} streak for user {}",
                    streak.streak_type, streak.user_id
                ))
            })?;
        check_version("streak", expected, stored.version)?;

        let mut next = streak.clone();
        next.version = stored.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Streak>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut streaks: Vec<Streak> = rows
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        streaks.sort_by_key(|s| s.streak_type.as_str());
        Ok(streaks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattloop_core::{DeviceId, GatewayId};
    use wattloop_energy::{CommandAction, NewCommand, NewRewardEntry, ReferenceType};

    fn command_with_key(key: &str) -> Command {
        Command::create(
            NewCommand::new(GatewayId::new(), DeviceId::new(), CommandAction::TurnOff)
                .with_idempotency_key(key),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_names_the_existing_command() {
        let store = InMemoryCommandStore::new();
        let first = command_with_key("retry-1");
        store.insert(&first).await.unwrap();

        let err = store.insert(&command_with_key("retry-1")).await.unwrap_err();
        match err {
            StoreError::Conflict(msg) => assert!(msg.contains(&first.id.to_string())),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(
            store.find_by_key(&first.idempotency_key).await.unwrap().unwrap().id,
            first.id
        );
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemoryCommandStore::new();
        let mut cmd = command_with_key("k");
        store.insert(&cmd).await.unwrap();

        cmd.mark_sent(Utc::now());
        let stored = store.update(&cmd, ExpectedVersion::Exact(0)).await.unwrap();
        assert_eq!(stored.version, 1);

        assert!(matches!(
            store.update(&cmd, ExpectedVersion::Exact(0)).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn ledger_reference_is_unique_per_event_type() {
        let store = InMemoryRewardLedgerStore::new();
        let user = UserId::new();
        let reference = RewardReference::new(ReferenceType::Command, CommandId::new());
        let entry = |event| {
            RewardLedgerEntry::create(
                NewRewardEntry::new(user, 10, event).referencing(reference),
                Utc::now(),
            )
            .unwrap()
        };

        store.append(&entry(RewardEventType::SavingAction)).await.unwrap();
        assert!(matches!(
            store.append(&entry(RewardEventType::SavingAction)).await,
            Err(StoreError::Conflict(_))
        ));
        store.append(&entry(RewardEventType::StreakBonus)).await.unwrap();

        let balance = store.balance(user, Utc::now()).await.unwrap();
        assert_eq!(balance.total, 20);
    }
}
