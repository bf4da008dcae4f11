//! Postgres-backed control loop stores.
//!
//! Unique violations (`23505`) become `StoreError::Conflict`; every other SQLx
//! failure becomes `StoreError::Storage`. Versioned updates run as
//! `UPDATE ... WHERE id = $1 AND version = $n` and report a conflict when no row
//! matched but the record exists.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use wattloop_core::{
    AssetId, CommandId, DeviceId, ExpectedVersion, GatewayId, ProofId, RecommendationId,
    RewardEntryId, UserId,
};
use wattloop_energy::{
    Command, CommandProof, CommandStatus, ExpectedSavings, IdempotencyKey, Recommendation,
    RecommendationStatus, RewardBalance, RewardEventType, RewardLedgerEntry, RewardReference,
    Streak, StreakType,
};

use super::{
    CommandStore, Page, PageRequest, RecommendationStore, RewardLedgerStore, StoreError,
    StreakStore,
};
use crate::pg::{describe, is_unique_violation};

fn map_sqlx_error(operation: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(describe(operation, &e))
        } else {
            StoreError::Storage(describe(operation, &e))
        }
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row
        .try_get(column)
        .map_err(|e| StoreError::Storage(format!("failed to read {column}: {e}")))?;
    raw.parse::<T>()
        .map_err(|e| StoreError::Storage(format!("invalid {column} '{raw}': {e}")))
}

fn column<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Storage(format!("failed to read {column}: {e}")))
}

fn object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

fn expected_version(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

/// Shared tail of a versioned update: decide between not-found and conflict.
async fn versioned_miss(
    pool: &PgPool,
    table: &'static str,
    what: String,
    id: Uuid,
) -> StoreError {
    let sql = format!("SELECT version FROM {table} WHERE id = $1");
    match sqlx::query(&sql).bind(id).fetch_optional(pool).await {
        Ok(Some(row)) => {
            let found: i64 = row.try_get("version").unwrap_or_default();
            StoreError::Conflict(format!(
                "{what} was modified concurrently (found version {found})"
            ))
        }
        Ok(None) => StoreError::NotFound(what),
        Err(e) => StoreError::Storage(describe("versioned_update", &e)),
    }
}

// ---------------------------------------------------------------------------
// Recommendations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresRecommendationStore {
    pool: Arc<PgPool>,
}

impl PostgresRecommendationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const RECOMMENDATION_COLUMNS: &str = "id, asset_id, device_id, user_id, reason, \
    expected_saving_try, expected_saving_kwh, status, expires_at, context, created_at, \
    updated_at, version";

fn recommendation_from_row(row: &PgRow) -> Result<Recommendation, StoreError> {
    let device_id: Option<Uuid> = column(row, "device_id")?;
    let user_id: Option<Uuid> = column(row, "user_id")?;
    let version: i64 = column(row, "version")?;

    Ok(Recommendation {
        id: RecommendationId::from_uuid(column(row, "id")?),
        asset_id: AssetId::from_uuid(column(row, "asset_id")?),
        device_id: device_id.map(DeviceId::from_uuid),
        user_id: user_id.map(UserId::from_uuid),
        reason: parse_column(row, "reason")?,
        expected_savings: ExpectedSavings {
            currency: column(row, "expected_saving_try")?,
            energy_kwh: column(row, "expected_saving_kwh")?,
        },
        status: parse_column(row, "status")?,
        expires_at: column(row, "expires_at")?,
        context: object(column(row, "context")?),
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        version: version as u64,
    })
}

#[async_trait]
impl RecommendationStore for PostgresRecommendationStore {
    async fn insert(&self, r: &Recommendation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recommendations (
                id, asset_id, device_id, user_id, reason, expected_saving_try,
                expected_saving_kwh, status, expires_at, context, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(r.id.as_uuid())
        .bind(r.asset_id.as_uuid())
        .bind(r.device_id.map(Uuid::from))
        .bind(r.user_id.map(Uuid::from))
        .bind(r.reason.as_str())
        .bind(r.expected_savings.currency)
        .bind(r.expected_savings.energy_kwh)
        .bind(r.status.as_str())
        .bind(r.expires_at)
        .bind(JsonValue::Object(r.context.clone()))
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(r.version as i64)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error("insert_recommendation"))?;
        Ok(())
    }

    async fn get(&self, id: RecommendationId) -> Result<Option<Recommendation>, StoreError> {
        let sql = format!("SELECT {RECOMMENDATION_COLUMNS} FROM recommendations WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error("get_recommendation"))?;
        row.as_ref().map(recommendation_from_row).transpose()
    }

    async fn update(
        &self,
        r: &Recommendation,
        expected: ExpectedVersion,
    ) -> Result<Recommendation, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE recommendations
            SET status = $2, expires_at = $3, context = $4, updated_at = $5, version = version + 1
            WHERE id = $1 AND ($6::bigint IS NULL OR version = $6)
            RETURNING version
            "#,
        )
        .bind(r.id.as_uuid())
        .bind(r.status.as_str())
        .bind(r.expires_at)
        .bind(JsonValue::Object(r.context.clone()))
        .bind(r.updated_at)
        .bind(expected_version(expected))
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error("update_recommendation"))?;

        match row {
            Some(row) => {
                let version: i64 = column(&row, "version")?;
                let mut stored = r.clone();
                stored.version = version as u64;
                Ok(stored)
            }
            None => Err(versioned_miss(
                &self.pool,
                "recommendations",
                format!("recommendation {}", r.id),
                *r.id.as_uuid(),
            )
            .await),
        }
    }

    async fn list_for_asset(
        &self,
        asset_id: AssetId,
        status: Option<RecommendationStatus>,
        page: PageRequest,
    ) -> Result<Page<Recommendation>, StoreError> {
        let status = status.map(|s| s.as_str());

        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM recommendations \
             WHERE asset_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(asset_id.as_uuid())
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_error("count_recommendations"))
        .and_then(|row| column(&row, "total"))?;

        let sql = format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
             WHERE asset_id = $1 AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query(&sql)
            .bind(asset_id.as_uuid())
            .bind(status)
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx_error("list_recommendations"))?;

        Ok(Page {
            items: rows
                .iter()
                .map(recommendation_from_row)
                .collect::<Result<_, _>>()?,
            total: total as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresCommandStore {
    pool: Arc<PgPool>,
}

impl PostgresCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const COMMAND_COLUMNS: &str = "id, recommendation_id, gateway_id, device_id, action, params, \
    status, idempotency_key, requested_by, created_at, sent_at, acked_at, finished_at, error, \
    dispatch_attempts, version";

fn command_from_row(row: &PgRow) -> Result<Command, StoreError> {
    let recommendation_id: Option<Uuid> = column(row, "recommendation_id")?;
    let requested_by: Option<Uuid> = column(row, "requested_by")?;
    let key: String = column(row, "idempotency_key")?;
    let attempts: i32 = column(row, "dispatch_attempts")?;
    let version: i64 = column(row, "version")?;

    Ok(Command {
        id: CommandId::from_uuid(column(row, "id")?),
        recommendation_id: recommendation_id.map(RecommendationId::from_uuid),
        gateway_id: GatewayId::from_uuid(column(row, "gateway_id")?),
        device_id: DeviceId::from_uuid(column(row, "device_id")?),
        action: parse_column(row, "action")?,
        params: object(column(row, "params")?),
        status: parse_column(row, "status")?,
        idempotency_key: IdempotencyKey::parse(key)
            .map_err(|e| StoreError::Storage(e.to_string()))?,
        requested_by: requested_by.map(UserId::from_uuid),
        created_at: column(row, "created_at")?,
        sent_at: column(row, "sent_at")?,
        acked_at: column(row, "acked_at")?,
        finished_at: column(row, "finished_at")?,
        error: column(row, "error")?,
        dispatch_attempts: attempts.max(0) as u32,
        version: version as u64,
    })
}

fn proof_from_row(row: &PgRow) -> Result<CommandProof, StoreError> {
    Ok(CommandProof {
        id: ProofId::from_uuid(column(row, "id")?),
        command_id: CommandId::from_uuid(column(row, "command_id")?),
        kind: parse_column(row, "proof_type")?,
        payload: column(row, "payload")?,
        verified_at: column(row, "verified_at")?,
    })
}

impl PostgresCommandStore {
    async fn update_in<'e, E>(
        executor: E,
        c: &Command,
        expected: ExpectedVersion,
    ) -> Result<Option<i64>, StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let row = sqlx::query(
            r#"
            UPDATE commands
            SET status = $2, sent_at = $3, acked_at = $4, finished_at = $5, error = $6,
                dispatch_attempts = $7, version = version + 1
            WHERE id = $1 AND idempotency_key = $8 AND ($9::bigint IS NULL OR version = $9)
            RETURNING version
            "#,
        )
        .bind(*c.id.as_uuid())
        .bind(c.status.as_str())
        .bind(c.sent_at)
        .bind(c.acked_at)
        .bind(c.finished_at)
        .bind(c.error.clone())
        .bind(c.dispatch_attempts as i32)
        .bind(c.idempotency_key.as_str().to_string())
        .bind(expected_version(expected))
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error("update_command"))?;

        row.map(|row| column::<i64>(&row, "version")).transpose()
    }
}

#[async_trait]
impl CommandStore for PostgresCommandStore {
    #[instrument(skip(self, c), fields(command_id = %c.id, key = %c.idempotency_key), err)]
    async fn insert(&self, c: &Command) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO commands (
                id, recommendation_id, gateway_id, device_id, action, params, status,
                idempotency_key, requested_by, created_at, sent_at, acked_at, finished_at,
                error, dispatch_attempts, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(c.id.as_uuid())
        .bind(c.recommendation_id.map(Uuid::from))
        .bind(c.gateway_id.as_uuid())
        .bind(c.device_id.as_uuid())
        .bind(c.action.as_str())
        .bind(JsonValue::Object(c.params.clone()))
        .bind(c.status.as_str())
        .bind(c.idempotency_key.as_str())
        .bind(c.requested_by.map(Uuid::from))
        .bind(c.created_at)
        .bind(c.sent_at)
        .bind(c.acked_at)
        .bind(c.finished_at)
        .bind(c.error.as_deref())
        .bind(c.dispatch_attempts as i32)
        .bind(c.version as i64)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let existing = self.find_by_key(&c.idempotency_key).await?;
                Err(StoreError::Conflict(match existing {
                    Some(existing) => format!(
                        "idempotency key '{}' already used by command {}",
                        c.idempotency_key, existing.id
                    ),
                    None => describe("insert_command", &e),
                }))
            }
            Err(e) => Err(StoreError::Storage(describe("insert_command", &e))),
        }
    }

    async fn get(&self, id: CommandId) -> Result<Option<Command>, StoreError> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error("get_command"))?;
        row.as_ref().map(command_from_row).transpose()
    }

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Command>, StoreError> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE idempotency_key = $1");
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error("find_command_by_key"))?;
        row.as_ref().map(command_from_row).transpose()
    }

    async fn update(
        &self,
        c: &Command,
        expected: ExpectedVersion,
    ) -> Result<Command, StoreError> {
        match Self::update_in(&*self.pool, c, expected).await? {
            Some(version) => {
                let mut stored = c.clone();
                stored.version = version as u64;
                Ok(stored)
            }
            None => Err(versioned_miss(
                &self.pool,
                "commands",
                format!("command {}", c.id),
                *c.id.as_uuid(),
            )
            .await),
        }
    }

    #[instrument(skip(self, c, proof), fields(command_id = %c.id, status = %c.status), err)]
    async fn complete(
        &self,
        c: &Command,
        expected: ExpectedVersion,
        proof: Option<&CommandProof>,
    ) -> Result<Command, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_sqlx_error("begin_transaction"))?;

        let Some(version) = Self::update_in(&mut *tx, c, expected).await? else {
            tx.rollback()
                .await
                .map_err(map_sqlx_error("rollback"))?;
            return Err(versioned_miss(
                &self.pool,
                "commands",
                format!("command {}", c.id),
                *c.id.as_uuid(),
            )
            .await);
        };

        if let Some(proof) = proof {
            sqlx::query(
                r#"
                INSERT INTO command_proofs (id, command_id, proof_type, payload, verified_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(proof.id.as_uuid())
            .bind(proof.command_id.as_uuid())
            .bind(proof.kind.as_str())
            .bind(&proof.payload)
            .bind(proof.verified_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error("insert_proof"))?;
        }

        tx.commit()
            .await
            .map_err(map_sqlx_error("commit_transaction"))?;

        let mut stored = c.clone();
        stored.version = version as u64;
        Ok(stored)
    }

    async fn list_overdue(
        &self,
        sent_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands \
             WHERE status IN ('sent', 'acked') AND sent_at <= $1 \
             ORDER BY sent_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(sent_before)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx_error("list_overdue_commands"))?;
        rows.iter().map(command_from_row).collect()
    }

    async fn list_by_status(
        &self,
        status: CommandStatus,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE status = $1 \
             ORDER BY created_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx_error("list_commands_by_status"))?;
        rows.iter().map(command_from_row).collect()
    }

    async fn list_redispatchable(
        &self,
        max_redispatch: u32,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        // redispatches = dispatch_attempts - 1, so budget remains while attempts <= max.
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands \
             WHERE status = 'timeout' AND dispatch_attempts <= $1 \
             ORDER BY finished_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(max_redispatch))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx_error("list_redispatchable_commands"))?;
        rows.iter().map(command_from_row).collect()
    }

    async fn proofs_for(&self, id: CommandId) -> Result<Vec<CommandProof>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, command_id, proof_type, payload, verified_at FROM command_proofs \
             WHERE command_id = $1 ORDER BY verified_at ASC",
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error("list_proofs"))?;
        rows.iter().map(proof_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Reward ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresRewardLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresRewardLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const LEDGER_COLUMNS: &str = "id, user_id, asset_id, event_type, amount, expires_at, \
    reference_type, reference_id, description, created_at";

fn ledger_entry_from_row(row: &PgRow) -> Result<RewardLedgerEntry, StoreError> {
    let asset_id: Option<Uuid> = column(row, "asset_id")?;
    let reference_type: Option<String> = column(row, "reference_type")?;
    let reference_id: Option<Uuid> = column(row, "reference_id")?;

    let reference = match (reference_type, reference_id) {
        (Some(kind), Some(id)) => Some(RewardReference {
            kind: kind
                .parse()
                .map_err(|e| StoreError::Storage(format!("invalid reference_type: {e}")))?,
            id,
        }),
        _ => None,
    };

    Ok(RewardLedgerEntry {
        id: RewardEntryId::from_uuid(column(row, "id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        asset_id: asset_id.map(AssetId::from_uuid),
        event_type: parse_column(row, "event_type")?,
        amount: column(row, "amount")?,
        expires_at: column(row, "expires_at")?,
        reference,
        description: column(row, "description")?,
        created_at: column(row, "created_at")?,
    })
}

#[async_trait]
impl RewardLedgerStore for PostgresRewardLedgerStore {
    #[instrument(skip(self, e), fields(user_id = %e.user_id, event_type = %e.event_type), err)]
    async fn append(&self, e: &RewardLedgerEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reward_ledger (
                id, user_id, asset_id, event_type, amount, expires_at,
                reference_type, reference_id, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(e.id.as_uuid())
        .bind(e.user_id.as_uuid())
        .bind(e.asset_id.map(Uuid::from))
        .bind(e.event_type.as_str())
        .bind(e.amount)
        .bind(e.expires_at)
        .bind(e.reference.map(|r| r.kind.as_str()))
        .bind(e.reference.map(|r| r.id))
        .bind(e.description.as_deref())
        .bind(e.created_at)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error("append_reward"))?;
        Ok(())
    }

    async fn find_by_reference(
        &self,
        event_type: RewardEventType,
        reference: RewardReference,
    ) -> Result<Option<RewardLedgerEntry>, StoreError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM reward_ledger \
             WHERE event_type = $1 AND reference_type = $2 AND reference_id = $3"
        );
        let row = sqlx::query(&sql)
            .bind(event_type.as_str())
            .bind(reference.kind.as_str())
            .bind(reference.id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error("find_reward_by_reference"))?;
        row.as_ref().map(ledger_entry_from_row).transpose()
    }

    async fn balance(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<RewardBalance, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE expires_at IS NULL OR expires_at > $2), 0)::bigint AS total,
                COALESCE(SUM(amount) FILTER (WHERE (expires_at IS NULL OR expires_at > $2) AND amount > 0), 0)::bigint AS earned,
                COALESCE(-SUM(amount) FILTER (WHERE (expires_at IS NULL OR expires_at > $2) AND amount < 0), 0)::bigint AS spent,
                COALESCE(SUM(amount) FILTER (WHERE expires_at <= $2 AND amount > 0), 0)::bigint AS expired
            FROM reward_ledger
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_error("reward_balance"))?;

        Ok(RewardBalance {
            user_id,
            total: column(&row, "total")?,
            earned: column(&row, "earned")?,
            spent: column(&row, "spent")?,
            expired: column(&row, "expired")?,
        })
    }

    async fn page(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<RewardLedgerEntry>, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM reward_ledger WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(map_sqlx_error("count_rewards"))
            .and_then(|row| column(&row, "total"))?;

        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM reward_ledger WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx_error("list_rewards"))?;

        Ok(Page {
            items: rows
                .iter()
                .map(ledger_entry_from_row)
                .collect::<Result<_, _>>()?,
            total: total as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }
}

// ---------------------------------------------------------------------------
// Streaks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgresStreakStore {
    pool: Arc<PgPool>,
}

impl PostgresStreakStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn streak_from_row(row: &PgRow) -> Result<Streak, StoreError> {
    let current: i32 = column(row, "current_count")?;
    let longest: i32 = column(row, "longest_count")?;
    let version: i64 = column(row, "version")?;
    Ok(Streak {
        user_id: UserId::from_uuid(column(row, "user_id")?),
        streak_type: parse_column(row, "streak_type")?,
        current_count: current.max(0) as u32,
        longest_count: longest.max(0) as u32,
        last_date: column(row, "last_date")?,
        version: version as u64,
    })
}

#[async_trait]
impl StreakStore for PostgresStreakStore {
    async fn get(
        &self,
        user_id: UserId,
        streak_type: StreakType,
    ) -> Result<Option<Streak>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, streak_type, current_count, longest_count, last_date, version \
             FROM streaks WHERE user_id = $1 AND streak_type = $2",
        )
        .bind(user_id.as_uuid())
        .bind(streak_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error("get_streak"))?;
        row.as_ref().map(streak_from_row).transpose()
    }

    async fn insert(&self, s: &Streak) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO streaks (user_id, streak_type, current_count, longest_count, last_date, version) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(s.user_id.as_uuid())
        .bind(s.streak_type.as_str())
        .bind(s.current_count as i32)
        .bind(s.longest_count as i32)
        .bind(s.last_date)
        .bind(s.version as i64)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error("insert_streak"))?;
        Ok(())
    }

    async fn update(&self, s: &Streak, expected: ExpectedVersion) -> Result<Streak, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE streaks
            SET current_count = $3, longest_count = $4, last_date = $5, version = version + 1
            WHERE user_id = $1 AND streak_type = $2 AND ($6::bigint IS NULL OR version = $6)
            RETURNING version
            "#,
        )
        .bind(s.user_id.as_uuid())
        .bind(s.streak_type.as_str())
        .bind(s.current_count as i32)
        .bind(s.longest_count as i32)
        .bind(s.last_date)
        .bind(expected_version(expected))
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error("update_streak"))?;

        match row {
            Some(row) => {
                let version: i64 = column(&row, "version")?;
                let mut stored = s.clone();
                stored.version = version as u64;
                Ok(stored)
            }
            None => match self.get(s.user_id, s.streak_type).await? {
                Some(found) => Err(StoreError::Conflict(format!(
                    "{} streak for user {} was modified concurrently (found version {})",
                    s.streak_type, s.user_id, found.version
                ))),
                None => Err(StoreError::NotFound(format!(
                    "{} streak for user {}",
                    s.streak_type, s.user_id
                ))),
            },
        }
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Streak>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, streak_type, current_count, longest_count, last_date, version \
             FROM streaks WHERE user_id = $1 ORDER BY streak_type",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error("list_streaks"))?;
        rows.iter().map(streak_from_row).collect()
    }
}
