//! Device command lifecycle.
//!
//! ```text
//! queued ──► sent ──► acked ──► success | failed
//!              │        │
//!              └────────┴─────► timeout ──► queued (re-dispatch, same key)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use wattloop_core::{
    CommandId, DeviceId, DomainError, DomainResult, Entity, GatewayId, RecommendationId, UserId,
};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    TurnOff,
    TurnOn,
    EcoMode,
    SetTemp,
    SetPower,
    Schedule,
}

impl_str_enum!(CommandAction, "command action" {
    TurnOff => "turn_off",
    TurnOn => "turn_on",
    EcoMode => "eco_mode",
    SetTemp => "set_temp",
    SetPower => "set_power",
    Schedule => "schedule",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Sent,
    Acked,
    Success,
    Failed,
    Timeout,
}

impl_str_enum!(CommandStatus, "command status" {
    Queued => "queued",
    Sent => "sent",
    Acked => "acked",
    Success => "success",
    Failed => "failed",
    Timeout => "timeout",
});

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Success | CommandStatus::Failed | CommandStatus::Timeout
        )
    }

    /// In flight at the gateway: eligible for the timeout sweep.
    pub fn is_in_flight(self) -> bool {
        matches!(self, CommandStatus::Sent | CommandStatus::Acked)
    }

    fn rank(self) -> u8 {
        match self {
            CommandStatus::Queued => 0,
            CommandStatus::Sent => 1,
            CommandStatus::Acked => 2,
            CommandStatus::Success | CommandStatus::Failed | CommandStatus::Timeout => 3,
        }
    }
}

/// Per-device policy gating automated control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyProfile {
    /// Never controlled automatically (medical equipment, freezers, ...).
    Critical,
    /// Controlled only under an approved recommendation.
    High,
    #[default]
    Normal,
}

impl_str_enum!(SafetyProfile, "safety profile" {
    Critical => "critical",
    High => "high",
    Normal => "normal",
});

impl SafetyProfile {
    /// Gate a command. `approved` is true when the command carries an approved recommendation.
    pub fn authorize(self, device_id: DeviceId, approved: bool) -> DomainResult<()> {
        match self {
            SafetyProfile::Critical => Err(DomainError::safety(format!(
                "device {device_id} has a critical safety profile and cannot be controlled"
            ))),
            SafetyProfile::High if !approved => Err(DomainError::approval_required(format!(
                "device {device_id} requires an approved recommendation"
            ))),
            SafetyProfile::High | SafetyProfile::Normal => Ok(()),
        }
    }
}

/// System-wide unique token deduplicating logically-equivalent command submissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive a fresh key: `{device}:{action}:{8 hex}`.
    pub fn derive(device_id: DeviceId, action: CommandAction) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{device_id}:{action}:{}", &suffix[..8]))
    }

    /// Accept a caller-supplied key.
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        let key = raw.trim();
        if key.is_empty() {
            return Err(DomainError::validation("idempotency key cannot be empty"));
        }
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency key longer than {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input for creating a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCommand {
    pub gateway_id: GatewayId,
    pub device_id: DeviceId,
    pub action: CommandAction,
    #[serde(default)]
    pub params: Map<String, JsonValue>,
    #[serde(default)]
    pub recommendation_id: Option<RecommendationId>,
    #[serde(default)]
    pub requested_by: Option<UserId>,
    /// Caller-supplied key; derived when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewCommand {
    pub fn new(gateway_id: GatewayId, device_id: DeviceId, action: CommandAction) -> Self {
        Self {
            gateway_id,
            device_id,
            action,
            params: Map::new(),
            recommendation_id: None,
            requested_by: None,
            idempotency_key: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn for_recommendation(mut self, id: RecommendationId) -> Self {
        self.recommendation_id = Some(id);
        self
    }

    pub fn requested_by(mut self, user_id: UserId) -> Self {
        self.requested_by = Some(user_id);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub recommendation_id: Option<RecommendationId>,
    pub gateway_id: GatewayId,
    pub device_id: DeviceId,
    pub action: CommandAction,
    pub params: Map<String, JsonValue>,
    pub status: CommandStatus,
    pub idempotency_key: IdempotencyKey,
    pub requested_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Number of times the command has been handed to the gateway.
    pub dispatch_attempts: u32,
    pub version: u64,
}

impl Command {
    pub fn create(input: NewCommand, now: DateTime<Utc>) -> DomainResult<Self> {
        let idempotency_key = match input.idempotency_key {
            Some(raw) => IdempotencyKey::parse(raw)?,
            None => IdempotencyKey::derive(input.device_id, input.action),
        };

        Ok(Self {
            id: CommandId::new(),
            recommendation_id: input.recommendation_id,
            gateway_id: input.gateway_id,
            device_id: input.device_id,
            action: input.action,
            params: input.params,
            status: CommandStatus::Queued,
            idempotency_key,
            requested_by: input.requested_by,
            created_at: now,
            sent_at: None,
            acked_at: None,
            finished_at: None,
            error: None,
            dispatch_attempts: 0,
            version: 0,
        })
    }

    /// Number of re-dispatches already consumed (the first send is not one).
    pub fn redispatches(&self) -> u32 {
        self.dispatch_attempts.saturating_sub(1)
    }

    /// `queued → sent`. Returns whether the state changed; never regresses.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != CommandStatus::Queued {
            return false;
        }
        self.status = CommandStatus::Sent;
        self.sent_at = Some(now);
        self.dispatch_attempts += 1;
        true
    }

    /// `queued | sent → acked`. Returns whether the state changed; never regresses.
    pub fn mark_acked(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.rank() >= CommandStatus::Acked.rank() {
            return false;
        }
        if self.sent_at.is_none() {
            self.sent_at = Some(now);
        }
        self.status = CommandStatus::Acked;
        self.acked_at = Some(now);
        true
    }

    /// Record the gateway's result. Returns `false` if the command already finished.
    pub fn complete(&mut self, success: bool, error: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = if success {
            CommandStatus::Success
        } else {
            CommandStatus::Failed
        };
        self.finished_at = Some(now);
        self.error = error;
        true
    }

    /// In flight for longer than `timeout` since it was last sent.
    pub fn is_overdue(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status.is_in_flight() && self.sent_at.is_some_and(|sent| sent + timeout <= now)
    }

    pub fn mark_timeout(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_in_flight() {
            return Err(DomainError::invalid_transition(self.status, CommandStatus::Timeout));
        }
        self.status = CommandStatus::Timeout;
        self.finished_at = Some(now);
        self.error = Some("gateway did not complete the command in time".to_string());
        Ok(())
    }

    pub fn can_redispatch(&self, max_redispatch: u32) -> bool {
        self.status == CommandStatus::Timeout && self.redispatches() < max_redispatch
    }

    /// `timeout → queued`, keeping the idempotency key.
    pub fn requeue(&mut self, max_redispatch: u32) -> DomainResult<()> {
        if self.status != CommandStatus::Timeout {
            return Err(DomainError::invalid_transition(self.status, CommandStatus::Queued));
        }
        if !self.can_redispatch(max_redispatch) {
            return Err(DomainError::validation(format!(
                "command {} exhausted its {max_redispatch} re-dispatch attempts",
                self.id
            )));
        }
        self.status = CommandStatus::Queued;
        self.sent_at = None;
        self.acked_at = None;
        self.finished_at = None;
        self.error = None;
        Ok(())
    }
}

impl Entity for Command {
    type Id = CommandId;

    fn id(&self) -> Self::Id {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        Command::create(
            NewCommand::new(GatewayId::new(), DeviceId::new(), CommandAction::TurnOff),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn derived_key_has_device_action_and_suffix() {
        let device = DeviceId::new();
        let key = IdempotencyKey::derive(device, CommandAction::EcoMode);
        let parts: Vec<_> = key.as_str().split(':').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], device.to_string());
        assert_eq!(parts[1], "eco_mode");
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, IdempotencyKey::derive(device, CommandAction::EcoMode));
    }

    #[test]
    fn caller_key_is_kept_and_validated() {
        let cmd = Command::create(
            NewCommand::new(GatewayId::new(), DeviceId::new(), CommandAction::TurnOn)
                .with_idempotency_key(" req-42 "),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(cmd.idempotency_key.as_str(), "req-42");

        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse("x".repeat(101)).is_err());
    }

    #[test]
    fn safety_gate() {
        let device = DeviceId::new();
        assert!(matches!(
            SafetyProfile::Critical.authorize(device, true),
            Err(DomainError::SafetyViolation(_))
        ));
        assert!(matches!(
            SafetyProfile::High.authorize(device, false),
            Err(DomainError::ApprovalRequired(_))
        ));
        assert!(SafetyProfile::High.authorize(device, true).is_ok());
        assert!(SafetyProfile::Normal.authorize(device, false).is_ok());
    }

    #[test]
    fn transitions_only_move_forward() {
        let mut cmd = command();
        let t0 = Utc::now();

        assert!(cmd.mark_sent(t0));
        assert!(cmd.mark_acked(t0));
        assert!(!cmd.mark_sent(t0 + Duration::seconds(1)));
        assert_eq!(cmd.status, CommandStatus::Acked);
        assert_eq!(cmd.sent_at, Some(t0));
        assert!(!cmd.mark_acked(t0 + Duration::seconds(2)));
        assert_eq!(cmd.acked_at, Some(t0));
    }

    #[test]
    fn ack_without_send_backfills_sent_at() {
        let mut cmd = command();
        let now = Utc::now();
        assert!(cmd.mark_acked(now));
        assert_eq!(cmd.sent_at, Some(now));
    }

    #[test]
    fn completes_at_most_once() {
        let mut cmd = command();
        cmd.mark_sent(Utc::now());

        assert!(cmd.complete(true, None, Utc::now()));
        let finished = cmd.finished_at;
        assert!(!cmd.complete(false, Some("late failure".into()), Utc::now()));
        assert_eq!(cmd.status, CommandStatus::Success);
        assert_eq!(cmd.finished_at, finished);
        assert_eq!(cmd.error, None);
    }

    #[test]
    fn timeout_and_bounded_redispatch_keep_the_key() {
        let mut cmd = command();
        let key = cmd.idempotency_key.clone();
        let timeout = Duration::seconds(300);
        let mut now = Utc::now();

        for _ in 0..=2 {
            cmd.mark_sent(now);
            assert!(!cmd.is_overdue(now, timeout));
            now += timeout;
            assert!(cmd.is_overdue(now, timeout));
            cmd.mark_timeout(now).unwrap();
            if cmd.can_redispatch(2) {
                cmd.requeue(2).unwrap();
            }
        }

        assert_eq!(cmd.status, CommandStatus::Timeout);
        assert_eq!(cmd.dispatch_attempts, 3);
        assert!(cmd.requeue(2).is_err());
        assert_eq!(cmd.idempotency_key, key);
    }

    #[test]
    fn queued_command_cannot_time_out() {
        let mut cmd = command();
        assert!(matches!(
            cmd.mark_timeout(Utc::now()),
            Err(DomainError::InvalidTransition { .. })
        ));
    }
}
