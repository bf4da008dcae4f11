//! Command dispatcher: safety gate, gateway hand-off, completion and payout.
//!
//! ```text
//! create ─► dispatch ─► (gateway) ack ─► complete ─► proof ─► reward ─► streak
//!                ▲                          │
//!                └──── sweep: timeout ◄─────┘ (no result in time)
//! ```
//!
//! Completion is persisted together with its proof in one store call, so a
//! command is completed at most once. The reward is keyed on the command id;
//! replaying a completion retries the credit and treats the uniqueness conflict
//! as "already paid".

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, instrument, warn};

use wattloop_core::{CommandId, ExpectedVersion, RecommendationId, UserId};
use wattloop_energy::{
    Command, CommandAction, CommandProof, CommandStatus, IdempotencyKey, NewCommand,
    NewRewardEntry, ProofKind, Recommendation, RecommendationAction, ReferenceType,
    RewardEventType, RewardLedgerEntry, RewardReference, StreakType,
};

use super::reward::saving_reward_points;
use super::{RecommendationService, RewardService, ServiceError, StreakService};
use crate::events::{ControlLoopEvent, EventSink};
use crate::ingestion::DeviceRegistry;
use crate::retry::RetryPolicy;
use crate::store::{CommandStore, StoreError};
use crate::transport::CommandTransport;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherConfig {
    /// Time a command may stay `sent`/`acked` before it times out.
    pub command_timeout: Duration,
    /// Re-dispatches allowed after the first send.
    pub max_redispatch: u32,
    /// Wait between a timeout and the next re-dispatch. Only the delay is
    /// used; `max_redispatch` bounds the number of attempts.
    pub redispatch_backoff: RetryPolicy,
    pub reward_base_points: i64,
    /// Commands examined per sweep phase.
    pub sweep_batch: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            max_redispatch: 3,
            redispatch_backoff: RetryPolicy::exponential(
                u32::MAX,
                Duration::from_secs(30),
                Duration::from_secs(600),
            )
            .with_jitter(0.1),
            reward_base_points: 10,
            sweep_batch: 100,
        }
    }
}

/// Gateway result callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub success: bool,
    /// Before/after evidence; only recorded for successful commands.
    #[serde(default)]
    pub proof: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Completion {
    pub fn succeeded(proof: JsonValue) -> Self {
        Self {
            success: true,
            proof: Some(proof),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            proof: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of one timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: usize,
    pub redispatched: usize,
    /// Timed out with budget left but still inside the backoff window.
    pub waiting: usize,
    /// Re-dispatch attempts the gateway transport refused.
    pub failed: usize,
}

pub struct CommandDispatcher {
    commands: Arc<dyn CommandStore>,
    recommendations: Arc<RecommendationService>,
    registry: Arc<dyn DeviceRegistry>,
    transport: Arc<dyn CommandTransport>,
    rewards: Arc<RewardService>,
    streaks: Arc<StreakService>,
    events: Arc<dyn EventSink>,
    config: DispatcherConfig,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commands: Arc<dyn CommandStore>,
        recommendations: Arc<RecommendationService>,
        registry: Arc<dyn DeviceRegistry>,
        transport: Arc<dyn CommandTransport>,
        rewards: Arc<RewardService>,
        streaks: Arc<StreakService>,
        events: Arc<dyn EventSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            commands,
            recommendations,
            registry,
            transport,
            rewards,
            streaks,
            events,
            config,
        }
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config
    }

    /// Create a `queued` command after the device's safety profile allows it.
    ///
    /// A caller-supplied idempotency key that is already taken is a conflict
    /// naming the command that holds it.
    #[instrument(skip(self, input), fields(device_id = %input.device_id, action = %input.action), err)]
    pub async fn create(&self, input: NewCommand) -> Result<Command, ServiceError> {
        let device = self
            .registry
            .device(input.device_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("device {}", input.device_id)))?;
        if device.gateway_id != input.gateway_id {
            return Err(ServiceError::Validation(format!(
                "device {} is not attached to gateway {}",
                input.device_id, input.gateway_id
            )));
        }

        let approved = match input.recommendation_id {
            Some(id) => {
                let recommendation = self.recommendations.get(id).await?;
                if recommendation
                    .device_id
                    .is_some_and(|target| target != input.device_id)
                {
                    return Err(ServiceError::Validation(format!(
                        "recommendation {id} targets a different device"
                    )));
                }
                recommendation.is_approved()
            }
            None => false,
        };
        device.safety_profile.authorize(input.device_id, approved)?;

        let command = Command::create(input, Utc::now())?;
        if let Some(existing) = self.commands.find_by_key(&command.idempotency_key).await? {
            return Err(duplicate_key(&command.idempotency_key, existing.id));
        }
        self.commands.insert(&command).await?;

        info!(
            command_id = %command.id,
            idempotency_key = %command.idempotency_key,
            safety_profile = %device.safety_profile,
            "command queued"
        );
        Ok(command)
    }

    pub async fn get(&self, id: CommandId) -> Result<Command, ServiceError> {
        self.commands
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("command {id}")))
    }

    pub async fn proofs(&self, id: CommandId) -> Result<Vec<CommandProof>, ServiceError> {
        self.get(id).await?;
        Ok(self.commands.proofs_for(id).await?)
    }

    /// Hand a `queued` command to its gateway and mark it `sent`.
    ///
    /// If the transport fails the command stays `queued`.
    #[instrument(skip(self), err)]
    pub async fn dispatch(&self, id: CommandId) -> Result<Command, ServiceError> {
        let mut command = self.get(id).await?;
        if command.status != CommandStatus::Queued {
            return Err(ServiceError::InvalidTransition(format!(
                "{} -> {}",
                command.status,
                CommandStatus::Sent
            )));
        }

        if let Err(err) = self.transport.send(&command).await {
            warn!(command_id = %id, error = %err, "gateway transport refused command");
            return Err(err.into());
        }

        let expected = ExpectedVersion::Exact(command.version);
        command.mark_sent(Utc::now());
        match self.commands.update(&command, expected).await {
            Ok(stored) => {
                info!(
                    command_id = %id,
                    gateway_id = %stored.gateway_id,
                    attempt = stored.dispatch_attempts,
                    "command sent"
                );
                Ok(stored)
            }
            // The gateway answered before the send was recorded.
            Err(StoreError::Conflict(_)) => self.get(id).await,
            Err(err) => Err(err.into()),
        }
    }

    /// Record the gateway's acknowledgement. Never moves a command backwards.
    #[instrument(skip(self), err)]
    pub async fn mark_acked(&self, id: CommandId) -> Result<Command, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut command = self.get(id).await?;
            let expected = ExpectedVersion::Exact(command.version);
            if !command.mark_acked(Utc::now()) {
                debug!(command_id = %id, status = %command.status, "ack ignored");
                return Ok(command);
            }
            match self.commands.update(&command, expected).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict(_)) if attempt < 3 => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Record the gateway's result, the proof of a successful command, and pay
    /// the reward.
    ///
    /// A second completion does not change the command. It returns the stored
    /// command and only retries a reward that has not been paid yet.
    #[instrument(skip(self, completion), fields(success = completion.success), err)]
    pub async fn complete(
        &self,
        id: CommandId,
        completion: Completion,
    ) -> Result<Command, ServiceError> {
        let mut command = self.get(id).await?;
        if command.status.is_terminal() {
            debug!(command_id = %id, status = %command.status, "completion replayed");
            self.reward_replay(&command).await?;
            return Ok(command);
        }

        let now = Utc::now();
        let expected = ExpectedVersion::Exact(command.version);
        command.complete(completion.success, completion.error, now);

        let proof = match (completion.success, completion.proof) {
            (true, Some(payload)) => Some(CommandProof::for_command(
                &command,
                ProofKind::StateChanged,
                payload,
                now,
            )?),
            _ => None,
        };

        let stored = match self.commands.complete(&command, expected, proof.as_ref()).await {
            Ok(stored) => stored,
            Err(StoreError::Conflict(msg)) => {
                let current = self.get(id).await?;
                if !current.status.is_terminal() {
                    return Err(ServiceError::Conflict(msg));
                }
                debug!(command_id = %id, "lost completion race; treating as replay");
                self.reward_replay(&current).await?;
                return Ok(current);
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            command_id = %id,
            status = %stored.status,
            proof = proof.is_some(),
            "command completed"
        );
        self.events
            .emit(ControlLoopEvent::CommandCompleted {
                command_id: id,
                status: stored.status,
                proof_recorded: proof.is_some(),
            })
            .await;

        if proof.is_some() {
            self.pay_reward(&stored).await?;
        }
        Ok(stored)
    }

    async fn reward_replay(&self, command: &Command) -> Result<(), ServiceError> {
        if command.status != CommandStatus::Success {
            return Ok(());
        }
        if self.commands.proofs_for(command.id).await?.is_empty() {
            return Ok(());
        }
        self.pay_reward(command).await.map(|_| ())
    }

    /// Credit the saving reward for a verified command, at most once.
    async fn pay_reward(
        &self,
        command: &Command,
    ) -> Result<Option<RewardLedgerEntry>, ServiceError> {
        let recommendation = match command.recommendation_id {
            Some(id) => Some(self.recommendations.get(id).await?),
            None => None,
        };
        let Some(user_id) = reward_owner(command, recommendation.as_ref()) else {
            debug!(command_id = %command.id, "no user to reward");
            return Ok(None);
        };

        let currency = recommendation
            .as_ref()
            .map(|r| r.expected_savings.currency)
            .unwrap_or(0.0);
        let amount = saving_reward_points(self.config.reward_base_points, currency);
        if amount <= 0 {
            debug!(command_id = %command.id, "reward rounds to zero points");
            return Ok(None);
        }

        let mut entry = NewRewardEntry::new(user_id, amount, RewardEventType::SavingAction)
            .referencing(RewardReference::new(ReferenceType::Command, command.id))
            .described(format!("verified {} command", command.action));
        if let Some(recommendation) = &recommendation {
            entry = entry.for_asset(recommendation.asset_id);
        }

        let credited = match self.rewards.credit(entry).await {
            Ok(credited) => credited,
            Err(ServiceError::Conflict(_)) => {
                debug!(command_id = %command.id, "reward already paid");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.streaks.update_streak(user_id, StreakType::DailySaving).await {
            // The credit stands; the next qualifying action picks the streak up again.
            error!(user_id = %user_id, error = %err, "streak update failed after reward");
        }
        Ok(Some(credited))
    }

    /// Approve a recommendation and send the resulting command to the device's
    /// gateway.
    ///
    /// The command's idempotency key is derived from the recommendation and
    /// action, so retrying this call returns the command created the first time.
    #[instrument(skip(self, params), err)]
    pub async fn approve_and_dispatch(
        &self,
        recommendation_id: RecommendationId,
        action: CommandAction,
        params: Map<String, JsonValue>,
        requested_by: Option<UserId>,
    ) -> Result<Command, ServiceError> {
        let mut recommendation = self.recommendations.get(recommendation_id).await?;
        if !recommendation.is_approved() {
            recommendation = self
                .recommendations
                .respond(recommendation_id, RecommendationAction::Approve)
                .await?;
        }
        let device_id = recommendation.device_id.ok_or_else(|| {
            ServiceError::Validation(format!(
                "recommendation {recommendation_id} has no target device"
            ))
        })?;
        let device = self
            .registry
            .device(device_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("device {device_id}")))?;

        let key = format!("recommendation:{recommendation_id}:{action}");
        let mut input = NewCommand::new(device.gateway_id, device_id, action)
            .for_recommendation(recommendation_id)
            .with_idempotency_key(key.clone());
        input.params = params;
        if let Some(user_id) = requested_by.or(recommendation.user_id) {
            input = input.requested_by(user_id);
        }

        let command = match self.create(input).await {
            Ok(command) => command,
            Err(ServiceError::Conflict(_)) => {
                let key = IdempotencyKey::parse(key)?;
                let existing = self
                    .commands
                    .find_by_key(&key)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("command with key {key}")))?;
                if existing.status != CommandStatus::Queued {
                    return Ok(existing);
                }
                existing
            }
            Err(err) => return Err(err),
        };

        self.dispatch(command.id).await
    }

    /// Re-send a timed-out command under its original idempotency key.
    #[instrument(skip(self), err)]
    pub async fn redispatch(&self, id: CommandId) -> Result<Command, ServiceError> {
        let mut command = self.get(id).await?;
        let expected = ExpectedVersion::Exact(command.version);
        command.requeue(self.config.max_redispatch)?;
        let requeued = self.commands.update(&command, expected).await?;
        info!(
            command_id = %id,
            redispatch = requeued.redispatches() + 1,
            "command requeued"
        );
        self.dispatch(id).await
    }

    /// Time out overdue commands, then re-dispatch the ones with attempts left
    /// whose backoff has elapsed.
    #[instrument(skip(self), err)]
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let mut report = SweepReport::default();
        let timeout = chrono::Duration::from_std(self.config.command_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        for mut command in self
            .commands
            .list_overdue(now - timeout, self.config.sweep_batch)
            .await?
        {
            let expected = ExpectedVersion::Exact(command.version);
            command.mark_timeout(now)?;
            match self.commands.update(&command, expected).await {
                Ok(_) => {
                    warn!(
                        command_id = %command.id,
                        attempts = command.dispatch_attempts,
                        "command timed out"
                    );
                    report.timed_out += 1;
                }
                // Completed or acked while we looked; the next sweep re-checks it.
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for command in self
            .commands
            .list_redispatchable(self.config.max_redispatch, self.config.sweep_batch)
            .await?
        {
            let backoff = self
                .config
                .redispatch_backoff
                .delay_for_attempt(command.redispatches() + 1);
            let due = command.finished_at.is_none_or(|finished| {
                chrono::Duration::from_std(backoff).is_ok_and(|wait| finished + wait <= now)
            });
            if !due {
                report.waiting += 1;
                continue;
            }
            match self.redispatch(command.id).await {
                Ok(_) => report.redispatched += 1,
                Err(ServiceError::Conflict(_) | ServiceError::InvalidTransition(_)) => {}
                Err(err) => {
                    warn!(command_id = %command.id, error = %err, "re-dispatch failed");
                    report.failed += 1;
                }
            }
        }

        // Requeued earlier but the gateway was unreachable at the time.
        for command in self
            .commands
            .list_by_status(CommandStatus::Queued, self.config.sweep_batch)
            .await?
            .into_iter()
            .filter(|c| c.dispatch_attempts > 0)
        {
            match self.dispatch(command.id).await {
                Ok(_) => report.redispatched += 1,
                Err(ServiceError::Conflict(_) | ServiceError::InvalidTransition(_)) => {}
                Err(err) => {
                    warn!(command_id = %command.id, error = %err, "re-dispatch failed");
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                timed_out = report.timed_out,
                redispatched = report.redispatched,
                waiting = report.waiting,
                failed = report.failed,
                "timeout sweep finished"
            );
        }
        Ok(report)
    }
}

fn duplicate_key(key: &IdempotencyKey, existing: CommandId) -> ServiceError {
    ServiceError::Conflict(format!(
        "idempotency key {key} already used by command {existing}"
    ))
}

fn reward_owner(command: &Command, recommendation: Option<&Recommendation>) -> Option<UserId> {
    command
        .requested_by
        .or_else(|| recommendation.and_then(|r| r.user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wattloop_core::{AssetId, DeviceId, GatewayId};
    use wattloop_energy::{ExpectedSavings, NewRecommendation, RecommendationReason, SafetyProfile};

    use crate::events::InMemoryEventSink;
    use crate::ingestion::{DeviceRecord, InMemoryDeviceRegistry};
    use crate::store::{
        InMemoryCommandStore, InMemoryRecommendationStore, InMemoryRewardLedgerStore,
        InMemoryStreakStore,
    };
    use crate::store::PageRequest;
    use crate::telemetry_store::InMemoryTelemetryStore;
    use crate::transport::InMemoryTransport;

    struct Fixture {
        registry: Arc<InMemoryDeviceRegistry>,
        transport: Arc<InMemoryTransport>,
        recommendations: Arc<RecommendationService>,
        rewards: Arc<RewardService>,
        dispatcher: Arc<CommandDispatcher>,
    }

    fn fixture(config: DispatcherConfig) -> Fixture {
        let events = Arc::new(InMemoryEventSink::new());
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        let transport = Arc::new(InMemoryTransport::new());
        let recommendations = Arc::new(RecommendationService::new(
            Arc::new(InMemoryRecommendationStore::new()),
            Arc::new(InMemoryTelemetryStore::new()),
            events.clone(),
        ));
        let rewards = Arc::new(RewardService::new(
            Arc::new(InMemoryRewardLedgerStore::new()),
            events.clone(),
        ));
        let streaks = Arc::new(StreakService::new(
            Arc::new(InMemoryStreakStore::new()),
            events.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(InMemoryCommandStore::new()),
            recommendations.clone(),
            registry.clone(),
            transport.clone(),
            rewards.clone(),
            streaks,
            events,
            config,
        ));
        Fixture {
            registry,
            transport,
            recommendations,
            rewards,
            dispatcher,
        }
    }

    fn device(f: &Fixture, safety_profile: SafetyProfile) -> DeviceRecord {
        let record = DeviceRecord {
            id: DeviceId::new(),
            gateway_id: GatewayId::new(),
            safety_profile,
        };
        f.registry.add_device(record);
        record
    }

    fn new_command(device: &DeviceRecord) -> NewCommand {
        NewCommand::new(device.gateway_id, device.id, CommandAction::TurnOff)
    }

    #[tokio::test]
    async fn safety_profiles_gate_creation() {
        let f = fixture(DispatcherConfig::default());

        let critical = device(&f, SafetyProfile::Critical);
        assert!(matches!(
            f.dispatcher.create(new_command(&critical)).await,
            Err(ServiceError::SafetyViolation(_))
        ));

        let high = device(&f, SafetyProfile::High);
        assert!(matches!(
            f.dispatcher.create(new_command(&high)).await,
            Err(ServiceError::ApprovalRequired(_))
        ));

        let rec = f
            .recommendations
            .create(NewRecommendation::new(AssetId::new(), RecommendationReason::PriceHigh).for_device(high.id))
            .await
            .unwrap();
        f.recommendations
            .respond(rec.id, RecommendationAction::Approve)
            .await
            .unwrap();
        let approved = f
            .dispatcher
            .create(new_command(&high).for_recommendation(rec.id))
            .await
            .unwrap();
        assert_eq!(approved.status, CommandStatus::Queued);

        let unknown = DeviceRecord {
            id: DeviceId::new(),
            gateway_id: GatewayId::new(),
            safety_profile: SafetyProfile::Normal,
        };
        assert!(matches!(
            f.dispatcher.create(new_command(&unknown)).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_caller_key_names_the_existing_command() {
        let f = fixture(DispatcherConfig::default());
        let d = device(&f, SafetyProfile::Normal);

        let first = f
            .dispatcher
            .create(new_command(&d).with_idempotency_key("client-req-1"))
            .await
            .unwrap();
        let err = f
            .dispatcher
            .create(new_command(&d).with_idempotency_key("client-req-1"))
            .await
            .unwrap_err();
        match err {
            ServiceError::Conflict(msg) => assert!(msg.contains(&first.id.to_string())),
            other => panic!("unexpected error: {other:?}"),
        }

        let derived_a = f.dispatcher.create(new_command(&d)).await.unwrap();
        let derived_b = f.dispatcher.create(new_command(&d)).await.unwrap();
        assert_ne!(derived_a.idempotency_key, derived_b.idempotency_key);
    }

    #[tokio::test]
    async fn transport_failure_leaves_the_command_queued() {
        let f = fixture(DispatcherConfig::default());
        let d = device(&f, SafetyProfile::Normal);
        let command = f.dispatcher.create(new_command(&d)).await.unwrap();

        f.transport.set_available(false);
        assert!(matches!(
            f.dispatcher.dispatch(command.id).await,
            Err(ServiceError::Unavailable(_))
        ));
        assert_eq!(f.dispatcher.get(command.id).await.unwrap().status, CommandStatus::Queued);

        f.transport.set_available(true);
        let sent = f.dispatcher.dispatch(command.id).await.unwrap();
        assert_eq!(sent.status, CommandStatus::Sent);
        assert_eq!(sent.dispatch_attempts, 1);
        assert_eq!(f.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn acks_never_regress_and_completion_happens_once() {
        let f = fixture(DispatcherConfig::default());
        let d = device(&f, SafetyProfile::Normal);
        let user = UserId::new();
        let command = f
            .dispatcher
            .create(new_command(&d).requested_by(user))
            .await
            .unwrap();
        f.dispatcher.dispatch(command.id).await.unwrap();

        let acked = f.dispatcher.mark_acked(command.id).await.unwrap();
        assert_eq!(acked.status, CommandStatus::Acked);
        let again = f.dispatcher.mark_acked(command.id).await.unwrap();
        assert_eq!(again.version, acked.version);

        let done = f
            .dispatcher
            .complete(command.id, Completion::succeeded(json!({"power_before": 900, "power_after": 0})))
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Success);

        let replay = f
            .dispatcher
            .complete(command.id, Completion::failed("late duplicate"))
            .await
            .unwrap();
        assert_eq!(replay.status, CommandStatus::Success);
        assert_eq!(replay.version, done.version);

        assert_eq!(f.dispatcher.proofs(command.id).await.unwrap().len(), 1);
        let balance = f.rewards.balance(user).await.unwrap();
        assert_eq!(balance.total, 10);
    }

    #[tokio::test]
    async fn failed_completion_pays_nothing() {
        let f = fixture(DispatcherConfig::default());
        let d = device(&f, SafetyProfile::Normal);
        let user = UserId::new();
        let command = f
            .dispatcher
            .create(new_command(&d).requested_by(user))
            .await
            .unwrap();
        f.dispatcher.dispatch(command.id).await.unwrap();

        let failed = f
            .dispatcher
            .complete(command.id, Completion::failed("relay stuck"))
            .await
            .unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("relay stuck"));
        assert!(f.dispatcher.proofs(command.id).await.unwrap().is_empty());
        assert_eq!(f.rewards.balance(user).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn zero_point_reward_is_skipped_without_failing_completion() {
        let f = fixture(DispatcherConfig {
            reward_base_points: 0,
            ..DispatcherConfig::default()
        });
        let d = device(&f, SafetyProfile::Normal);
        let user = UserId::new();
        let command = f
            .dispatcher
            .create(new_command(&d).requested_by(user))
            .await
            .unwrap();
        f.dispatcher.dispatch(command.id).await.unwrap();

        let proof = Completion::succeeded(json!({"power_after": 0}));
        let done = f.dispatcher.complete(command.id, proof.clone()).await.unwrap();
        assert_eq!(done.status, CommandStatus::Success);
        let replay = f.dispatcher.complete(command.id, proof).await.unwrap();
        assert_eq!(replay.version, done.version);

        assert_eq!(f.dispatcher.proofs(command.id).await.unwrap().len(), 1);
        assert_eq!(f.rewards.balance(user).await.unwrap().total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_settle_exactly_once() {
        let f = fixture(DispatcherConfig::default());
        let d = device(&f, SafetyProfile::Normal);
        let user = UserId::new();
        let command = f
            .dispatcher
            .create(new_command(&d).requested_by(user))
            .await
            .unwrap();
        f.dispatcher.dispatch(command.id).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let dispatcher = Arc::clone(&f.dispatcher);
                let completion = if i % 2 == 0 {
                    Completion::succeeded(json!({"attempt": i}))
                } else {
                    Completion::failed(format!("attempt {i}"))
                };
                tokio::spawn(async move { dispatcher.complete(command.id, completion).await })
            })
            .collect();

        let mut statuses = Vec::new();
        for task in tasks {
            let settled = task.await.unwrap().unwrap();
            statuses.push(settled.status);
        }
        let stored = f.dispatcher.get(command.id).await.unwrap();
        assert!(stored.status.is_terminal());
        assert!(statuses.iter().all(|s| *s == stored.status));

        let proofs = f.dispatcher.proofs(command.id).await.unwrap();
        let ledger = f.rewards.ledger(user, PageRequest::default()).await.unwrap();
        match stored.status {
            CommandStatus::Success => {
                assert_eq!(proofs.len(), 1);
                assert_eq!(ledger.total, 1);
                assert_eq!(f.rewards.balance(user).await.unwrap().total, 10);
            }
            _ => {
                assert!(proofs.is_empty());
                assert_eq!(ledger.total, 0);
            }
        }
    }

    #[tokio::test]
    async fn approve_and_dispatch_is_retry_safe() {
        let f = fixture(DispatcherConfig::default());
        let d = device(&f, SafetyProfile::High);
        let rec = f
            .recommendations
            .create(
                NewRecommendation::new(AssetId::new(), RecommendationReason::PriceHigh)
                    .for_device(d.id)
                    .for_user(UserId::new())
                    .with_savings(ExpectedSavings::new(4.2, 1.4).unwrap()),
            )
            .await
            .unwrap();

        let first = f
            .dispatcher
            .approve_and_dispatch(rec.id, CommandAction::EcoMode, Map::new(), None)
            .await
            .unwrap();
        assert_eq!(first.status, CommandStatus::Sent);
        assert_eq!(first.requested_by, rec.user_id);

        let retried = f
            .dispatcher
            .approve_and_dispatch(rec.id, CommandAction::EcoMode, Map::new(), None)
            .await
            .unwrap();
        assert_eq!(retried.id, first.id);
        assert_eq!(f.transport.sent().len(), 1);

        f.dispatcher
            .complete(first.id, Completion::succeeded(json!({"state": "eco"})))
            .await
            .unwrap();
        let owner = rec.user_id.unwrap();
        assert_eq!(f.rewards.balance(owner).await.unwrap().total, 10 + 8);
    }

    #[tokio::test]
    async fn sweep_times_out_and_redispatches_with_the_same_key() {
        let config = DispatcherConfig {
            command_timeout: Duration::from_secs(300),
            max_redispatch: 1,
            redispatch_backoff: RetryPolicy::fixed(u32::MAX, Duration::from_secs(30)),
            ..DispatcherConfig::default()
        };
        let f = fixture(config);
        let d = device(&f, SafetyProfile::Normal);
        let command = f.dispatcher.create(new_command(&d)).await.unwrap();
        f.dispatcher.dispatch(command.id).await.unwrap();

        let now = Utc::now();
        let early = f.dispatcher.sweep_timeouts(now).await.unwrap();
        assert_eq!(early, SweepReport::default());

        let later = now + chrono::Duration::seconds(301);
        let report = f.dispatcher.sweep_timeouts(later).await.unwrap();
        assert_eq!((report.timed_out, report.waiting), (1, 1));
        assert_eq!(f.dispatcher.get(command.id).await.unwrap().status, CommandStatus::Timeout);

        let after_backoff = later + chrono::Duration::seconds(31);
        let report = f.dispatcher.sweep_timeouts(after_backoff).await.unwrap();
        assert_eq!(report.redispatched, 1);

        let resent = f.dispatcher.get(command.id).await.unwrap();
        assert_eq!(resent.status, CommandStatus::Sent);
        assert_eq!(resent.idempotency_key, command.idempotency_key);
        assert_eq!(resent.dispatch_attempts, 2);

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].idempotency_key, sent[1].idempotency_key);

        // Budget spent: the next timeout is final.
        let final_sweep = f
            .dispatcher
            .sweep_timeouts(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(final_sweep.timed_out, 1);
        assert_eq!(final_sweep.redispatched, 0);
        assert!(matches!(
            f.dispatcher.redispatch(command.id).await,
            Err(ServiceError::Validation(_))
        ));
    }
}
