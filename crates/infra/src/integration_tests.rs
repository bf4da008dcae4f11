//! Cross-component scenarios over the in-memory implementations.
//!
//! Broker → Listener → Buffer → TelemetryStore, and
//! Recommendation → Command → Proof → Reward → Streak.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Map};

use wattloop_core::{AssetId, CommandId, DeviceId, GatewayId, UserId};
use wattloop_energy::{
    CommandAction, CommandStatus, ExpectedSavings, NewCommand, NewRecommendation,
    NewRewardEntry, RecommendationAction, RecommendationReason, ReferenceType, RewardEventType,
    RewardReference, SafetyProfile, StreakType,
};
use wattloop_telemetry::TelemetryQuery;

use crate::buffer::{BufferConfig, TelemetryBuffer};
use crate::events::InMemoryEventSink;
use crate::ingestion::{DeviceRecord, InMemoryBroker, InMemoryDeviceRegistry, IngestionListener};
use crate::retry::RetryPolicy;
use crate::services::{
    CommandDispatcher, Completion, DispatcherConfig, RecommendationService, RewardService,
    ServiceError, StreakService,
};
use crate::store::{
    InMemoryCommandStore, InMemoryRecommendationStore, InMemoryRewardLedgerStore,
    InMemoryStreakStore, PageRequest, RewardLedgerStore,
};
use crate::telemetry_store::{InMemoryTelemetryStore, TelemetryStore};
use crate::transport::InMemoryTransport;

struct ControlLoop {
    telemetry: Arc<InMemoryTelemetryStore>,
    registry: Arc<InMemoryDeviceRegistry>,
    ledger: Arc<InMemoryRewardLedgerStore>,
    events: Arc<InMemoryEventSink>,
    recommendations: Arc<RecommendationService>,
    rewards: Arc<RewardService>,
    streaks: Arc<StreakService>,
    dispatcher: Arc<CommandDispatcher>,
}

impl ControlLoop {
    fn new() -> Self {
        let telemetry = Arc::new(InMemoryTelemetryStore::new());
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        let ledger = Arc::new(InMemoryRewardLedgerStore::new());
        let events = Arc::new(InMemoryEventSink::new());

        let recommendations = Arc::new(RecommendationService::new(
            Arc::new(InMemoryRecommendationStore::new()),
            telemetry.clone(),
            events.clone(),
        ));
        let rewards = Arc::new(RewardService::new(ledger.clone(), events.clone()));
        let streaks = Arc::new(StreakService::new(
            Arc::new(InMemoryStreakStore::new()),
            events.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(InMemoryCommandStore::new()),
            recommendations.clone(),
            registry.clone(),
            Arc::new(InMemoryTransport::new()),
            rewards.clone(),
            streaks.clone(),
            events.clone(),
            DispatcherConfig::default(),
        ));

        Self {
            telemetry,
            registry,
            ledger,
            events,
            recommendations,
            rewards,
            streaks,
            dispatcher,
        }
    }

    fn device(&self, safety_profile: SafetyProfile) -> DeviceRecord {
        let record = DeviceRecord {
            id: DeviceId::new(),
            gateway_id: GatewayId::new(),
            safety_profile,
        };
        self.registry.add_device(record);
        record
    }
}

#[tokio::test(start_paused = true)]
async fn published_reading_is_queryable_after_flush() {
    let cl = ControlLoop::new();
    let d1 = cl.device(SafetyProfile::Normal);
    let broker = Arc::new(InMemoryBroker::new());
    let buffer = Arc::new(TelemetryBuffer::new(cl.telemetry.clone(), BufferConfig::default()));
    let listener = Arc::new(IngestionListener::new(
        broker.clone(),
        cl.registry.clone(),
        cl.registry.clone(),
        buffer.clone(),
        RetryPolicy::fixed(u32::MAX, Duration::from_secs(5)),
    ));
    let handle = listener.start();
    broker.wait_for_connections(1).await;

    let t = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
    let payload = json!({
        "timestamp": t,
        "readings": [{ "metric_name": "power", "value": 120.5, "unit": "W" }]
    });
    broker.send(&format!("devices/{}/telemetry", d1.id), payload.to_string());

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert!(buffer.is_empty());

    let query = TelemetryQuery::new(
        d1.id,
        t - chrono::Duration::seconds(1),
        t + chrono::Duration::seconds(1),
    )
    .with_metric("power");
    let readings = cl.telemetry.query(&query).await.unwrap();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].value, 120.5);
    assert_eq!(readings[0].unit, "W");

    handle.shutdown().await;
    assert_eq!(listener.stats().readings, 1);
}

#[tokio::test(start_paused = true)]
async fn readings_survive_a_store_outage() {
    let cl = ControlLoop::new();
    let device = cl.device(SafetyProfile::Normal);
    let broker = Arc::new(InMemoryBroker::new());
    let buffer = Arc::new(TelemetryBuffer::new(
        cl.telemetry.clone(),
        BufferConfig {
            max_size: 10,
            flush_interval: Duration::from_secs(5),
        },
    ));
    let listener = Arc::new(IngestionListener::new(
        broker.clone(),
        cl.registry.clone(),
        cl.registry.clone(),
        buffer.clone(),
        RetryPolicy::fixed(u32::MAX, Duration::from_secs(5)),
    ));
    let handle = listener.start();
    broker.wait_for_connections(1).await;

    cl.telemetry.set_available(false);
    let topic = format!("devices/{}/telemetry", device.id);
    for i in 0..4 {
        let payload = json!({ "readings": [{ "metric_name": "power", "value": i as f64 }] });
        broker.send(&topic, payload.to_string());
    }
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(buffer.len(), 4);
    assert!(buffer.stats().failed_flushes >= 1);

    cl.telemetry.set_available(true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(buffer.is_empty());
    assert_eq!(cl.telemetry.len(), 4);

    handle.shutdown().await;
}

#[tokio::test]
async fn approved_recommendation_pays_exactly_one_reward() {
    let cl = ControlLoop::new();
    let device = cl.device(SafetyProfile::High);
    let user = UserId::new();

    let r1 = cl
        .recommendations
        .create(
            NewRecommendation::new(AssetId::new(), RecommendationReason::PriceHigh)
                .for_device(device.id)
                .for_user(user)
                .with_savings(ExpectedSavings::new(2.5, 0.8).unwrap()),
        )
        .await
        .unwrap();
    cl.recommendations.mark_notified(r1.id).await.unwrap();

    let c1 = cl
        .dispatcher
        .approve_and_dispatch(r1.id, CommandAction::TurnOff, Map::new(), None)
        .await
        .unwrap();
    assert_eq!(c1.status, CommandStatus::Sent);
    assert_eq!(c1.recommendation_id, Some(r1.id));
    assert!(!c1.idempotency_key.as_str().is_empty());

    cl.dispatcher.mark_acked(c1.id).await.unwrap();
    let proof = json!({ "before": { "power_w": 820.0 }, "after": { "power_w": 3.0 } });
    let done = cl
        .dispatcher
        .complete(c1.id, Completion::succeeded(proof.clone()))
        .await
        .unwrap();
    assert_eq!(done.status, CommandStatus::Success);

    // Gateway retries its callback.
    cl.dispatcher
        .complete(c1.id, Completion::succeeded(proof))
        .await
        .unwrap();

    assert_eq!(cl.dispatcher.proofs(c1.id).await.unwrap().len(), 1);

    let reference = RewardReference::new(ReferenceType::Command, c1.id);
    let entry = cl
        .ledger
        .find_by_reference(RewardEventType::SavingAction, reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.amount, 10 + 5);
    assert_eq!(entry.user_id, user);

    let ledger = cl.rewards.ledger(user, PageRequest::default()).await.unwrap();
    assert_eq!(ledger.total, 1);
    assert_eq!(cl.rewards.balance(user).await.unwrap().total, 15);

    let streaks = cl.streaks.list(user).await.unwrap();
    assert_eq!(streaks.len(), 1);
    assert_eq!(streaks[0].streak_type, StreakType::DailySaving);
    assert_eq!(streaks[0].current_count, 1);

    assert_eq!(cl.events.count("command_completed"), 1);
    assert_eq!(cl.events.count("reward_credited"), 1);
    assert_eq!(cl.events.count("streak_updated"), 1);
}

#[tokio::test]
async fn critical_devices_are_never_commanded() {
    let cl = ControlLoop::new();
    let device = cl.device(SafetyProfile::Critical);

    let rec = cl
        .recommendations
        .create(
            NewRecommendation::new(AssetId::new(), RecommendationReason::PriceHigh)
                .for_device(device.id),
        )
        .await
        .unwrap();
    cl.recommendations
        .respond(rec.id, RecommendationAction::Approve)
        .await
        .unwrap();

    let direct = cl
        .dispatcher
        .create(
            NewCommand::new(device.gateway_id, device.id, CommandAction::TurnOff)
                .for_recommendation(rec.id),
        )
        .await;
    assert!(matches!(direct, Err(ServiceError::SafetyViolation(_))));

    let via_approval = cl
        .dispatcher
        .approve_and_dispatch(rec.id, CommandAction::TurnOff, Map::new(), None)
        .await;
    assert!(matches!(via_approval, Err(ServiceError::SafetyViolation(_))));
}

#[tokio::test]
async fn same_reward_reference_credits_once() {
    let cl = ControlLoop::new();
    let user = UserId::new();
    let reference = RewardReference::new(ReferenceType::Command, CommandId::new());
    let credit = || {
        NewRewardEntry::new(user, 40, RewardEventType::SavingAction).referencing(reference)
    };

    let (a, b) = tokio::join!(cl.rewards.credit(credit()), cl.rewards.credit(credit()));
    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(
        a.err().or(b.err()),
        Some(ServiceError::Conflict(_))
    ));
    assert_eq!(cl.rewards.balance(user).await.unwrap().total, 40);

    // A different event type for the same source is a separate payout.
    cl.rewards
        .credit(NewRewardEntry::new(user, 5, RewardEventType::StreakBonus).referencing(reference))
        .await
        .unwrap();
    assert_eq!(cl.rewards.balance(user).await.unwrap().total, 45);
}

#[tokio::test]
async fn reused_idempotency_key_is_rejected() {
    let cl = ControlLoop::new();
    let device = cl.device(SafetyProfile::Normal);
    let input = || {
        NewCommand::new(device.gateway_id, device.id, CommandAction::EcoMode)
            .with_idempotency_key("checkout-42")
    };

    let first = cl.dispatcher.create(input()).await.unwrap();
    assert!(matches!(
        cl.dispatcher.create(input()).await,
        Err(ServiceError::Conflict(_))
    ));
    assert_eq!(cl.dispatcher.get(first.id).await.unwrap().status, CommandStatus::Queued);
}

#[tokio::test]
async fn streak_continues_at_10h_and_resets_at_50h() {
    let cl = ControlLoop::new();
    let user = UserId::new();
    let t0 = Utc::now();

    let a = cl
        .streaks
        .update_streak_at(user, StreakType::WeeklySaving, t0)
        .await
        .unwrap();
    let b = cl
        .streaks
        .update_streak_at(user, StreakType::WeeklySaving, t0 + chrono::Duration::hours(10))
        .await
        .unwrap();
    let c = cl
        .streaks
        .update_streak_at(user, StreakType::WeeklySaving, t0 + chrono::Duration::hours(60))
        .await
        .unwrap();

    assert_eq!((a.current_count, a.longest_count), (1, 1));
    assert_eq!((b.current_count, b.longest_count), (2, 2));
    assert_eq!((c.current_count, c.longest_count), (1, 2));
}
