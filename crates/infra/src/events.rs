//! Control-loop events handed to external consumers (notifications, analytics).
//!
//! Emission is fire-and-forget: a sink failure is the sink's problem and never
//! rolls back the state change that produced the event.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use wattloop_core::{AssetId, CommandId, RecommendationId, RewardEntryId, UserId};
use wattloop_energy::{
    CommandStatus, RecommendationReason, RewardEventType, StreakChange, StreakType,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlLoopEvent {
    RecommendationCreated {
        recommendation_id: RecommendationId,
        asset_id: AssetId,
        user_id: Option<UserId>,
        reason: RecommendationReason,
    },
    CommandCompleted {
        command_id: CommandId,
        status: CommandStatus,
        proof_recorded: bool,
    },
    RewardCredited {
        entry_id: RewardEntryId,
        user_id: UserId,
        event_type: RewardEventType,
        amount: i64,
    },
    StreakUpdated {
        user_id: UserId,
        streak_type: StreakType,
        change: StreakChange,
        current_count: u32,
        longest_count: u32,
    },
}

impl ControlLoopEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ControlLoopEvent::RecommendationCreated { .. } => "recommendation_created",
            ControlLoopEvent::CommandCompleted { .. } => "command_completed",
            ControlLoopEvent::RewardCredited { .. } => "reward_credited",
            ControlLoopEvent::StreakUpdated { .. } => "streak_updated",
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ControlLoopEvent);
}

/// Writes events to the log. Default sink when nothing else is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: ControlLoopEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(event = event.name(), %payload, "control loop event");
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<ControlLoopEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ControlLoopEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: ControlLoopEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
