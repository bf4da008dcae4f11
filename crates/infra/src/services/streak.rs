//! Streak tracker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use wattloop_core::{ExpectedVersion, UserId};
use wattloop_energy::{Streak, StreakChange, StreakType};

use super::ServiceError;
use crate::events::{ControlLoopEvent, EventSink};
use crate::store::{StoreError, StreakStore};

/// Lost compare-and-swap races retried before giving up.
const MAX_UPDATE_ATTEMPTS: u32 = 3;

pub struct StreakService {
    store: Arc<dyn StreakStore>,
    events: Arc<dyn EventSink>,
}

impl StreakService {
    pub fn new(store: Arc<dyn StreakStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    pub async fn update_streak(
        &self,
        user_id: UserId,
        streak_type: StreakType,
    ) -> Result<Streak, ServiceError> {
        self.update_streak_at(user_id, streak_type, Utc::now()).await
    }

    /// Record a qualifying activity at `now`.
    ///
    /// `now` is the activity time even if it is older than the stored
    /// `last_date`; late events are not reordered.
    #[instrument(skip(self), err)]
    pub async fn update_streak_at(
        &self,
        user_id: UserId,
        streak_type: StreakType,
        now: DateTime<Utc>,
    ) -> Result<Streak, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_update(user_id, streak_type, now).await {
                Ok((streak, change)) => {
                    info!(
                        current = streak.current_count,
                        longest = streak.longest_count,
                        ?change,
                        "streak updated"
                    );
                    self.events
                        .emit(ControlLoopEvent::StreakUpdated {
                            user_id,
                            streak_type,
                            change,
                            current_count: streak.current_count,
                            longest_count: streak.longest_count,
                        })
                        .await;
                    return Ok(streak);
                }
                Err(StoreError::Conflict(msg)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(attempt, reason = %msg, "streak update raced; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn try_update(
        &self,
        user_id: UserId,
        streak_type: StreakType,
        now: DateTime<Utc>,
    ) -> Result<(Streak, StreakChange), StoreError> {
        match self.store.get(user_id, streak_type).await? {
            None => {
                let streak = Streak::start(user_id, streak_type, now);
                self.store.insert(&streak).await?;
                Ok((streak, StreakChange::Started))
            }
            Some(mut streak) => {
                let expected = ExpectedVersion::Exact(streak.version);
                let change = streak.record_activity(now);
                let stored = self.store.update(&streak, expected).await?;
                Ok((stored, change))
            }
        }
    }

    pub async fn list(&self, user_id: UserId) -> Result<Vec<Streak>, ServiceError> {
        Ok(self.store.list_for_user(user_id).await?)
    }
}
