//! Reward ledger service.
//!
//! The ledger is append-only and balances are computed on read. Double credits
//! are prevented by the store's uniqueness rule on `(event_type, reference)`,
//! so a retried credit for the same source event comes back as a conflict.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use wattloop_core::UserId;
use wattloop_energy::{NewRewardEntry, RewardBalance, RewardLedgerEntry};

use super::ServiceError;
use crate::events::{ControlLoopEvent, EventSink};
use crate::store::{Page, PageRequest, RewardLedgerStore};

/// Points per unit of expected currency saving on a verified saving command.
pub const SAVING_REWARD_MULTIPLIER: f64 = 2.0;

/// `base + floor(currency × multiplier)`, never negative.
pub fn saving_reward_points(base_points: i64, expected_currency: f64) -> i64 {
    let bonus = if expected_currency.is_finite() && expected_currency > 0.0 {
        (expected_currency * SAVING_REWARD_MULTIPLIER).floor() as i64
    } else {
        0
    };
    base_points.max(0).saturating_add(bonus)
}

pub struct RewardService {
    ledger: Arc<dyn RewardLedgerStore>,
    events: Arc<dyn EventSink>,
}

impl RewardService {
    pub fn new(ledger: Arc<dyn RewardLedgerStore>, events: Arc<dyn EventSink>) -> Self {
        Self { ledger, events }
    }

    /// Append a credit (or a debit, for debit event types).
    #[instrument(skip(self, input), fields(user_id = %input.user_id, event_type = %input.event_type, amount = input.amount), err)]
    pub async fn credit(&self, input: NewRewardEntry) -> Result<RewardLedgerEntry, ServiceError> {
        let entry = RewardLedgerEntry::create(input, Utc::now())?;
        self.ledger.append(&entry).await?;

        info!(entry_id = %entry.id, "reward entry appended");
        self.events
            .emit(ControlLoopEvent::RewardCredited {
                entry_id: entry.id,
                user_id: entry.user_id,
                event_type: entry.event_type,
                amount: entry.amount,
            })
            .await;
        Ok(entry)
    }

    pub async fn balance(&self, user_id: UserId) -> Result<RewardBalance, ServiceError> {
        Ok(self.ledger.balance(user_id, Utc::now()).await?)
    }

    /// Newest first.
    pub async fn ledger(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<RewardLedgerEntry>, ServiceError> {
        Ok(self.ledger.page(user_id, page).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wattloop_core::CommandId;
    use wattloop_energy::{ReferenceType, RewardEventType, RewardReference};

    use crate::events::InMemoryEventSink;
    use crate::store::InMemoryRewardLedgerStore;

    fn service() -> (RewardService, Arc<InMemoryEventSink>) {
        let events = Arc::new(InMemoryEventSink::new());
        (
            RewardService::new(Arc::new(InMemoryRewardLedgerStore::new()), events.clone()),
            events,
        )
    }

    #[test]
    fn saving_points_floor_the_bonus() {
        assert_eq!(saving_reward_points(10, 0.0), 10);
        assert_eq!(saving_reward_points(10, 3.74), 17);
        assert_eq!(saving_reward_points(10, -5.0), 10);
        assert_eq!(saving_reward_points(10, f64::NAN), 10);
    }

    #[tokio::test]
    async fn same_reference_is_credited_once() {
        let (rewards, events) = service();
        let user = UserId::new();
        let reference = RewardReference::new(ReferenceType::Command, CommandId::new());
        let entry = || {
            NewRewardEntry::new(user, 25, RewardEventType::SavingAction).referencing(reference)
        };

        rewards.credit(entry()).await.unwrap();
        let second = rewards.credit(entry()).await;
        assert!(matches!(second, Err(ServiceError::Conflict(_))));

        assert_eq!(rewards.balance(user).await.unwrap().total, 25);
        assert_eq!(events.count("reward_credited"), 1);
    }

    #[tokio::test]
    async fn expired_credits_and_debits_shape_the_balance() {
        let (rewards, _) = service();
        let user = UserId::new();

        rewards
            .credit(NewRewardEntry::new(user, 100, RewardEventType::DailyLogin))
            .await
            .unwrap();
        rewards
            .credit(
                NewRewardEntry::new(user, 40, RewardEventType::StreakBonus)
                    .expires_at(Utc::now() + Duration::milliseconds(20)),
            )
            .await
            .unwrap();
        rewards
            .credit(NewRewardEntry::new(user, -30, RewardEventType::Redemption))
            .await
            .unwrap();

        assert!(matches!(
            rewards
                .credit(NewRewardEntry::new(user, -5, RewardEventType::SavingAction))
                .await,
            Err(ServiceError::Validation(_))
        ));

        assert_eq!(rewards.balance(user).await.unwrap().total, 110);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let balance = rewards.balance(user).await.unwrap();
        assert_eq!(balance.total, 70);
        assert_eq!(balance.expired, 40);

        let page = rewards.ledger(user, PageRequest::new(1, 2)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].event_type, RewardEventType::Redemption);
    }
}
