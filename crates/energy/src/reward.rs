//! Append-only reward ledger entries and balance folding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wattloop_core::{AssetId, DomainError, DomainResult, RewardEntryId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardEventType {
    SavingAction,
    DailyLogin,
    MaintenanceJob,
    StreakBonus,
    Referral,
    ManualAdjustment,
    Redemption,
}

impl_str_enum!(RewardEventType, "reward event type" {
    SavingAction => "saving_action",
    DailyLogin => "daily_login",
    MaintenanceJob => "maintenance_job",
    StreakBonus => "streak_bonus",
    Referral => "referral",
    ManualAdjustment => "manual_adjustment",
    Redemption => "redemption",
});

impl RewardEventType {
    /// Event types that may carry a negative amount.
    pub fn allows_debit(self) -> bool {
        matches!(
            self,
            RewardEventType::Redemption | RewardEventType::ManualAdjustment
        )
    }

    /// Event types that may carry a positive amount.
    pub fn allows_credit(self) -> bool {
        self != RewardEventType::Redemption
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Command,
    Job,
    Streak,
}

impl_str_enum!(ReferenceType, "reference type" {
    Command => "command",
    Job => "job",
    Streak => "streak",
});

/// Source event an entry pays out for. `(event_type, reference)` is unique in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RewardReference {
    #[serde(rename = "type")]
    pub kind: ReferenceType,
    pub id: Uuid,
}

impl RewardReference {
    pub fn new(kind: ReferenceType, id: impl Into<Uuid>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl core::fmt::Display for RewardReference {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Input for a ledger write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRewardEntry {
    pub user_id: UserId,
    pub amount: i64,
    pub event_type: RewardEventType,
    #[serde(default)]
    pub asset_id: Option<AssetId>,
    #[serde(default)]
    pub reference: Option<RewardReference>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewRewardEntry {
    pub fn new(user_id: UserId, amount: i64, event_type: RewardEventType) -> Self {
        Self {
            user_id,
            amount,
            event_type,
            asset_id: None,
            reference: None,
            expires_at: None,
            description: None,
        }
    }

    pub fn for_asset(mut self, asset_id: AssetId) -> Self {
        self.asset_id = Some(asset_id);
        self
    }

    pub fn referencing(mut self, reference: RewardReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardLedgerEntry {
    pub id: RewardEntryId,
    pub user_id: UserId,
    pub asset_id: Option<AssetId>,
    pub event_type: RewardEventType,
    /// Signed points: credits positive, debits negative.
    pub amount: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub reference: Option<RewardReference>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RewardLedgerEntry {
    pub fn create(input: NewRewardEntry, now: DateTime<Utc>) -> DomainResult<Self> {
        match input.amount {
            0 => return Err(DomainError::validation("reward amount cannot be zero")),
            a if a < 0 && !input.event_type.allows_debit() => {
                return Err(DomainError::validation(format!(
                    "{} entries must be positive",
                    input.event_type
                )));
            }
            a if a > 0 && !input.event_type.allows_credit() => {
                return Err(DomainError::validation(format!(
                    "{} entries must be negative",
                    input.event_type
                )));
            }
            _ => {}
        }

        Ok(Self {
            id: RewardEntryId::new(),
            user_id: input.user_id,
            asset_id: input.asset_id,
            event_type: input.event_type,
            amount: input.amount,
            expires_at: input.expires_at,
            reference: input.reference,
            description: input.description,
            created_at: now,
        })
    }

    /// Counts toward the balance: no expiry, or expiry still in the future.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Read-time view of a user's points, derived from ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardBalance {
    pub user_id: UserId,
    /// Sum of active entries.
    pub total: i64,
    /// Active credits.
    pub earned: i64,
    /// Active debits, as a positive number.
    pub spent: i64,
    /// Credits that lapsed.
    pub expired: i64,
}

impl RewardBalance {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            total: 0,
            earned: 0,
            spent: 0,
            expired: 0,
        }
    }

    pub fn fold<'a>(
        user_id: UserId,
        entries: impl IntoIterator<Item = &'a RewardLedgerEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        entries
            .into_iter()
            .filter(|e| e.user_id == user_id)
            .fold(Self::empty(user_id), |mut acc, entry| {
                if entry.is_active_at(now) {
                    acc.total += entry.amount;
                    if entry.amount > 0 {
                        acc.earned += entry.amount;
                    } else {
                        acc.spent -= entry.amount;
                    }
                } else if entry.amount > 0 {
                    acc.expired += entry.amount;
                }
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn amount_sign_follows_event_type() {
        let user = UserId::new();
        let now = Utc::now();
        assert!(RewardLedgerEntry::create(NewRewardEntry::new(user, 0, RewardEventType::Referral), now).is_err());
        assert!(RewardLedgerEntry::create(NewRewardEntry::new(user, -5, RewardEventType::SavingAction), now).is_err());
        assert!(RewardLedgerEntry::create(NewRewardEntry::new(user, 5, RewardEventType::Redemption), now).is_err());
        assert!(RewardLedgerEntry::create(NewRewardEntry::new(user, -5, RewardEventType::Redemption), now).is_ok());
        assert!(RewardLedgerEntry::create(NewRewardEntry::new(user, -5, RewardEventType::ManualAdjustment), now).is_ok());
    }

    #[test]
    fn balance_ignores_expired_entries() {
        let user = UserId::new();
        let now = Utc::now();
        let entry = |amount, event, expires: Option<DateTime<Utc>>| {
            let mut input = NewRewardEntry::new(user, amount, event);
            input.expires_at = expires;
            RewardLedgerEntry::create(input, now - Duration::days(2)).unwrap()
        };

        let entries = vec![
            entry(30, RewardEventType::SavingAction, None),
            entry(20, RewardEventType::DailyLogin, Some(now - Duration::hours(1))),
            entry(15, RewardEventType::StreakBonus, Some(now + Duration::days(1))),
            entry(-10, RewardEventType::Redemption, None),
            RewardLedgerEntry::create(
                NewRewardEntry::new(UserId::new(), 99, RewardEventType::Referral),
                now,
            )
            .unwrap(),
        ];

        let balance = RewardBalance::fold(user, &entries, now);
        assert_eq!(balance.total, 35);
        assert_eq!(balance.earned, 45);
        assert_eq!(balance.spent, 10);
        assert_eq!(balance.expired, 20);
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let now = Utc::now();
        let entry = RewardLedgerEntry::create(
            NewRewardEntry::new(UserId::new(), 1, RewardEventType::DailyLogin).expires_at(now),
            now - Duration::hours(1),
        )
        .unwrap();
        assert!(!entry.is_active_at(now));
        assert!(entry.is_active_at(now - Duration::seconds(1)));
    }
}
