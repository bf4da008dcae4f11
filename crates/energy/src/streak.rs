use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use wattloop_core::UserId;

/// Maximum gap between two activities for a streak to continue.
pub const STREAK_WINDOW_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakType {
    DailySaving,
    WeeklySaving,
    MonthlySaving,
    ApprovalStreak,
}

impl_str_enum!(StreakType, "streak type" {
    DailySaving => "daily_saving",
    WeeklySaving => "weekly_saving",
    MonthlySaving => "monthly_saving",
    ApprovalStreak => "approval_streak",
});

/// Outcome of recording an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakChange {
    Started,
    Continued,
    Reset,
}

/// Consecutive-activity counter for one `(user, streak_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streak {
    pub user_id: UserId,
    pub streak_type: StreakType,
    pub current_count: u32,
    pub longest_count: u32,
    pub last_date: DateTime<Utc>,
    pub version: u64,
}

impl Streak {
    pub fn start(user_id: UserId, streak_type: StreakType, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            streak_type,
            current_count: 1,
            longest_count: 1,
            last_date: now,
            version: 0,
        }
    }

    /// Record an activity at `now`.
    ///
    /// `now` is taken as the activity time even when it precedes `last_date`; a
    /// negative gap is within the window and continues the streak.
    pub fn record_activity(&mut self, now: DateTime<Utc>) -> StreakChange {
        let change = if now - self.last_date <= Duration::hours(STREAK_WINDOW_HOURS) {
            self.current_count += 1;
            StreakChange::Continued
        } else {
            self.current_count = 1;
            StreakChange::Reset
        };
        self.longest_count = self.longest_count.max(self.current_count);
        self.last_date = now;
        change
    }
}
