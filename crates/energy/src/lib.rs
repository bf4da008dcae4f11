//! `wattloop-energy`: the recommend → command → proof → reward control loop.
//!
//! Pure domain logic: lifecycle state machines, the safety gate, reward ledger
//! folding and the streak continuation rule. Persistence and transport live in
//! `wattloop-infra`.

/// Closed string-backed enum: `as_str`, `Display` and `FromStr` over the wire names.
macro_rules! impl_str_enum {
    ($ty:ident, $what:literal { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl core::fmt::Display for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $ty {
            type Err = wattloop_core::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(wattloop_core::DomainError::validation(format!(
                        concat!("unknown ", $what, ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

pub mod command;
pub mod proof;
pub mod recommendation;
pub mod reward;
pub mod streak;

pub use command::{
    Command, CommandAction, CommandStatus, IdempotencyKey, NewCommand, SafetyProfile,
};
pub use proof::{CommandProof, ProofKind};
pub use recommendation::{
    ExpectedSavings, NewRecommendation, Recommendation, RecommendationAction,
    RecommendationReason, RecommendationStatus,
};
pub use reward::{
    NewRewardEntry, ReferenceType, RewardBalance, RewardEventType, RewardLedgerEntry,
    RewardReference,
};
pub use streak::{Streak, StreakChange, StreakType, STREAK_WINDOW_HOURS};
