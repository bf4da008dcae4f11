//! Entity trait and optimistic concurrency primitives.

use crate::error::{DomainError, DomainResult};

/// Entity marker + minimal interface.
///
/// Mutable records (commands, recommendations, streaks) carry a version that stores
/// use for compare-and-swap updates.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> Self::Id;

    /// Monotonically increasing revision, bumped on every persisted mutation.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stored record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
