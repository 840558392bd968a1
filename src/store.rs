//! Storage collaborators consumed by the engine.
//!
//! Every exclusivity guarantee lives behind these traits: the XP increment is
//! relative and atomic, idempotency keys and earned badges are unique.

use async_trait::async_trait;

use crate::domain::{ActivityCounters, Attempt, Badge, EarnedBadge, IdempotencyKey, LearnerStats};
use crate::error::StoreError;

/// Result of one atomic, keyed XP increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XpIncrement {
    /// Total before this call's increment (equal to `new_total` when not applied).
    pub previous_total: u64,
    pub new_total: u64,
    /// False when the idempotency key had already been used.
    pub applied: bool,
}

/// Outcome of inserting an earned badge under the (learner, badge) uniqueness constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(EarnedBadge),
    AlreadyExists(EarnedBadge),
}

/// Per-learner XP/level rows.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn get_stats(&self, learner_id: &str) -> Result<Option<LearnerStats>, StoreError>;

    /// Create the row if absent. Returns `StoreError::Conflict` if another writer won.
    async fn create_stats(&self, learner_id: &str, defaults: LearnerStats) -> Result<LearnerStats, StoreError>;

    /// Atomically record `key` and add `delta` to total XP in one indivisible update.
    /// A key seen before leaves the total untouched and reports `applied = false`.
    async fn increment_xp(&self, learner_id: &str, delta: u64, key: &IdempotencyKey) -> Result<XpIncrement, StoreError>;

    /// Write the cached level, but only while total XP still equals `total_xp`,
    /// the value the level was derived from. Returns false when a later
    /// increment moved the total first; that increment writes its own level.
    async fn set_level(&self, learner_id: &str, level: u32, total_xp: u64) -> Result<bool, StoreError>;
}

/// Badge catalogue plus the append-only earned set.
#[async_trait]
pub trait BadgeStore: Send + Sync {
    async fn list_badges(&self) -> Result<Vec<Badge>, StoreError>;

    async fn list_earned_badges(&self, learner_id: &str) -> Result<Vec<EarnedBadge>, StoreError>;

    async fn insert_earned_badge(&self, learner_id: &str, badge_id: &str) -> Result<InsertOutcome, StoreError>;
}

/// Read-only activity counts owned by the rest of the platform.
#[async_trait]
pub trait ActivityProvider: Send + Sync {
    async fn counters(&self, learner_id: &str) -> Result<ActivityCounters, StoreError>;
}

/// Quiz/challenge attempt records; their status is separate from the XP ledger.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn start_attempt(&self, learner_id: &str, attempt_id: &str) -> Result<Attempt, StoreError>;

    async fn get_attempt(&self, learner_id: &str, attempt_id: &str) -> Result<Option<Attempt>, StoreError>;

    async fn mark_completed(&self, learner_id: &str, attempt_id: &str) -> Result<Attempt, StoreError>;
}
