//! In-memory stores implementing every collaborator trait.
//!
//! Each mutation happens under a single write guard, which gives the same
//! guarantees a relational store gives through `UPDATE ... SET x = x + d`
//! and unique constraints.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::domain::{ActivityCounters, Attempt, AttemptStatus, Badge, EarnedBadge, IdempotencyKey, LearnerStats};
use crate::error::StoreError;
use crate::store::{ActivityProvider, AttemptStore, BadgeStore, InsertOutcome, StatsStore, XpIncrement};

#[derive(Default)]
struct StatsRow {
    stats: LearnerStats,
    awarded: HashSet<IdempotencyKey>,
}

#[derive(Default)]
pub struct MemoryStore {
    stats: RwLock<HashMap<String, StatsRow>>,
    catalogue: RwLock<Vec<Badge>>,
    earned: RwLock<HashMap<String, Vec<EarnedBadge>>>,
    activity: RwLock<HashMap<String, ActivityCounters>>,
    attempts: RwLock<HashMap<(String, String), Attempt>>,
}

impl MemoryStore {
    pub fn with_catalogue(badges: Vec<Badge>) -> Self {
        Self { catalogue: RwLock::new(badges), ..Default::default() }
    }

    /// Add to a learner's activity counters. Stands in for the platform's
    /// lesson/course tables.
    #[instrument(level = "debug", skip(self))]
    pub async fn record_activity(&self, learner_id: &str, delta: ActivityCounters) -> ActivityCounters {
        let mut activity = self.activity.write().await;
        let c = activity.entry(learner_id.to_string()).or_default();
        c.lessons_completed = c.lessons_completed.saturating_add(delta.lessons_completed);
        c.courses_enrolled = c.courses_enrolled.saturating_add(delta.courses_enrolled);
        c.courses_completed = c.courses_completed.saturating_add(delta.courses_completed);
        *c
    }

    /// Overwrite a stats row as-is, bypassing all invariants. Used to simulate
    /// stale or externally edited rows.
    #[cfg(test)]
    pub async fn put_raw_stats(&self, learner_id: &str, stats: LearnerStats) {
        self.stats.write().await.entry(learner_id.to_string()).or_default().stats = stats;
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn get_stats(&self, learner_id: &str) -> Result<Option<LearnerStats>, StoreError> {
        Ok(self.stats.read().await.get(learner_id).map(|r| r.stats))
    }

    async fn create_stats(&self, learner_id: &str, defaults: LearnerStats) -> Result<LearnerStats, StoreError> {
        let mut rows = self.stats.write().await;
        if rows.contains_key(learner_id) {
            return Err(StoreError::Conflict(format!("stats row for {learner_id} already exists")));
        }
        rows.insert(learner_id.to_string(), StatsRow { stats: defaults, awarded: HashSet::new() });
        debug!(target: "progression", %learner_id, "Created stats row");
        Ok(defaults)
    }

    async fn increment_xp(&self, learner_id: &str, delta: u64, key: &IdempotencyKey) -> Result<XpIncrement, StoreError> {
        let mut rows = self.stats.write().await;
        let row = rows
            .get_mut(learner_id)
            .ok_or_else(|| StoreError::NotFound(format!("stats row for {learner_id}")))?;
        let previous_total = row.stats.total_xp;
        if row.awarded.contains(key) {
            return Ok(XpIncrement { previous_total, new_total: previous_total, applied: false });
        }
        let new_total = previous_total
            .checked_add(delta)
            .ok_or_else(|| StoreError::Overflow(learner_id.to_string()))?;
        row.awarded.insert(key.clone());
        row.stats.total_xp = new_total;
        Ok(XpIncrement { previous_total, new_total, applied: true })
    }

    async fn set_level(&self, learner_id: &str, level: u32, total_xp: u64) -> Result<bool, StoreError> {
        let mut rows = self.stats.write().await;
        let row = rows
            .get_mut(learner_id)
            .ok_or_else(|| StoreError::NotFound(format!("stats row for {learner_id}")))?;
        if row.stats.total_xp != total_xp {
            return Ok(false);
        }
        row.stats.current_level = level;
        Ok(true)
    }
}

#[async_trait]
impl BadgeStore for MemoryStore {
    async fn list_badges(&self) -> Result<Vec<Badge>, StoreError> {
        Ok(self.catalogue.read().await.clone())
    }

    async fn list_earned_badges(&self, learner_id: &str) -> Result<Vec<EarnedBadge>, StoreError> {
        Ok(self.earned.read().await.get(learner_id).cloned().unwrap_or_default())
    }

    async fn insert_earned_badge(&self, learner_id: &str, badge_id: &str) -> Result<InsertOutcome, StoreError> {
        let mut earned = self.earned.write().await;
        let list = earned.entry(learner_id.to_string()).or_default();
        if let Some(existing) = list.iter().find(|e| e.badge_id == badge_id) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        let record = EarnedBadge {
            learner_id: learner_id.to_string(),
            badge_id: badge_id.to_string(),
            earned_at: Utc::now(),
        };
        list.push(record.clone());
        Ok(InsertOutcome::Inserted(record))
    }
}

#[async_trait]
impl ActivityProvider for MemoryStore {
    async fn counters(&self, learner_id: &str) -> Result<ActivityCounters, StoreError> {
        Ok(self.activity.read().await.get(learner_id).copied().unwrap_or_default())
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn start_attempt(&self, learner_id: &str, attempt_id: &str) -> Result<Attempt, StoreError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .entry((learner_id.to_string(), attempt_id.to_string()))
            .or_insert_with(|| Attempt {
                learner_id: learner_id.to_string(),
                attempt_id: attempt_id.to_string(),
                status: AttemptStatus::InProgress,
                started_at: Utc::now(),
                completed_at: None,
            });
        Ok(attempt.clone())
    }

    async fn get_attempt(&self, learner_id: &str, attempt_id: &str) -> Result<Option<Attempt>, StoreError> {
        let key = (learner_id.to_string(), attempt_id.to_string());
        Ok(self.attempts.read().await.get(&key).cloned())
    }

    async fn mark_completed(&self, learner_id: &str, attempt_id: &str) -> Result<Attempt, StoreError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(&(learner_id.to_string(), attempt_id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("attempt {attempt_id} for {learner_id}")))?;
        if attempt.status != AttemptStatus::Completed {
            attempt.status = AttemptStatus::Completed;
            attempt.completed_at = Some(Utc::now());
        }
        Ok(attempt.clone())
    }
}
