//! Domain models for learner progression: stats, badge definitions and rules,
//! earned badges, activity counters, idempotency keys and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted per-learner progression row.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearnerStats {
  pub total_xp: u64,
  /// Cached level. Only ever trusted after reconciliation against `total_xp`.
  pub current_level: u32,
}

impl Default for LearnerStats {
  fn default() -> Self { Self { total_xp: 0, current_level: 1 } }
}

/// Catalogue grouping of a badge, as stored alongside its definition.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BadgeCategory {
  Milestone,
  Course,
  Enrollment,
  BadgeCollection,
  Lesson,
  #[default]
  Other,
}

/// Which activity counter a count-based rule reads.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
  LessonsCompleted,
  CoursesEnrolled,
  CoursesCompleted,
}

impl CounterKind {
  pub fn read(self, counters: &ActivityCounters) -> u64 {
    match self {
      CounterKind::LessonsCompleted => counters.lessons_completed,
      CounterKind::CoursesEnrolled => counters.courses_enrolled,
      CounterKind::CoursesCompleted => counters.courses_completed,
    }
  }
}

/// Closed set of eligibility rules a badge can carry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BadgeRule {
  LevelGate { level: u32 },
  Milestone { xp: u64 },
  CountThreshold { counter: CounterKind, required: u64 },
  BadgeCollection { required: u64 },
  SingleEvent { counter: CounterKind },
  Unrecognized,
}

/// Badge definition from the catalogue. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Badge {
  pub id: String,
  pub name: String,
  #[serde(default)] pub description: String,
  #[serde(default)] pub icon: String,
  #[serde(default)] pub xp_reward: u64,
  #[serde(default)] pub level_required: u32,
  #[serde(default)] pub category: BadgeCategory,
  /// Explicit rule; when absent the rule is derived from category and name.
  #[serde(default)] pub rule: Option<BadgeRule>,
}

/// A badge awarded to a learner. Append-only, one per (learner, badge).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EarnedBadge {
  pub learner_id: String,
  pub badge_id: String,
  pub earned_at: DateTime<Utc>,
}

/// Read-only activity counts provided by the rest of the platform.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityCounters {
  pub lessons_completed: u64,
  pub courses_enrolled: u64,
  pub courses_completed: u64,
}

/// Identifies one award-worthy event so that it can only grant XP once.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum IdempotencyKey {
  Badge(String),
  Attempt(String),
}

impl std::fmt::Display for IdempotencyKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      IdempotencyKey::Badge(id) => write!(f, "badge:{id}"),
      IdempotencyKey::Attempt(id) => write!(f, "attempt:{id}"),
    }
  }
}

/// Lifecycle of a quiz/challenge attempt, tracked apart from the XP ledger.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
  InProgress,
  Completed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attempt {
  pub learner_id: String,
  pub attempt_id: String,
  pub status: AttemptStatus,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

/// User-facing events emitted by the engine.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
  LevelUp {
    learner_id: String,
    level: u32,
    total_xp: u64,
  },
  BadgeEarned {
    learner_id: String,
    badge_id: String,
    name: String,
    xp_reward: u64,
  },
  StatsChanged {
    learner_id: String,
    total_xp: u64,
    level: u32,
  },
}

impl ProgressEvent {
  pub fn learner_id(&self) -> &str {
    match self {
      ProgressEvent::LevelUp { learner_id, .. }
      | ProgressEvent::BadgeEarned { learner_id, .. }
      | ProgressEvent::StatsChanged { learner_id, .. } => learner_id,
    }
  }
}
