//! Badge rule classification and evaluation. Pure functions, no I/O.
//!
//! A badge either carries an explicit `BadgeRule` or gets one derived from its
//! stored fields, checked in this order (first match wins):
//!   1. level-gated, zero reward
//!   2. milestone name -> XP threshold
//!   3. course-completion tier
//!   4. enrollment tier
//!   5. badge-collection tier
//!   6. single-event name
//!   7. unrecognized (never met)

use serde::Serialize;

use crate::config::RuleTables;
use crate::domain::{ActivityCounters, Badge, BadgeCategory, BadgeRule, CounterKind, LearnerStats};
use crate::util::{normalize_name, plural};

/// Normalized outcome of evaluating a badge for one learner.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BadgeEvaluation {
  pub requirement_text: String,
  pub is_met: bool,
  pub progress: f64,
}

/// `tables` must already be `RuleTables::normalized`.
pub fn classify(badge: &Badge, tables: &RuleTables) -> BadgeRule {
  if let Some(rule) = &badge.rule {
    return rule.clone();
  }
  if badge.level_required > 0 && badge.xp_reward == 0 {
    return BadgeRule::LevelGate { level: badge.level_required };
  }

  let key = normalize_name(&badge.name);
  match badge.category {
    BadgeCategory::Milestone => {
      if let Some(xp) = tables.milestones.get(&key) {
        return BadgeRule::Milestone { xp: *xp };
      }
    }
    BadgeCategory::Course => {
      if let Some(n) = tables.course_tiers.get(&key) {
        return BadgeRule::CountThreshold { counter: CounterKind::CoursesCompleted, required: *n };
      }
    }
    BadgeCategory::Enrollment => {
      if let Some(n) = tables.enrollment_tiers.get(&key) {
        return BadgeRule::CountThreshold { counter: CounterKind::CoursesEnrolled, required: *n };
      }
    }
    BadgeCategory::BadgeCollection => {
      if let Some(n) = tables.collection_tiers.get(&key) {
        return BadgeRule::BadgeCollection { required: *n };
      }
    }
    BadgeCategory::Lesson | BadgeCategory::Other => {}
  }

  // Single-event names ("First Steps") live in lesson/course/enrollment categories.
  if badge.category != BadgeCategory::Other {
    if let Some(counter) = tables.single_events.get(&key) {
      return BadgeRule::SingleEvent { counter: *counter };
    }
  }
  BadgeRule::Unrecognized
}

fn ratio(have: u64, need: u64) -> f64 {
  if need == 0 {
    return 1.0;
  }
  (have as f64 / need as f64).clamp(0.0, 1.0)
}

fn threshold(have: u64, need: u64, requirement_text: String) -> BadgeEvaluation {
  BadgeEvaluation { requirement_text, is_met: have >= need, progress: ratio(have, need) }
}

fn count_text(counter: CounterKind, n: u64) -> String {
  match counter {
    CounterKind::LessonsCompleted => format!("Complete {}", plural(n, "lesson")),
    CounterKind::CoursesEnrolled => format!("Enroll in {}", plural(n, "course")),
    CounterKind::CoursesCompleted => format!("Complete {}", plural(n, "course")),
  }
}

fn first_event_text(counter: CounterKind) -> &'static str {
  match counter {
    CounterKind::LessonsCompleted => "Complete your first lesson",
    CounterKind::CoursesEnrolled => "Enroll in your first course",
    CounterKind::CoursesCompleted => "Complete your first course",
  }
}

/// Evaluate an already-classified rule.
///
/// `earned_badge_count` is the size of the learner's earned set *excluding*
/// the badge being evaluated.
pub fn evaluate_rule(
  rule: &BadgeRule,
  badge: &Badge,
  stats: &LearnerStats,
  counters: &ActivityCounters,
  earned_badge_count: u64,
) -> BadgeEvaluation {
  match rule {
    BadgeRule::LevelGate { level } => threshold(
      u64::from(stats.current_level),
      u64::from(*level),
      format!("Reach level {}", level),
    ),
    BadgeRule::Milestone { xp } => threshold(stats.total_xp, *xp, format!("Earn {} XP", xp)),
    BadgeRule::CountThreshold { counter, required } => {
      threshold(counter.read(counters), *required, count_text(*counter, *required))
    }
    BadgeRule::BadgeCollection { required } => threshold(
      earned_badge_count,
      *required,
      format!("Earn {} other {}", required, if *required == 1 { "badge" } else { "badges" }),
    ),
    BadgeRule::SingleEvent { counter } => {
      let is_met = counter.read(counters) >= 1;
      BadgeEvaluation {
        requirement_text: first_event_text(*counter).to_string(),
        is_met,
        progress: if is_met { 1.0 } else { 0.0 },
      }
    }
    BadgeRule::Unrecognized => BadgeEvaluation {
      requirement_text: badge.description.clone(),
      is_met: false,
      progress: 0.0,
    },
  }
}

/// Classify and evaluate in one step. `stats.current_level` is expected to be reconciled.
pub fn evaluate_badge(
  badge: &Badge,
  stats: &LearnerStats,
  counters: &ActivityCounters,
  earned_badge_count: u64,
  tables: &RuleTables,
) -> BadgeEvaluation {
  let rule = classify(badge, tables);
  evaluate_rule(&rule, badge, stats, counters, earned_badge_count)
}
