//! XP curve: cumulative XP per level and its inverse.
//!
//! Advancing from level `k` to `k + 1` costs `60 + (k - 1) * 15` XP, so the
//! cumulative requirement for level `L` is the arithmetic series
//! `60 n + 15 n (n - 1) / 2` with `n = L - 1`. All math is integer; the
//! intermediate values are computed in `u128` so no level in `u32` overflows.

use serde::Serialize;

use crate::domain::LearnerStats;

const BASE_COST: u128 = 60;
const COST_STEP: u128 = 15;

fn required_exact(level: u32) -> u128 {
  if level <= 1 {
    return 0;
  }
  let n = u128::from(level - 1);
  BASE_COST * n + COST_STEP * n * (n - 1) / 2
}

/// Total XP needed to reach `level`. Saturates at `u64::MAX` for levels no
/// `u64` XP total can reach.
pub fn xp_required_for_level(level: u32) -> u64 {
  u64::try_from(required_exact(level)).unwrap_or(u64::MAX)
}

/// Largest level whose requirement is `<= xp`. Always at least 1.
pub fn level_from_xp(xp: u64) -> u32 {
  let xp = u128::from(xp);
  // required_exact(1) == 0 <= xp, and required_exact(u32::MAX) > u64::MAX.
  let (mut lo, mut hi) = (1u32, u32::MAX);
  while lo + 1 < hi {
    let mid = lo + (hi - lo) / 2;
    if required_exact(mid) <= xp {
      lo = mid;
    } else {
      hi = mid;
    }
  }
  lo
}

/// Fraction of the way from `current_level` to the next one, in `[0, 1]`.
pub fn progress_to_next_level(total_xp: u64, current_level: u32) -> f64 {
  let floor = required_exact(current_level);
  let ceil = required_exact(current_level.saturating_add(1));
  let span = ceil.saturating_sub(floor);
  if span == 0 {
    return 1.0;
  }
  let gained = u128::from(total_xp).saturating_sub(floor);
  (gained as f64 / span as f64).clamp(0.0, 1.0)
}

/// Display-ready view of where a learner sits on the curve.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProgressSummary {
  pub total_xp: u64,
  pub level: u32,
  pub xp_current_level: u64,
  pub xp_next_level: u64,
  pub xp_to_next: u64,
  pub progress: f64,
  pub progress_percent: f64,
}

/// Summary computed from the derived level; the stored level is ignored.
pub fn progress_summary(stats: &LearnerStats) -> ProgressSummary {
  let level = level_from_xp(stats.total_xp);
  let xp_current_level = xp_required_for_level(level);
  let xp_next_level = xp_required_for_level(level.saturating_add(1));
  let progress = progress_to_next_level(stats.total_xp, level);
  ProgressSummary {
    total_xp: stats.total_xp,
    level,
    xp_current_level,
    xp_next_level,
    xp_to_next: xp_next_level.saturating_sub(stats.total_xp),
    progress,
    progress_percent: progress * 100.0,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_points_on_the_curve() {
    assert_eq!(xp_required_for_level(0), 0);
    assert_eq!(xp_required_for_level(1), 0);
    assert_eq!(xp_required_for_level(2), 60);
    assert_eq!(xp_required_for_level(3), 135);
    assert_eq!(xp_required_for_level(4), 225);
    assert_eq!(xp_required_for_level(5), 330);
  }

  #[test]
  fn matches_the_per_level_sum() {
    let mut total = 0u64;
    for level in 2..200u32 {
      total += 60 + u64::from(level - 2) * 15;
      assert_eq!(xp_required_for_level(level), total, "level {level}");
    }
  }

  #[test]
  fn requirements_strictly_increase() {
    for level in 1..2_000u32 {
      assert!(xp_required_for_level(level + 1) > xp_required_for_level(level), "level {level}");
    }
  }

  #[test]
  fn inversion_hits_every_threshold() {
    assert_eq!(level_from_xp(0), 1);
    for level in 1..1_000u32 {
      let req = xp_required_for_level(level);
      assert_eq!(level_from_xp(req), level);
      if level > 1 {
        assert_eq!(level_from_xp(req - 1), level - 1);
      }
    }
  }

  #[test]
  fn level_from_xp_is_total_over_u64() {
    let top = level_from_xp(u64::MAX);
    assert!(top > 1);
    assert!(xp_required_for_level(top) <= u64::MAX);
    assert!(required_exact(top + 1) > u128::from(u64::MAX));
  }

  #[test]
  fn progress_is_clamped() {
    assert_eq!(progress_to_next_level(0, 1), 0.0);
    assert_eq!(progress_to_next_level(30, 1), 0.5);
    assert_eq!(progress_to_next_level(10_000, 1), 1.0);
    // Stale level above what XP justifies never goes negative.
    assert_eq!(progress_to_next_level(0, 5), 0.0);
  }

  #[test]
  fn summary_uses_derived_level() {
    let s = progress_summary(&LearnerStats { total_xp: 150, current_level: 1 });
    assert_eq!(s.level, 3);
    assert_eq!(s.xp_current_level, 135);
    assert_eq!(s.xp_next_level, 225);
    assert_eq!(s.xp_to_next, 75);
    assert!((s.progress_percent - 100.0 * 15.0 / 90.0).abs() < 1e-9);
  }
}
