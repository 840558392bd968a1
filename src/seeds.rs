//! Built-in badge catalogue, used when the TOML config supplies none.
//! Names line up with the default `RuleTables` so every entry classifies.

use crate::domain::{Badge, BadgeCategory};

fn badge(id: &str, name: &str, description: &str, icon: &str, category: BadgeCategory, xp_reward: u64, level_required: u32) -> Badge {
  Badge {
    id: id.into(),
    name: name.into(),
    description: description.into(),
    icon: icon.into(),
    xp_reward,
    level_required,
    category,
    rule: None,
  }
}

pub fn seed_badges() -> Vec<Badge> {
  use BadgeCategory::*;
  vec![
    badge("first-steps", "First Steps", "Complete your first lesson", "footprints", Lesson, 10, 0),
    badge("first-enrollment", "First Enrollment", "Enroll in your first course", "door-open", Enrollment, 10, 0),
    badge("first-graduation", "First Graduation", "Finish your first course", "graduation-cap", Course, 25, 0),
    badge("explorer", "Explorer", "Enroll in a course", "compass", Enrollment, 15, 0),
    badge("curious-mind", "Curious Mind", "Enroll in 5 courses", "lightbulb", Enrollment, 50, 0),
    badge("knowledge-seeker", "Knowledge Seeker", "Enroll in 10 courses", "telescope", Enrollment, 100, 0),
    badge("course-finisher", "Course Finisher", "Complete a course", "flag", Course, 30, 0),
    badge("dedicated-learner", "Dedicated Learner", "Complete 5 courses", "book-open", Course, 100, 0),
    badge("scholar", "Scholar", "Complete 10 courses", "scroll", Course, 200, 0),
    badge("xp-hunter", "XP Hunter", "Earn 100 XP", "target", Milestone, 10, 0),
    badge("xp-collector", "XP Collector", "Earn 500 XP", "gem", Milestone, 25, 0),
    badge("xp-master", "XP Master", "Earn 1000 XP", "crown", Milestone, 50, 0),
    badge("xp-legend", "XP Legend", "Earn 5000 XP", "trophy", Milestone, 100, 0),
    badge("badge-collector", "Badge Collector", "Earn 5 badges", "medal", BadgeCollection, 50, 0),
    badge("badge-hoarder", "Badge Hoarder", "Earn 10 badges", "treasure-chest", BadgeCollection, 100, 0),
    badge("level-5", "Rising Star", "Reach level 5", "star", Milestone, 0, 5),
    badge("level-10", "Veteran", "Reach level 10", "shield", Milestone, 0, 10),
    badge("level-20", "Elite", "Reach level 20", "rocket", Milestone, 0, 20),
  ]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::RuleTables;
  use crate::domain::BadgeRule;
  use crate::rules::classify;
  use std::collections::HashSet;

  #[test]
  fn every_seed_badge_classifies() {
    let tables = RuleTables::default().normalized();
    for b in seed_badges() {
      assert_ne!(classify(&b, &tables), BadgeRule::Unrecognized, "{}", b.name);
    }
  }

  #[test]
  fn seed_ids_are_unique() {
    let badges = seed_badges();
    let ids: HashSet<_> = badges.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids.len(), badges.len());
  }
}
