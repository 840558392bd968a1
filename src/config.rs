//! Loading progression configuration (rule thresholds + badge catalogue) from TOML.
//!
//! See `ProgressionConfig` and `RuleTables` for expected schema.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::{Badge, CounterKind};
use crate::util::normalize_name;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ProgressionConfig {
  #[serde(default)]
  pub rules: RuleTables,
  #[serde(default)]
  pub badges: Vec<Badge>,
}

/// Name-keyed thresholds used to classify badges that carry no explicit rule.
/// Keys are matched case-insensitively after trimming.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuleTables {
  pub milestones: HashMap<String, u64>,
  pub course_tiers: HashMap<String, u64>,
  pub enrollment_tiers: HashMap<String, u64>,
  pub collection_tiers: HashMap<String, u64>,
  pub single_events: HashMap<String, CounterKind>,
}

fn table<V: Copy>(pairs: &[(&str, V)]) -> HashMap<String, V> {
  pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

impl Default for RuleTables {
  fn default() -> Self {
    Self {
      milestones: table(&[("XP Hunter", 100), ("XP Collector", 500), ("XP Master", 1000), ("XP Legend", 5000)]),
      course_tiers: table(&[("Course Finisher", 1), ("Dedicated Learner", 5), ("Scholar", 10)]),
      enrollment_tiers: table(&[("Explorer", 1), ("Curious Mind", 5), ("Knowledge Seeker", 10)]),
      collection_tiers: table(&[("Badge Collector", 5), ("Badge Hoarder", 10)]),
      single_events: table(&[
        ("First Steps", CounterKind::LessonsCompleted),
        ("First Enrollment", CounterKind::CoursesEnrolled),
        ("First Graduation", CounterKind::CoursesCompleted),
      ]),
    }
  }
}

impl RuleTables {
  /// Re-key every table with normalized names so lookups are a single hash lookup.
  pub fn normalized(self) -> Self {
    fn norm<V>(m: HashMap<String, V>) -> HashMap<String, V> {
      m.into_iter().map(|(k, v)| (normalize_name(&k), v)).collect()
    }
    Self {
      milestones: norm(self.milestones),
      course_tiers: norm(self.course_tiers),
      enrollment_tiers: norm(self.enrollment_tiers),
      collection_tiers: norm(self.collection_tiers),
      single_events: norm(self.single_events),
    }
  }
}

/// Runtime settings read from the environment.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
  pub port: u16,
  pub notify_channel_capacity: usize,
  /// How many learners' XP high-water marks the engine remembers.
  pub xp_mark_capacity: usize,
}

impl Default for ServiceSettings {
  fn default() -> Self {
    Self { port: 3000, notify_channel_capacity: 256, xp_mark_capacity: 10_000 }
  }
}

fn positive_env(name: &str) -> Option<usize> {
  std::env::var(name).ok().and_then(|c| c.parse::<usize>().ok()).filter(|c| *c > 0)
}

impl ServiceSettings {
  pub fn from_env() -> Self {
    let defaults = Self::default();
    let port = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()).unwrap_or(defaults.port);
    Self {
      port,
      notify_channel_capacity: positive_env("NOTIFY_CHANNEL_CAPACITY").unwrap_or(defaults.notify_channel_capacity),
      xp_mark_capacity: positive_env("XP_MARK_CAPACITY").unwrap_or(defaults.xp_mark_capacity),
    }
  }
}

pub fn parse_config(s: &str) -> Result<ProgressionConfig, toml::de::Error> {
  toml::from_str::<ProgressionConfig>(s)
}

/// Attempt to load `ProgressionConfig` from PROGRESSION_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_config_from_env() -> Option<ProgressionConfig> {
  let path = std::env::var("PROGRESSION_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_config(&s) {
      Ok(cfg) => {
        info!(target: "progression_backend", %path, badges = cfg.badges.len(), "Loaded progression config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "progression_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "progression_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}
