//! Application state: the in-memory stores, the notification sinks and the
//! progression engine wired on top of them.
//!
//! This module owns:
//!   - the memory store (stats, catalogue, earned badges, activity, attempts)
//!   - the broadcast channel feeding WebSocket clients and observers
//!   - the engine itself
//!
//! The badge catalogue comes from TOML when configured, otherwise from the
//! built-in seeds.

use std::{collections::HashMap, sync::Arc};

use tracing::{info, instrument};

use crate::config::{load_config_from_env, ProgressionConfig, ServiceSettings};
use crate::domain::BadgeCategory;
use crate::engine::{EngineParts, ProgressionEngine};
use crate::memory::MemoryStore;
use crate::notify::{BroadcastSink, FanoutSink, NotificationSink, TracingSink};
use crate::seeds::seed_badges;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProgressionEngine>,
    pub store: Arc<MemoryStore>,
}

impl AppState {
    /// Build state from env: load config, seed catalogue, wire the engine.
    #[instrument(level = "info", skip_all)]
    pub fn new(settings: &ServiceSettings) -> Self {
        let cfg = load_config_from_env().unwrap_or_default();
        Self::from_config(cfg, settings)
    }

    pub fn from_config(cfg: ProgressionConfig, settings: &ServiceSettings) -> Self {
        let ProgressionConfig { rules, badges } = cfg;
        let badges = if badges.is_empty() { seed_badges() } else { badges };

        // Catalogue inventory by category.
        let mut by_category: HashMap<BadgeCategory, usize> = HashMap::new();
        for b in &badges {
            *by_category.entry(b.category).or_default() += 1;
        }
        for (category, count) in by_category {
            info!(target: "progression_backend", ?category, count, "Startup badge inventory");
        }

        let store = Arc::new(MemoryStore::with_catalogue(badges));
        let events = BroadcastSink::new(settings.notify_channel_capacity);
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink)];
        let sink = Arc::new(FanoutSink::new(sinks));

        let engine = ProgressionEngine::new(
            EngineParts {
                stats: store.clone(),
                badges: store.clone(),
                activity: store.clone(),
                attempts: store.clone(),
                sink,
            },
            rules,
            events,
        )
        .with_xp_mark_capacity(settings.xp_mark_capacity);

        Self { engine: Arc::new(engine), store }
    }
}
