//! Notification sinks and stats-change observers.
//!
//! Sinks are fire-and-forget: a failing sink logs and moves on, it never
//! reports back into the XP/badge write that produced the event.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::ProgressEvent;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &ProgressEvent);
}

/// Writes every event to the log.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::LevelUp { learner_id, level, total_xp } => {
                info!(target: "progression", %learner_id, level, total_xp, "Level up");
            }
            ProgressEvent::BadgeEarned { learner_id, badge_id, xp_reward, .. } => {
                info!(target: "progression", %learner_id, %badge_id, xp_reward, "Badge earned");
            }
            ProgressEvent::StatsChanged { learner_id, total_xp, level } => {
                debug!(target: "progression", %learner_id, total_xp, level, "Stats changed");
            }
        }
    }
}

/// Fans events out to any number of live subscribers (WebSocket clients,
/// `on_stats_changed` observers). Slow receivers lag and skip events.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, event: &ProgressEvent) {
        // Err only means nobody is listening right now.
        if self.tx.send(event.clone()).is_err() {
            debug!(target: "progression", learner_id = %event.learner_id(), "No live subscribers for event");
        }
    }
}

/// Forwards each event to every inner sink.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

/// Live registration created by `ProgressionEngine::on_stats_changed`.
/// Dropping it unsubscribes.
pub struct StatsSubscription {
    handle: JoinHandle<()>,
}

impl StatsSubscription {
    /// Spawn a task that calls `callback(total_xp, level)` for each
    /// `StatsChanged` event belonging to `learner_id`.
    pub fn spawn<F>(mut rx: broadcast::Receiver<ProgressEvent>, learner_id: String, callback: F) -> Self
    where
        F: Fn(u64, u32) + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ProgressEvent::StatsChanged { learner_id: who, total_xp, level }) if who == learner_id => {
                        callback(total_xp, level);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "progression", %learner_id, skipped, "Stats observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { handle }
    }
}

impl Drop for StatsSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Records every event in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl NotificationSink for RecordingSink {
    fn notify(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(learner: &str, total_xp: u64) -> ProgressEvent {
        ProgressEvent::StatsChanged { learner_id: learner.into(), total_xp, level: 1 }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![a.clone(), b.clone(), Arc::new(TracingSink)];
        let fanout = FanoutSink::new(sinks);
        fanout.notify(&changed("l1", 5));
        assert_eq!(a.events.lock().unwrap().len(), 1);
        assert_eq!(b.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn broadcast_without_subscribers_does_not_fail() {
        BroadcastSink::new(4).notify(&changed("l1", 5));
    }

    #[tokio::test]
    async fn subscription_filters_by_learner() {
        let sink = BroadcastSink::new(16);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = StatsSubscription::spawn(sink.subscribe(), "l1".into(), move |xp, _| {
            let _ = tx.send(xp);
        });

        sink.notify(&changed("l2", 1));
        sink.notify(&changed("l1", 2));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn dropping_subscription_stops_callbacks() {
        let sink = BroadcastSink::new(16);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u64>();
        let sub = StatsSubscription::spawn(sink.subscribe(), "l1".into(), move |xp, _| {
            let _ = tx.send(xp);
        });
        drop(sub);
        tokio::task::yield_now().await;
        sink.notify(&changed("l1", 9));
        // The task (and its sender) is gone, so the channel closes.
        assert_eq!(rx.recv().await, None);
    }
}
