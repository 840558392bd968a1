//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::curve::ProgressSummary;
use crate::domain::{Attempt, IdempotencyKey, ProgressEvent};
use crate::engine::{AwardOutcome, BadgeStatus, ClaimOutcome};

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    /// Ask for the learner's current (reconciled) stats.
    Stats,
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Stats { stats: StatsOut },
    Event { event: ProgressEvent },
    Error { message: String },
}

//
// HTTP request/response DTOs
//

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub learner: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsOut {
    #[serde(rename = "learnerId")]
    pub learner_id: String,
    /// True when the stored level was stale and has been rewritten.
    pub corrected: bool,
    #[serde(flatten)]
    pub summary: ProgressSummaryOut,
}

/// Mirror of `ProgressSummary` so the wire shape is owned here.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressSummaryOut {
    #[serde(rename = "totalXp")]
    pub total_xp: u64,
    pub level: u32,
    #[serde(rename = "xpCurrentLevel")]
    pub xp_current_level: u64,
    #[serde(rename = "xpNextLevel")]
    pub xp_next_level: u64,
    #[serde(rename = "xpToNext")]
    pub xp_to_next: u64,
    pub progress: f64,
    #[serde(rename = "progressPercent")]
    pub progress_percent: f64,
}

impl From<ProgressSummary> for ProgressSummaryOut {
    fn from(s: ProgressSummary) -> Self {
        Self {
            total_xp: s.total_xp,
            level: s.level,
            xp_current_level: s.xp_current_level,
            xp_next_level: s.xp_next_level,
            xp_to_next: s.xp_to_next,
            progress: s.progress,
            progress_percent: s.progress_percent,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AwardIn {
    pub amount: u64,
    pub key: AwardKeyIn,
}

/// Keys a raw XP award may carry. Badge keys only come from claims.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AwardKeyIn {
    Attempt(String),
}

impl From<AwardKeyIn> for IdempotencyKey {
    fn from(k: AwardKeyIn) -> Self {
        match k {
            AwardKeyIn::Attempt(id) => IdempotencyKey::Attempt(id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AwardOut {
    #[serde(rename = "newTotalXp")]
    pub new_total_xp: u64,
    #[serde(rename = "newLevel")]
    pub new_level: u32,
    #[serde(rename = "leveledUp")]
    pub leveled_up: bool,
    pub applied: bool,
}

impl From<AwardOutcome> for AwardOut {
    fn from(a: AwardOutcome) -> Self {
        Self { new_total_xp: a.new_total_xp, new_level: a.new_level, leveled_up: a.leveled_up, applied: a.applied }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartAttemptIn {
    #[serde(default, rename = "attemptId")]
    pub attempt_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteAttemptIn {
    pub xp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptOut {
    pub attempt: Attempt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub award: Option<AwardOut>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityIn {
    #[serde(default, rename = "lessonsCompleted")]
    pub lessons_completed: u64,
    #[serde(default, rename = "coursesEnrolled")]
    pub courses_enrolled: u64,
    #[serde(default, rename = "coursesCompleted")]
    pub courses_completed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivityOut {
    #[serde(rename = "lessonsCompleted")]
    pub lessons_completed: u64,
    #[serde(rename = "coursesEnrolled")]
    pub courses_enrolled: u64,
    #[serde(rename = "coursesCompleted")]
    pub courses_completed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BadgeOut {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    #[serde(rename = "xpReward")]
    pub xp_reward: u64,
    #[serde(rename = "requirementText")]
    pub requirement_text: String,
    #[serde(rename = "isMet")]
    pub is_met: bool,
    pub progress: f64,
    pub earned: bool,
    #[serde(rename = "earnedAt")]
    pub earned_at: Option<String>,
}

impl From<BadgeStatus> for BadgeOut {
    fn from(s: BadgeStatus) -> Self {
        Self {
            id: s.badge.id,
            name: s.badge.name,
            description: s.badge.description,
            icon: s.badge.icon,
            xp_reward: s.badge.xp_reward,
            requirement_text: s.evaluation.requirement_text,
            is_met: s.evaluation.is_met,
            progress: s.evaluation.progress,
            earned: s.earned,
            earned_at: s.earned_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimOut {
    pub success: bool,
    pub message: String,
    #[serde(rename = "alreadyClaimed")]
    pub already_claimed: bool,
    #[serde(rename = "leveledUp")]
    pub leveled_up: bool,
    #[serde(rename = "newXp", skip_serializing_if = "Option::is_none")]
    pub new_xp: Option<u64>,
    #[serde(rename = "newLevel", skip_serializing_if = "Option::is_none")]
    pub new_level: Option<u32>,
}

impl From<ClaimOutcome> for ClaimOut {
    fn from(c: ClaimOutcome) -> Self {
        Self {
            success: c.success,
            message: c.message,
            already_claimed: c.already_claimed,
            leveled_up: c.leveled_up,
            new_xp: c.new_xp,
            new_level: c.new_level,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LevelOut {
    pub level: u32,
    #[serde(rename = "xpRequired")]
    pub xp_required: u64,
    #[serde(rename = "xpRequiredNext")]
    pub xp_required_next: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorOut {
    pub error: String,
    pub retryable: bool,
}

#[derive(Serialize, Deserialize)]
pub struct HealthOut {
    pub ok: bool,
}
