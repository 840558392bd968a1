//! HTTP endpoint handlers. These are thin wrappers that forward to the engine.
//! Each handler is instrumented and logs parameters and basic result info.

use std::sync::Arc;

use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use tracing::{error, info, instrument, warn};

use crate::curve::xp_required_for_level;
use crate::domain::ActivityCounters;
use crate::error::{ProgressionError, StoreError};
use crate::protocol::*;
use crate::state::AppState;

/// Engine error mapped onto a status code and a JSON body.
pub struct ApiError(ProgressionError);

impl From<ProgressionError> for ApiError {
  fn from(e: ProgressionError) -> Self { ApiError(e) }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self.0 {
      ProgressionError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
      ProgressionError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
      ProgressionError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
      ProgressionError::Store(StoreError::Overflow(_)) => StatusCode::UNPROCESSABLE_ENTITY,
      ProgressionError::UnknownBadge(_) | ProgressionError::UnknownAttempt(_) => StatusCode::NOT_FOUND,
      ProgressionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
      ProgressionError::DataIntegrity { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
      error!(target: "progression_backend", %status, error = %self.0, "Request failed");
    } else {
      warn!(target: "progression_backend", %status, error = %self.0, "Request rejected");
    }
    let body = ErrorOut { error: self.0.to_string(), retryable: self.0.is_retryable() };
    (status, Json(body)).into_response()
  }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

#[instrument(level = "info")]
pub async fn http_get_level(Path(level): Path<u32>) -> impl IntoResponse {
  Json(LevelOut {
    level,
    xp_required: xp_required_for_level(level),
    xp_required_next: xp_required_for_level(level.saturating_add(1)),
  })
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_stats(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ApiResult<StatsOut> {
  let (r, summary) = state.engine.stats_summary(&id).await?;
  info!(target: "progression", learner_id = %id, level = summary.level, corrected = r.corrected, "HTTP stats served");
  Ok(Json(StatsOut { learner_id: id, corrected: r.corrected, summary: summary.into() }))
}

#[instrument(level = "info", skip(state, body), fields(amount = body.amount))]
pub async fn http_post_xp(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<AwardIn>,
) -> ApiResult<AwardOut> {
  let out = state.engine.award_xp(&id, body.amount, body.key.into()).await?;
  info!(target: "progression", learner_id = %id, total_xp = out.new_total_xp, leveled_up = out.leveled_up, applied = out.applied, "HTTP xp awarded");
  Ok(Json(out.into()))
}

#[instrument(level = "info", skip(state, body))]
pub async fn http_post_activity(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<ActivityIn>,
) -> ApiResult<ActivityOut> {
  if id.trim().is_empty() {
    return Err(ProgressionError::InvalidInput("learner id must not be empty".into()).into());
  }
  let delta = ActivityCounters {
    lessons_completed: body.lessons_completed,
    courses_enrolled: body.courses_enrolled,
    courses_completed: body.courses_completed,
  };
  let c = state.store.record_activity(&id, delta).await;
  Ok(Json(ActivityOut {
    lessons_completed: c.lessons_completed,
    courses_enrolled: c.courses_enrolled,
    courses_completed: c.courses_completed,
  }))
}

#[instrument(level = "info", skip(state, body))]
pub async fn http_post_attempt(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<StartAttemptIn>,
) -> ApiResult<AttemptOut> {
  let attempt = state.engine.start_attempt(&id, body.attempt_id).await?;
  info!(target: "progression", learner_id = %id, attempt_id = %attempt.attempt_id, "HTTP attempt started");
  Ok(Json(AttemptOut { attempt, award: None }))
}

#[instrument(level = "info", skip(state, body), fields(xp = body.xp))]
pub async fn http_post_attempt_complete(
  State(state): State<Arc<AppState>>,
  Path((id, attempt_id)): Path<(String, String)>,
  Json(body): Json<CompleteAttemptIn>,
) -> ApiResult<AttemptOut> {
  let out = state.engine.complete_attempt(&id, &attempt_id, body.xp).await?;
  Ok(Json(AttemptOut { attempt: out.attempt, award: Some(out.award.into()) }))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_badges(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ApiResult<Vec<BadgeOut>> {
  let board = state.engine.badge_board(&id).await?;
  Ok(Json(board.into_iter().map(BadgeOut::from).collect()))
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_claim(
  State(state): State<Arc<AppState>>,
  Path((id, badge_id)): Path<(String, String)>,
) -> ApiResult<ClaimOut> {
  let out = state.engine.claim_badge(&id, &badge_id).await?;
  info!(target: "progression", learner_id = %id, %badge_id, success = out.success, already = out.already_claimed, "HTTP claim handled");
  Ok(Json(out.into()))
}
