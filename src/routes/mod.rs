//! Router assembly: HTTP endpoints, WebSocket upgrade, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket at `/ws?learner=<id>` streaming that learner's progress events
/// - REST-ish API under `/api/v1/...`
/// - CORS (allow any origin/method/headers), adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(ws::ws_upgrade))
        // HTTP API
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/levels/:level", get(http::http_get_level))
        .route("/api/v1/learners/:id/stats", get(http::http_get_stats))
        .route("/api/v1/learners/:id/xp", post(http::http_post_xp))
        .route("/api/v1/learners/:id/activity", post(http::http_post_activity))
        .route("/api/v1/learners/:id/attempts", post(http::http_post_attempt))
        .route(
            "/api/v1/learners/:id/attempts/:attempt_id/complete",
            post(http::http_post_attempt_complete),
        )
        .route("/api/v1/learners/:id/badges", get(http::http_get_badges))
        .route(
            "/api/v1/learners/:id/badges/:badge_id/claim",
            post(http::http_post_claim),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}
