//! Learner Progression Backend
//!
//! - XP curve, level reconciliation, keyed XP awards, badge rules and claims
//! - Axum HTTP + WebSocket API (live progress events per learner)
//! - In-memory stores behind async store traits
//!
//! Important env variables:
//!   PORT                     : u16 (default 3000)
//!   PROGRESSION_CONFIG_PATH  : path to TOML config (rule tables + badge catalogue)
//!   NOTIFY_CHANNEL_CAPACITY  : broadcast buffer for live events (default 256)
//!   XP_MARK_CAPACITY         : learners tracked for XP-decrease detection (default 10000)
//!   LOG_LEVEL                : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT               : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod config;
mod curve;
mod rules;
mod error;
mod store;
mod memory;
mod notify;
mod engine;
mod seeds;
mod state;
mod protocol;
mod routes;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServiceSettings;
use crate::routes::build_router;
use crate::state::AppState;

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "progression_backend", error = %e, "Failed to listen for shutdown signal");
  }
  info!(target: "progression_backend", "Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();
  let settings = ServiceSettings::from_env();

  // Shared state: stores, sinks and the engine.
  let state = Arc::new(AppState::new(&settings));

  // HTTP router with routes, CORS and tracing layers.
  let app = build_router(state.clone());

  let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
  let listener = TcpListener::bind(addr).await?;
  info!(target: "progression_backend", %addr, "HTTP server listening");
  axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
  Ok(())
}
