//! WebSocket upgrade + message loop. The socket is bound to one learner:
//! progress events for that learner are pushed as they happen, and client
//! messages are answered with a single JSON message each.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    Query, State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, instrument, warn};

use crate::protocol::{ClientWsMessage, ServerWsMessage, StatsOut, WsQuery};
use crate::state::AppState;
use crate::util::trunc_for_log;

#[instrument(level = "info", skip(ws, state), fields(learner = %q.learner))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>, Query(q): Query<WsQuery>) -> impl IntoResponse {
  info!(target: "progression_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state, q.learner))
}

fn encode(msg: &ServerWsMessage) -> String {
  serde_json::to_string(msg).unwrap_or_else(|e| {
    serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
  })
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>, learner_id: String) {
  info!(target: "progression_backend", "WebSocket connected");
  let mut events = state.engine.subscribe();

  loop {
    let reply = tokio::select! {
      incoming = socket.recv() => match incoming {
        Some(Ok(Message::Text(txt))) => match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(msg) => {
            debug!(target: "progression_backend", "WS received: {:?}", &msg);
            handle_client_ws(msg, &state, &learner_id).await
          }
          Err(e) => {
            debug!(target: "progression_backend", text = %trunc_for_log(&txt, 120), "WS rejected message");
            ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) }
          }
        },
        Some(Ok(Message::Ping(payload))) => {
          let _ = socket.send(Message::Pong(payload)).await;
          continue;
        }
        Some(Ok(Message::Close(_))) | None => break,
        Some(Ok(_)) => continue,
        Some(Err(e)) => {
          warn!(target: "progression_backend", error = %e, "WS receive error");
          break;
        }
      },
      event = events.recv() => match event {
        Ok(event) if event.learner_id() == learner_id => ServerWsMessage::Event { event },
        Ok(_) => continue,
        Err(RecvError::Lagged(skipped)) => {
          warn!(target: "progression_backend", skipped, "WS client lagged behind event stream");
          continue;
        }
        Err(RecvError::Closed) => break,
      },
    };

    if let Err(e) = socket.send(Message::Text(encode(&reply))).await {
      error!(target: "progression_backend", error = %e, "WS send error");
      break;
    }
  }
  info!(target: "progression_backend", "WebSocket disconnected");
}

#[instrument(level = "info", skip(state))]
async fn handle_client_ws(msg: ClientWsMessage, state: &AppState, learner_id: &str) -> ServerWsMessage {
  match msg {
    ClientWsMessage::Ping => ServerWsMessage::Pong,
    ClientWsMessage::Stats => match state.engine.stats_summary(learner_id).await {
      Ok((r, summary)) => ServerWsMessage::Stats {
        stats: StatsOut { learner_id: learner_id.to_string(), corrected: r.corrected, summary: summary.into() },
      },
      Err(e) => ServerWsMessage::Error { message: e.to_string() },
    },
  }
}
