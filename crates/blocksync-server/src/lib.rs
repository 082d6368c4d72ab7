//! Blocksync production server.
//!
//! Glue between [`blocksync_core`]'s action-based room logic and real
//! WebSocket I/O. The core's `RoomDriver` decides what happens (pure
//! logic, time passed in); this crate runs the axum endpoint, the
//! per-session reader/writer tasks and the reaper, and executes driver
//! effects against sockets.
//!
//! # Components
//!
//! - [`AppState`] / [`app`]: router wiring and shared registry
//! - [`session`]: one connection's Opening → Live → Closing lifecycle
//! - [`reaper`]: periodic eviction of stalled participants

#![forbid(unsafe_code)]

pub mod reaper;
mod session;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use blocksync_core::{CoreConfig, RoomRegistry};
use serde::Deserialize;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<RoomRegistry>,
}

impl AppState {
    /// Build the process-wide state from resolved configuration.
    pub fn new(config: CoreConfig) -> Self {
        Self { registry: Arc::new(RoomRegistry::new(config)) }
    }

    /// Build state over a caller-provided registry (tests, external
    /// stores).
    pub fn with_registry(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// The room registry.
    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("registry", &self.registry).finish()
    }
}

#[derive(Debug, Deserialize)]
struct JoinQuery {
    nickname: Option<String>,
}

/// Build the router exposing the workspace WebSocket endpoint.
///
/// Both `/ws/workspace/{room}` and the trailing-slash form clients send
/// are accepted.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws/workspace/:room_id", get(ws_handler))
        .route("/ws/workspace/:room_id/", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(query): Query<JoinQuery>,
    State(state): State<AppState>,
) -> Response {
    let nickname = query.nickname.unwrap_or_default();
    ws.on_upgrade(move |socket| session::run(socket, state, room_id, nickname))
}
