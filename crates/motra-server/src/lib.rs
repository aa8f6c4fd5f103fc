// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capture server: the WebSocket endpoint dispensing capture
//! configurations to measurement clients.
//!
//! One [`ServerSession`] runs per accepted socket. Session state is
//! per-connection; the only process-wide mutable state is the
//! [`CapConQueue`], guarded by a lock so two concurrent clients can never
//! receive the same configuration.

#![deny(unsafe_code)]

mod session;
mod upload;

pub use session::{ServerSession, SessionError};
pub use upload::{UploadError, handle_file_payload};

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use motra_config::ServerConfig;
use motra_queue::CapConQueue;
use motra_schedule::JobScheduler;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Frames must be able to carry base64-encoded archives; 64 MiB leaves
/// headroom over the protocol's required 32 MiB.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Process-wide server state shared across sessions.
pub struct AppState {
    /// Validated server configuration.
    pub config: ServerConfig,
    /// The startup-scanned configuration queue.
    pub queue: Mutex<CapConQueue>,
    /// Scheduler bridge used at capture handoff.
    pub scheduler: Arc<dyn JobScheduler>,
}

/// Build the axum router with the liveness probe and the protocol route.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/motra", any(ws_motra))
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(json!({ "message": "Server is running" }))
}

async fn ws_motra(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session = ServerSession::new(state);
    match session.run(socket).await {
        Ok(()) => info!("session complete, connection closed"),
        Err(SessionError::Disconnected) => info!("client disconnected"),
        Err(e) => warn!(error = %e, "session aborted"),
    }
}
