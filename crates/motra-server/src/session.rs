// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-connection protocol dispatcher.
//!
//! A session is strictly sequential: one inbound frame is received,
//! dispatched by its `message_type`, and answered before the next frame is
//! read. All session state (active jobs, accumulated scheduler
//! submissions) lives on the session object and dies with the socket.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, close_code};
use motra_capcon::CapConError;
use motra_config::SERVER_ENTITY;
use motra_protocol::{
    AckCapCon, CapCon, ClientHello, ExecuteCapCon, Message, ProtocolError, RequestUpload,
    ServerHello, UploadComplete,
};
use motra_schedule::{JobSubmission, MEXEC_START_DELTA, UnitKind};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::upload::{UploadError, handle_file_payload};

/// Read timeout applied to every inbound frame.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An inbound frame failed validation; the socket is closed with the
    /// reason `"failed validation"`.
    #[error("frame failed validation: {0}")]
    FailedValidation(ProtocolError),

    /// The frame carried an unknown or out-of-order `message_type`;
    /// answered with an `INVALID_DATA` frame and a close.
    #[error("unknown message type: {0}")]
    ProtocolUnknown(String),

    /// Upload handling failed (digest mismatch, duplicate artifact, io).
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Persisting a payload descriptor failed.
    #[error(transparent)]
    CapCon(#[from] CapConError),

    /// Serialising an outbound frame failed.
    #[error("failed to encode outbound frame: {0}")]
    Encode(ProtocolError),

    /// The underlying socket reported a transport error.
    #[error("websocket transport error: {0}")]
    Transport(#[from] axum::Error),

    /// The client went away mid-session; the accumulator is discarded.
    #[error("client disconnected")]
    Disconnected,

    /// No frame arrived within the read timeout.
    #[error("read timed out")]
    Timeout,
}

enum Step {
    Continue,
    Finished,
}

/// One protocol session over one accepted WebSocket.
pub struct ServerSession {
    state: Arc<AppState>,
    active_jobs: HashMap<String, PathBuf>,
    schedule_units: Vec<JobSubmission>,
}

impl ServerSession {
    /// Create a fresh session against the shared server state.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            active_jobs: HashMap::new(),
            schedule_units: Vec::new(),
        }
    }

    /// Drive the session until the protocol completes or fails.
    ///
    /// Every failure path closes the socket before returning: validation
    /// failures with the reason `"failed validation"`, unknown message
    /// types with an `INVALID_DATA` frame, everything else with a bare
    /// close.
    pub async fn run(mut self, mut socket: WebSocket) -> Result<(), SessionError> {
        loop {
            let frame = match timeout(READ_TIMEOUT, socket.recv()).await {
                Err(_) => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return Err(SessionError::Timeout);
                }
                Ok(None) => return Err(SessionError::Disconnected),
                Ok(Some(frame)) => frame?,
            };

            let text = match frame {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => return Err(SessionError::Disconnected),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                WsMessage::Binary(_) => {
                    return Err(self.reject_invalid_data(&mut socket, "binary frame".into()).await);
                }
            };

            let message = match Message::decode(&text) {
                Ok(message) => message,
                Err(ProtocolError::UnknownType(tag)) => {
                    return Err(self.reject_invalid_data(&mut socket, tag).await);
                }
                Err(e) => {
                    let _ = socket
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "failed validation".into(),
                        })))
                        .await;
                    return Err(SessionError::FailedValidation(e));
                }
            };

            info!(message = message.kind(), "server: < frame");
            match self.dispatch(message, &mut socket).await {
                Ok(Step::Continue) => {}
                Ok(Step::Finished) => return Ok(()),
                Err(SessionError::ProtocolUnknown(tag)) => {
                    return Err(self.reject_invalid_data(&mut socket, tag).await);
                }
                Err(e) => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return Err(e);
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        message: Message,
        socket: &mut WebSocket,
    ) -> Result<Step, SessionError> {
        match message {
            Message::ClientHello(hello) => self.on_client_hello(hello, socket).await,
            Message::RequestUpload(request) => self.on_request_upload(request, socket).await,
            Message::RequestCapCon(_) => self.on_request_capcon(socket).await,
            Message::AckCapCon(ack) => self.on_ack_capcon(ack, socket).await,
            // A known kind arriving in the wrong direction is invalid data.
            other => Err(SessionError::ProtocolUnknown(other.kind().to_string())),
        }
    }

    /// `CLIENT_HELLO`: reset the session and answer with `SERVER_HELLO`.
    ///
    /// Payload descriptors recorded by a previous, never-executed run are
    /// removed from disk and the scheduler accumulator is cleared.
    async fn on_client_hello(
        &mut self,
        hello: ClientHello,
        socket: &mut WebSocket,
    ) -> Result<Step, SessionError> {
        debug!(client = %hello.client_id, "client announced itself");
        for (job_id, job_file) in self.active_jobs.drain() {
            info!(job = %job_id, "removing old job");
            if let Err(e) = std::fs::remove_file(&job_file) {
                warn!(job = %job_id, file = %job_file.display(), error = %e, "failed to remove job descriptor");
            }
        }
        self.schedule_units.clear();

        let hello = ServerHello::new(self.state.config.server_id.clone());
        self.send(socket, Message::ServerHello(hello)).await?;
        Ok(Step::Continue)
    }

    /// `REQUEST_UPLOAD`: verify and persist the artifact, acknowledge it.
    async fn on_request_upload(
        &mut self,
        request: RequestUpload,
        socket: &mut WebSocket,
    ) -> Result<Step, SessionError> {
        info!(file = %request.file_name, "receiving file");
        handle_file_payload(&request, &self.state.config.workspace.archive)?;

        let ack = UploadComplete::echoing(&request);
        self.send(socket, Message::UploadComplete(ack)).await?;
        Ok(Step::Continue)
    }

    /// `REQUEST_CAPCON`: serve the queue head (or the sentinel), staging
    /// server-side payloads before the response leaves.
    ///
    /// The queue lock is held across peek, send, and pop so that two
    /// concurrent sessions can never serve the same configuration.
    async fn on_request_capcon(&mut self, socket: &mut WebSocket) -> Result<Step, SessionError> {
        let state = Arc::clone(&self.state);
        let mut queue = state.queue.lock().await;
        let response = match queue.peek() {
            Some(capcon) => capcon.clone(),
            None => {
                info!("executed all available capture configurations");
                CapCon::sentinel()
            }
        };
        let served = !response.is_sentinel();

        if served {
            self.stage_server_payloads(&response)?;
        }

        info!(capcon = %response.capcon_id, "serving capture configuration");
        self.send(socket, Message::CapCon(response)).await?;
        if served {
            queue.pop();
        }
        Ok(Step::Continue)
    }

    /// `ACK_CAPCON`: fire the accumulated scheduler jobs, emit the final
    /// trigger, and close the connection.
    async fn on_ack_capcon(
        &mut self,
        ack: AckCapCon,
        socket: &mut WebSocket,
    ) -> Result<Step, SessionError> {
        for job in &self.schedule_units {
            self.state.scheduler.submit(job).await;
        }
        self.schedule_units.clear();

        let trigger = ExecuteCapCon::new(ack.capcon_id);
        self.send(socket, Message::ExecuteCapCon(trigger)).await?;

        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
        info!("sent EXECUTE and closed connection");
        Ok(Step::Finished)
    }

    /// Persist descriptors and accumulate submissions for every payload
    /// targeted at the server entity.
    fn stage_server_payloads(&mut self, capcon: &CapCon) -> Result<(), SessionError> {
        for payload in capcon.payloads_for(SERVER_ENTITY) {
            let job_file = self
                .state
                .config
                .workspace
                .live
                .join(format!("{}.json", payload.payload_id));
            motra_capcon::write_payload(&job_file, payload)?;
            self.active_jobs
                .insert(payload.payload_id.clone(), job_file);
            self.schedule_units.push(JobSubmission::new(
                UnitKind::ServerMexec,
                payload.payload_id.clone(),
                MEXEC_START_DELTA,
            ));
        }
        Ok(())
    }

    async fn reject_invalid_data(&mut self, socket: &mut WebSocket, tag: String) -> SessionError {
        warn!(message_type = %tag, "got invalid data from client");
        let body = json!({ "message_type": "INVALID_DATA" }).to_string();
        let _ = socket.send(WsMessage::Text(body.into())).await;
        let _ = socket.send(WsMessage::Close(None)).await;
        SessionError::ProtocolUnknown(tag)
    }

    async fn send(&self, socket: &mut WebSocket, message: Message) -> Result<(), SessionError> {
        info!(message = message.kind(), "server: > frame");
        let frame = message.to_json().map_err(SessionError::Encode)?;
        socket.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }
}
