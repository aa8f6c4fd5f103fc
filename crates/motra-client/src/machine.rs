// SPDX-License-Identifier: MIT OR Apache-2.0
//! The measurement client driver.
//!
//! The protocol is driven by an event loop over the transition table:
//! each state's entry handler pulls typed messages off the socket and
//! yields the next event; each event's action sends the matching request.
//! Connection failures before the handshake completes fall back into
//! `DISCONNECTED` and the linear backoff; after the upload phase begins,
//! failures are fatal and the next connect re-enumerates `staging/`.

use motra_archive::ArchiveError;
use motra_capcon::CapConError;
use motra_codec::CodecError;
use motra_config::{Backoff, BackoffExhausted, ClientConfig};
use motra_protocol::{
    AckCapCon, ClientHello, Message, ProtocolError, RequestCapCon, RequestUpload,
};
use motra_schedule::{JobScheduler, JobSubmission, MEXEC_START_DELTA, UnitKind};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, ConnectionError};
use crate::state::{ClientEvent, ClientState};

/// Fatal errors that end the client process.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The reconnect budget is spent; the process exits non-zero.
    #[error(transparent)]
    BackoffExhausted(#[from] BackoffExhausted),

    /// A received frame failed to decode or validate.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A frame of the wrong kind arrived at a receive point.
    #[error("unexpected {got} while waiting for {expected}")]
    UnexpectedMessage {
        /// The message kind this state awaits.
        expected: &'static str,
        /// The kind that actually arrived.
        got: String,
    },

    /// The transport failed at a point with no recovery transition.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Archiving the previous live run failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Workspace persistence failed.
    #[error(transparent)]
    CapCon(#[from] CapConError),

    /// Encoding a pending upload failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// `UPLOAD_COMPLETE` did not echo the pending upload.
    #[error("upload acknowledgement {received:?} does not match pending {expected:?}")]
    UploadMismatch {
        /// File name and digest of the upload in flight.
        expected: String,
        /// What the server acknowledged instead.
        received: String,
    },

    /// `EXECUTE_CAPCON` named a different configuration than the active one.
    #[error("current and received capture configuration ids do not match: {expected:?} vs {received:?}")]
    CapConMismatch {
        /// The id this client acknowledged.
        expected: String,
        /// The id the trigger carried.
        received: String,
    },

    /// An event fired outside the transition table; a driver bug.
    #[error("event {event} is not valid in state {state}")]
    InvalidTransition {
        /// State the machine was in.
        state: ClientState,
        /// Event that was fired.
        event: ClientEvent,
    },

    /// An upload or acknowledgement was processed with nothing in flight.
    #[error("no pending upload")]
    NoPendingUpload,

    /// The final trigger arrived before any configuration was installed.
    #[error("no active capture configuration")]
    NoActiveCapCon,
}

/// How a completed client session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The sentinel arrived: no more work, shut down cleanly.
    Drained,
    /// A configuration was installed and handed to the scheduler.
    Scheduled {
        /// Id of the scheduled capture configuration.
        capcon_id: String,
    },
}

enum Flow {
    Event(ClientEvent),
    Done(SessionOutcome),
}

/// The six-state protocol driver. One instance drives one client
/// lifetime: construct, [`run`](Self::run), exit.
pub struct MeasurementClient {
    config: ClientConfig,
    backoff: Backoff,
    connection: ClientConnection,
    scheduler: Arc<dyn JobScheduler>,
    state: ClientState,
    pending_files: VecDeque<PathBuf>,
    upload_in_flight: Option<(String, String)>,
    current_capcon: Option<String>,
    schedule_units: Vec<JobSubmission>,
}

impl MeasurementClient {
    /// Build a client from its validated configuration.
    #[must_use]
    pub fn new(config: ClientConfig, scheduler: Arc<dyn JobScheduler>) -> Self {
        let backoff = config.backoff();
        let connection = ClientConnection::new(config.server_url.clone());
        Self {
            config,
            backoff,
            connection,
            scheduler,
            state: ClientState::Disconnected,
            pending_files: VecDeque::new(),
            upload_in_flight: None,
            current_capcon: None,
            schedule_units: Vec::new(),
        }
    }

    /// Drive the protocol until the session completes or fails.
    pub async fn run(mut self) -> Result<SessionOutcome, ClientError> {
        loop {
            let flow = self.enter_state().await?;
            match flow {
                Flow::Done(outcome) => return Ok(outcome),
                Flow::Event(event) => self.fire(event).await?,
            }
        }
    }

    /// Fire `event`: move through the transition table and run the
    /// event's action. An action may redirect into a follow-up event
    /// (a failed connect falls through to `connection_failed`).
    async fn fire(&mut self, mut event: ClientEvent) -> Result<(), ClientError> {
        loop {
            let target = self
                .state
                .transition(event)
                .ok_or(ClientError::InvalidTransition {
                    state: self.state,
                    event,
                })?;
            debug!(from = %self.state, to = %target, event = %event, "transition");
            self.state = target;
            match self.on_event(event).await? {
                Some(follow_up) => event = follow_up,
                None => return Ok(()),
            }
        }
    }

    async fn enter_state(&mut self) -> Result<Flow, ClientError> {
        match self.state {
            ClientState::Disconnected => self.enter_disconnected().await,
            ClientState::Connecting => self.enter_connecting().await,
            ClientState::Connected => self.enter_connected().await,
            ClientState::UploadDataAvailable => self.enter_upload_data_available().await,
            ClientState::PreparingReadyForTest => self.enter_preparing_ready_for_test().await,
            ClientState::OfflineTesting => self.enter_offline_testing().await,
        }
    }

    async fn on_event(&mut self, event: ClientEvent) -> Result<Option<ClientEvent>, ClientError> {
        match event {
            ClientEvent::Connect => {
                if self.issue_connection_request().await? {
                    Ok(None)
                } else {
                    Ok(Some(ClientEvent::ConnectionFailed))
                }
            }
            ClientEvent::StartUpload => {
                self.upload_next_file().await?;
                Ok(None)
            }
            ClientEvent::UploadComplete => {
                info!("requesting new capture configuration from server");
                self.send(Message::RequestCapCon(RequestCapCon::new()))
                    .await?;
                Ok(None)
            }
            ClientEvent::TransitionAwaitFinalTestTrigger => {
                let capcon_id = self
                    .current_capcon
                    .clone()
                    .ok_or(ClientError::NoActiveCapCon)?;
                info!("requesting final trigger from server");
                self.send(Message::AckCapCon(AckCapCon::new(capcon_id)))
                    .await?;
                Ok(None)
            }
            ClientEvent::ConnectionFailed => {
                self.connection.reset();
                Ok(None)
            }
            ClientEvent::ConnectionSuccessful => Ok(None),
        }
    }

    // -- State entry handlers -----------------------------------------------

    async fn enter_disconnected(&mut self) -> Result<Flow, ClientError> {
        let wait = self.backoff.next()?;
        info!(wait_secs = wait, "entered DISCONNECTED state, will try to connect");
        sleep(Duration::from_secs(wait)).await;
        Ok(Flow::Event(ClientEvent::Connect))
    }

    async fn enter_connecting(&mut self) -> Result<Flow, ClientError> {
        // The connect event may arrive here before a socket exists;
        // reissue the connection request in that case.
        if !self.connection.is_connected() && !self.issue_connection_request().await? {
            return Ok(Flow::Event(ClientEvent::ConnectionFailed));
        }

        info!("entered CONNECTING state, waiting for SERVER_HELLO");
        let raw = match self.connection.receive().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "handshake receive failed");
                return Ok(Flow::Event(ClientEvent::ConnectionFailed));
            }
        };

        match Message::decode(&raw)? {
            Message::ServerHello(hello) => {
                debug!(server = %hello.server_id, "received SERVER_HELLO");
                info!("connection successful");
                Ok(Flow::Event(ClientEvent::ConnectionSuccessful))
            }
            other => Err(ClientError::UnexpectedMessage {
                expected: "SERVER_HELLO",
                got: other.kind().to_string(),
            }),
        }
    }

    async fn enter_connected(&mut self) -> Result<Flow, ClientError> {
        let workspace = &self.config.workspace;

        if let Some(previous) = motra_capcon::load_capcon(&workspace.live)? {
            info!(capcon = %previous.capcon_id, "generating zip archive for previous capture run");
            motra_archive::archive(&previous.capcon_id, &workspace.live, &workspace.staging)?;
            motra_archive::clean(&workspace.live)?;
        }

        info!("determining files for upload");
        self.pending_files = workspace.pending_uploads()?.into();
        if self.pending_files.is_empty() {
            info!("no pending files for upload");
            Ok(Flow::Event(ClientEvent::UploadComplete))
        } else {
            Ok(Flow::Event(ClientEvent::StartUpload))
        }
    }

    async fn enter_upload_data_available(&mut self) -> Result<Flow, ClientError> {
        let ack = match self.receive().await? {
            Message::UploadComplete(ack) => ack,
            other => {
                return Err(ClientError::UnexpectedMessage {
                    expected: "UPLOAD_COMPLETE",
                    got: other.kind().to_string(),
                });
            }
        };

        let (file_name, file_hash) = self
            .upload_in_flight
            .take()
            .ok_or(ClientError::NoPendingUpload)?;
        if ack.file_name != file_name || ack.file_hash != file_hash {
            return Err(ClientError::UploadMismatch {
                expected: file_name,
                received: ack.file_name,
            });
        }

        self.config.workspace.retire_upload(&ack.file_name)?;

        if !self.pending_files.is_empty() {
            return Ok(Flow::Event(ClientEvent::StartUpload));
        }
        info!("upload of file(s) complete");
        Ok(Flow::Event(ClientEvent::UploadComplete))
    }

    async fn enter_preparing_ready_for_test(&mut self) -> Result<Flow, ClientError> {
        info!("waiting for new capture configuration from server");
        let capcon = match self.receive().await? {
            Message::CapCon(capcon) => capcon,
            other => {
                return Err(ClientError::UnexpectedMessage {
                    expected: "CAPCON",
                    got: other.kind().to_string(),
                });
            }
        };

        if capcon.is_sentinel() {
            info!("received empty capture configuration, stopping");
            let _ = self
                .connection
                .disconnect("Tests finished, closing gracefully")
                .await;
            return Ok(Flow::Done(SessionOutcome::Drained));
        }

        info!(capcon = %capcon.capcon_id, "received capture configuration");
        self.current_capcon = Some(capcon.capcon_id.clone());
        motra_capcon::write_capcon(&self.config.workspace.live, &capcon)?;

        // The respawn unit comes first; mexec units follow in payload order.
        let mut units = vec![JobSubmission::new(
            UnitKind::Client,
            capcon.capcon_id.clone(),
            format!("{}s", capcon.duration),
        )];
        for payload in capcon.payloads_for(&self.config.client_id) {
            let descriptor = self
                .config
                .workspace
                .live
                .join(format!("{}.json", payload.payload_id));
            motra_capcon::write_payload(&descriptor, payload)?;
            units.push(JobSubmission::new(
                UnitKind::ClientMexec,
                payload.payload_id.clone(),
                MEXEC_START_DELTA,
            ));
        }
        self.schedule_units = units;

        Ok(Flow::Event(ClientEvent::TransitionAwaitFinalTestTrigger))
    }

    async fn enter_offline_testing(&mut self) -> Result<Flow, ClientError> {
        info!("waiting for execution trigger");
        let trigger = match self.receive().await? {
            Message::ExecuteCapCon(trigger) => trigger,
            other => {
                return Err(ClientError::UnexpectedMessage {
                    expected: "EXECUTE_CAPCON",
                    got: other.kind().to_string(),
                });
            }
        };

        let capcon_id = self.current_capcon.clone().ok_or(ClientError::NoActiveCapCon)?;
        if trigger.capcon_id != capcon_id {
            return Err(ClientError::CapConMismatch {
                expected: capcon_id,
                received: trigger.capcon_id,
            });
        }

        // The submissions run before the close: they only arm timers, and
        // the respawn must be in place before this process is gone.
        for job in &self.schedule_units {
            self.scheduler.submit(job).await;
        }

        let _ = self.connection.disconnect("").await;
        info!("entered OFFLINE_TESTING state, client is now offline");
        Ok(Flow::Done(SessionOutcome::Scheduled { capcon_id }))
    }

    // -- Actions ------------------------------------------------------------

    /// Open the socket and greet the server. Returns `false` if the
    /// attempt failed and the machine should fall back into backoff.
    async fn issue_connection_request(&mut self) -> Result<bool, ClientError> {
        if let Err(e) = self.connection.connect().await {
            warn!(error = %e, "connection attempt failed, is the server running?");
            return Ok(false);
        }
        let hello = Message::ClientHello(ClientHello::new(self.config.client_id.clone()));
        match self.send(hello).await {
            Ok(()) => Ok(true),
            Err(ClientError::Connection(e)) => {
                warn!(error = %e, "sending CLIENT_HELLO failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_next_file(&mut self) -> Result<(), ClientError> {
        let file = self
            .pending_files
            .pop_front()
            .ok_or(ClientError::NoPendingUpload)?;
        info!(file = %file.display(), "uploading file to server");

        let encoded = motra_codec::encode(&file)?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or(ClientError::NoPendingUpload)?;
        self.upload_in_flight = Some((file_name.clone(), encoded.sha256_hex.clone()));

        self.send(Message::RequestUpload(RequestUpload::new(
            file_name,
            encoded.sha256_hex,
            encoded.base64,
        )))
        .await
    }

    async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        info!(message = message.kind(), "client: > frame");
        let frame = message.to_json()?;
        self.connection.send(frame).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, ClientError> {
        let raw = self.connection.receive().await?;
        let message = Message::decode(&raw)?;
        info!(message = message.kind(), "client: < frame");
        Ok(message)
    }
}
