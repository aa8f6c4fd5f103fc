// SPDX-License-Identifier: MIT OR Apache-2.0
//! The client protocol states and the data-driven transition table.

use std::fmt;

/// The six states of a client lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Initial state; waiting out the backoff delay.
    Disconnected,
    /// Socket opened, `CLIENT_HELLO` sent, awaiting `SERVER_HELLO`.
    Connecting,
    /// Handshake done; archiving leftovers and enumerating uploads.
    Connected,
    /// At least one upload in flight, awaiting `UPLOAD_COMPLETE`.
    UploadDataAvailable,
    /// Capture configuration requested, awaiting `CAPCON`.
    PreparingReadyForTest,
    /// Final state: jobs installed, connection closed, going offline.
    OfflineTesting,
}

/// Events that drive the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    /// Open the socket and greet the server.
    Connect,
    /// `SERVER_HELLO` received and validated.
    ConnectionSuccessful,
    /// Send the next pending upload.
    StartUpload,
    /// All uploads acknowledged; request the next configuration.
    UploadComplete,
    /// Configuration installed; acknowledge and await the trigger.
    TransitionAwaitFinalTestTrigger,
    /// The connection attempt or handshake failed.
    ConnectionFailed,
}

/// The transition table: `(source, event, target)` triples.
///
/// Anything not listed here is a protocol violation and fatal.
const TRANSITIONS: &[(ClientState, ClientEvent, ClientState)] = &[
    (ClientState::Disconnected, ClientEvent::Connect, ClientState::Connecting),
    (ClientState::Connecting, ClientEvent::ConnectionSuccessful, ClientState::Connected),
    (ClientState::Connected, ClientEvent::StartUpload, ClientState::UploadDataAvailable),
    (ClientState::UploadDataAvailable, ClientEvent::StartUpload, ClientState::UploadDataAvailable),
    (ClientState::Connected, ClientEvent::UploadComplete, ClientState::PreparingReadyForTest),
    (ClientState::UploadDataAvailable, ClientEvent::UploadComplete, ClientState::PreparingReadyForTest),
    (ClientState::PreparingReadyForTest, ClientEvent::TransitionAwaitFinalTestTrigger, ClientState::OfflineTesting),
    (ClientState::Connecting, ClientEvent::ConnectionFailed, ClientState::Disconnected),
    (ClientState::Connected, ClientEvent::ConnectionFailed, ClientState::Disconnected),
];

impl ClientState {
    /// The state reached by firing `event` in this state, if the
    /// transition is allowed.
    #[must_use]
    pub fn transition(self, event: ClientEvent) -> Option<ClientState> {
        TRANSITIONS
            .iter()
            .find(|(source, trigger, _)| *source == self && *trigger == event)
            .map(|(_, _, target)| *target)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::UploadDataAvailable => "UPLOAD_DATA_AVAILABLE",
            Self::PreparingReadyForTest => "PREPARING_READY_FOR_TEST",
            Self::OfflineTesting => "OFFLINE_TESTING",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::ConnectionSuccessful => "connection_successful",
            Self::StartUpload => "start_upload",
            Self::UploadComplete => "upload_complete",
            Self::TransitionAwaitFinalTestTrigger => "transition_await_final_test_trigger",
            Self::ConnectionFailed => "connection_failed",
        };
        f.write_str(s)
    }
}
