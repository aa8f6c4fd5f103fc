// SPDX-License-Identifier: MIT OR Apache-2.0
//! The client side of the WebSocket transport.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, error};

/// Frames must be able to carry base64-encoded archives.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Read timeout applied to every receive.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The initial connect handshake failed.
    #[error("failed to initialize connection to server: {0}")]
    Connect(#[source] tungstenite::Error),

    /// An operation was attempted without an open socket.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the connection.
    #[error("connection closed by server{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed {
        /// Close reason supplied by the peer, if any.
        reason: Option<String>,
    },

    /// No frame arrived within [`READ_TIMEOUT`].
    #[error("read timed out")]
    Timeout,

    /// The socket reported a transport error.
    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// The peer sent a non-text frame; the protocol is text-only.
    #[error("unexpected non-text frame")]
    UnexpectedFrame,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One client connection to the capture server.
pub struct ClientConnection {
    url: String,
    socket: Option<Socket>,
}

impl ClientConnection {
    /// Prepare a connection to `url`; nothing is opened yet.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: None,
        }
    }

    /// Returns `true` if a socket is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Open the WebSocket.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_FRAME_BYTES))
            .max_frame_size(Some(MAX_FRAME_BYTES));
        let (socket, _response) = connect_async_with_config(&self.url, Some(config), false)
            .await
            .map_err(ConnectionError::Connect)?;
        debug!(url = %self.url, "websocket connected");
        self.socket = Some(socket);
        Ok(())
    }

    /// Send one text frame.
    pub async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        let socket = self.socket.as_mut().ok_or(ConnectionError::NotConnected)?;
        debug!(bytes = text.len(), "sending message");
        socket.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    /// Receive the next text frame, skipping keepalive frames.
    pub async fn receive(&mut self) -> Result<String, ConnectionError> {
        loop {
            let socket = self.socket.as_mut().ok_or(ConnectionError::NotConnected)?;
            let frame = tokio::time::timeout(READ_TIMEOUT, socket.next())
                .await
                .map_err(|_| ConnectionError::Timeout)?;
            match frame {
                None => {
                    self.socket = None;
                    return Err(ConnectionError::Closed { reason: None });
                }
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(ConnectionError::Transport(e));
                }
                Some(Ok(WsMessage::Text(text))) => {
                    debug!(bytes = text.len(), "received message");
                    return Ok(text.as_str().to_string());
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    error!("server closed the connection unexpectedly");
                    self.socket = None;
                    return Err(ConnectionError::Closed {
                        reason: frame.map(|f| f.reason.as_str().to_string()),
                    });
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(_)) => return Err(ConnectionError::UnexpectedFrame),
            }
        }
    }

    /// Close the connection with code 1000 and an optional reason.
    pub async fn disconnect(&mut self, reason: &str) -> Result<(), ConnectionError> {
        if let Some(mut socket) = self.socket.take() {
            socket
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.to_string().into(),
                }))
                .await?;
        }
        Ok(())
    }

    /// Drop the socket without a close handshake, e.g. after an error.
    pub fn reset(&mut self) {
        self.socket = None;
    }
}
