// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed wire messages for the MOTRA capture protocol.
//!
//! A protocol frame is a single JSON object discriminated by its
//! `message_type` field. This crate defines the eight message kinds as a
//! closed tagged union ([`Message`]), the embedded capture payload
//! descriptor ([`GenericPayload`]), and a strict two-phase decoder: the
//! discriminator is parsed first, then the frame body is validated against
//! the matching typed model. Unknown discriminators and unknown fields are
//! first-class errors, never silently dropped.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod messages;
mod payload;

pub use codec::Message;
pub use messages::{
    AckCapCon, CapCon, ClientHello, ExecuteCapCon, RequestCapCon, RequestUpload, ServerHello,
    UploadComplete, UploadEncoding, is_valid_peer_id,
};
pub use payload::{GenericPayload, PayloadKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while decoding or validating a protocol frame.
///
/// Every variant maps onto the protocol's close behaviour: an unknown
/// discriminator is answered with an `INVALID_DATA` frame, everything else
/// closes the socket with the reason `"failed validation"`.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not syntactically valid JSON.
    #[error("invalid JSON frame: {0}")]
    Frame(#[from] serde_json::Error),

    /// The frame parsed, but the top-level value is not a JSON object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The frame carries no `message_type` discriminator.
    #[error("missing message_type discriminator")]
    MissingType,

    /// The `message_type` value is not one of the eight protocol messages.
    #[error("unknown message_type: {0}")]
    UnknownType(String),

    /// The frame body failed validation against its typed model.
    #[error("malformed {message_type} message: {reason}")]
    Malformed {
        /// Discriminator of the message that failed to validate.
        message_type: String,
        /// Human-readable validation failure.
        reason: String,
    },

    /// A peer identifier does not match the MAC-style id pattern.
    #[error("invalid peer id in {field}: {value:?}")]
    InvalidPeerId {
        /// Field that carried the identifier (`client_id` or `server_id`).
        field: &'static str,
        /// The rejected value.
        value: String,
    },
}
