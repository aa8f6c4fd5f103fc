// SPDX-License-Identifier: MIT OR Apache-2.0
//! The eight protocol message bodies.
//!
//! Each body is a strict serde model (`deny_unknown_fields`); the
//! `message_type` discriminator itself lives on the [`Message`](crate::Message)
//! union and is stripped before the body is validated.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::payload::GenericPayload;

static PEER_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").expect("peer id pattern compiles")
});

/// Returns `true` if `id` is a MAC-style peer identifier
/// (`aa:bb:cc:dd:ee:ff`, `:` or `-` separated).
#[must_use]
pub fn is_valid_peer_id(id: &str) -> bool {
    PEER_ID_PATTERN.is_match(id)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First message on a fresh connection; identifies the client and resets
/// the server-side session state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientHello {
    /// MAC-style hardware id of the client.
    pub client_id: String,
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
}

impl ClientHello {
    /// Build a hello stamped with the current time.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            timestamp_utc: Utc::now(),
        }
    }
}

/// The server's answer to [`ClientHello`]; ends the setup stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerHello {
    /// MAC-style hardware id of the server.
    pub server_id: String,
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
}

impl ServerHello {
    /// Build a hello stamped with the current time.
    #[must_use]
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            timestamp_utc: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// File upload
// ---------------------------------------------------------------------------

/// Wire encoding of an uploaded file. The protocol only defines base64.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadEncoding {
    /// Standard-alphabet base64, ASCII output.
    Base64,
}

/// A single archived artifact pushed from the client to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestUpload {
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
    /// File name of the archive; identical to its name under `staging/`.
    pub file_name: String,
    /// Hex digest over the raw file bytes.
    pub file_hash: String,
    /// Digest algorithm used for `file_hash`.
    pub hash_type: String,
    /// Wire encoding of `payload`.
    pub encoding: UploadEncoding,
    /// The encoded file bytes.
    pub payload: String,
}

impl RequestUpload {
    /// Build an upload request for an already-encoded file.
    #[must_use]
    pub fn new(
        file_name: impl Into<String>,
        file_hash: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            timestamp_utc: Utc::now(),
            file_name: file_name.into(),
            file_hash: file_hash.into(),
            hash_type: "sha256".into(),
            encoding: UploadEncoding::Base64,
            payload: payload.into(),
        }
    }
}

/// Server acknowledgement of a stored artifact. Echoes the identifiers
/// from the matching [`RequestUpload`] so the client can retire the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadComplete {
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
    /// File name from the acknowledged upload.
    pub file_name: String,
    /// Digest from the acknowledged upload.
    pub file_hash: String,
}

impl UploadComplete {
    /// Build an acknowledgement echoing the identifiers of `request`.
    #[must_use]
    pub fn echoing(request: &RequestUpload) -> Self {
        Self {
            timestamp_utc: Utc::now(),
            file_name: request.file_name.clone(),
            file_hash: request.file_hash.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Capture configuration exchange
// ---------------------------------------------------------------------------

/// Client request for the next capture configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestCapCon {
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
}

impl RequestCapCon {
    /// Build a request stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp_utc: Utc::now(),
        }
    }
}

impl Default for RequestCapCon {
    fn default() -> Self {
        Self::new()
    }
}

/// A capture configuration: the unit of work dispatched from server to
/// client. An empty `CapConID` is the sentinel meaning "no more work".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapCon {
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
    /// Unique id of this capture configuration.
    #[serde(rename = "CapConID")]
    pub capcon_id: String,
    /// Textual description, embedded into the final data archive.
    pub description: String,
    /// Measurement window in seconds; also the client respawn delay.
    pub duration: u64,
    /// Ordered payloads to materialise on the targeted peers.
    #[serde(default)]
    pub payload: Option<Vec<GenericPayload>>,
}

impl CapCon {
    /// The sentinel configuration: no id, no duration, no payloads.
    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            timestamp_utc: Utc::now(),
            capcon_id: String::new(),
            description: String::new(),
            duration: 0,
            payload: None,
        }
    }

    /// Returns `true` if this is the "no more work" sentinel.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.capcon_id.is_empty()
    }

    /// Payloads targeted at `entity`, in configuration order.
    pub fn payloads_for(&self, entity: &str) -> impl Iterator<Item = &GenericPayload> {
        self.payload
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(move |p| p.targets(entity))
    }

    /// Parse an on-disk capture configuration document.
    ///
    /// Stored documents are the serialised `CAPCON` message; a present
    /// `message_type` field must read `"CAPCON"`, an absent one is
    /// tolerated.
    pub fn from_document(raw: &str) -> Result<Self, crate::ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let serde_json::Value::Object(mut map) = value else {
            return Err(crate::ProtocolError::NotAnObject);
        };
        if let Some(tag) = map.remove("message_type") {
            if tag.as_str() != Some("CAPCON") {
                return Err(crate::ProtocolError::Malformed {
                    message_type: "CAPCON".into(),
                    reason: format!("document discriminator is {tag}"),
                });
            }
        }
        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
            crate::ProtocolError::Malformed {
                message_type: "CAPCON".into(),
                reason: e.to_string(),
            }
        })
    }
}

/// Client acknowledgement: the capture configuration is installed and the
/// client is ready to go offline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckCapCon {
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
    /// Copy of the acknowledged configuration id.
    #[serde(rename = "CapConID")]
    pub capcon_id: String,
}

impl AckCapCon {
    /// Build an acknowledgement for `capcon_id`.
    #[must_use]
    pub fn new(capcon_id: impl Into<String>) -> Self {
        Self {
            timestamp_utc: Utc::now(),
            capcon_id: capcon_id.into(),
        }
    }
}

/// Final trigger from the server. On receipt the client fires its
/// accumulated scheduler jobs, closes the connection, and exits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteCapCon {
    /// When the message was created.
    pub timestamp_utc: DateTime<Utc>,
    /// Copy of the configuration id being executed.
    #[serde(rename = "CapConID")]
    pub capcon_id: String,
}

impl ExecuteCapCon {
    /// Build a trigger for `capcon_id`.
    #[must_use]
    pub fn new(capcon_id: impl Into<String>) -> Self {
        Self {
            timestamp_utc: Utc::now(),
            capcon_id: capcon_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_accepts_colon_and_dash_forms() {
        assert!(is_valid_peer_id("00:11:22:aa:bb:cc"));
        assert!(is_valid_peer_id("00-11-22-AA-BB-CC"));
    }

    #[test]
    fn peer_id_rejects_junk() {
        assert!(!is_valid_peer_id("not-a-mac"));
        assert!(!is_valid_peer_id("00:11:22:aa:bb"));
        assert!(!is_valid_peer_id("00:11:22:aa:bb:cc:dd"));
        assert!(!is_valid_peer_id("zz:11:22:aa:bb:cc"));
        assert!(!is_valid_peer_id(""));
    }

    #[test]
    fn capcon_id_uses_wire_name() {
        let ack = AckCapCon::new("t1");
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["CapConID"], "t1");
        assert!(json.get("capcon_id").is_none());
    }

    #[test]
    fn sentinel_capcon_has_empty_id_and_zero_duration() {
        let s = CapCon::sentinel();
        assert!(s.is_sentinel());
        assert_eq!(s.duration, 0);
        assert!(s.payload.is_none());
    }

    #[test]
    fn capcon_document_tolerates_missing_discriminator() {
        let raw = r#"{
            "timestamp_utc": "2026-01-01T00:00:00Z",
            "CapConID": "t1",
            "description": "run",
            "duration": 5
        }"#;
        let capcon = CapCon::from_document(raw).unwrap();
        assert_eq!(capcon.capcon_id, "t1");
        assert_eq!(capcon.duration, 5);
    }

    #[test]
    fn capcon_document_rejects_foreign_discriminator() {
        let raw = r#"{
            "message_type": "ACK_CAPCON",
            "timestamp_utc": "2026-01-01T00:00:00Z",
            "CapConID": "t1",
            "description": "",
            "duration": 5
        }"#;
        assert!(CapCon::from_document(raw).is_err());
    }

    #[test]
    fn upload_encoding_is_base64_on_the_wire() {
        let req = RequestUpload::new("a.zip", "deadbeef", "AAAA");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["encoding"], "base64");
        assert_eq!(json["hash_type"], "sha256");
    }

    #[test]
    fn upload_complete_echoes_request_identifiers() {
        let req = RequestUpload::new("a.zip", "deadbeef", "AAAA");
        let ack = UploadComplete::echoing(&req);
        assert_eq!(ack.file_name, req.file_name);
        assert_eq!(ack.file_hash, req.file_hash);
    }
}
