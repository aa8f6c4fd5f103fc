// SPDX-License-Identifier: MIT OR Apache-2.0
//! The closed message union and the strict frame decoder.

use serde::Serialize;
use serde_json::Value;

use crate::ProtocolError;
use crate::messages::{
    AckCapCon, CapCon, ClientHello, ExecuteCapCon, RequestCapCon, RequestUpload, ServerHello,
    UploadComplete, is_valid_peer_id,
};

/// A single protocol frame: one of the eight message kinds.
///
/// Serialisation flattens the body and adds the `message_type` tag;
/// decoding goes through [`Message::decode`], which validates strictly and
/// reports unknown discriminators and unknown fields as typed errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "message_type")]
pub enum Message {
    /// Client-side session opener.
    #[serde(rename = "CLIENT_HELLO")]
    ClientHello(ClientHello),
    /// Server-side handshake answer.
    #[serde(rename = "SERVER_HELLO")]
    ServerHello(ServerHello),
    /// One archived artifact, base64-encoded.
    #[serde(rename = "REQUEST_UPLOAD")]
    RequestUpload(RequestUpload),
    /// Acknowledgement of a persisted artifact.
    #[serde(rename = "UPLOAD_COMPLETE")]
    UploadComplete(UploadComplete),
    /// Request for the next capture configuration.
    #[serde(rename = "REQUEST_CAPCON")]
    RequestCapCon(RequestCapCon),
    /// A capture configuration (or the sentinel).
    #[serde(rename = "CAPCON")]
    CapCon(CapCon),
    /// Client acknowledgement of an installed configuration.
    #[serde(rename = "ACK_CAPCON")]
    AckCapCon(AckCapCon),
    /// Final execution trigger from the server.
    #[serde(rename = "EXECUTE_CAPCON")]
    ExecuteCapCon(ExecuteCapCon),
}

impl Message {
    /// The wire discriminator of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientHello(_) => "CLIENT_HELLO",
            Self::ServerHello(_) => "SERVER_HELLO",
            Self::RequestUpload(_) => "REQUEST_UPLOAD",
            Self::UploadComplete(_) => "UPLOAD_COMPLETE",
            Self::RequestCapCon(_) => "REQUEST_CAPCON",
            Self::CapCon(_) => "CAPCON",
            Self::AckCapCon(_) => "ACK_CAPCON",
            Self::ExecuteCapCon(_) => "EXECUTE_CAPCON",
        }
    }

    /// Serialise this message into a single JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Frame)
    }

    /// Decode and validate a single text frame.
    ///
    /// The discriminator is parsed first; the remaining object is then
    /// validated against the matching typed model with unknown fields
    /// rejected. Hello messages additionally have their peer id checked
    /// against the MAC-style pattern.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let tag = match map.remove("message_type") {
            Some(Value::String(tag)) => tag,
            Some(_) | None => return Err(ProtocolError::MissingType),
        };

        let body = Value::Object(map);
        let message = match tag.as_str() {
            "CLIENT_HELLO" => Self::ClientHello(parse_body(&tag, body)?),
            "SERVER_HELLO" => Self::ServerHello(parse_body(&tag, body)?),
            "REQUEST_UPLOAD" => Self::RequestUpload(parse_body(&tag, body)?),
            "UPLOAD_COMPLETE" => Self::UploadComplete(parse_body(&tag, body)?),
            "REQUEST_CAPCON" => Self::RequestCapCon(parse_body(&tag, body)?),
            "CAPCON" => Self::CapCon(parse_body(&tag, body)?),
            "ACK_CAPCON" => Self::AckCapCon(parse_body(&tag, body)?),
            "EXECUTE_CAPCON" => Self::ExecuteCapCon(parse_body(&tag, body)?),
            _ => return Err(ProtocolError::UnknownType(tag)),
        };

        match &message {
            Self::ClientHello(hello) if !is_valid_peer_id(&hello.client_id) => {
                Err(ProtocolError::InvalidPeerId {
                    field: "client_id",
                    value: hello.client_id.clone(),
                })
            }
            Self::ServerHello(hello) if !is_valid_peer_id(&hello.server_id) => {
                Err(ProtocolError::InvalidPeerId {
                    field: "server_id",
                    value: hello.server_id.clone(),
                })
            }
            _ => Ok(message),
        }
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(
    tag: &str,
    body: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|e| ProtocolError::Malformed {
        message_type: tag.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::GenericPayload;
    use chrono::Utc;

    fn roundtrip(message: Message) {
        let frame = message.to_json().unwrap();
        let back = Message::decode(&frame).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn all_message_kinds_roundtrip() {
        let upload = RequestUpload::new("a.zip", "cafe", "QUFB");
        roundtrip(Message::ClientHello(ClientHello::new("00:11:22:aa:bb:cc")));
        roundtrip(Message::ServerHello(ServerHello::new("00:11:22:aa:bb:cd")));
        roundtrip(Message::UploadComplete(UploadComplete::echoing(&upload)));
        roundtrip(Message::RequestUpload(upload));
        roundtrip(Message::RequestCapCon(RequestCapCon::new()));
        roundtrip(Message::CapCon(CapCon::sentinel()));
        roundtrip(Message::AckCapCon(AckCapCon::new("t1")));
        roundtrip(Message::ExecuteCapCon(ExecuteCapCon::new("t1")));
    }

    #[test]
    fn frame_carries_discriminator_and_timestamp() {
        let frame = Message::RequestCapCon(RequestCapCon::new())
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["message_type"], "REQUEST_CAPCON");
        assert!(value.get("timestamp_utc").is_some());
    }

    #[test]
    fn capcon_with_payload_roundtrips() {
        let capcon = CapCon {
            timestamp_utc: Utc::now(),
            capcon_id: "t3".into(),
            description: "mixed targets".into(),
            duration: 30,
            payload: Some(vec![GenericPayload {
                payload_type: Default::default(),
                payload_id: "p1".into(),
                target: vec!["client".into(), "server".into()],
                setup: String::new(),
                command: "/bin/true".into(),
                teardown: String::new(),
                description: String::new(),
                limits: 30,
                timestamp_utc: Utc::now(),
            }]),
        };
        roundtrip(Message::CapCon(capcon));
    }

    #[test]
    fn unknown_discriminator_is_a_first_class_error() {
        let raw = r#"{"message_type": "SELF_DESTRUCT", "timestamp_utc": "2026-01-01T00:00:00Z"}"#;
        match Message::decode(raw) {
            Err(ProtocolError::UnknownType(tag)) => assert_eq!(tag, "SELF_DESTRUCT"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn missing_discriminator_is_rejected() {
        let raw = r#"{"timestamp_utc": "2026-01-01T00:00:00Z"}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn non_object_frame_is_rejected() {
        assert!(matches!(
            Message::decode("[1, 2, 3]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(Message::decode("{"), Err(ProtocolError::Frame(_))));
    }

    #[test]
    fn unknown_fields_fail_validation() {
        let raw = r#"{
            "message_type": "REQUEST_CAPCON",
            "timestamp_utc": "2026-01-01T00:00:00Z",
            "smuggled": true
        }"#;
        assert!(matches!(
            Message::decode(raw),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn missing_required_fields_fail_validation() {
        let raw = r#"{"message_type": "ACK_CAPCON", "timestamp_utc": "2026-01-01T00:00:00Z"}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn hello_with_invalid_peer_id_is_rejected() {
        let raw = r#"{
            "message_type": "CLIENT_HELLO",
            "client_id": "not-a-mac",
            "timestamp_utc": "2026-01-01T00:00:00Z"
        }"#;
        match Message::decode(raw) {
            Err(ProtocolError::InvalidPeerId { field, value }) => {
                assert_eq!(field, "client_id");
                assert_eq!(value, "not-a-mac");
            }
            other => panic!("expected InvalidPeerId, got {other:?}"),
        }
    }
}
