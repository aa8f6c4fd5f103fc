// SPDX-License-Identifier: MIT OR Apache-2.0
//! SHA-256 and base64 file codec for MOTRA uploads.
//!
//! A file travels over the wire as a base64 string next to the hex SHA-256
//! of its raw bytes. [`encode`] produces both from a file on disk;
//! [`decode_and_verify`] reverses the encoding and enforces the digest
//! before the receiver is allowed to persist anything.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const HASH_CHUNK_SIZE: usize = 8 * 1024;

/// Errors produced while encoding or verifying an upload payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Reading the source file failed.
    #[error("failed to read file for encoding: {0}")]
    Io(#[from] std::io::Error),

    /// The wire payload is not valid base64.
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded bytes do not hash to the declared digest.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        /// Digest declared by the sender.
        expected: String,
        /// Digest computed over the decoded bytes.
        computed: String,
    },
}

/// A file prepared for transmission: its digest and its encoded bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFile {
    /// Hex SHA-256 over the raw file bytes.
    pub sha256_hex: String,
    /// Base64 encoding of the raw file bytes (ASCII).
    pub base64: String,
}

/// Encode a file for transmission.
///
/// The digest is computed by streaming the file in 8 KiB chunks; the
/// base64 string covers the full byte content.
pub fn encode(path: &Path) -> Result<EncodedFile, CodecError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    let sha256_hex = hex_digest(hasher);

    let bytes = std::fs::read(path)?;
    Ok(EncodedFile {
        sha256_hex,
        base64: BASE64.encode(bytes),
    })
}

/// Decode a wire payload and verify it against the declared digest.
///
/// Returns the raw bytes only if their SHA-256 equals `expected_hex`
/// (compared case-insensitively); otherwise nothing may be persisted.
pub fn decode_and_verify(payload: &str, expected_hex: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = BASE64.decode(payload)?;
    let computed = sha256_hex(&bytes);
    if !computed.eq_ignore_ascii_case(expected_hex) {
        return Err(CodecError::HashMismatch {
            expected: expected_hex.to_string(),
            computed,
        });
    }
    Ok(bytes)
}

/// Hex SHA-256 of an in-memory byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
