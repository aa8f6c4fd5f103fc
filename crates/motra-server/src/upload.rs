// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence of uploaded capture archives.

use motra_codec::CodecError;
use motra_protocol::RequestUpload;
use std::path::{Path, PathBuf};
use tracing::info;

/// Errors produced while persisting an uploaded artifact.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Decoding failed or the payload does not match its declared digest.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The file name would escape the archive directory.
    #[error("unsafe upload file name: {0:?}")]
    UnsafeFileName(String),

    /// An artifact with this name already exists on disk.
    #[error("capture archive already exists: {0}")]
    DuplicateArtifact(PathBuf),

    /// Writing the artifact failed.
    #[error("failed to write upload: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Returns `true` if this failure is the digest check.
    #[must_use]
    pub fn is_hash_mismatch(&self) -> bool {
        matches!(self, Self::Codec(CodecError::HashMismatch { .. }))
    }
}

/// Decode, verify, and persist one uploaded file into `archive_dir`.
///
/// The payload bytes are only written after their SHA-256 matches the
/// declared digest; an existing artifact of the same name is never
/// overwritten.
pub fn handle_file_payload(
    request: &RequestUpload,
    archive_dir: &Path,
) -> Result<PathBuf, UploadError> {
    let name = &request.file_name;
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
    {
        return Err(UploadError::UnsafeFileName(name.clone()));
    }

    let bytes = motra_codec::decode_and_verify(&request.payload, &request.file_hash)?;

    let destination = archive_dir.join(name);
    if destination.exists() {
        return Err(UploadError::DuplicateArtifact(destination));
    }
    std::fs::write(&destination, bytes)?;

    info!(file = %name, path = %destination.display(), "stored uploaded archive");
    Ok(destination)
}
