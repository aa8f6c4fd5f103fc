// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-disk capture configuration layout for MOTRA peers.
//!
//! A client workspace is three sibling directories: `live/` holds the
//! active capcon and its payload descriptors, `staging/` the zipped
//! archives awaiting upload, `archived/` the uploads the server has
//! acknowledged. The server keeps the same shape with `live/`, `archive/`
//! (received uploads) and `tests/` (the queue source).
//!
//! `live/capcon.json` and the per-payload descriptors are write-once per
//! cycle: an existing file is never overwritten. A single process owns its
//! workspace, so no locking is involved.

#![deny(unsafe_code)]

use motra_protocol::{CapCon, GenericPayload, ProtocolError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the active capture configuration inside `live/`.
pub const CAPCON_FILE: &str = "capcon.json";

/// Errors produced by workspace persistence.
#[derive(Debug, thiserror::Error)]
pub enum CapConError {
    /// A write-once file already exists; the cycle is inconsistent.
    #[error("refusing to overwrite existing configuration {0}")]
    AlreadyExists(PathBuf),

    /// An underlying filesystem operation failed.
    #[error("workspace io error on {path}: {source}")]
    Io {
        /// File or directory the operation touched.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// A stored document failed to parse.
    #[error("invalid stored document {path}: {source}")]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// Validation failure detail.
        source: ProtocolError,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CapConError + '_ {
    move |source| CapConError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Workspace layouts
// ---------------------------------------------------------------------------

/// The three directories of a client workspace.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ClientWorkspace {
    /// Active capture configuration and payload descriptors.
    pub live: PathBuf,
    /// Zipped archives awaiting upload.
    pub staging: PathBuf,
    /// Successfully uploaded archives.
    pub archived: PathBuf,
}

impl ClientWorkspace {
    /// Create all three directories if they are missing.
    pub fn ensure_dirs(&self) -> Result<(), CapConError> {
        for dir in [&self.live, &self.staging, &self.archived] {
            std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        Ok(())
    }

    /// Files pending upload under `staging/`, sorted by name.
    pub fn pending_uploads(&self) -> Result<Vec<PathBuf>, CapConError> {
        let mut pending = Vec::new();
        for entry in std::fs::read_dir(&self.staging).map_err(io_err(&self.staging))? {
            let entry = entry.map_err(io_err(&self.staging))?;
            if entry.path().is_file() {
                pending.push(entry.path());
            }
        }
        pending.sort();
        Ok(pending)
    }

    /// Retire an acknowledged upload: move it from `staging/` to
    /// `archived/`.
    pub fn retire_upload(&self, file_name: &str) -> Result<PathBuf, CapConError> {
        let source = self.staging.join(file_name);
        let destination = self.archived.join(file_name);
        std::fs::rename(&source, &destination).map_err(io_err(&source))?;
        debug!(file = file_name, "moved acknowledged upload to archived");
        Ok(destination)
    }
}

/// The server-side workspace directories.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ServerWorkspace {
    /// Active payload descriptors for the current run.
    pub live: PathBuf,
    /// Received client uploads.
    pub archive: PathBuf,
    /// Capture configuration documents scanned into the queue.
    pub tests: PathBuf,
}

impl ServerWorkspace {
    /// Create all three directories if they are missing.
    pub fn ensure_dirs(&self) -> Result<(), CapConError> {
        for dir in [&self.live, &self.archive, &self.tests] {
            std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Load the active capture configuration from `live/`, if one exists.
pub fn load_capcon(live: &Path) -> Result<Option<CapCon>, CapConError> {
    let path = live.join(CAPCON_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).map_err(io_err(&path))?;
    let capcon = CapCon::from_document(&raw).map_err(|source| CapConError::Parse {
        path: path.clone(),
        source,
    })?;
    info!(capcon = %capcon.capcon_id, "found existing capture configuration");
    Ok(Some(capcon))
}

/// Persist the active capture configuration into `live/`.
///
/// Write-once: an existing `capcon.json` is a fatal inconsistency. An
/// empty marker file named after the `CapConID` is touched next to it so
/// the later archive identifies the run it came from.
pub fn write_capcon(live: &Path, capcon: &CapCon) -> Result<(), CapConError> {
    let path = live.join(CAPCON_FILE);
    if path.is_file() {
        return Err(CapConError::AlreadyExists(path));
    }

    let marker = live.join(&capcon.capcon_id);
    std::fs::write(&marker, b"").map_err(io_err(&marker))?;

    let document = serde_json::to_string_pretty(&motra_protocol::Message::CapCon(capcon.clone()))
        .map_err(|e| CapConError::Parse {
            path: path.clone(),
            source: ProtocolError::Frame(e),
        })?;
    std::fs::write(&path, document).map_err(io_err(&path))?;
    debug!(capcon = %capcon.capcon_id, path = %path.display(), "stored capture configuration");
    Ok(())
}

/// Persist one payload descriptor, write-once.
pub fn write_payload(path: &Path, payload: &GenericPayload) -> Result<(), CapConError> {
    if path.is_file() {
        return Err(CapConError::AlreadyExists(path.to_path_buf()));
    }
    let document = serde_json::to_string_pretty(payload).map_err(|e| CapConError::Parse {
        path: path.to_path_buf(),
        source: ProtocolError::Frame(e),
    })?;
    std::fs::write(path, document).map_err(io_err(path))?;
    debug!(payload = %payload.payload_id, path = %path.display(), "stored payload descriptor");
    Ok(())
}

/// Load one payload descriptor from disk.
pub fn load_payload(path: &Path) -> Result<GenericPayload, CapConError> {
    let raw = std::fs::read_to_string(path).map_err(io_err(path))?;
    serde_json::from_str(&raw).map_err(|e| CapConError::Parse {
        path: path.to_path_buf(),
        source: ProtocolError::Frame(e),
    })
}
