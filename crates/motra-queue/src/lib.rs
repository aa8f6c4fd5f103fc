// SPDX-License-Identifier: MIT OR Apache-2.0
//! The server's capture configuration queue.
//!
//! Populated exactly once at startup by scanning a configured directory
//! for `*.json` capcon documents. Startup aborts if two documents share a
//! `CapConID`; afterwards the queue only shrinks — `peek` answers a
//! `REQUEST_CAPCON` and `pop` retires the entry once the response has been
//! sent.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use motra_protocol::{CapCon, ProtocolError};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Errors produced while populating the queue at startup.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The configured directory could not be read.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// Directory being scanned.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// A capcon document failed to parse or validate.
    #[error("invalid capcon document {path}: {source}")]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// Validation failure detail.
        source: ProtocolError,
    },

    /// Two documents carry the same `CapConID`; the server must not start.
    #[error("duplicate CapConID {id:?} in {path}")]
    DuplicateCapCon {
        /// The duplicated id.
        id: String,
        /// The second file carrying it.
        path: PathBuf,
    },
}

/// An ordered queue of pending capture configurations.
#[derive(Debug, Default)]
pub struct CapConQueue {
    entries: VecDeque<CapCon>,
}

impl CapConQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` for `*.json` capcon documents.
    ///
    /// Files are loaded in filename order so the queue is deterministic
    /// across hosts. Every `CapConID` must be unique across the scanned
    /// set.
    pub fn scan(dir: &Path) -> Result<Self, QueueError> {
        let read_dir = std::fs::read_dir(dir).map_err(|source| QueueError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| QueueError::Scan {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") && path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut entries = VecDeque::with_capacity(files.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(files.len());
        for path in files {
            let raw = std::fs::read_to_string(&path).map_err(|source| QueueError::Scan {
                path: path.clone(),
                source,
            })?;
            let capcon = CapCon::from_document(&raw).map_err(|source| QueueError::Parse {
                path: path.clone(),
                source,
            })?;
            if !seen.insert(capcon.capcon_id.clone()) {
                return Err(QueueError::DuplicateCapCon {
                    id: capcon.capcon_id,
                    path,
                });
            }
            debug!(capcon = %capcon.capcon_id, file = %path.display(), "queued capture configuration");
            entries.push_back(capcon);
        }

        info!(pending = entries.len(), dir = %dir.display(), "capture configuration queue loaded");
        Ok(Self { entries })
    }

    /// The configuration a `REQUEST_CAPCON` would receive, if any.
    #[must_use]
    pub fn peek(&self) -> Option<&CapCon> {
        self.entries.front()
    }

    /// Retire the head entry after its response has been sent.
    pub fn pop(&mut self) -> Option<CapCon> {
        self.entries.pop_front()
    }

    /// Number of pending configurations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no configurations are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_capcon(dir: &Path, file: &str, id: &str) {
        let document = serde_json::json!({
            "message_type": "CAPCON",
            "timestamp_utc": "2026-01-01T00:00:00Z",
            "CapConID": id,
            "description": format!("capcon {id}"),
            "duration": 5,
        });
        std::fs::write(dir.join(file), document.to_string()).unwrap();
    }

    #[test]
    fn scan_orders_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        write_capcon(dir.path(), "b.json", "second");
        write_capcon(dir.path(), "a.json", "first");
        write_capcon(dir.path(), "c.json", "third");

        let mut queue = CapConQueue::scan(dir.path()).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().capcon_id, "first");
        assert_eq!(queue.pop().unwrap().capcon_id, "second");
        assert_eq!(queue.pop().unwrap().capcon_id, "third");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn scan_ignores_non_json_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_capcon(dir.path(), "a.json", "only");
        std::fs::write(dir.path().join("notes.txt"), "not a capcon").unwrap();
        std::fs::create_dir(dir.path().join("sub.json")).unwrap();

        let queue = CapConQueue::scan(dir.path()).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn duplicate_ids_abort_startup() {
        let dir = tempfile::tempdir().unwrap();
        write_capcon(dir.path(), "a.json", "t1");
        write_capcon(dir.path(), "b.json", "t1");

        match CapConQueue::scan(dir.path()) {
            Err(QueueError::DuplicateCapCon { id, .. }) => assert_eq!(id, "t1"),
            other => panic!("expected DuplicateCapCon, got {other:?}"),
        }
    }

    #[test]
    fn invalid_document_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{\"duration\": []}").unwrap();
        assert!(matches!(
            CapConQueue::scan(dir.path()),
            Err(QueueError::Parse { .. })
        ));
    }

    #[test]
    fn peek_does_not_consume() {
        let dir = tempfile::tempdir().unwrap();
        write_capcon(dir.path(), "a.json", "t1");
        let mut queue = CapConQueue::scan(dir.path()).unwrap();
        assert_eq!(queue.peek().unwrap().capcon_id, "t1");
        assert_eq!(queue.peek().unwrap().capcon_id, "t1");
        assert_eq!(queue.pop().unwrap().capcon_id, "t1");
        assert!(queue.peek().is_none());
    }
}
