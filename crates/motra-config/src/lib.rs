// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client and server configuration for the MOTRA testbed.
//!
//! A configuration file is a JSON document discriminated by its `type`
//! field (`client` or `server`). The core itself only consumes the typed
//! structs; discovery of the file on the host is a collaborator concern.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use motra_capcon::{ClientWorkspace, ServerWorkspace};
use serde::Deserialize;
use std::path::Path;
use tracing::error;

/// Upper bound for `retry_time` and `retry_limit`.
pub const RETRY_BOUND: u32 = 30;

/// Errors produced while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {0}")]
    FileNotFound(String),

    /// The file could not be parsed as a configuration document.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Reading the file failed.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// A retry field lies outside the allowed `[0, 30]` range.
    #[error("{field} = {value} is outside [0, {RETRY_BOUND}]")]
    RetryOutOfRange {
        /// Offending field name.
        field: &'static str,
        /// The rejected value.
        value: u32,
    },

    /// A peer id does not match the MAC-style pattern.
    #[error("invalid peer id {value:?} for {field}")]
    InvalidPeerId {
        /// Offending field name.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The file holds the other peer's configuration kind.
    #[error("config file is a {found} configuration, expected {expected}")]
    WrongKind {
        /// Kind found in the file.
        found: &'static str,
        /// Kind the caller asked for.
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Configuration and retry state for a measurement client.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// MAC-style hardware id; also the payload target entity of this peer.
    pub client_id: String,
    /// WebSocket URL of the server, e.g. `ws://10.0.0.1:12400/motra`.
    pub server_url: String,
    /// Initial reconnect delay in seconds.
    pub retry_time: u32,
    /// Number of reconnect attempts before giving up.
    pub retry_limit: u32,
    /// The `live` / `staging` / `archived` directory triple.
    pub workspace: ClientWorkspace,
}

impl ClientConfig {
    /// Validate field-level invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_time > RETRY_BOUND {
            return Err(ConfigError::RetryOutOfRange {
                field: "retry_time",
                value: self.retry_time,
            });
        }
        if self.retry_limit > RETRY_BOUND {
            return Err(ConfigError::RetryOutOfRange {
                field: "retry_limit",
                value: self.retry_limit,
            });
        }
        if !motra_protocol::is_valid_peer_id(&self.client_id) {
            return Err(ConfigError::InvalidPeerId {
                field: "client_id",
                value: self.client_id.clone(),
            });
        }
        Ok(())
    }

    /// Fresh backoff state for one client lifetime.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_time, self.retry_limit)
    }
}

/// Linear reconnect backoff: each call returns the current delay and
/// raises it by two seconds, until the retry budget is spent.
#[derive(Clone, Debug)]
pub struct Backoff {
    delay_secs: u64,
    retries: u32,
    limit: u32,
}

/// The retry budget is exhausted; the client process must stop.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("reached the configured limit of {limit} retries")]
pub struct BackoffExhausted {
    /// The configured retry limit.
    pub limit: u32,
}

impl Backoff {
    /// Start a backoff schedule at `retry_time` with `retry_limit`
    /// attempts.
    #[must_use]
    pub fn new(retry_time: u32, retry_limit: u32) -> Self {
        Self {
            delay_secs: u64::from(retry_time),
            retries: 0,
            limit: retry_limit,
        }
    }

    /// The delay to wait before the next connection attempt.
    ///
    /// Side effects: the stored delay grows by 2 s and the retry count by
    /// one. Once the count reaches the limit the budget is exhausted.
    pub fn next(&mut self) -> Result<u64, BackoffExhausted> {
        if self.retries >= self.limit {
            error!(limit = self.limit, "reached configured retries, stopping the client");
            return Err(BackoffExhausted { limit: self.limit });
        }
        let tick = self.delay_secs;
        self.delay_secs += 2;
        self.retries += 1;
        Ok(tick)
    }

    /// Connection attempts performed so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Configuration for the capture server.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// MAC-style hardware id announced in `SERVER_HELLO`.
    pub server_id: String,
    /// Socket address to bind, e.g. `0.0.0.0:12400`.
    pub bind: String,
    /// The `live` / `archive` / `tests` directory triple.
    pub workspace: ServerWorkspace,
}

impl ServerConfig {
    /// Validate field-level invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !motra_protocol::is_valid_peer_id(&self.server_id) {
            return Err(ConfigError::InvalidPeerId {
                field: "server_id",
                value: self.server_id.clone(),
            });
        }
        Ok(())
    }
}

/// The entity name the server matches against payload targets.
pub const SERVER_ENTITY: &str = "server";

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// A configuration document, discriminated by its `type` field.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigFile {
    /// A client configuration.
    Client(ClientConfig),
    /// A server configuration.
    Server(ServerConfig),
}

impl ConfigFile {
    /// Load and validate a configuration document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        match &config {
            Self::Client(client) => client.validate()?,
            Self::Server(server) => server.validate()?,
        }
        Ok(config)
    }

    /// Unwrap a client configuration or fail with [`ConfigError::WrongKind`].
    pub fn into_client(self) -> Result<ClientConfig, ConfigError> {
        match self {
            Self::Client(client) => Ok(client),
            Self::Server(_) => Err(ConfigError::WrongKind {
                found: "server",
                expected: "client",
            }),
        }
    }

    /// Unwrap a server configuration or fail with [`ConfigError::WrongKind`].
    pub fn into_server(self) -> Result<ServerConfig, ConfigError> {
        match self {
            Self::Server(server) => Ok(server),
            Self::Client(_) => Err(ConfigError::WrongKind {
                found: "client",
                expected: "server",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_by_two_per_call() {
        let mut backoff = Backoff::new(1, 3);
        assert_eq!(backoff.next().unwrap(), 1);
        assert_eq!(backoff.next().unwrap(), 3);
        assert_eq!(backoff.next().unwrap(), 5);
        assert_eq!(backoff.next(), Err(BackoffExhausted { limit: 3 }));
        assert_eq!(backoff.retries(), 3);
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing() {
        let mut backoff = Backoff::new(0, 30);
        let mut previous = 0;
        while let Ok(delay) = backoff.next() {
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn zero_retry_limit_exhausts_immediately() {
        let mut backoff = Backoff::new(5, 0);
        assert!(backoff.next().is_err());
    }

    #[test]
    fn client_config_rejects_out_of_range_retries() {
        let config = ClientConfig {
            client_id: "00:11:22:aa:bb:cc".into(),
            server_url: "ws://127.0.0.1:12400/motra".into(),
            retry_time: 31,
            retry_limit: 3,
            workspace: motra_capcon::ClientWorkspace {
                live: "live".into(),
                staging: "staging".into(),
                archived: "archived".into(),
            },
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetryOutOfRange {
                field: "retry_time",
                value: 31
            })
        ));
    }

    #[test]
    fn config_file_discriminates_on_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motra.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "type": "client",
                "client_id": "00:11:22:aa:bb:cc",
                "server_url": "ws://127.0.0.1:12400/motra",
                "retry_time": 1,
                "retry_limit": 3,
                "workspace": {
                    "live": "live",
                    "staging": "staging",
                    "archived": "archived",
                },
            })
            .to_string(),
        )
        .unwrap();

        let config = ConfigFile::load(&path).unwrap().into_client().unwrap();
        assert_eq!(config.client_id, "00:11:22:aa:bb:cc");
        assert!(
            ConfigFile::load(&path)
                .unwrap()
                .into_server()
                .is_err()
        );
    }

    #[test]
    fn server_config_parses_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motra.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "type": "server",
                "server_id": "00:11:22:aa:bb:cd",
                "bind": "127.0.0.1:12400",
                "workspace": {
                    "live": "live",
                    "archive": "archive",
                    "tests": "tests",
                },
            })
            .to_string(),
        )
        .unwrap();

        let config = ConfigFile::load(&path).unwrap().into_server().unwrap();
        assert_eq!(config.bind, "127.0.0.1:12400");
    }

    #[test]
    fn unknown_discriminator_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motra.json");
        std::fs::write(&path, r#"{"type": "relay"}"#).unwrap();
        assert!(matches!(
            ConfigFile::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            ConfigFile::load(Path::new("/nonexistent/motra.json")),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
