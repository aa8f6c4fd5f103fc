// SPDX-License-Identifier: MIT OR Apache-2.0
//! The capture payload descriptor embedded in a `CAPCON` message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broad class of a payload: a measurement capture or an attack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// A measurement capture process.
    #[default]
    Capture,
    /// An attack process running alongside the capture.
    Attack,
}

/// A named command to be executed at a scheduled time on one or more
/// targeted peers as part of a capture configuration.
///
/// `target` is a set of free-form entity identifiers; each peer
/// materialises exactly the payloads whose target set contains its own
/// entity id. It is deliberately not an enum so that new entities can be
/// added to a testbed without a protocol change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenericPayload {
    /// Payload class discriminator.
    #[serde(default)]
    pub payload_type: PayloadKind,
    /// Unique id for the payload; doubles as the scheduler instance id.
    pub payload_id: String,
    /// Entity identifiers that must materialise this payload.
    pub target: Vec<String>,
    /// Setup command, run before the payload itself.
    pub setup: String,
    /// The measurement or attack command to execute.
    pub command: String,
    /// Teardown command, run after the payload finishes.
    pub teardown: String,
    /// Textual description of this payload.
    pub description: String,
    /// Runtime limit in seconds.
    pub limits: u64,
    /// When the payload descriptor was created.
    pub timestamp_utc: DateTime<Utc>,
}

impl GenericPayload {
    /// Returns `true` if this payload must be materialised by `entity`.
    #[must_use]
    pub fn targets(&self, entity: &str) -> bool {
        self.target.iter().any(|t| t == entity)
    }
}
