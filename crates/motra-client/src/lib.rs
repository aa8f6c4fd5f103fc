// SPDX-License-Identifier: MIT OR Apache-2.0
//! The measurement client: a six-state protocol driver over one
//! WebSocket connection.
//!
//! A client lifetime is one pass through the protocol: connect and greet,
//! archive and drain any leftover captures, receive the next capture
//! configuration, install the scheduler jobs, and drop offline. The
//! respawn after the measurement window is owned by the local timer
//! daemon, not by this process.

#![deny(unsafe_code)]

mod connection;
mod machine;
mod state;

pub use connection::{ClientConnection, ConnectionError};
pub use machine::{ClientError, MeasurementClient, SessionOutcome};
pub use state::{ClientEvent, ClientState};
