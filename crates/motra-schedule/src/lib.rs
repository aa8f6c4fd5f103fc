// SPDX-License-Identifier: MIT OR Apache-2.0
//! One-shot timer job submissions for the MOTRA scheduler bridge.
//!
//! The protocol core never runs a payload itself. At handoff time each
//! peer materialises a set of [`JobSubmission`]s — "at *now + delta*,
//! start the installed unit `<type>[@]<instance>`" — and pushes them into
//! the local timer daemon via `systemd-run`. Submission happens after the
//! protocol has committed, so failures are logged and never propagated.

#![deny(unsafe_code)]

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Default timer accuracy for every submission.
pub const DEFAULT_ACCURACY: &str = "10ms";

/// Fixed start delta for per-payload mexec units.
pub const MEXEC_START_DELTA: &str = "3s";

/// Errors produced while building a job submission.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The unit identifier is not one of the four installable units.
    #[error("unknown unit type: {0}")]
    UnknownUnitType(String),
}

// ---------------------------------------------------------------------------
// Unit kinds
// ---------------------------------------------------------------------------

/// The closed set of installable unit templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// The measurement client itself (respawn unit).
    Client,
    /// A per-payload executor on the client.
    ClientMexec,
    /// A per-payload executor on the server.
    ServerMexec,
    /// The server process.
    Server,
}

impl UnitKind {
    /// The installed unit name this kind refers to.
    #[must_use]
    pub fn unit_name(&self) -> &'static str {
        match self {
            Self::Client => "motra-client",
            Self::ClientMexec => "motra-client-mexec",
            Self::ServerMexec => "motra-server-mexec",
            Self::Server => "motra-server",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.unit_name())
    }
}

impl FromStr for UnitKind {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "motra-client" => Ok(Self::Client),
            "motra-client-mexec" => Ok(Self::ClientMexec),
            "motra-server-mexec" => Ok(Self::ServerMexec),
            "motra-server" => Ok(Self::Server),
            other => Err(ScheduleError::UnknownUnitType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Submissions
// ---------------------------------------------------------------------------

/// A single one-shot, timer-triggered job submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSubmission {
    /// Which installed unit to trigger.
    pub unit: UnitKind,
    /// Per-test instance suffix for template units.
    pub instance_id: String,
    /// Relative start time, e.g. `"3s"` or `"2m"`.
    pub start_delta: String,
    /// Timer accuracy, e.g. `"10ms"`.
    pub accuracy: String,
    /// Insert the `@` template separator between unit and instance.
    pub template: bool,
}

impl JobSubmission {
    /// Build a template-unit submission with the default accuracy.
    #[must_use]
    pub fn new(unit: UnitKind, instance_id: impl Into<String>, start_delta: impl Into<String>) -> Self {
        Self {
            unit,
            instance_id: instance_id.into(),
            start_delta: start_delta.into(),
            accuracy: DEFAULT_ACCURACY.into(),
            template: true,
        }
    }

    /// The full unit instance name, e.g. `motra-client@t1.service`.
    #[must_use]
    pub fn unit_instance(&self) -> String {
        let separator = if self.template { "@" } else { "" };
        format!("{}{}{}.service", self.unit.unit_name(), separator, self.instance_id)
    }

    /// Materialise the platform command line for this submission.
    #[must_use]
    pub fn materialise(&self) -> Vec<String> {
        vec![
            "sudo".into(),
            "systemd-run".into(),
            format!("--on-active={}", self.start_delta),
            "--unit".into(),
            self.unit_instance(),
            "--timer-property".into(),
            format!("AccuracySec={}", self.accuracy),
        ]
    }
}

// ---------------------------------------------------------------------------
// Schedulers
// ---------------------------------------------------------------------------

/// The seam between the protocol core and the local timer daemon.
///
/// Submission runs after the protocol has committed; implementations log
/// failures and never surface them into the protocol.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit one job to the local timer daemon.
    async fn submit(&self, submission: &JobSubmission);
}

/// Production scheduler: shells out to `systemd-run` synchronously,
/// captures stdout/stderr, and logs a non-zero exit as a warning.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemdScheduler;

#[async_trait]
impl JobScheduler for SystemdScheduler {
    async fn submit(&self, submission: &JobSubmission) {
        let argv = submission.materialise();
        info!(unit = %submission.unit_instance(), delta = %submission.start_delta, "submitting scheduler job");

        let output = Command::new(&argv[0]).args(&argv[1..]).output().await;
        match output {
            Ok(output) if output.status.success() => {
                log_streams(&output.stdout, &output.stderr, false);
            }
            Ok(output) => {
                warn!(
                    unit = %submission.unit_instance(),
                    code = ?output.status.code(),
                    "scheduler submission exited non-zero"
                );
                log_streams(&output.stdout, &output.stderr, true);
            }
            Err(e) => {
                error!(unit = %submission.unit_instance(), error = %e, "failed to spawn scheduler submission");
            }
        }
    }
}

fn log_streams(stdout: &[u8], stderr: &[u8], failed: bool) {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if !stdout.trim().is_empty() {
        if failed {
            warn!(target: "motra_schedule.stdout", "{}", stdout.trim_end());
        } else {
            info!(target: "motra_schedule.stdout", "{}", stdout.trim_end());
        }
    }
    if !stderr.trim().is_empty() {
        if failed {
            warn!(target: "motra_schedule.stderr", "{}", stderr.trim_end());
        } else {
            info!(target: "motra_schedule.stderr", "{}", stderr.trim_end());
        }
    }
}

/// Test scheduler that records submissions instead of running them.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    submitted: Mutex<Vec<JobSubmission>>,
}

impl RecordingScheduler {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything submitted so far, in submission order.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobSubmission> {
        self.submitted.lock().expect("recorder lock").clone()
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    async fn submit(&self, submission: &JobSubmission) {
        self.submitted
            .lock()
            .expect("recorder lock")
            .push(submission.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialise_produces_systemd_run_argv() {
        let job = JobSubmission::new(UnitKind::Client, "t1", "5s");
        assert_eq!(
            job.materialise(),
            [
                "sudo",
                "systemd-run",
                "--on-active=5s",
                "--unit",
                "motra-client@t1.service",
                "--timer-property",
                "AccuracySec=10ms",
            ]
        );
    }

    #[test]
    fn non_template_unit_omits_separator() {
        let job = JobSubmission {
            unit: UnitKind::Server,
            instance_id: String::new(),
            start_delta: "2m".into(),
            accuracy: "1s".into(),
            template: false,
        };
        assert_eq!(job.unit_instance(), "motra-server.service");
        assert_eq!(job.materialise()[2], "--on-active=2m");
        assert_eq!(job.materialise()[6], "AccuracySec=1s");
    }

    #[test]
    fn unit_kind_parses_the_closed_set() {
        assert_eq!("motra-client".parse::<UnitKind>().unwrap(), UnitKind::Client);
        assert_eq!(
            "motra-client-mexec".parse::<UnitKind>().unwrap(),
            UnitKind::ClientMexec
        );
        assert_eq!(
            "motra-server-mexec".parse::<UnitKind>().unwrap(),
            UnitKind::ServerMexec
        );
        assert_eq!("motra-server".parse::<UnitKind>().unwrap(), UnitKind::Server);
    }

    #[test]
    fn unknown_unit_type_is_rejected() {
        match "motra-reactor".parse::<UnitKind>() {
            Err(ScheduleError::UnknownUnitType(name)) => assert_eq!(name, "motra-reactor"),
            other => panic!("expected UnknownUnitType, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recorder_preserves_submission_order() {
        let recorder = RecordingScheduler::new();
        let first = JobSubmission::new(UnitKind::Client, "t1", "5s");
        let second = JobSubmission::new(UnitKind::ClientMexec, "p1", MEXEC_START_DELTA);
        recorder.submit(&first).await;
        recorder.submit(&second).await;
        assert_eq!(recorder.submitted(), vec![first, second]);
    }
}
