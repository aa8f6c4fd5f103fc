// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subcommand implementations for the `motra` binary.

use anyhow::{Context, Result, anyhow, bail};
use motra_client::{MeasurementClient, SessionOutcome};
use motra_config::ConfigFile;
use motra_queue::CapConQueue;
use motra_schedule::SystemdScheduler;
use motra_server::{AppState, build_app};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Run the capture server until terminated.
pub async fn run_server(config_path: &Path) -> Result<()> {
    let config = ConfigFile::load(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?
        .into_server()?;
    config.workspace.ensure_dirs()?;

    let queue =
        CapConQueue::scan(&config.workspace.tests).context("server startup aborted")?;
    info!(pending = queue.len(), "capture configurations loaded");

    let bind = config.bind.clone();
    let state = Arc::new(AppState {
        config,
        queue: Mutex::new(queue),
        scheduler: Arc::new(SystemdScheduler),
    });

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "motra server listening");

    axum::serve(listener, build_app(state)).await.context("serve")
}

/// Run one client cycle: drain uploads, install the next configuration,
/// go offline.
pub async fn run_client(config_path: &Path) -> Result<()> {
    let config = ConfigFile::load(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?
        .into_client()?;
    config.workspace.ensure_dirs()?;

    let client = MeasurementClient::new(config, Arc::new(SystemdScheduler));

    tokio::select! {
        outcome = client.run() => match outcome? {
            SessionOutcome::Drained => {
                info!("no more capture configurations, shutting down");
                Ok(())
            }
            SessionOutcome::Scheduled { capcon_id } => {
                info!(capcon = %capcon_id, "capture scheduled, going offline");
                Ok(())
            }
        },
        _ = tokio::signal::ctrl_c() => {
            bail!("interrupted, closing connection")
        }
    }
}

/// Load `<payload_id>.json` from the current directory and replace this
/// process with the payload's command.
pub fn run_mexec(payload_id: &str) -> Result<()> {
    let workspace = std::env::current_dir()?;
    let descriptor = workspace.join(format!("{payload_id}.json"));
    if !descriptor.is_file() {
        bail!(
            "configuration for {payload_id} does not exist in {}",
            workspace.display()
        );
    }

    let payload = motra_capcon::load_payload(&descriptor)?;
    info!(payload = %payload.payload_id, command = %payload.command, "executing payload");

    let mut parts = payload.command.split_ascii_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow!("payload {payload_id} has an empty command"))?;
    let args: Vec<&str> = parts.collect();

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        // exec only returns on failure.
        let err = std::process::Command::new(program).args(&args).exec();
        Err(err).with_context(|| format!("exec {program}"))
    }
    #[cfg(not(unix))]
    {
        let _ = (program, args);
        bail!("mexec requires a unix host")
    }
}
