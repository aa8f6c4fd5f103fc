// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "motra", version, about = "Measurement testbed orchestration")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "motra.json")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture server.
    Server,
    /// Run one measurement client cycle.
    Client,
    /// Execute a payload descriptor from the current live directory.
    Mexec {
        /// Id of the payload to execute.
        payload_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Server => commands::run_server(&cli.config).await,
        Command::Client => commands::run_client(&cli.config).await,
        Command::Mexec { payload_id } => commands::run_mexec(&payload_id),
    }
}
