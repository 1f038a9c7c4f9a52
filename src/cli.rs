//! CLI surface: `dockbridge start|stop|status`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "dockbridge", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML config file (default: ~/.dockbridge/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay and remote-host supervisor.
    Start(StartParams),
    /// Ask a running instance to shut down.
    Stop,
    /// Report the running instance's connection state and time to shutdown.
    Status,
}

#[derive(Parser, Debug)]
pub struct StartParams {
    /// Override the local Unix socket path.
    #[arg(long)]
    pub socket_path: Option<PathBuf>,

    /// Override the cloud API token (normally from config or
    /// `DOCKBRIDGE_API_TOKEN`).
    #[arg(long, env = "DOCKBRIDGE_API_TOKEN")]
    pub api_token: Option<String>,

    /// Override the provisioned server type.
    #[arg(long)]
    pub server_type: Option<String>,

    /// Override the provisioning location.
    #[arg(long)]
    pub location: Option<String>,

    /// Accepted for compatibility with process supervisors that pass it;
    /// this binary never daemonizes, so it is a no-op.
    #[arg(long)]
    pub foreground: bool,
}
