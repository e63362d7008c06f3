//! CLI definitions for `lbard`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "lbard",
    version,
    about = "Low-Bandwidth Asynchronous Rhizome Demonstrator\n\nSyncs a Rhizome bundle store with nearby nodes over HF/ALE and other declarative radio transports.",
    long_about = None
)]
pub struct Cli {
    /// Path to lbard.toml config file
    #[clap(long, short, default_value = "lbard.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler loop: pull Rhizome, service the radio, push
    /// completed bundles back. Does not return under normal operation.
    Run,

    /// Print an example lbard.toml to stdout
    Init,

    /// Show the time-accounting watchdog tables and recent debug-log
    /// activity for a running (or previously run) instance
    Status,

    /// Manage the lbard systemd service
    Service {
        #[clap(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
pub enum ServiceAction {
    /// Install and start the systemd unit
    Install,
    /// Stop, disable, and remove the systemd unit
    Uninstall,
    Start,
    Stop,
    Restart,
}
