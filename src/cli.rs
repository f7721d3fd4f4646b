//! CLI definitions for can-gw.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "can-gw",
    version,
    about = "Bidirectional CAN-bus gateway — delay, jitter, loss, and rule-based manipulation between two interfaces",
    long_about = None
)]
pub struct Cli {
    /// Path to gateway.toml config file
    #[clap(long, short, default_value = "gateway.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway to completion (Ctrl-C to stop)
    Run,

    /// Print an example gateway.toml to stdout
    Init,

    /// Show the most recent status snapshot from the running daemon
    Status,
}
