//! can-gw — bidirectional CAN-bus gateway core.
//!
//! Applies programmable latency, jitter, loss, and rule-based content
//! manipulation between two CAN interfaces. Run `can-gw --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod run;
mod status;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::GatewayFileConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run => {
            if !cli.config.exists() {
                anyhow::bail!(
                    "config file {:?} not found — run `can-gw init > {:?}` first",
                    cli.config,
                    cli.config
                );
            }
            let config = config::GatewayFileConfig::load(&cli.config)?;
            run::run(config)?;
        }
        Commands::Status => {
            let config = if cli.config.exists() {
                Some(config::GatewayFileConfig::load(&cli.config)?)
            } else {
                None
            };
            let log_path = config
                .map(|c| c.status_log)
                .unwrap_or_else(|| "/var/log/can-gw.jsonl".to_string());
            status::run(&log_path)?;
        }
    }

    Ok(())
}
