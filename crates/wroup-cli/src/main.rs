//! Wroup CLI — host, browse for, and join ad-hoc groups.
//!
//! Groups are advertised and found over mDNS; members talk to the group
//! owner over TCP.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = wroup_types::config::load_config(cli.config.as_deref());
    let rt = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;

    rt.block_on(async move {
        match cli.command {
            Commands::Host { group, attrs } => cmd::host(config, &group, attrs).await,
            Commands::Browse { timeout_ms } => cmd::browse(config, timeout_ms).await,
            Commands::Join { addr } => cmd::join(config, addr).await,
        }
    })
}
