//! CLI command definitions and dispatch.

mod images;
mod layers;
mod push;

use clap::{Parser, Subcommand};
use kra_core::{LogLevel, PushConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// kra - push local container images to kraud.
#[derive(Parser)]
#[command(name = "kra", version, about)]
pub struct Cli {
    /// Log level (debug, info, warn, error); overrides RUST_LOG and KRA_LOG_LEVEL
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// API endpoint (default: $KRA_API_URL or https://api.kraudcloud.com)
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Push local images to kraud
    Push(push::PushArgs),
    /// Inspect images in the remote catalog
    #[command(subcommand)]
    Images(images::ImagesCommand),
    /// Inspect layers in the remote store
    #[command(subcommand)]
    Layers(layers::LayersCommand),
}

/// Build the push configuration from the environment and global flags.
pub fn load_config(cli: &Cli) -> Result<PushConfig, Box<dyn std::error::Error>> {
    let mut config = PushConfig::from_env()?;
    if let Some(url) = &cli.api_url {
        config.api_url = url.clone();
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;
    Ok(config)
}

/// Log filter: `--log-level`, else `RUST_LOG`, else the configured level.
pub fn log_filter(cli: &Cli, config: &PushConfig) -> EnvFilter {
    let configured = || {
        let level = tracing::Level::from(config.log_level);
        EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
    };
    if cli.log_level.is_some() {
        return configured();
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| configured())
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(
    cli: Cli,
    config: PushConfig,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Push(args) => push::execute(args, config, cancel).await,
        Command::Images(cmd) => images::execute(cmd, config).await,
        Command::Layers(cmd) => layers::execute(cmd, config).await,
    }
}
