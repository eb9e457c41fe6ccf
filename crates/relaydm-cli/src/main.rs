//! relaydm - encrypted direct messages over relays

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaydm_cli::{
    cli::Cli,
    commands::CommandDispatcher,
    config::AppConfig,
};
use relaydm_nostr::PoolConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .or_else(AppConfig::default_config_path);
    let mut config = load_configuration(config_path.as_ref())?;
    apply_overrides(&cli, &mut config);

    if let Err(e) = CommandDispatcher::execute(cli.command, config, config_path).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Setup logging; `RUST_LOG` takes precedence over `--verbose`
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) if path.exists() => {
            info!("Loading configuration from: {}", path.display());
            AppConfig::load_from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))
        }
        _ => {
            info!("Using default configuration");
            Ok(AppConfig::default())
        }
    }
}

fn apply_overrides(cli: &Cli, config: &mut AppConfig) {
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = Some(data_dir.into());
    }
    if cli.local_relay {
        config.relays = PoolConfig::local_development().relays;
    }
    config.override_relays(&cli.relays);
}
