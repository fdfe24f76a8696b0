//! Main entry point for fanbridge

use anyhow::Context;
use clap::Parser;
use fanbridge::{
    args::{Args, Commands},
    client::{self, FanBridgeClient},
    config::BridgeConfig,
    daemon::FanBridgeDaemon,
    logging::{self, LogTarget},
    FanBridge,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(BridgeConfig::get_config_path);

    let command = match args.command {
        Commands::Config { command } => {
            logging::setup(logging::resolve_level(args.verbose, None), LogTarget::Stderr)?;
            return client::handle_config(command, &config_path)
                .with_context(|| format!("config {}", config_path.display()));
        }
        command => command,
    };

    let mut config = BridgeConfig::load_or_init(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.apply_env_overrides();

    let target = if matches!(command, Commands::Daemon) {
        LogTarget::Stdout
    } else {
        LogTarget::Stderr
    };
    logging::setup(logging::resolve_level(args.verbose, config.log_level.as_deref()), target)?;

    let bridge = Arc::new(FanBridge::from_config(config).context("starting fanbridge")?);

    match command {
        Commands::Daemon => {
            // Print version and build metadata for binary identity verification
            log::info!(
                "fanbridge v{} (git {} / {}) built {}",
                env!("CARGO_PKG_VERSION"),
                option_env!("GIT_HASH").unwrap_or("unknown"),
                option_env!("GIT_DESC").unwrap_or("unknown"),
                option_env!("BUILD_TIME").unwrap_or("unknown")
            );
            FanBridgeDaemon::new(bridge, config_path).run().await?;
        }
        command => {
            // serial exchanges block, keep them off the async workers
            tokio::task::spawn_blocking(move || {
                let client = FanBridgeClient::new(&bridge);
                match command {
                    Commands::Status => client.status(),
                    Commands::Serial { command } => client.handle_serial(command),
                    Commands::Daemon | Commands::Config { .. } => Ok(()),
                }
            })
            .await??;
        }
    }

    Ok(())
}
