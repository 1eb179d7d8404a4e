//! CLI entry point for soil-relay
//!
//! # Usage
//!
//! Run the relay with the default configuration file:
//! ```bash
//! soil-relay run
//! ```
//!
//! Check a configuration without opening any device:
//! ```bash
//! soil-relay --config config/relay.toml check-config
//! ```
//!
//! Feed a recorded RocketLogger export into a running relay:
//! ```bash
//! soil-relay replay --socket /tmp/rlstream.socket data/rl_export.csv
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soil_relay::config::{RelayConfig, DEFAULT_CONFIG_PATH};
use soil_relay::dispatch::TransportDispatcher;
use soil_relay::replay::{self, ReplayOptions, DEFAULT_CHUNK_BYTES};
use soil_relay::{logging, Relay};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "soil-relay")]
#[command(about = "Correlates RocketLogger and TEROS streams and relays per-cycle averages", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind both stream sockets and relay cycles until a fatal error
    Run {
        /// Override `streams.logger_socket`
        #[arg(long)]
        logger_socket: Option<PathBuf>,

        /// Override `streams.soil_socket`
        #[arg(long)]
        soil_socket: Option<PathBuf>,
    },

    /// Load and validate the configuration, then print the effective values
    CheckConfig,

    /// Stream a recorded file into a relay socket
    Replay {
        /// File to replay
        file: PathBuf,

        /// Socket to connect to
        #[arg(long)]
        socket: PathBuf,

        /// Bytes per write
        #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
        chunk_size: usize,

        /// Pause after each write, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            logger_socket,
            soil_socket,
        } => run(cli.config, logger_socket, soil_socket).await,
        Commands::CheckConfig => check_config(cli.config),
        Commands::Replay {
            file,
            socket,
            chunk_size,
            delay_ms,
        } => {
            let options = ReplayOptions {
                chunk_bytes: chunk_size,
                delay: Duration::from_millis(delay_ms),
            };
            replay_once(cli.config, file, socket, options).await
        }
    }
}

fn load(path: &Path) -> Result<RelayConfig> {
    RelayConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn run(
    path: PathBuf,
    logger_socket: Option<PathBuf>,
    soil_socket: Option<PathBuf>,
) -> Result<()> {
    let mut config = load(&path)?;
    if let Some(socket) = logger_socket {
        config.streams.logger_socket = socket;
    }
    if let Some(socket) = soil_socket {
        config.streams.soil_socket = socket;
    }
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(name = %config.application.name, config = %path.display(), "starting");

    let dispatcher = TransportDispatcher::connect(&config.transport)
        .await
        .context("Failed to open transport")?;
    let mut relay = Relay::bind(&config, dispatcher)?;

    tokio::select! {
        result = relay.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    config.validate()?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{rendered}");
    println!("# configuration OK ({})", path.display());
    Ok(())
}

async fn replay_once(
    path: PathBuf,
    file: PathBuf,
    socket: PathBuf,
    options: ReplayOptions,
) -> Result<()> {
    let config = RelayConfig::load_from(&path).unwrap_or_default();
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    let written = replay::replay_file(&file, &socket, options).await?;
    info!(bytes = written, "done");
    Ok(())
}
