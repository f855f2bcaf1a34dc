//! `geotrigger` command-line entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use geotrigger::action::ProcessDispatcher;
use geotrigger::config::{AgentConfig, RelayConfig};
use geotrigger::identity::Identity;
use geotrigger::protocol::LocationUpdate;
use geotrigger::relay::RelayServer;
use geotrigger::{daemon, publisher};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "geotrigger")]
#[command(version = VERSION)]
#[command(about = "Authenticated location relay and geofence-driven automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay hub
    Relay {
        /// Relay config file (JSON); environment variables alone also work
        #[arg(long)]
        config: Option<PathBuf>,
        /// Listen address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run the automation agent
    Agent {
        /// Agent config file (JSON)
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        /// Identity file, defaults to the config dir
        #[arg(long)]
        identity: Option<PathBuf>,
    },
    /// Publish one location through the relay
    Publish {
        /// Relay URL (ws://, wss://, http:// or https://)
        #[arg(long)]
        relay_url: String,
        /// Latitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        /// Longitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Sample time (RFC 3339), defaults to now
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
        /// Identity file, defaults to the config dir
        #[arg(long)]
        identity: Option<PathBuf>,
        /// Attach a payload signature to the location frame
        #[arg(long)]
        sign: bool,
    },
    /// Print (creating if needed) a peer identity for the relay allow-list
    Identity {
        /// Role name used for the default identity file
        #[arg(long, default_value = "agent")]
        role: String,
        /// Identity file, overrides the role default
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("GEOTRIGGER_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn identity_path(explicit: Option<PathBuf>, role: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Identity::default_path(role),
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    log::warn!("Failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        log::info!("Shutdown signal received");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Relay { config, bind } => {
            let mut config = RelayConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            let server = RelayServer::bind(&config).await?;

            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            server.run(shutdown).await?;
        }
        Commands::Agent { config, identity } => {
            let config = AgentConfig::load(&config)?;
            let identity = Identity::resolve(&identity_path(identity, "agent")?)?;
            log::info!(
                "Agent public key: {} (fingerprint {})",
                identity.public_key_base64(),
                identity.fingerprint
            );

            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            daemon::run_agent(
                config,
                Arc::new(identity),
                Arc::new(ProcessDispatcher),
                shutdown,
            )
            .await?;
        }
        Commands::Publish {
            relay_url,
            lat,
            lon,
            timestamp,
            identity,
            sign,
        } => {
            let identity = Identity::resolve(&identity_path(identity, "publisher")?)?;
            let update = LocationUpdate {
                latitude: lat,
                longitude: lon,
                timestamp: timestamp.unwrap_or_else(Utc::now),
            };
            publisher::publish_location(&relay_url, &identity, &update, sign).await?;
        }
        Commands::Identity { role, path } => {
            let identity = Identity::resolve(&identity_path(path, &role)?)?;
            println!("Public key:  {}", identity.public_key_base64());
            println!("Fingerprint: {}", identity.fingerprint);
        }
    }

    Ok(())
}
