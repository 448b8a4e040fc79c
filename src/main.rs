use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracon::commands;
use tracon::sim::EngineConfig;

#[derive(Parser)]
#[command(name = "tracon", version, about = "Training-simulation network for ATC practice")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connection broker
    Hub {
        #[arg(long, default_value = "0.0.0.0")]
        interface: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Boundaries file served read-only to clients
        #[arg(long)]
        boundaries: Option<PathBuf>,
        /// Directory of topology shape files, served as one bundle
        #[arg(long)]
        topologies: Option<PathBuf>,
        /// OSM PBF extract served read-only to clients
        #[arg(long)]
        geos: Option<PathBuf>,
    },
    /// Run a simulation server attached to a hub
    Serve {
        /// Hub base URL
        #[arg(long, default_value = "ws://127.0.0.1:8000")]
        hub: String,
        /// Human name published in the hub's server directory
        #[arg(long)]
        name: String,
        /// Directory scanned for plugin modules (repeatable)
        #[arg(long = "plugin-dir")]
        plugin_dirs: Vec<PathBuf>,
        /// Pump rate in ticks per second
        #[arg(long, default_value_t = 10)]
        tick_hz: u32,
        #[arg(long, default_value_t = 1)]
        commit_interval_secs: u64,
        #[arg(long, default_value_t = 30)]
        resync_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracon=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Hub {
            interface,
            port,
            boundaries,
            topologies,
            geos,
        } => commands::handle_hub(interface, port, boundaries, topologies, geos).await,
        Commands::Serve {
            hub,
            name,
            plugin_dirs,
            tick_hz,
            commit_interval_secs,
            resync_interval_secs,
        } => {
            let config = EngineConfig {
                hub_url: hub,
                name,
                plugin_dirs,
                tick_interval: Duration::from_secs_f64(1.0 / f64::from(tick_hz.max(1))),
                commit_interval: Duration::from_secs(commit_interval_secs.max(1)),
                resync_interval: Duration::from_secs(resync_interval_secs.max(1)),
                ..EngineConfig::default()
            };
            commands::handle_serve(config).await
        }
    }
}
