//! MemSync - Resilient memory store and realtime sync for AI conversation context
//!
//! Runs the peer transport over the configured vector store, and offers
//! config and diagnostics subcommands.

use anyhow::Result;
use clap::{Parser, Subcommand};
use memsync::{
    config::{MemSyncConfig, StoreBackend},
    server::SyncServerBuilder,
    MemoryService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memsync")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Resilient memory store and realtime sync for AI conversation context")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MEMSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Initialize the configured store and report its health
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("memsync={}", log_level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!cli.json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::Doctor => {
            run_doctor(config).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

/// Explicit path, else the per-user config file if present, else defaults
fn load_config(path: Option<PathBuf>) -> Result<MemSyncConfig> {
    let path = path.or_else(|| {
        dirs_next::config_dir()
            .map(|dir| dir.join("memsync").join("config.toml"))
            .filter(|p| p.exists())
    });
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration");
            Ok(MemSyncConfig::load(&path)?)
        }
        None => Ok(MemSyncConfig::default()),
    }
}

async fn run_server(config: MemSyncConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    tracing::info!("Starting MemSync");

    let service = Arc::new(MemoryService::from_config(&config).await?);
    let mut builder = SyncServerBuilder::new().config(config.server.clone());
    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }
    let server = builder.build(service.clone());
    server.start().await?;

    tracing::info!("MemSync is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    server.stop().await?;
    service.close().await?;

    Ok(())
}

async fn run_doctor(config: MemSyncConfig) -> Result<()> {
    println!("MemSync Doctor");
    println!();

    println!("Checking configuration...");
    match config.validate() {
        Ok(()) => println!("  ✓ Configuration valid"),
        Err(e) => {
            println!("  ✗ {}", e);
            return Ok(());
        }
    }

    println!();
    match config.store.backend {
        StoreBackend::Memory => println!("Checking in-process store..."),
        StoreBackend::Qdrant => println!("Checking Qdrant at {}...", config.store.url),
    }
    let service = match MemoryService::from_config(&config).await {
        Ok(service) => service,
        Err(e) => {
            println!("  ✗ Store unavailable: {}", e);
            return Ok(());
        }
    };

    let stats = service.stats().await?;
    let deleted = stats
        .store
        .deleted_chunks
        .map_or_else(|| "unknown".to_string(), |d| d.to_string());
    println!(
        "  ✓ {} chunks ({} deleted), dimension {:?}",
        stats.store.total_chunks, deleted, stats.store.dimension
    );
    if let Some(pool) = &stats.pool {
        println!(
            "  ✓ Pool: {} idle, {} in use (max {})",
            pool.idle, pool.in_use, pool.max_size
        );
    }
    if let Some(breaker) = &stats.breaker {
        println!("  ✓ Circuit {}: {:?}", breaker.target, breaker.state);
    }
    println!(
        "  ℹ Conflicts: {} pending, {} resolved",
        stats.conflicts.pending, stats.conflicts.resolved
    );

    service.close().await?;
    println!();
    println!("Doctor check complete!");

    Ok(())
}

fn show_config(config: Option<&MemSyncConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
