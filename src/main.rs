/// BTrace alert engine - Main entry point
///
/// Wires the bus client, store, transport and templates together and runs
/// the consumer tasks until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use btrace_engine::bus::redis_bus::RedisBusClient;
use btrace_engine::bus::BusClient;
use btrace_engine::dispatch::{Dispatcher, TelegramTransport};
use btrace_engine::engine::{Engine, EngineCore};
use btrace_engine::messages::MessageTemplates;
use btrace_engine::store::{MemoryStore, Seed};
use btrace_engine::{init_logging, EngineConfig, VERSION};

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config/engine.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand)]
enum Commands {
    /// Generate default configuration
    Init,

    /// Run the engine
    Run {
        /// Optional YAML seed file pre-populating the in-memory store
        #[arg(short, long)]
        seed: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command.unwrap_or(Commands::Run { seed: None }) {
        Commands::Init => {
            let yaml = EngineConfig::default_yaml()?;
            std::fs::write(&cli.config, yaml)
                .with_context(|| format!("failed to write config file {}", cli.config))?;
            info!("Default configuration written to {}", cli.config);
            Ok(())
        }
        Commands::Run { seed } => run(&cli.config, seed).await,
    }
}

async fn run(config_path: &str, seed: Option<PathBuf>) -> Result<()> {
    info!("BTrace alert engine v{}", VERSION);
    let config = EngineConfig::load(config_path)?;

    let store = match seed {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read seed file {}", path.display()))?;
            let seed: Seed = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse seed file {}", path.display()))?;
            let store = MemoryStore::from_seed(seed).await?;
            info!("Store seeded from {}", path.display());
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };

    // No bus, no engine; starting without one would silently do nothing.
    let bus: Arc<dyn BusClient> = Arc::new(RedisBusClient::connect(&config.bus).await?);

    let templates_dir = config.general.templates_dir.as_ref().map(PathBuf::from);
    let templates = Arc::new(MessageTemplates::load(templates_dir.as_deref())?);

    let transport = Arc::new(TelegramTransport::new(&config.telegram)?);
    let dispatcher = Arc::new(Dispatcher::new(
        transport,
        store.clone(),
        templates.clone(),
        config.delivery.clone(),
    ));
    let core = Arc::new(EngineCore::new(
        store.clone(),
        store,
        bus.clone(),
        dispatcher,
        templates,
        &config,
    ));

    let engine = Engine::start(core, bus, &config).await?;
    info!("Engine running on {} chain(s), press Ctrl+C to stop", config.chains.len());

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    engine.stop().await;
    Ok(())
}
