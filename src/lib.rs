//! Chat-bot alert fan-out and notification-billing engine.
//!
//! Consumes per-chain transaction alerts and watch-request outcomes from a
//! message bus, resolves them against tracked addresses and their
//! subscription links, charges the owning user per dispatched notification,
//! and fans personalized messages out to the destination chats.

pub mod billing;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod messages;
pub mod resolver;
pub mod store;
pub mod types;
pub mod watch;

pub use config::EngineConfig;
pub use engine::{Engine, EngineCore};
pub use errors::{EngineError, Result};

use anyhow::Context;
use tracing::info;

/// Crate version, for startup banners and health endpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the global tracing subscriber at the given level.
pub fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    info!("Logging initialized at {} level", log_level);
    Ok(())
}
