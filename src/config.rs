//! Configuration module for the alert engine.
//!
//! Defines the configuration structures used throughout the engine and loads
//! them from a YAML file. Every section has sane defaults so a partial config
//! file is enough to start.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::Blockchain;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// General settings
    pub general: GeneralConfig,

    /// Message bus connection
    pub bus: BusConfig,

    /// Supported chains, keyed by chain id
    pub chains: Vec<ChainConfig>,

    /// Telegram transport settings
    pub telegram: TelegramConfig,

    /// Fan-out delivery settings
    pub delivery: DeliveryConfig,

    /// Watch-request protocol settings
    pub watch: WatchConfig,
}

/// General engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// Optional directory of `*.txt` message templates overriding the
    /// built-in ones
    pub templates_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            templates_dir: None,
        }
    }
}

/// Message bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Redis connection URL
    pub url: String,

    /// Consumer group shared by all engine instances
    pub group: String,

    /// Consumer name of this instance within the group
    pub consumer: String,

    /// Blocking read timeout per poll, in milliseconds
    pub poll_block_ms: u64,

    /// Publish retry attempts before surfacing a bus error
    pub publish_retries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            group: "BOT".to_string(),
            consumer: "engine-1".to_string(),
            poll_block_ms: 5_000,
            publish_retries: 3,
        }
    }
}

/// A single supported chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain id
    pub id: u16,

    /// Human-readable name
    pub title: String,

    /// Short tag; also the inbound bus topic for this chain
    pub tag: String,
}

impl From<&ChainConfig> for Blockchain {
    fn from(c: &ChainConfig) -> Self {
        Blockchain {
            id: c.id,
            title: c.title.clone(),
            tag: c.tag.clone(),
        }
    }
}

/// Telegram transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token
    pub token: String,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            request_timeout_secs: 10,
        }
    }
}

/// Fan-out delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Maximum concurrent chat sends per alert batch
    pub max_concurrent_sends: usize,

    /// Timeout per individual chat send, in milliseconds
    pub send_timeout_ms: u64,

    /// Grace period for in-flight sends on shutdown, in milliseconds
    pub shutdown_grace_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sends: 8,
            send_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Watch-request protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// How long a watch request may stay unanswered before it expires,
    /// in seconds
    pub request_ttl_secs: u64,

    /// Interval between expiry sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            request_ttl_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Basic sanity checks that are cheaper to fail at startup than at the
    /// first alert.
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("no chains configured");
        }
        let mut seen: HashMap<u16, &str> = HashMap::new();
        for chain in &self.chains {
            if chain.tag.is_empty() {
                anyhow::bail!("chain {} has an empty tag", chain.id);
            }
            if let Some(tag) = seen.insert(chain.id, &chain.tag) {
                anyhow::bail!("duplicate chain id {} (tags {} and {})", chain.id, tag, chain.tag);
            }
        }
        Ok(())
    }

    /// Look up a chain by id.
    pub fn chain(&self, id: u16) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == id)
    }

    /// Serialize the default configuration, for `init` scaffolding.
    pub fn default_yaml() -> Result<String> {
        let mut config = EngineConfig::default();
        config.chains.push(ChainConfig {
            id: 1,
            title: "Ethereum".to_string(),
            tag: "ETH".to_string(),
        });
        serde_yaml::to_string(&config).context("failed to serialize default config")
    }
}
