//! Message bus boundary: wire schema, event decoding and the transport
//! abstraction.
//!
//! Raw payloads are decoded exactly once, here, into the `BusEvent` sum type;
//! the rest of the engine never sees an `action` string or an untyped data
//! bag. Consumption is at-least-once: a message cursor is committed only
//! after the full pipeline has handled the message.

pub mod redis_bus;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{EngineError, Result};
use crate::types::Transaction;

/// Outbound message to the checker workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outgoing {
    pub action: String,
    pub wallet: String,
    pub blockchain: u16,
    pub cluster_id: u64,
}

impl Outgoing {
    pub fn add_address(wallet: &str, blockchain: u16, cluster_id: u64) -> Self {
        Self {
            action: "add_address".to_string(),
            wallet: wallet.to_string(),
            blockchain,
            cluster_id,
        }
    }

    pub fn delete_address(wallet: &str, blockchain: u16, cluster_id: u64) -> Self {
        Self {
            action: "delete_address".to_string(),
            wallet: wallet.to_string(),
            blockchain,
            cluster_id,
        }
    }
}

/// Inbound message from the checker workers, as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct Incoming {
    pub action: String,
    #[serde(default)]
    pub state: Option<i64>,
    #[serde(default)]
    pub cluster_id: Option<u64>,
    pub blockchain: u16,
    pub wallet: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub auto_add: Vec<String>,
}

/// A transaction alert for a tracked wallet.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub blockchain: u16,
    pub wallet: String,
    pub transactions: Vec<Transaction>,
    /// Wallets the checker already auto-added; no watch prompt is offered
    /// for these.
    pub auto_add: Vec<String>,
}

/// Decoded bus event. The fixed set of kinds the engine reacts to.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Alert(AlertEvent),
    WatchConfirmed {
        cluster_id: u64,
        blockchain: u16,
        wallet: String,
    },
    WatchRejected {
        cluster_id: u64,
        blockchain: u16,
        wallet: String,
    },
}

/// Decode a raw inbound payload into a `BusEvent`.
pub fn decode_event(payload: &[u8]) -> Result<BusEvent> {
    let incoming: Incoming = serde_json::from_slice(payload)?;
    match incoming.action.as_str() {
        "alert" => Ok(BusEvent::Alert(AlertEvent {
            blockchain: incoming.blockchain,
            wallet: incoming.wallet,
            transactions: incoming.transactions,
            auto_add: incoming.auto_add,
        })),
        "add_address" => {
            let cluster_id = incoming.cluster_id.ok_or_else(|| {
                EngineError::Codec("add_address outcome without cluster_id".to_string())
            })?;
            let confirmed = match incoming.state {
                Some(1) => true,
                Some(_) => false,
                None => {
                    return Err(EngineError::Codec(
                        "add_address outcome without state".to_string(),
                    ))
                }
            };
            if confirmed {
                Ok(BusEvent::WatchConfirmed {
                    cluster_id,
                    blockchain: incoming.blockchain,
                    wallet: incoming.wallet,
                })
            } else {
                Ok(BusEvent::WatchRejected {
                    cluster_id,
                    blockchain: incoming.blockchain,
                    wallet: incoming.wallet,
                })
            }
        }
        other => Err(EngineError::Codec(format!("unknown action '{}'", other))),
    }
}

/// Outbound topic for a chain tag.
pub fn outbound_topic(tag: &str) -> String {
    format!("{}_TO_CHECKER", tag)
}

/// Cursor identifying a consumed message for the commit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub topic: String,
    pub id: String,
}

/// A message pulled from the bus, with the cursor to commit once handled.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub cursor: Cursor,
}

/// Ordered stream of messages for a single topic.
#[async_trait]
pub trait BusStream: Send {
    /// Wait for the next message on this topic. Messages left uncommitted by
    /// a previous run are redelivered first.
    async fn next(&mut self) -> Result<BusMessage>;
}

/// Transport abstraction over the message bus.
#[async_trait]
pub trait BusClient: Send + Sync + 'static {
    /// Open an ordered consumer for one topic.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn BusStream>>;

    /// Publish a payload to a topic. Failures surface as
    /// `EngineError::TransientBus`; retrying is the caller's decision.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Acknowledge a fully handled message.
    async fn commit(&self, cursor: &Cursor) -> Result<()>;
}

/// Publish with jittered exponential backoff on transient failures.
pub async fn publish_with_retry(
    bus: &dyn BusClient,
    topic: &str,
    payload: &[u8],
    attempts: u32,
) -> Result<()> {
    let mut last = None;
    for attempt in 0..=attempts {
        if attempt > 0 {
            let backoff_ms = 100 * u64::pow(2, attempt);
            let jitter = rand::thread_rng().gen_range(0..100);
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms + jitter)).await;
        }
        match bus.publish(topic, payload).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                warn!(topic, attempt, error = %e, "bus publish failed, retrying");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| EngineError::TransientBus("publish failed".to_string())))
}
