//! Redis Streams implementation of the bus transport.
//!
//! One stream per topic, one consumer group shared by all engine instances.
//! `XADD` publishes, `XREADGROUP` consumes, `XACK` commits. Entries that were
//! delivered but never acknowledged stay in the pending list and are replayed
//! before new entries when a consumer restarts, which gives the at-least-once
//! semantics the engine is built around.

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{BusClient, BusMessage, BusStream, Cursor};
use crate::config::BusConfig;
use crate::errors::{EngineError, Result};

/// Bus client backed by Redis Streams.
pub struct RedisBusClient {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    group: String,
    consumer: String,
    poll_block_ms: u64,
}

impl RedisBusClient {
    /// Connect and verify the broker is reachable. The engine refuses to
    /// start when this fails; running without a bus would silently deliver
    /// nothing.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| EngineError::TransientBus(format!("invalid bus url: {}", e)))?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        info!(url = %config.url, group = %config.group, "connected to message bus");
        Ok(Self {
            client,
            conn,
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            poll_block_ms: config.poll_block_ms,
        })
    }

    async fn ensure_group(&self, topic: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(topic, &self.group, "$")
            .await;
        match created {
            Ok(()) => {
                debug!(topic, group = %self.group, "created consumer group");
                Ok(())
            }
            // The group surviving restarts is the normal case.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BusClient for RedisBusClient {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn BusStream>> {
        self.ensure_group(topic).await?;
        // A dedicated connection per stream: XREADGROUP blocks, and a blocked
        // multiplexed connection would stall every other topic loop.
        let conn = self.client.get_async_connection().await?;
        Ok(Box::new(RedisBusStream {
            conn,
            topic: topic.to_string(),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            poll_block_ms: self.poll_block_ms,
            backlog_drained: false,
        }))
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.xadd::<_, _, _, _, ()>(topic, "*", &[("payload", payload)]).await?;
        Ok(())
    }

    async fn commit(&self, cursor: &Cursor) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(&cursor.topic, &self.group, &[&cursor.id]).await?;
        Ok(())
    }
}

struct RedisBusStream {
    conn: redis::aio::Connection,
    topic: String,
    group: String,
    consumer: String,
    poll_block_ms: u64,
    backlog_drained: bool,
}

impl RedisBusStream {
    fn first_entry(reply: StreamReadReply) -> Option<(String, Vec<u8>)> {
        let entry = reply
            .keys
            .into_iter()
            .next()
            .and_then(|key| key.ids.into_iter().next())?;
        let payload = entry
            .map
            .get("payload")
            .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok())
            .unwrap_or_default();
        Some((entry.id, payload))
    }
}

#[async_trait]
impl BusStream for RedisBusStream {
    async fn next(&mut self) -> Result<BusMessage> {
        loop {
            // Replay our own unacknowledged backlog before reading new
            // entries, so a crash between handling and commit redelivers.
            let id = if self.backlog_drained { ">" } else { "0" };
            let options = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(1)
                .block(self.poll_block_ms as usize);
            let reply: StreamReadReply = self
                .conn
                .xread_options(&[&self.topic], &[id], &options)
                .await?;
            match Self::first_entry(reply) {
                Some((entry_id, payload)) => {
                    return Ok(BusMessage {
                        topic: self.topic.clone(),
                        payload,
                        cursor: Cursor {
                            topic: self.topic.clone(),
                            id: entry_id,
                        },
                    });
                }
                None => {
                    if !self.backlog_drained {
                        self.backlog_drained = true;
                        debug!(topic = %self.topic, "pending backlog drained");
                    }
                    // Block timed out with no new entries; poll again.
                }
            }
        }
    }
}
