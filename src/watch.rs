//! Two-phase watch-request protocol.
//!
//! A cluster asks to watch a wallet; the address is stored `Requested` and an
//! `add_address` message goes to the chain's checker workers. The checker
//! replies with an outcome that moves the address to `Confirmed` or
//! `Rejected`. Outcomes arrive over an at-least-once bus, so every transition
//! here is idempotent: a redelivered outcome is a no-op, and only transitions
//! that contradict an already-terminal state are protocol violations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::bus::{outbound_topic, publish_with_retry, BusClient, Outgoing};
use crate::config::{EngineConfig, WatchConfig};
use crate::dispatch::Dispatcher;
use crate::errors::{EngineError, Result};
use crate::messages::MessageTemplates;
use crate::store::TrackerStore;
use crate::types::{check_name, Blockchain, ConfirmationState, TrackedAddress, MAX_NAME_LEN};

pub struct WatchProtocol {
    store: Arc<dyn TrackerStore>,
    bus: Arc<dyn BusClient>,
    dispatcher: Arc<Dispatcher>,
    templates: Arc<MessageTemplates>,
    chains: HashMap<u16, Blockchain>,
    publish_retries: u32,
    config: WatchConfig,
}

impl WatchProtocol {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        bus: Arc<dyn BusClient>,
        dispatcher: Arc<Dispatcher>,
        templates: Arc<MessageTemplates>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            dispatcher,
            templates,
            chains: config
                .chains
                .iter()
                .map(|c| (c.id, Blockchain::from(c)))
                .collect(),
            publish_retries: config.bus.publish_retries,
            config: config.watch.clone(),
        }
    }

    fn chain(&self, blockchain: u16) -> Result<&Blockchain> {
        self.chains
            .get(&blockchain)
            .ok_or_else(|| EngineError::ProtocolViolation(format!("unknown chain {}", blockchain)))
    }

    /// Start watching a wallet for a cluster. Creates the pending address and
    /// link and asks the checker to pick the wallet up. Re-requesting a
    /// wallet the cluster already tracks is a no-op.
    pub async fn request_watch(
        &self,
        cluster_id: u64,
        wallet: &str,
        blockchain: u16,
        name: Option<&str>,
    ) -> Result<TrackedAddress> {
        let chain = self.chain(blockchain)?;
        if let Some(name) = name {
            if !check_name(name) {
                return Err(EngineError::ProtocolViolation(format!(
                    "display name must be 1 to {} characters",
                    MAX_NAME_LEN
                )));
            }
        }
        if self.store.cluster_tracks(cluster_id, wallet, blockchain).await? {
            debug!(cluster_id, wallet, blockchain, "cluster already tracks wallet");
            let address = self
                .store
                .find_address(wallet, blockchain)
                .await?
                .ok_or_else(|| {
                    EngineError::Persistence("tracked address vanished mid-request".to_string())
                })?;
            return Ok(address);
        }

        let address = self
            .store
            .create_pending(cluster_id, wallet, blockchain, name)
            .await?;

        // A reused address that is already confirmed needs no checker round
        // trip; the new link is live immediately.
        if address.state == ConfirmationState::Requested {
            let message = Outgoing::add_address(wallet, blockchain, cluster_id);
            let payload = serde_json::to_vec(&message)?;
            publish_with_retry(
                self.bus.as_ref(),
                &outbound_topic(&chain.tag),
                &payload,
                self.publish_retries,
            )
            .await?;
            info!(cluster_id, wallet, chain = %chain.tag, "watch requested");
        }
        Ok(address)
    }

    /// Apply a confirmation outcome from the checker.
    pub async fn handle_outcome(
        &self,
        cluster_id: u64,
        wallet: &str,
        blockchain: u16,
        confirmed: bool,
    ) -> Result<()> {
        let chain = self.chain(blockchain)?.clone();
        let Some(address) = self.store.find_address(wallet, blockchain).await? else {
            if confirmed {
                return Err(EngineError::ProtocolViolation(format!(
                    "confirmation for unknown address {} on chain {}",
                    wallet, blockchain
                )));
            }
            // A rejection removes the address; a redelivered rejection finds
            // nothing left to do.
            debug!(wallet, blockchain, "rejection for already-removed address");
            return Ok(());
        };

        match (address.state, confirmed) {
            (ConfirmationState::Requested, true) => {
                self.store
                    .set_confirmation(address.id, ConfirmationState::Confirmed)
                    .await?;
                info!(wallet, chain = %chain.tag, "watch confirmed");
                let text = self.templates.render(
                    "watch_confirmed",
                    &[("wallet", wallet), ("chain", chain.title.as_str())],
                )?;
                self.notify_cluster(cluster_id, &text).await;
                Ok(())
            }
            (ConfirmationState::Requested, false) => {
                let text = self.templates.render(
                    "watch_rejected",
                    &[("wallet", wallet), ("chain", chain.title.as_str())],
                )?;
                self.notify_cluster(cluster_id, &text).await;
                self.retire_address(&address, &chain, cluster_id).await?;
                info!(wallet, chain = %chain.tag, "watch rejected, address removed");
                Ok(())
            }
            // Redelivery of an outcome already applied.
            (ConfirmationState::Confirmed, true) => {
                debug!(wallet, blockchain, "duplicate confirmation ignored");
                Ok(())
            }
            (ConfirmationState::Confirmed, false) => Err(EngineError::ProtocolViolation(format!(
                "rejection for confirmed address {} on chain {}",
                wallet, blockchain
            ))),
            (ConfirmationState::Rejected, _) => Err(EngineError::ProtocolViolation(format!(
                "outcome for rejected address {} on chain {}",
                wallet, blockchain
            ))),
        }
    }

    /// Expire watch requests the checker never answered. Returns how many
    /// were retired.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(self.config.request_ttl_secs as i64);
        let expired = self.store.expired_requests(cutoff).await?;
        let count = expired.len();
        for address in expired {
            let chain = match self.chain(address.blockchain) {
                Ok(chain) => chain.clone(),
                Err(e) => {
                    warn!(wallet = %address.wallet, error = %e, "expired request on unknown chain");
                    continue;
                }
            };
            warn!(wallet = %address.wallet, chain = %chain.tag, "watch request expired");
            let text = self.templates.render(
                "watch_timeout",
                &[
                    ("wallet", address.wallet.as_str()),
                    ("chain", chain.title.as_str()),
                ],
            )?;
            self.notify_cluster(address.requested_by, &text).await;
            self.retire_address(&address, &chain, address.requested_by)
                .await?;
        }
        Ok(count)
    }

    /// Remove the address and its links, and tell the checker to stop
    /// watching the wallet in case it had partially picked it up.
    async fn retire_address(
        &self,
        address: &TrackedAddress,
        chain: &Blockchain,
        cluster_id: u64,
    ) -> Result<()> {
        self.store.remove_address(address.id).await?;
        let message = Outgoing::delete_address(&address.wallet, address.blockchain, cluster_id);
        let payload = serde_json::to_vec(&message)?;
        if let Err(e) = publish_with_retry(
            self.bus.as_ref(),
            &outbound_topic(&chain.tag),
            &payload,
            self.publish_retries,
        )
        .await
        {
            // The local state is already consistent; a stray checker-side
            // watch only costs redundant alerts that resolve as unknown.
            warn!(wallet = %address.wallet, error = %e, "could not send delete_address");
        }
        Ok(())
    }

    async fn notify_cluster(&self, cluster_id: u64, text: &str) {
        match self.store.cluster(cluster_id).await {
            Ok(Some(cluster)) => {
                self.dispatcher.notify(text, &cluster.chats).await;
            }
            Ok(None) => {
                warn!(cluster_id, "cannot notify: cluster no longer exists");
            }
            Err(e) => {
                warn!(cluster_id, error = %e, "cannot notify cluster");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, DeliveryConfig};
    use crate::dispatch::{ChatTransport, WatchPrompt};
    use crate::errors::Result;
    use crate::store::MemoryStore;
    use crate::types::{Cluster, User};
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    struct RecordingBus {
        published: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl RecordingBus {
        fn new() -> Self {
            Self {
                published: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BusClient for RecordingBus {
        async fn subscribe(&self, _topic: &str) -> Result<Box<dyn crate::bus::BusStream>> {
            Err(EngineError::TransientBus("not implemented".to_string()))
        }

        async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
            let value = serde_json::from_slice(payload)?;
            self.published.lock().await.push((topic.to_string(), value));
            Ok(())
        }

        async fn commit(&self, _cursor: &crate::bus::Cursor) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingTransport {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_message(
            &self,
            chat_id: i64,
            text: &str,
            _prompt: Option<&WatchPrompt>,
        ) -> Result<()> {
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        protocol: WatchProtocol,
        store: Arc<MemoryStore>,
        bus: Arc<RecordingBus>,
        transport: Arc<RecordingTransport>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .add_user(User {
                id: 7,
                balance: Decimal::new(1000, 2),
                notification_cost: Decimal::new(5, 2),
                notifications_remain: 10,
                is_active: true,
                created_at: Utc::now(),
            })
            .await;
        store
            .add_cluster(Cluster {
                id: 1,
                name: "c1".to_string(),
                user_id: 7,
                chats: vec![100, 200],
                watch: true,
            })
            .await;

        let bus = Arc::new(RecordingBus::new());
        let transport = Arc::new(RecordingTransport {
            sent: Mutex::new(Vec::new()),
        });
        let templates = Arc::new(MessageTemplates::load(None).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            store.clone(),
            templates.clone(),
            DeliveryConfig::default(),
        ));
        let mut config = EngineConfig::default();
        config.chains.push(ChainConfig {
            id: 2,
            title: "Everscale".to_string(),
            tag: "EVER".to_string(),
        });
        let protocol = WatchProtocol::new(
            store.clone(),
            bus.clone() as Arc<dyn BusClient>,
            dispatcher,
            templates,
            &config,
        );
        Fixture {
            protocol,
            store,
            bus,
            transport,
        }
    }

    #[tokio::test]
    async fn test_request_publishes_add_address() {
        let f = fixture().await;
        let address = f
            .protocol
            .request_watch(1, "0xDEF", 2, Some("treasury"))
            .await
            .unwrap();
        assert_eq!(address.state, ConfirmationState::Requested);

        let published = f.bus.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "EVER_TO_CHECKER");
        assert_eq!(published[0].1["action"], "add_address");
        assert_eq!(published[0].1["wallet"], "0xDEF");
    }

    #[tokio::test]
    async fn test_request_rejects_overlong_name() {
        let f = fixture().await;
        let name = "x".repeat(MAX_NAME_LEN + 1);
        let err = f
            .protocol
            .request_watch(1, "0xDEF", 2, Some(name.as_str()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
        assert!(f.bus.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_request_is_noop() {
        let f = fixture().await;
        f.protocol.request_watch(1, "0xDEF", 2, None).await.unwrap();
        f.protocol.request_watch(1, "0xDEF", 2, None).await.unwrap();
        assert_eq!(f.bus.published.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reusing_confirmed_address_skips_checker() {
        let f = fixture().await;
        f.store
            .add_cluster(Cluster {
                id: 2,
                name: "c2".to_string(),
                user_id: 7,
                chats: vec![300],
                watch: true,
            })
            .await;
        f.store
            .add_tracked(1, "0xDEF", 2, "main", ConfirmationState::Confirmed)
            .await;

        let address = f.protocol.request_watch(2, "0xDEF", 2, None).await.unwrap();
        assert_eq!(address.state, ConfirmationState::Confirmed);
        assert!(f.bus.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_transitions_and_notifies() {
        let f = fixture().await;
        f.protocol.request_watch(1, "0xDEF", 2, None).await.unwrap();

        f.protocol.handle_outcome(1, "0xDEF", 2, true).await.unwrap();
        let address = f.store.find_address("0xDEF", 2).await.unwrap().unwrap();
        assert_eq!(address.state, ConfirmationState::Confirmed);

        let sent = f.transport.sent.lock().await;
        assert_eq!(sent.len(), 2); // both cluster chats
        assert!(sent[0].1.contains("0xDEF"));
        assert!(sent[0].1.contains("Everscale"));
    }

    #[tokio::test]
    async fn test_redelivered_confirmation_is_noop() {
        let f = fixture().await;
        f.protocol.request_watch(1, "0xDEF", 2, None).await.unwrap();
        f.protocol.handle_outcome(1, "0xDEF", 2, true).await.unwrap();
        f.protocol.handle_outcome(1, "0xDEF", 2, true).await.unwrap();
        // Only the first outcome notified.
        assert_eq!(f.transport.sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejection_removes_and_tells_checker() {
        let f = fixture().await;
        f.protocol.request_watch(1, "0xDEF", 2, None).await.unwrap();

        f.protocol.handle_outcome(1, "0xDEF", 2, false).await.unwrap();
        assert!(f.store.find_address("0xDEF", 2).await.unwrap().is_none());

        let published = f.bus.published.lock().await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].1["action"], "delete_address");

        // Redelivered rejection after removal stays silent.
        drop(published);
        f.protocol.handle_outcome(1, "0xDEF", 2, false).await.unwrap();
        assert_eq!(f.bus.published.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cross_terminal_outcome_is_violation() {
        let f = fixture().await;
        f.protocol.request_watch(1, "0xDEF", 2, None).await.unwrap();
        f.protocol.handle_outcome(1, "0xDEF", 2, true).await.unwrap();

        let err = f
            .protocol
            .handle_outcome(1, "0xDEF", 2, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
        // State is untouched.
        let address = f.store.find_address("0xDEF", 2).await.unwrap().unwrap();
        assert_eq!(address.state, ConfirmationState::Confirmed);
    }

    #[tokio::test]
    async fn test_sweep_retires_only_stale_requests() {
        let f = fixture().await;
        f.protocol.request_watch(1, "0xOLD", 2, None).await.unwrap();
        f.store
            .add_tracked(1, "0xOK", 2, "ok", ConfirmationState::Confirmed)
            .await;

        // Nothing is older than the TTL yet.
        assert_eq!(f.protocol.sweep_expired().await.unwrap(), 0);

        // Shrink the TTL to zero and sweep again.
        let mut config = EngineConfig::default();
        config.chains.push(ChainConfig {
            id: 2,
            title: "Everscale".to_string(),
            tag: "EVER".to_string(),
        });
        config.watch.request_ttl_secs = 0;
        let templates = Arc::new(MessageTemplates::load(None).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            f.transport.clone(),
            f.store.clone(),
            templates.clone(),
            DeliveryConfig::default(),
        ));
        let protocol = WatchProtocol::new(
            f.store.clone(),
            f.bus.clone() as Arc<dyn BusClient>,
            dispatcher,
            templates,
            &config,
        );

        assert_eq!(protocol.sweep_expired().await.unwrap(), 1);
        assert!(f.store.find_address("0xOLD", 2).await.unwrap().is_none());
        assert!(f.store.find_address("0xOK", 2).await.unwrap().is_some());

        let published = f.bus.published.lock().await;
        let last = published.last().unwrap();
        assert_eq!(last.1["action"], "delete_address");
        assert_eq!(last.1["wallet"], "0xOLD");
    }
}
