//! Delivery dispatcher: fan a resolved alert out to chat destinations.
//!
//! Message content is personalized per link (the watched side of the
//! transaction is labelled with the link's display name), sends run with
//! bounded concurrency and a per-send timeout, and an individual chat
//! failure never aborts the rest of the batch nor undoes an applied charge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use tracing::{debug, warn};

use crate::bus::AlertEvent;
use crate::config::{DeliveryConfig, TelegramConfig};
use crate::errors::{EngineError, Result};
use crate::messages::MessageTemplates;
use crate::store::{SubscriptionView, TrackerStore};
use crate::types::{Blockchain, Transaction};

/// Inline action offered with an alert: start watching the counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchPrompt {
    pub wallet: String,
    pub blockchain: u16,
}

/// Transport seam for the chat service.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        prompt: Option<&WatchPrompt>,
    ) -> Result<()>;
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    token: String,
    client: Client,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            token: config.token.clone(),
            client,
        })
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        prompt: Option<&WatchPrompt>,
    ) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let mut params = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(prompt) = prompt {
            params["reply_markup"] = serde_json::json!({
                "inline_keyboard": [[{
                    "text": "Watch this wallet",
                    "callback_data": serde_json::json!({
                        "action": "add_address",
                        "wallet": prompt.wallet,
                        "blockchain": prompt.blockchain,
                    }).to_string(),
                }]]
            });
        }

        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(|e| EngineError::Delivery {
                chat_id,
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(EngineError::Delivery {
                chat_id,
                reason: format!("HTTP {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Fans resolved events out to the distinct chat destinations of eligible
/// subscriptions.
pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn TrackerStore>,
    templates: Arc<MessageTemplates>,
    config: DeliveryConfig,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn TrackerStore>,
        templates: Arc<MessageTemplates>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            transport,
            store,
            templates,
            config,
        }
    }

    /// Render the personalized alert text for one link. The side of the
    /// transaction matching the watched wallet is replaced with the link's
    /// display name.
    pub fn render_alert(
        &self,
        chain: &Blockchain,
        wallet: &str,
        tx: &Transaction,
        sub: &SubscriptionView,
    ) -> Result<String> {
        let src = if tx.src == wallet {
            sub.address_name.as_str()
        } else {
            tx.src.as_str()
        };
        let dst = if tx.dst == wallet {
            sub.address_name.as_str()
        } else {
            tx.dst.as_str()
        };
        let value = tx.value.to_string();
        let hash = tx.tx_hash.as_deref().unwrap_or("-");
        self.templates.render(
            "alert",
            &[
                ("name", sub.address_name.as_str()),
                ("chain", chain.tag.as_str()),
                ("src", src),
                ("dst", dst),
                ("value", value.as_str()),
                ("token", tx.token.as_str()),
                ("tx_hash", hash),
            ],
        )
    }

    /// Decide whether the "watch this wallet" prompt should accompany the
    /// alert: only when the counterparty is neither auto-added by the
    /// checker nor already tracked by the same cluster.
    pub async fn watch_prompt(
        &self,
        chain: &Blockchain,
        event: &AlertEvent,
        tx: &Transaction,
        sub: &SubscriptionView,
    ) -> Option<WatchPrompt> {
        let counterparty = tx.counterparty(&event.wallet)?;
        if event.auto_add.iter().any(|w| w == counterparty) {
            return None;
        }
        match self
            .store
            .cluster_tracks(sub.cluster_id, counterparty, chain.id)
            .await
        {
            Ok(true) => None,
            Ok(false) => Some(WatchPrompt {
                wallet: counterparty.to_string(),
                blockchain: chain.id,
            }),
            Err(e) => {
                // Prompt is decoration; a lookup failure must not block the
                // alert itself.
                warn!(error = %e, "counterparty lookup failed, omitting watch prompt");
                None
            }
        }
    }

    /// Deliver one transaction alert for one subscription to the given
    /// chats. Every chat is attempted; failures are logged per chat.
    /// Returns the number of successful sends.
    pub async fn deliver(
        &self,
        chain: &Blockchain,
        event: &AlertEvent,
        tx: &Transaction,
        sub: &SubscriptionView,
        chats: &[i64],
    ) -> Result<usize> {
        let text = self.render_alert(chain, &event.wallet, tx, sub)?;
        let prompt = self.watch_prompt(chain, event, tx, sub).await;
        Ok(self.send_to_chats(&text, prompt.as_ref(), chats).await)
    }

    /// Plain notification to a list of chats, used by the watch protocol for
    /// confirmation and expiry notices.
    pub async fn notify(&self, text: &str, chats: &[i64]) -> usize {
        self.send_to_chats(text, None, chats).await
    }

    async fn send_to_chats(&self, text: &str, prompt: Option<&WatchPrompt>, chats: &[i64]) -> usize {
        let delivered = AtomicUsize::new(0);
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        stream::iter(chats.iter().copied())
            .for_each_concurrent(self.config.max_concurrent_sends, |chat_id| {
                let delivered = &delivered;
                let transport = self.transport.clone();
                async move {
                    let send = transport.send_message(chat_id, text, prompt);
                    match tokio::time::timeout(timeout, send).await {
                        Ok(Ok(())) => {
                            delivered.fetch_add(1, Ordering::SeqCst);
                            debug!(chat_id, "alert delivered");
                        }
                        Ok(Err(e)) => e.log(),
                        Err(_) => EngineError::Delivery {
                            chat_id,
                            reason: "send timed out".to_string(),
                        }
                        .log(),
                    }
                }
            })
            .await;
        delivered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Cluster, ConfirmationState, User};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    /// Records sends; optionally fails for specific chats.
    struct MockTransport {
        sent: Mutex<Vec<(i64, String, Option<WatchPrompt>)>>,
        failing: Vec<i64>,
    }

    impl MockTransport {
        fn new(failing: Vec<i64>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failing,
            }
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_message(
            &self,
            chat_id: i64,
            text: &str,
            prompt: Option<&WatchPrompt>,
        ) -> Result<()> {
            if self.failing.contains(&chat_id) {
                return Err(EngineError::Delivery {
                    chat_id,
                    reason: "bot blocked".to_string(),
                });
            }
            self.sent
                .lock()
                .await
                .push((chat_id, text.to_string(), prompt.cloned()));
            Ok(())
        }
    }

    fn chain() -> Blockchain {
        Blockchain {
            id: 1,
            title: "Ethereum".to_string(),
            tag: "ETH".to_string(),
        }
    }

    fn tx(src: &str, dst: &str) -> Transaction {
        Transaction {
            tx_hash: Some("0xh".to_string()),
            src: src.to_string(),
            dst: dst.to_string(),
            value: 2.5,
            token: "ETH".to_string(),
            created_at: 0,
        }
    }

    fn event(wallet: &str, auto_add: Vec<String>) -> AlertEvent {
        AlertEvent {
            blockchain: 1,
            wallet: wallet.to_string(),
            transactions: vec![],
            auto_add,
        }
    }

    async fn setup(failing: Vec<i64>) -> (Dispatcher, Arc<MockTransport>, Arc<MemoryStore>) {
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
        let transport = Arc::new(MockTransport::new(failing));
        let dispatcher = Dispatcher::new(
            transport.clone(),
            store.clone(),
            Arc::new(MessageTemplates::load(None).unwrap()),
            DeliveryConfig::default(),
        );
        (dispatcher, transport, store)
    }

    async fn sub_for(store: &MemoryStore, wallet: &str) -> SubscriptionView {
        let (address, _) = store
            .add_tracked(1, wallet, 1, "savings", ConfirmationState::Confirmed)
            .await;
        store.subscriptions(address.id).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_render_substitutes_watched_side() {
        let (dispatcher, _, store) = setup(vec![]).await;
        let sub = sub_for(&store, "0xABC").await;

        let text = dispatcher
            .render_alert(&chain(), "0xABC", &tx("0xAAA", "0xABC"), &sub)
            .unwrap();
        assert!(text.contains("Sender: 0xAAA"));
        assert!(text.contains("Receiver: savings"));

        let text = dispatcher
            .render_alert(&chain(), "0xABC", &tx("0xABC", "0xBBB"), &sub)
            .unwrap();
        assert!(text.contains("Sender: savings"));
        assert!(text.contains("Receiver: 0xBBB"));
    }

    #[tokio::test]
    async fn test_prompt_for_untracked_counterparty() {
        let (dispatcher, _, store) = setup(vec![]).await;
        let sub = sub_for(&store, "0xABC").await;

        let prompt = dispatcher
            .watch_prompt(&chain(), &event("0xABC", vec![]), &tx("0xABC", "0xNEW"), &sub)
            .await;
        assert_eq!(
            prompt,
            Some(WatchPrompt {
                wallet: "0xNEW".to_string(),
                blockchain: 1
            })
        );
    }

    #[tokio::test]
    async fn test_prompt_suppressed_when_tracked_or_auto_added() {
        let (dispatcher, _, store) = setup(vec![]).await;
        let sub = sub_for(&store, "0xABC").await;
        // The cluster already tracks the counterparty.
        store
            .add_tracked(1, "0xOTHER", 1, "other", ConfirmationState::Confirmed)
            .await;

        let prompt = dispatcher
            .watch_prompt(
                &chain(),
                &event("0xABC", vec![]),
                &tx("0xABC", "0xOTHER"),
                &sub,
            )
            .await;
        assert!(prompt.is_none());

        let prompt = dispatcher
            .watch_prompt(
                &chain(),
                &event("0xABC", vec!["0xNEW".to_string()]),
                &tx("0xABC", "0xNEW"),
                &sub,
            )
            .await;
        assert!(prompt.is_none());
    }

    #[tokio::test]
    async fn test_failed_chat_does_not_abort_batch() {
        let (dispatcher, transport, store) = setup(vec![100]).await;
        let sub = sub_for(&store, "0xABC").await;

        let delivered = dispatcher
            .deliver(
                &chain(),
                &event("0xABC", vec![]),
                &tx("0xAAA", "0xABC"),
                &sub,
                &[100, 200],
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 200);
    }
}
