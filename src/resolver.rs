//! Address resolution: attach domain context to a raw (wallet, chain) pair.
//!
//! An alert only fans out to links whose address is confirmed and which are
//! unmuted at both the link and cluster level. Both filters happen here, at
//! resolution time; the policy re-checks the mute flags again right before
//! charging because resolution and delivery can be separated by fan-out
//! latency.

use std::sync::Arc;

use crate::errors::{EngineError, Result};
use crate::store::{SubscriptionView, TrackerStore};
use crate::types::{ConfirmationState, TrackedAddress};

/// An alert correlated to the tracked address and its eligible links.
#[derive(Debug, Clone)]
pub struct ResolvedAlert {
    pub address: TrackedAddress,
    pub subscriptions: Vec<SubscriptionView>,
}

/// Maps (wallet, chain) to the internal tracked-address identity and the
/// active subscription links watching it.
pub struct AddressResolver {
    store: Arc<dyn TrackerStore>,
}

impl AddressResolver {
    pub fn new(store: Arc<dyn TrackerStore>) -> Self {
        Self { store }
    }

    /// Resolve an alert event. `UnknownAddress` is an expected outcome: the
    /// bus may still carry events for wallets de-tracked in flight, and the
    /// caller drops the event and commits the cursor.
    pub async fn resolve_alert(&self, wallet: &str, blockchain: u16) -> Result<ResolvedAlert> {
        let address = self
            .store
            .find_address(wallet, blockchain)
            .await?
            .ok_or_else(|| EngineError::UnknownAddress {
                wallet: wallet.to_string(),
                blockchain,
            })?;

        // Pending and rejected addresses are excluded from fan-out entirely.
        let subscriptions = if address.state == ConfirmationState::Confirmed {
            self.store
                .subscriptions(address.id)
                .await?
                .into_iter()
                .filter(|s| s.link_watch && s.cluster_watch)
                .collect()
        } else {
            Vec::new()
        };

        Ok(ResolvedAlert {
            address,
            subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Cluster, User};
    use chrono::Utc;
    use rust_decimal::Decimal;

    async fn store_with_cluster() -> MemoryStore {
        let store = MemoryStore::new();
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
        store
    }

    #[tokio::test]
    async fn test_unknown_address_is_benign() {
        let store = Arc::new(store_with_cluster().await);
        let resolver = AddressResolver::new(store);
        let err = resolver.resolve_alert("0xNONE", 1).await.unwrap_err();
        assert!(err.is_benign());
        assert!(!err.blocks_commit());
    }

    #[tokio::test]
    async fn test_muted_link_is_filtered() {
        let store = Arc::new(store_with_cluster().await);
        let (_, link) = store
            .add_tracked(1, "0xABC", 1, "main", ConfirmationState::Confirmed)
            .await;
        store.set_link_watch(link.id, false).await;

        let resolver = AddressResolver::new(store);
        let resolved = resolver.resolve_alert("0xABC", 1).await.unwrap();
        assert!(resolved.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_pending_address_yields_no_subscriptions() {
        let store = Arc::new(store_with_cluster().await);
        store
            .add_tracked(1, "0xDEF", 2, "new", ConfirmationState::Requested)
            .await;

        let resolver = AddressResolver::new(store);
        let resolved = resolver.resolve_alert("0xDEF", 2).await.unwrap();
        assert_eq!(resolved.address.state, ConfirmationState::Requested);
        assert!(resolved.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_unmuted_link_is_returned() {
        let store = Arc::new(store_with_cluster().await);
        store
            .add_tracked(1, "0xABC", 1, "main", ConfirmationState::Confirmed)
            .await;

        let resolver = AddressResolver::new(store);
        let resolved = resolver.resolve_alert("0xABC", 1).await.unwrap();
        assert_eq!(resolved.subscriptions.len(), 1);
        assert_eq!(resolved.subscriptions[0].address_name, "main");
        assert_eq!(resolved.subscriptions[0].chats, vec![100, 200]);
    }
}
