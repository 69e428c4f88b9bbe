//! Repository seams between the engine and persistence.
//!
//! The engine never touches a database session directly; it goes through
//! these traits, which hand back plain value structs. `MemoryStore` is the
//! reference implementation, used by tests and by the standalone binary.
//! Production deployments plug the relational collaborator in behind the
//! same traits.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::types::{
    default_address_name, AlertLedgerEntry, Cluster, ConfirmationState, Subscription,
    TrackedAddress, User,
};

/// A subscription link pre-joined with its owning cluster and user, the
/// shape the policy and dispatcher consume.
#[derive(Debug, Clone)]
pub struct SubscriptionView {
    pub link_id: u64,
    pub address_name: String,
    pub link_watch: bool,
    pub cluster_id: u64,
    pub cluster_watch: bool,
    pub chats: Vec<i64>,
    pub user: User,
}

/// Read/modify contract for tracked addresses, clusters and links.
#[async_trait]
pub trait TrackerStore: Send + Sync + 'static {
    /// Find the tracked address for (wallet, chain), in any confirmation
    /// state.
    async fn find_address(&self, wallet: &str, blockchain: u16) -> Result<Option<TrackedAddress>>;

    /// All subscription links referencing an address, joined with cluster
    /// and user. Mute filtering is the resolver's job, not the store's.
    async fn subscriptions(&self, address_id: u64) -> Result<Vec<SubscriptionView>>;

    /// Create a pending tracked address for a watch request, plus the
    /// requesting cluster's link. Reuses the address row when another
    /// cluster already tracks the wallet.
    async fn create_pending(
        &self,
        cluster_id: u64,
        wallet: &str,
        blockchain: u16,
        name: Option<&str>,
    ) -> Result<TrackedAddress>;

    /// Set the confirmation state, returning the previous state.
    async fn set_confirmation(
        &self,
        address_id: u64,
        state: ConfirmationState,
    ) -> Result<ConfirmationState>;

    /// Delete an address and every link referencing it.
    async fn remove_address(&self, address_id: u64) -> Result<()>;

    /// Fetch a cluster snapshot.
    async fn cluster(&self, cluster_id: u64) -> Result<Option<Cluster>>;

    /// Whether the cluster already has a link (in any state) to the wallet.
    async fn cluster_tracks(&self, cluster_id: u64, wallet: &str, blockchain: u16) -> Result<bool>;

    /// Watch requests still `Requested` and older than the cutoff.
    async fn expired_requests(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrackedAddress>>;
}

/// One charge: debit a user once for one (subscription, transaction) pair.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub user_id: i64,
    pub blockchain: u16,
    pub wallet: String,
    pub link_id: u64,
    pub tx_hash: Option<String>,
}

/// Outcome of a charge attempt.
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    /// Credits and balance were decremented and a ledger row appended.
    Charged(AlertLedgerEntry),
    /// This (tx_hash, link) pair was already charged; the message is a bus
    /// redelivery. The alert may still be dispatched.
    Duplicate,
    /// The user no longer qualifies (raced mute/deactivation/exhaustion).
    Denied,
}

/// Billing contract. The credit decrement, balance decrement and ledger
/// append must be one atomic unit scoped to the user row.
#[async_trait]
pub trait BillingStore: Send + Sync + 'static {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome>;

    /// Append-only ledger rows for one user, oldest first. Backs the
    /// per-user billing export.
    async fn ledger_for_user(&self, user_id: i64) -> Result<Vec<AlertLedgerEntry>>;
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<i64, User>,
    clusters: HashMap<u64, Cluster>,
    addresses: HashMap<u64, TrackedAddress>,
    links: HashMap<u64, Subscription>,
    ledger: Vec<AlertLedgerEntry>,
    /// Idempotency keys (tx_hash, link_id) of charges already applied.
    charged: HashSet<(String, u64)>,
    next_address_id: u64,
    next_link_id: u64,
}

/// In-memory store. All maps live under one lock so a charge is atomic and
/// concurrent alerts for the same user cannot produce lost updates.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: User) {
        self.inner.write().await.users.insert(user.id, user);
    }

    pub async fn add_cluster(&self, cluster: Cluster) {
        self.inner.write().await.clusters.insert(cluster.id, cluster);
    }

    /// Insert a tracked address with one link, in the given state. Test and
    /// seed helper. Address identity is (wallet, blockchain): when the
    /// wallet is already tracked, the existing row is reused and only a new
    /// link is added.
    pub async fn add_tracked(
        &self,
        cluster_id: u64,
        wallet: &str,
        blockchain: u16,
        name: &str,
        state: ConfirmationState,
    ) -> (TrackedAddress, Subscription) {
        let mut inner = self.inner.write().await;
        let existing = inner
            .addresses
            .values()
            .find(|a| a.wallet == wallet && a.blockchain == blockchain)
            .cloned();
        let address = match existing {
            Some(address) => address,
            None => {
                inner.next_address_id += 1;
                let address = TrackedAddress {
                    id: inner.next_address_id,
                    wallet: wallet.to_string(),
                    blockchain,
                    state,
                    requested_by: cluster_id,
                    requested_at: Utc::now(),
                };
                inner.addresses.insert(address.id, address.clone());
                address
            }
        };
        inner.next_link_id += 1;
        let link = Subscription {
            id: inner.next_link_id,
            cluster_id,
            address_id: address.id,
            address_name: name.to_string(),
            watch: true,
        };
        inner.links.insert(link.id, link.clone());
        (address, link)
    }

    /// Flip the mute flag on a link. Test helper mirroring the bot's
    /// toggle-mute action.
    pub async fn set_link_watch(&self, link_id: u64, watch: bool) {
        if let Some(link) = self.inner.write().await.links.get_mut(&link_id) {
            link.watch = watch;
        }
    }

    /// Build a store pre-populated from a seed file.
    pub async fn from_seed(seed: Seed) -> Result<Self> {
        let store = MemoryStore::new();
        for user in seed.users {
            store
                .add_user(User {
                    id: user.id,
                    balance: user.balance,
                    notification_cost: user.notification_cost,
                    notifications_remain: user.notifications_remain,
                    is_active: user.is_active,
                    created_at: Utc::now(),
                })
                .await;
        }
        for cluster in seed.clusters {
            store
                .add_cluster(Cluster {
                    id: cluster.id,
                    name: cluster.name,
                    user_id: cluster.user_id,
                    chats: cluster.chats,
                    watch: cluster.watch,
                })
                .await;
        }
        for watch in seed.watches {
            let name = watch
                .name
                .unwrap_or_else(|| default_address_name(&watch.wallet));
            store
                .add_tracked(
                    watch.cluster_id,
                    &watch.wallet,
                    watch.blockchain,
                    &name,
                    watch.state,
                )
                .await;
        }
        Ok(store)
    }
}

impl MemoryInner {
    fn join(&self, link: &Subscription) -> Option<SubscriptionView> {
        let cluster = self.clusters.get(&link.cluster_id)?;
        let user = self.users.get(&cluster.user_id)?;
        Some(SubscriptionView {
            link_id: link.id,
            address_name: link.address_name.clone(),
            link_watch: link.watch,
            cluster_id: cluster.id,
            cluster_watch: cluster.watch,
            chats: cluster.chats.clone(),
            user: user.clone(),
        })
    }
}

#[async_trait]
impl TrackerStore for MemoryStore {
    async fn find_address(&self, wallet: &str, blockchain: u16) -> Result<Option<TrackedAddress>> {
        let inner = self.inner.read().await;
        Ok(inner
            .addresses
            .values()
            .find(|a| a.wallet == wallet && a.blockchain == blockchain)
            .cloned())
    }

    async fn subscriptions(&self, address_id: u64) -> Result<Vec<SubscriptionView>> {
        let inner = self.inner.read().await;
        let mut views: Vec<SubscriptionView> = inner
            .links
            .values()
            .filter(|l| l.address_id == address_id)
            .filter_map(|l| inner.join(l))
            .collect();
        views.sort_by_key(|v| v.link_id);
        Ok(views)
    }

    async fn create_pending(
        &self,
        cluster_id: u64,
        wallet: &str,
        blockchain: u16,
        name: Option<&str>,
    ) -> Result<TrackedAddress> {
        let mut inner = self.inner.write().await;
        if !inner.clusters.contains_key(&cluster_id) {
            return Err(EngineError::Persistence(format!(
                "cluster {} does not exist",
                cluster_id
            )));
        }
        let existing = inner
            .addresses
            .values()
            .find(|a| a.wallet == wallet && a.blockchain == blockchain)
            .cloned();
        let address = match existing {
            Some(address) => address,
            None => {
                inner.next_address_id += 1;
                let address = TrackedAddress {
                    id: inner.next_address_id,
                    wallet: wallet.to_string(),
                    blockchain,
                    state: ConfirmationState::Requested,
                    requested_by: cluster_id,
                    requested_at: Utc::now(),
                };
                inner.addresses.insert(address.id, address.clone());
                address
            }
        };
        inner.next_link_id += 1;
        let link = Subscription {
            id: inner.next_link_id,
            cluster_id,
            address_id: address.id,
            address_name: name
                .map(str::to_string)
                .unwrap_or_else(|| default_address_name(wallet)),
            watch: true,
        };
        inner.links.insert(link.id, link);
        Ok(address)
    }

    async fn set_confirmation(
        &self,
        address_id: u64,
        state: ConfirmationState,
    ) -> Result<ConfirmationState> {
        let mut inner = self.inner.write().await;
        let address = inner.addresses.get_mut(&address_id).ok_or_else(|| {
            EngineError::Persistence(format!("address {} does not exist", address_id))
        })?;
        let previous = address.state;
        address.state = state;
        Ok(previous)
    }

    async fn remove_address(&self, address_id: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.addresses.remove(&address_id);
        inner.links.retain(|_, l| l.address_id != address_id);
        Ok(())
    }

    async fn cluster(&self, cluster_id: u64) -> Result<Option<Cluster>> {
        Ok(self.inner.read().await.clusters.get(&cluster_id).cloned())
    }

    async fn cluster_tracks(&self, cluster_id: u64, wallet: &str, blockchain: u16) -> Result<bool> {
        let inner = self.inner.read().await;
        let Some(address) = inner
            .addresses
            .values()
            .find(|a| a.wallet == wallet && a.blockchain == blockchain)
        else {
            return Ok(false);
        };
        Ok(inner
            .links
            .values()
            .any(|l| l.cluster_id == cluster_id && l.address_id == address.id))
    }

    async fn expired_requests(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrackedAddress>> {
        let inner = self.inner.read().await;
        Ok(inner
            .addresses
            .values()
            .filter(|a| a.state == ConfirmationState::Requested && a.requested_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        let mut inner = self.inner.write().await;
        if let Some(hash) = &request.tx_hash {
            if inner.charged.contains(&(hash.clone(), request.link_id)) {
                return Ok(ChargeOutcome::Duplicate);
            }
        }
        let user = inner.users.get_mut(&request.user_id).ok_or_else(|| {
            EngineError::Persistence(format!("user {} does not exist", request.user_id))
        })?;
        // Re-checked here even though authorize ran first: quota and balance
        // must never go negative under concurrent alerts.
        if !user.is_active || user.notifications_remain <= 0 {
            return Ok(ChargeOutcome::Denied);
        }
        let cost = user.notification_cost;
        if user.balance < cost {
            return Ok(ChargeOutcome::Denied);
        }
        user.notifications_remain -= 1;
        user.balance -= cost;
        let entry = AlertLedgerEntry {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            blockchain: request.blockchain,
            wallet: request.wallet.clone(),
            balance_delta: -cost,
            created_at: Utc::now(),
        };
        inner.ledger.push(entry.clone());
        if let Some(hash) = &request.tx_hash {
            inner.charged.insert((hash.clone(), request.link_id));
        }
        Ok(ChargeOutcome::Charged(entry))
    }

    async fn ledger_for_user(&self, user_id: i64) -> Result<Vec<AlertLedgerEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Seed file for the standalone binary: pre-populates the in-memory store.
#[derive(Debug, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub clusters: Vec<SeedCluster>,
    #[serde(default)]
    pub watches: Vec<SeedWatch>,
}

#[derive(Debug, Deserialize)]
pub struct SeedUser {
    pub id: i64,
    pub balance: Decimal,
    pub notification_cost: Decimal,
    pub notifications_remain: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeedCluster {
    pub id: u64,
    pub name: String,
    pub user_id: i64,
    pub chats: Vec<i64>,
    #[serde(default = "default_true")]
    pub watch: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeedWatch {
    pub cluster_id: u64,
    pub wallet: String,
    pub blockchain: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_confirmed")]
    pub state: ConfirmationState,
}

fn default_true() -> bool {
    true
}

fn default_confirmed() -> ConfirmationState {
    ConfirmationState::Confirmed
}
