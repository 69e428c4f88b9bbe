//! Notification policy and billing gatekeeper.
//!
//! Decides per subscription link whether a transaction alert may be
//! delivered, and debits the owning user's quota atomically with delivery.
//! The key invariant: one charge per (subscription, transaction) pair that is
//! actually dispatched, never one per destination chat.

use std::sync::Arc;

use crate::errors::Result;
use crate::store::{BillingStore, ChargeOutcome, ChargeRequest, SubscriptionView};
use crate::types::Transaction;

pub struct NotificationPolicy {
    billing: Arc<dyn BillingStore>,
}

impl NotificationPolicy {
    pub fn new(billing: Arc<dyn BillingStore>) -> Self {
        Self { billing }
    }

    /// Whether the link may receive an alert right now. The mute flags are
    /// re-checked even though the resolver already filtered on them: a mute
    /// toggled between resolution and send must win.
    pub fn authorize(&self, sub: &SubscriptionView) -> bool {
        sub.user.is_active
            && sub.user.notifications_remain > 0
            && sub.link_watch
            && sub.cluster_watch
    }

    /// Debit the user for one (subscription, transaction) pair. The store
    /// applies credit decrement, balance decrement and ledger append as one
    /// atomic unit; a `Persistence` error here blocks the cursor commit.
    pub async fn charge(
        &self,
        sub: &SubscriptionView,
        blockchain: u16,
        wallet: &str,
        tx: &Transaction,
    ) -> Result<ChargeOutcome> {
        let request = ChargeRequest {
            user_id: sub.user.id,
            blockchain,
            wallet: wallet.to_string(),
            link_id: sub.link_id,
            tx_hash: tx.tx_hash.clone(),
        };
        self.billing.charge(&request).await
    }
}
