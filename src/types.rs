//! Core domain types for the alert engine.
//!
//! Everything here is a plain value struct: snapshots of persisted state,
//! safe to hold across await points and to hand between tasks. Live storage
//! handles stay behind the repository traits in `store`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A supported ledger network, identified by a small integer id and a short
/// tag. The tag doubles as the inbound bus topic name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blockchain {
    pub id: u16,
    pub title: String,
    pub tag: String,
}

/// Confirmation state of a tracked address.
///
/// Transitions only via the watch-request protocol: `Requested` to
/// `Confirmed` or `Requested` to `Rejected`, never between the terminal
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationState {
    /// Watch request sent to the checker workers, no reply yet.
    Requested,
    /// Checker workers confirmed they watch the wallet.
    Confirmed,
    /// Checker workers refused the wallet.
    Rejected,
}

/// The record that a given wallet on a given chain is being monitored.
/// Identity is (wallet, blockchain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedAddress {
    pub id: u64,
    pub wallet: String,
    pub blockchain: u16,
    pub state: ConfirmationState,
    /// Cluster that issued the original watch request; used to notify the
    /// requester when the confirmation outcome arrives or the request
    /// expires.
    pub requested_by: u64,
    pub requested_at: DateTime<Utc>,
}

/// A user-defined named group of destination chats sharing a set of watched
/// addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: u64,
    pub name: String,
    pub user_id: i64,
    pub chats: Vec<i64>,
    pub watch: bool,
}

/// Link between a cluster and a tracked address, carrying the per-link
/// display name and mute flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    pub cluster_id: u64,
    pub address_id: u64,
    pub address_name: String,
    pub watch: bool,
}

/// Bot user with a monetary balance and a notification quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub balance: Decimal,
    pub notification_cost: Decimal,
    pub notifications_remain: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit row, appended atomically with every credit decrement.
/// The system of record for billing disputes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertLedgerEntry {
    pub id: Uuid,
    pub user_id: i64,
    pub blockchain: u16,
    pub wallet: String,
    pub balance_delta: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A single on-chain transaction carried in an alert event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_hash: Option<String>,
    pub src: String,
    pub dst: String,
    pub value: f64,
    pub token: String,
    pub created_at: i64,
}

impl Transaction {
    /// The side of the transaction that is not the given wallet, if the
    /// wallet is involved at all.
    pub fn counterparty(&self, wallet: &str) -> Option<&str> {
        if self.src == wallet {
            Some(self.dst.as_str())
        } else if self.dst == wallet {
            Some(self.src.as_str())
        } else {
            None
        }
    }
}

/// Maximum length of a link display name, matching the persisted column.
pub const MAX_NAME_LEN: usize = 28;

/// Validate a link display name. The cap counts characters, matching the
/// persisted column, not bytes.
pub fn check_name(name: &str) -> bool {
    let len = name.chars().count();
    len >= 1 && len <= MAX_NAME_LEN
}

/// Default display name for a wallet when the watch request carries none.
/// Wallet strings are not guaranteed to be ASCII, so the head and tail are
/// taken per character.
pub fn default_address_name(wallet: &str) -> String {
    let chars: Vec<char> = wallet.chars().collect();
    if chars.len() <= 14 {
        wallet.to_string()
    } else {
        let head: String = chars[..7].iter().collect();
        let tail: String = chars[chars.len() - 7..].iter().collect();
        format!("{}...{}", head, tail)
    }
}
