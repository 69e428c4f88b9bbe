//! # Engine Error Management
//!
//! Central error enum for the whole alert engine, together with the
//! classification helpers the consumer loop relies on to decide whether a
//! message cursor may be committed.
//!
//! Every module in the engine uses this error type instead of defining its
//! own.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for the whole engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Central error enum for the alert engine.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "error_type", content = "error_details")]
pub enum EngineError {
    /// No tracked address exists for (wallet, chain). Benign: the bus may
    /// still carry events for wallets that were de-tracked in flight.
    #[error("no tracked address for wallet {wallet} on chain {blockchain}")]
    UnknownAddress { wallet: String, blockchain: u16 },

    /// Transient bus failure (publish, subscribe or commit).
    #[error("bus error: {0}")]
    TransientBus(String),

    /// Billing or ledger write failure. Blocks the cursor commit so the
    /// message is redelivered.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Transport rejected a specific chat (bot blocked, chat deleted).
    #[error("delivery to chat {chat_id} failed: {reason}")]
    Delivery { chat_id: i64, reason: String },

    /// Confirmation event that does not fit the watch-request state machine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Malformed bus payload.
    #[error("malformed bus payload: {0}")]
    Codec(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Errors that are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientBus(_) | EngineError::Persistence(_)
        )
    }

    /// Errors that must keep the message cursor uncommitted so the bus
    /// redelivers the message. Everything else is either handled or dropped
    /// on purpose, and the cursor advances.
    pub fn blocks_commit(&self) -> bool {
        matches!(
            self,
            EngineError::TransientBus(_) | EngineError::Persistence(_)
        )
    }

    /// Expected, non-fatal outcomes that warrant no more than a debug log.
    pub fn is_benign(&self) -> bool {
        matches!(self, EngineError::UnknownAddress { .. })
    }

    /// Log this error at the severity the taxonomy assigns to it.
    pub fn log(&self) {
        use tracing::{debug, error, warn};

        match self {
            EngineError::UnknownAddress { wallet, blockchain } => {
                debug!(wallet = %wallet, blockchain, "dropping event for untracked wallet");
            }
            EngineError::ProtocolViolation(msg) => {
                warn!(message = %msg, "discarding out-of-protocol confirmation event");
            }
            EngineError::Codec(msg) => {
                warn!(message = %msg, "discarding malformed bus payload");
            }
            EngineError::Delivery { chat_id, reason } => {
                error!(chat_id, reason = %reason, "chat delivery failed");
            }
            _ => {
                error!(error = %self, "engine error");
            }
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::TransientBus(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_classification() {
        let bus = EngineError::TransientBus("broker down".to_string());
        assert!(bus.blocks_commit());
        assert!(bus.is_retryable());

        let persistence = EngineError::Persistence("ledger write failed".to_string());
        assert!(persistence.blocks_commit());

        let miss = EngineError::UnknownAddress {
            wallet: "0xABC".to_string(),
            blockchain: 1,
        };
        assert!(!miss.blocks_commit());
        assert!(miss.is_benign());

        let delivery = EngineError::Delivery {
            chat_id: 100,
            reason: "bot blocked".to_string(),
        };
        assert!(!delivery.blocks_commit());

        let violation = EngineError::ProtocolViolation("already rejected".to_string());
        assert!(!violation.blocks_commit());
    }

    #[test]
    fn test_error_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: EngineError = json_err.into();
        assert!(matches!(err, EngineError::Codec(_)));
        assert!(!err.blocks_commit());
    }
}
