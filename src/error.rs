use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::txn::types::{TxState, TxVersion};

pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by the cache core.
///
/// Variants are serializable so that a failure observed on a remote node travels back
/// inside a response and is re-raised on the caller with its kind intact.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum CacheError {
    #[error("Partition {partition} is not valid on this node: {reason}")]
    InvalidPartition { partition: u32, reason: String },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Stale topology version {requested} (current is {current})")]
    StaleTopology { requested: u64, current: u64 },

    #[error("Optimistic conflict on key '{key}': read {expected}, found {actual}")]
    OptimisticConflict {
        key: String,
        expected: TxVersion,
        actual: TxVersion,
    },

    #[error("Heuristic transaction outcome: {0}")]
    Heuristic(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Timed out waiting for lock on key '{key}'")]
    LockTimeout { key: String },

    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    #[error("Invalid transaction state {state:?} for {operation}")]
    InvalidState { state: TxState, operation: String },

    #[error("Cache store failure: {0}")]
    Store(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Failures the caller can resolve by remapping and running the transaction again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Topology(_)
                | CacheError::StaleTopology { .. }
                | CacheError::OptimisticConflict { .. }
                | CacheError::LockTimeout { .. }
        )
    }

    pub fn invalid_state(state: TxState, operation: &str) -> Self {
        CacheError::InvalidState {
            state,
            operation: operation.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CacheError::Topology("node left".into()).is_retryable());
        assert!(
            CacheError::StaleTopology {
                requested: 3,
                current: 4
            }
            .is_retryable()
        );
        assert!(!CacheError::Heuristic("store".into()).is_retryable());
        assert!(!CacheError::Timeout("tx".into()).is_retryable());
    }

    #[test]
    fn test_error_survives_the_wire() {
        let err = CacheError::OptimisticConflict {
            key: "k".into(),
            expected: TxVersion::ZERO,
            actual: TxVersion::new(2, 7, 1),
        };

        let json = serde_json::to_string(&err).unwrap();
        let back: CacheError = serde_json::from_str(&json).unwrap();

        assert_eq!(err, back);
    }
}
