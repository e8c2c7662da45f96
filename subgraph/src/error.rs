/// Error types for the staking subgraph projection engine
use ethers::types::U256;
use thiserror::Error;

/// Main error type for the projection engine and its services
#[derive(Error, Debug)]
pub enum IndexerError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis cache operation failed
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Blockchain RPC error
    #[error("Blockchain RPC error: {0}")]
    Rpc(String),

    /// Event parsing error
    #[error("Event parsing error: {0}")]
    EventParsing(String),

    /// Event is missing a required field
    #[error("Malformed event: missing or invalid field `{field}`")]
    MalformedEvent { field: String },

    /// Event arrived at or before the last applied stream position
    #[error("Out-of-order event: received {received:?} after {last:?}")]
    OutOfOrder {
        last: (u64, u64),
        received: (u64, u64),
    },

    /// Withdrawal would drive a user's staked amount below zero
    #[error("Negative balance for {user}: staked {staked}, withdrawing {amount}")]
    NegativeBalance {
        user: String,
        staked: U256,
        amount: U256,
    },

    /// Block timestamp cannot be mapped to a calendar date
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(u64),

    /// Arithmetic overflow on a running total
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid block range
    #[error("Invalid block range: from {from} to {to}")]
    InvalidBlockRange { from: u64, to: u64 },

    /// Generic error
    #[error("Generic error: {0}")]
    Generic(String),
}

impl IndexerError {
    /// Shorthand for a malformed-event error on `field`
    pub fn malformed(field: impl Into<String>) -> Self {
        IndexerError::MalformedEvent {
            field: field.into(),
        }
    }

    /// Whether retrying the same work could succeed.
    ///
    /// Data errors (malformed, out-of-order, negative balance) are
    /// deterministic and will fail again on replay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::Database(_) | IndexerError::Cache(_) | IndexerError::Rpc(_)
        )
    }
}

/// Result type alias for indexer operations
pub type IndexerResult<T> = Result<T, IndexerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexerError::malformed("amount");
        assert_eq!(
            err.to_string(),
            "Malformed event: missing or invalid field `amount`"
        );

        let err = IndexerError::OutOfOrder {
            last: (10, 2),
            received: (10, 1),
        };
        assert!(err.to_string().contains("(10, 1)"));
    }

    #[test]
    fn test_is_transient() {
        assert!(IndexerError::Rpc("timeout".to_string()).is_transient());
        assert!(!IndexerError::malformed("user").is_transient());
        assert!(!IndexerError::InvalidTimestamp(0).is_transient());
    }
}
