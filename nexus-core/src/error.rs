//! Error types for nexus operations

use thiserror::Error;

/// Backing key-value store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Codec error for key {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Revision {revision} has been compacted")]
    Compacted { revision: i64 },

    #[error("Store is closed")]
    Closed,
}

/// Graph layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Malformed record at {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("{operation} gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Property update on {id} kept conflicting after {attempts} attempts")]
    UpdateConflict { id: String, attempts: u32 },
}

/// Notification decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Malformed notification value at {key}: {reason}")]
    MalformedValue { key: String, reason: String },

    #[error("Watch stream closed")]
    WatchClosed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all nexus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NexusError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for nexus operations.
pub type NexusResult<T> = Result<T, NexusError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_exhausted_display() {
        let err = GraphError::RetryExhausted {
            operation: "describe_node".to_string(),
            attempts: 33,
            last_error: "connection refused".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("describe_node"));
        assert!(msg.contains("33"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_store_error_converts_to_master() {
        let err: NexusError = StoreError::Closed.into();
        assert!(matches!(err, NexusError::Store(StoreError::Closed)));
        assert!(format!("{}", err).contains("closed"));
    }

    #[test]
    fn test_bus_error_display() {
        let err = BusError::MalformedValue {
            key: "/Config/default".to_string(),
            reason: "expected object".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/Config/default"));
        assert!(msg.contains("expected object"));
    }
}
