//! Error types for the broker.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registration for '{message_type}' failed: {source}")]
    Registration {
        message_type: String,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("Publishing '{message_type}' failed: {source}")]
    Publish {
        message_type: String,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("Delivery to {subscriber} rejected: {reason}")]
    DeliveryRejected { subscriber: String, reason: String },

    #[error("Partition {partition} has kind {kind}; only Int64 range partitions are supported")]
    UnsupportedPartitioning { partition: String, kind: String },

    #[error("No partitions found for broker {0}")]
    NoPartitions(String),

    #[error("No broker address was provided or discovered for scope {0}")]
    BrokerNotFound(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Property store error: {0}")]
    Property(String),

    #[error("Topology query error: {0}")]
    Topology(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Envelope has no payload")]
    EmptyPayload,

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Timed out waiting for lock on collection {0}")]
    LockTimeout(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection {0} exists with a different kind")]
    WrongCollectionKind(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BrokerError {
    /// Errors that go away on their own and are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::LockTimeout(_) | BrokerError::BrokerUnavailable(_) => true,
            BrokerError::Registration { source, .. } | BrokerError::Publish { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    pub(crate) fn registration(message_type: &str, source: BrokerError) -> Self {
        BrokerError::Registration {
            message_type: message_type.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn publish(message_type: &str, source: BrokerError) -> Self {
        BrokerError::Publish {
            message_type: message_type.to_string(),
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::LockTimeout("q".into()).is_transient());
        assert!(!BrokerError::Cancelled.is_transient());
        assert!(!BrokerError::EmptyPayload.is_transient());

        let wrapped = BrokerError::registration("Order", BrokerError::LockTimeout("q".into()));
        assert!(wrapped.is_transient());

        let wrapped = BrokerError::publish("Order", BrokerError::Locked);
        assert!(!wrapped.is_transient());
    }

    #[test]
    fn test_wrapped_message_mentions_type() {
        let err = BrokerError::publish("Order", BrokerError::Cancelled);
        assert!(err.to_string().contains("Order"));
    }
}
