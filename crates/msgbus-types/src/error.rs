//! Error types for msgbus
//!
//! Every failure of the adapter, its transports and its configuration layer
//! is one of these variants.

use thiserror::Error;

/// Main error type for msgbus operations
#[derive(Error, Debug)]
pub enum Error {
    /// Broker unreachable, handshake failed, or an established connection was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// An exchange or queue already exists with incompatible attributes
    #[error("Declaration conflict on {entity} '{name}': {reason}")]
    DeclarationConflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Protocol or channel level failure reported by the broker
    #[error("Broker error: {0}")]
    Broker(String),

    /// Subscription callback failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Malformed configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a conflict error for an exchange
    pub fn exchange_conflict(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeclarationConflict {
            entity: "exchange",
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Build a conflict error for a queue
    pub fn queue_conflict(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeclarationConflict {
            entity: "queue",
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the connection itself is gone.
    ///
    /// Only these errors are candidates for automatic recovery.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type alias for msgbus operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_connectivity() {
        assert!(Error::Connection("refused".into()).is_connectivity());
        assert!(!Error::Broker("channel closed".into()).is_connectivity());
        assert!(!Error::exchange_conflict("x", "kind").is_connectivity());
        assert!(!Error::InvalidArgument("callback".into()).is_connectivity());
    }

    #[test]
    fn test_conflict_message_names_entity() {
        let err = Error::queue_conflict("orders", "durable mismatch");
        assert_eq!(
            err.to_string(),
            "Declaration conflict on queue 'orders': durable mismatch"
        );
    }
}
