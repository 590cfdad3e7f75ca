//! Error types for FolioDB
//!
//! A single unified error type is used across all crates. We use `thiserror`
//! for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Categories
//!
//! - **Not Found**: record, subscription, or connection doesn't exist
//! - **Validation**: config, schema, or filter-grammar failures
//! - **Constraints**: unique / required index violations
//! - **Transaction**: aborts from timeouts, prepare vetoes, WAL failures
//! - **Storage**: adapter and WAL I/O, corruption
//! - **Limits**: subscription / connection exhaustion, rate limiting

use std::io;
use thiserror::Error;

/// Result type alias for Folio operations
pub type FolioResult<T> = std::result::Result<T, FolioError>;

/// Error types for the Folio document store
#[derive(Debug, Error)]
pub enum FolioError {
    /// Entity not found (record, subscription, connection)
    #[error("not found: {entity}")]
    NotFound {
        /// Description of the entity that was not found
        entity: String,
    },

    /// Invalid input, configuration, schema, or filter grammar
    #[error("validation error: {message}")]
    Validation {
        /// What failed to validate
        message: String,
    },

    /// A unique index already holds the value being inserted
    #[error("unique violation on index '{index}': value {value}")]
    UniqueViolation {
        /// The index whose constraint was violated
        index: String,
        /// The duplicated value, rendered for diagnostics
        value: String,
    },

    /// A required index received a null value
    #[error("required violation on index '{index}': value is null")]
    RequiredViolation {
        /// The index whose constraint was violated
        index: String,
    },

    /// Permission check failed
    #[error("authorization denied: {reason}")]
    AuthorizationDenied {
        /// Why the check failed
        reason: String,
    },

    /// Caller exceeded a rate limit
    #[error("rate limited: {message}")]
    RateLimited {
        /// Which limit was exceeded
        message: String,
    },

    /// Transaction was aborted (timeout, prepare veto, WAL write failure)
    #[error("transaction {tx_id} aborted: {reason}")]
    TransactionAborted {
        /// The aborted transaction
        tx_id: String,
        /// Why it was aborted
        reason: String,
    },

    /// WAL frame failed CRC validation or decoded to garbage
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Details including the file offset or sequence number
        message: String,
    },

    /// WAL file I/O failure
    #[error("WAL I/O error: {message}")]
    WalIo {
        /// Details of the failure
        message: String,
    },

    /// Storage adapter I/O failure
    #[error("adapter I/O error: {message}")]
    AdapterIo {
        /// Details of the failure
        message: String,
    },

    /// The subscription engine is not running
    #[error("engine not running")]
    EngineNotRunning,

    /// A bounded resource (subscriptions, connections) is exhausted
    #[error("resource exhausted: {resource}")]
    ResourceExhausted {
        /// Which resource hit its cap
        resource: String,
    },

    /// Serialization or deserialization failure
    #[error("serialization error: {message}")]
    Serialization {
        /// Details of the failure
        message: String,
    },

    /// Invalid configuration
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// What was wrong with the configuration
        message: String,
    },

    /// Raw I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for FolioError {
    fn from(e: serde_json::Error) -> Self {
        FolioError::Serialization {
            message: e.to_string(),
        }
    }
}

impl FolioError {
    /// Entity-not-found constructor
    pub fn not_found(entity: impl Into<String>) -> Self {
        FolioError::NotFound {
            entity: entity.into(),
        }
    }

    /// Validation-failure constructor
    pub fn validation(message: impl Into<String>) -> Self {
        FolioError::Validation {
            message: message.into(),
        }
    }

    /// Unique-violation constructor
    pub fn unique_violation(index: impl Into<String>, value: impl ToString) -> Self {
        FolioError::UniqueViolation {
            index: index.into(),
            value: value.to_string(),
        }
    }

    /// Required-violation constructor
    pub fn required_violation(index: impl Into<String>) -> Self {
        FolioError::RequiredViolation {
            index: index.into(),
        }
    }

    /// Authorization-denied constructor
    pub fn denied(reason: impl Into<String>) -> Self {
        FolioError::AuthorizationDenied {
            reason: reason.into(),
        }
    }

    /// Transaction-aborted constructor
    pub fn aborted(tx_id: impl ToString, reason: impl Into<String>) -> Self {
        FolioError::TransactionAborted {
            tx_id: tx_id.to_string(),
            reason: reason.into(),
        }
    }

    /// WAL-corruption constructor
    pub fn corruption(message: impl Into<String>) -> Self {
        FolioError::WalCorruption {
            message: message.into(),
        }
    }

    /// WAL-I/O constructor
    pub fn wal_io(message: impl Into<String>) -> Self {
        FolioError::WalIo {
            message: message.into(),
        }
    }

    /// Adapter-I/O constructor
    pub fn adapter_io(message: impl Into<String>) -> Self {
        FolioError::AdapterIo {
            message: message.into(),
        }
    }

    /// Resource-exhausted constructor
    pub fn exhausted(resource: impl Into<String>) -> Self {
        FolioError::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Serialization-failure constructor
    pub fn serialization(message: impl Into<String>) -> Self {
        FolioError::Serialization {
            message: message.into(),
        }
    }

    /// Invalid-config constructor
    pub fn config(message: impl Into<String>) -> Self {
        FolioError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Check if this error is a not-found condition
    ///
    /// Used where absence is tolerated, e.g. idempotent removal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FolioError::NotFound { .. })
    }

    /// Check if the operation that produced this error may be retried
    ///
    /// Only transient conditions qualify: rate limiting and aborted
    /// transactions. Constraint and validation failures are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FolioError::RateLimited { .. } | FolioError::TransactionAborted { .. }
        )
    }
}
