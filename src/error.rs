//! Unified error handling for the Sentinel-aware metadata store layer
//!
//! Errors fall into two families. Transport-level errors (network, protocol,
//! timeouts, nodes answering in the wrong role) may be cured by re-resolving
//! the topology and reconnecting. Logical store outcomes (not found, version
//! conflict, lock held) are final and pass through to the caller unchanged.

use std::io;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::Endpoint;

/// Main error type for Sentinel client, pool and metadata store operations
#[derive(Debug, Error)]
pub enum HaError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// RESP framing or unexpected reply shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// The node refused the command because of its role or state
    /// (READONLY, MASTERDOWN, LOADING)
    #[error("Node {endpoint} unavailable: {message}")]
    Unavailable { endpoint: String, message: String },

    /// Authentication rejected by a Sentinel or store node
    #[error("Authentication failed for {endpoint}: {message}")]
    Auth { endpoint: String, message: String },

    /// Zero Sentinel endpoints are currently usable
    #[error("No Sentinel available")]
    NoSentinelAvailable,

    /// A reachable Sentinel returned an error or an unparsable reply
    #[error("Sentinel query to {endpoint} failed: {message}")]
    QueryFailed { endpoint: String, message: String },

    /// The pool holds no usable primary connection
    #[error("No primary available")]
    NoPrimaryAvailable,

    /// Logical metadata store outcomes
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Logical outcomes reported by the metadata store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {key}")]
    NotFound { key: String },

    #[error("Record already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict { key: String, expected: i32, found: i32 },

    #[error("Lock held: {key}")]
    LockHeld { key: String },

    #[error("Record encoding error: {0}")]
    Codec(String),

    #[error("Command error: {0}")]
    Command(String),
}

/// Result type alias for HA layer operations
pub type HaResult<T> = Result<T, HaError>;

impl HaError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        HaError::Protocol(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        HaError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn query_failed<S: Into<String>>(endpoint: &Endpoint, message: S) -> Self {
        HaError::QueryFailed {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Classify an error reply received from `endpoint`.
    ///
    /// Replies that mean "this node cannot serve you right now" become
    /// [`HaError::Unavailable`]; everything else is a logical command error.
    pub fn from_reply(endpoint: &Endpoint, message: &str) -> Self {
        let code = message.split_whitespace().next().unwrap_or_default();
        match code {
            "READONLY" | "MASTERDOWN" | "LOADING" | "TRYAGAIN" => HaError::Unavailable {
                endpoint: endpoint.to_string(),
                message: message.to_string(),
            },
            "NOAUTH" | "WRONGPASS" | "NOPERM" => HaError::Auth {
                endpoint: endpoint.to_string(),
                message: message.to_string(),
            },
            _ => HaError::Store(StoreError::Command(message.to_string())),
        }
    }

    /// Check if this error is transport-level, i.e. worth one refresh-and-retry
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HaError::Network(_)
                | HaError::Protocol(_)
                | HaError::Timeout { .. }
                | HaError::Unavailable { .. }
                | HaError::NoPrimaryAvailable
        )
    }

    /// Check if this error is a logical not-found outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, HaError::Store(StoreError::NotFound { .. }))
    }
}

impl StoreError {
    pub fn not_found<S: Into<String>>(key: S) -> Self {
        StoreError::NotFound { key: key.into() }
    }

    pub fn already_exists<S: Into<String>>(key: S) -> Self {
        StoreError::AlreadyExists { key: key.into() }
    }

    pub fn lock_held<S: Into<String>>(key: S) -> Self {
        StoreError::LockHeld { key: key.into() }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("10.0.0.1", 6379)
    }

    #[test]
    fn test_error_display() {
        let error = HaError::query_failed(&endpoint(), "ERR No such master with that name");
        assert_eq!(
            error.to_string(),
            "Sentinel query to 10.0.0.1:6379 failed: ERR No such master with that name"
        );
        assert_eq!(HaError::NoPrimaryAvailable.to_string(), "No primary available");
    }

    #[test]
    fn test_transport_classification() {
        let network = HaError::Network(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(network.is_transport());
        assert!(HaError::timeout("GET").is_transport());
        assert!(HaError::NoPrimaryAvailable.is_transport());

        assert!(!HaError::NoSentinelAvailable.is_transport());
        assert!(!HaError::Store(StoreError::not_found("file:1:a")).is_transport());
        assert!(!HaError::Store(StoreError::lock_held("lock:1:a")).is_transport());
    }

    #[test]
    fn test_reply_classification() {
        let readonly = HaError::from_reply(
            &endpoint(),
            "READONLY You can't write against a read only replica.",
        );
        assert!(matches!(readonly, HaError::Unavailable { .. }));
        assert!(readonly.is_transport());

        let noauth = HaError::from_reply(&endpoint(), "NOAUTH Authentication required.");
        assert!(matches!(noauth, HaError::Auth { .. }));
        assert!(!noauth.is_transport());

        let wrongtype = HaError::from_reply(&endpoint(), "WRONGTYPE Operation against a key");
        assert!(matches!(wrongtype, HaError::Store(StoreError::Command(_))));
        assert!(!wrongtype.is_transport());
    }

    #[test]
    fn test_not_found_helper() {
        assert!(HaError::Store(StoreError::not_found("x")).is_not_found());
        assert!(!HaError::NoPrimaryAvailable.is_not_found());
    }
}
