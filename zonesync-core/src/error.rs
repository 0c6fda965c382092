//! Error types for zonesync core

use thiserror::Error;

/// Result type alias using zonesync Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage or network operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Action precondition violated (duplicate create, missing parent, ...)
    #[error("Action error: {0}")]
    Action(String),

    /// Session misuse (unknown, terminated or re-used session)
    #[error("Session error: {0}")]
    Session(String),

    /// Resource lock unavailable after retries
    #[error("Lock error: {0}")]
    Lock(String),

    /// Peer protocol violations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Wire framing errors
    #[error("Wire error: {0}")]
    Wire(#[from] zonesync_protocol::ProtocolError),

    /// Peer authentication failures
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Requested position is outside the peer's retained journal
    #[error("Position {0} is not available on the remote journal")]
    NoPosition(u64),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Action dump (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// TLS setup errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an action error
    pub fn action(msg: impl Into<String>) -> Self {
        Self::Action(msg.into())
    }

    /// Create a session error
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this is a precondition failure raised by an action
    pub fn is_action(&self) -> bool {
        matches!(self, Self::Action(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_pick_variant() {
        assert!(matches!(Error::action("x"), Error::Action(_)));
        assert!(matches!(Error::session("x"), Error::Session(_)));
        assert!(matches!(Error::lock("x"), Error::Lock(_)));
        assert!(Error::action("zone already exists").is_action());
        assert!(!Error::storage("x").is_action());
    }

    #[test]
    fn test_display() {
        let err = Error::action("zone example.com already exists");
        assert_eq!(err.to_string(), "Action error: zone example.com already exists");
        assert_eq!(
            Error::NoPosition(10).to_string(),
            "Position 10 is not available on the remote journal"
        );
    }
}
