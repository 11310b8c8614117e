//! Error taxonomy for relay, subscription and group operations.

use thiserror::Error;

/// Errors raised by the chat core. Each one is local to the operation that
/// produced it; other relays and groups are unaffected.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Relay unreachable or the websocket handshake failed.
    #[error("failed to connect to {url}: {reason}")]
    Connection { url: String, reason: String },

    /// Filter rejected or transport failure while subscribing.
    #[error("failed to subscribe to {group} on {url}: {reason}")]
    Subscription {
        url: String,
        group: String,
        reason: String,
    },

    /// An already created subscription could not be activated.
    #[error("failed to fire subscription {id}: {reason}")]
    Fire { id: String, reason: String },

    #[error("relay not found: {0}")]
    RelayNotFound(String),

    #[error("group {group} not found on {url}")]
    GroupNotFound { url: String, group: String },

    /// The relay connection has already been closed.
    #[error("connection to {0} is closed")]
    Closed(String),

    #[error("no group selected")]
    NoSelection,

    #[error("no identity configured")]
    NoIdentity,

    #[error("message is empty")]
    EmptyMessage,

    #[error("signing failed: {0}")]
    Signing(String),

    /// Writing or clearing persisted preferences failed.
    #[error("failed to persist preferences: {0}")]
    Persist(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
