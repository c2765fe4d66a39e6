//! Error types for the stream hub.

use std::io;
use thiserror::Error;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur while watching and dispatching changes.
#[derive(Error, Debug)]
pub enum HubError {
    /// A resume token was not issued by the current source generation.
    #[error("invalid resume token for collection {collection}")]
    InvalidResumeToken {
        /// Collection the watch was opened on.
        collection: String,
    },

    /// The connection to the change source was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The change source could not be reached at all.
    #[error("failed to connect to change source: {0}")]
    Connect(String),

    /// The collection is not known to the hub or the source.
    #[error("unknown collection: {name}")]
    UnknownCollection {
        /// Name of the collection.
        name: String,
    },

    /// A raw change event was missing identifying fields.
    #[error("malformed event in collection {collection}: {reason}")]
    MalformedEvent {
        /// Collection the event arrived on.
        collection: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A subscriber callback failed.
    #[error("handler {registration} failed: {message}")]
    HandlerFailure {
        /// Registration id of the failing handler.
        registration: u64,
        /// Failure message.
        message: String,
    },

    /// Reconnect attempts were exhausted.
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The hub failed and must be restarted before it accepts registrations.
    #[error("hub is not running")]
    HubNotRunning,

    /// Invalid lifecycle transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cross-instance publish failed.
    #[error("broadcast publish failed on {topic}: {message}")]
    Publish {
        /// Topic that was published to.
        topic: String,
        /// Failure message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Creates a connection lost error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost(message.into())
    }

    /// Creates an unknown collection error.
    pub fn unknown_collection(name: impl Into<String>) -> Self {
        Self::UnknownCollection { name: name.into() }
    }

    /// Creates a malformed event error.
    pub fn malformed(collection: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the recovery logic should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::ConnectionLost(_) | HubError::Connect(_))
    }

    /// Returns true if this error stops the hub.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HubError::ReconnectExhausted { .. })
    }
}
