//! Server → client replies.

use serde::{Deserialize, Serialize};

/// Status attached to relayed broker messages.
pub const STATUS_RECEIVED: &str = "received";

/// WebSocket close codes used by the bridge.
pub mod close_code {
    /// The session token was missing, invalid or expired.
    pub const AUTH_FAILED: u16 = 4001;
}

/// A reply frame.
///
/// Variants are untagged; the field set identifies the shape. Order matters
/// for deserialization: wider shapes come first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// A message relayed from the broker.
    Received {
        /// Broker topic.
        topic: String,
        /// Always [`STATUS_RECEIVED`].
        status: String,
        /// Payload decoded as UTF-8 (lossy).
        message: String,
    },

    /// Session bootstrap, sent once when the socket is accepted.
    Session {
        /// Session identifier.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Token to attach to every envelope.
        token: String,
    },

    /// Outcome of a publish.
    Published {
        /// Topic that was published to.
        topic: String,
        /// Human-readable outcome.
        status: String,
    },

    /// Outcome of a connect/disconnect.
    Status {
        /// Human-readable outcome.
        status: String,
    },

    /// A failed command.
    Error {
        /// Human-readable error.
        error: String,
    },
}

impl Reply {
    /// Create a status reply.
    #[must_use]
    pub fn status(status: impl Into<String>) -> Self {
        Reply::Status {
            status: status.into(),
        }
    }

    /// Create an error reply.
    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Reply::Error {
            error: error.into(),
        }
    }

    /// Create a publish outcome reply.
    #[must_use]
    pub fn published(topic: impl Into<String>, status: impl Into<String>) -> Self {
        Reply::Published {
            topic: topic.into(),
            status: status.into(),
        }
    }

    /// Create a relayed broker message.
    #[must_use]
    pub fn received(topic: impl Into<String>, payload: &[u8]) -> Self {
        Reply::Received {
            topic: topic.into(),
            status: STATUS_RECEIVED.to_string(),
            message: String::from_utf8_lossy(payload).into_owned(),
        }
    }

    /// Create the session bootstrap reply.
    #[must_use]
    pub fn session(session_id: impl Into<String>, token: impl Into<String>) -> Self {
        Reply::Session {
            session_id: session_id.into(),
            token: token.into(),
        }
    }

    /// Whether this reply reports a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}
