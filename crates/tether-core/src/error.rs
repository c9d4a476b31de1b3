//! Error taxonomy for the bridge.

use thiserror::Error;

use crate::auth::AuthError;

/// Broad class of a [`HubError`], used to pick a reply shape or HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request itself was incomplete or out of range.
    Validation,
    /// The session token was missing, invalid or expired.
    Auth,
    /// The bridge is not in a state that allows the request.
    State,
    /// The broker or its transport failed.
    Upstream,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::State => "state",
            ErrorKind::Upstream => "upstream",
        }
    }
}

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// `serverIndex` missing or negative.
    #[error("serverIndex is required")]
    MissingServerIndex,

    /// `serverIndex` beyond the configured profiles or not an integer.
    #[error("Invalid serverIndex")]
    InvalidServerIndex(String),

    /// `topic` or `message` missing from a publish.
    #[error("topic and message are required")]
    MissingPublishFields,

    /// Token check failed.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Connect requested while connected.
    #[error("Already connected to MQTT broker")]
    AlreadyConnected,

    /// Connect/disconnect requested while a connect is in flight.
    #[error("Connection to MQTT broker already in progress")]
    AlreadyConnecting,

    /// Disconnect/publish requested while disconnected.
    #[error("Not connected to MQTT broker")]
    NotConnected,

    /// Disconnect requested while other sessions share the connection.
    #[error("Other clients are still connected")]
    SessionsRemain,

    /// Registry is full.
    #[error("Session limit reached")]
    TooManySessions,

    /// Broker connect attempt failed or timed out.
    #[error("Failed to connect to MQTT broker: {0}")]
    ConnectFailed(String),

    /// Broker did not accept a publish.
    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    /// Profile requires TLS but its CA material cannot be read.
    #[error("CA certificate not found: {0}")]
    CertificateNotFound(String),

    /// Broker refused a subscription.
    #[error("Failed to subscribe to '{topic}': {reason}")]
    SubscribeFailed { topic: String, reason: String },
}

impl HubError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::MissingServerIndex
            | HubError::InvalidServerIndex(_)
            | HubError::MissingPublishFields => ErrorKind::Validation,
            HubError::Auth(_) => ErrorKind::Auth,
            HubError::AlreadyConnected
            | HubError::AlreadyConnecting
            | HubError::NotConnected
            | HubError::SessionsRemain
            | HubError::TooManySessions => ErrorKind::State,
            HubError::ConnectFailed(_)
            | HubError::PublishFailed(_)
            | HubError::CertificateNotFound(_)
            | HubError::SubscribeFailed { .. } => ErrorKind::Upstream,
        }
    }
}
