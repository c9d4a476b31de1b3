//! Transport abstraction traits for Tether.
//!
//! These traits define what the bridge needs from an upstream broker
//! client, allowing the bridge to be tested without a live broker.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// MQTT delivery quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Quality {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<Quality> for u8 {
    fn from(q: Quality) -> u8 {
        q as u8
    }
}

impl TryFrom<u8> for Quality {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Quality::AtMostOnce),
            1 => Ok(Quality::AtLeastOnce),
            2 => Ok(Quality::ExactlyOnce),
            _ => Err("Invalid quality of service"),
        }
    }
}

/// Message the broker publishes on our behalf after an unclean loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub quality: Quality,
    pub retain: bool,
}

/// Everything needed to open one broker connection.
#[derive(Clone)]
pub struct ConnectRequest {
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Broker host name, without scheme.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional username/password pair.
    pub credentials: Option<(String, String)>,
    /// Start with a clean session.
    pub clean_session: bool,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Delay between automatic reconnect attempts once connected.
    pub reconnect_period: Duration,
    /// PEM-encoded CA material. `Some` selects the TLS variant.
    pub ca: Option<Vec<u8>>,
    /// Last-Will-Testament.
    pub last_will: Option<LastWill>,
}

impl ConnectRequest {
    /// Whether the request selects the secure protocol variant.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.ca.is_some()
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.credentials.as_ref().map(|(u, _)| u))
            .field("clean_session", &self.clean_session)
            .field("secure", &self.is_secure())
            .field("last_will", &self.last_will)
            .finish()
    }
}

/// Signals raised by an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The broker accepted the connection (first connect or reconnect).
    Connected,
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Bytes },
    /// The connection dropped; the link is retrying on its own.
    Reconnecting { reason: String },
    /// The connection failed before it was ever established.
    Failed { reason: String },
    /// The link is gone for good.
    Closed,
}

/// A freshly opened link plus its event stream.
pub struct Opened {
    pub link: Arc<dyn BrokerLink>,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Link was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Timed out")]
    Timeout,

    /// Broker refused the connection.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Publish was not accepted.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Subscription was not granted.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// TLS setup failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Something that can open broker links.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Start connecting.
    ///
    /// Returns as soon as the link exists; the outcome of the attempt is
    /// reported as the first [`BrokerEvent::Connected`] or
    /// [`BrokerEvent::Failed`] on the event stream.
    async fn open(&self, request: ConnectRequest) -> Result<Opened, TransportError>;

    /// Get the transport name (e.g., "mqtt").
    fn name(&self) -> &'static str;
}

/// One open broker connection.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Client identifier this link connected with.
    fn client_id(&self) -> &str;

    /// Publish and wait for the broker to acknowledge (immediately for QoS 0).
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        quality: Quality,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Subscribe and wait for the broker to grant it.
    async fn subscribe(&self, topic: &str, quality: Quality) -> Result<(), TransportError>;

    /// Disconnect cleanly and stop the link.
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_conversion() {
        assert_eq!(Quality::try_from(0), Ok(Quality::AtMostOnce));
        assert_eq!(Quality::try_from(1), Ok(Quality::AtLeastOnce));
        assert_eq!(Quality::try_from(2), Ok(Quality::ExactlyOnce));
        assert!(Quality::try_from(3).is_err());
        assert_eq!(u8::from(Quality::ExactlyOnce), 2);
    }

    #[test]
    fn test_quality_serde() {
        let q: Quality = serde_json::from_str("2").unwrap();
        assert_eq!(q, Quality::ExactlyOnce);
        assert!(serde_json::from_str::<Quality>("7").is_err());
        assert_eq!(serde_json::to_string(&Quality::AtMostOnce).unwrap(), "0");
    }

    #[test]
    fn test_connect_request_debug_hides_password() {
        let request = ConnectRequest {
            client_id: "mqtt_1".into(),
            host: "localhost".into(),
            port: 1883,
            credentials: Some(("user".into(), "hunter2".into())),
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            reconnect_period: Duration::from_secs(1),
            ca: None,
            last_will: None,
        };
        let debug = format!("{:?}", request);
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
        assert!(!request.is_secure());
    }
}
