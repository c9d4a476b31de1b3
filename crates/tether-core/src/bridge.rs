//! The single upstream broker connection.
//!
//! [`BridgeState`] is the state machine (Disconnected → Connecting →
//! Connected → Disconnected). [`Bridge`] performs the transport work for
//! each transition; it holds no state of its own so the hub can run it
//! without holding its lock where that is safe.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::{
    BrokerEvent, BrokerLink, BrokerTransport, ConnectRequest, LastWill, Quality,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::arbiter::Owner;
use crate::error::HubError;
use crate::profile::{BrokerProfile, TopicSubscription};

/// Observable bridge phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgePhase {
    Disconnected,
    Connecting,
    Connected,
}

impl BridgePhase {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgePhase::Disconnected => "disconnected",
            BridgePhase::Connecting => "connecting",
            BridgePhase::Connected => "connected",
        }
    }
}

/// Bridge tuning.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Bound on waiting for the broker to accept a connect.
    pub connect_timeout: Duration,
    /// Bound on waiting for a publish or subscribe acknowledgment.
    pub ack_timeout: Duration,
    /// Delay between automatic reconnect attempts.
    pub reconnect_period: Duration,
    /// MQTT keep-alive.
    pub keep_alive: Duration,
    /// Marker topic for profiles without a Last-Will.
    pub status_topic: String,
    /// Retained payload announcing the bridge online.
    pub online_payload: String,
    /// Retained payload announcing the bridge offline.
    pub offline_payload: String,
    /// Prefix of generated client identifiers.
    pub client_id_prefix: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(4000),
            ack_timeout: Duration::from_millis(5000),
            reconnect_period: Duration::from_millis(1000),
            keep_alive: Duration::from_secs(30),
            status_topic: "test/online".to_string(),
            online_payload: "1".to_string(),
            offline_payload: "0".to_string(),
            client_id_prefix: "mqtt_".to_string(),
        }
    }
}

/// A live broker connection.
pub(crate) struct Connection {
    pub owner: Owner,
    pub link: Arc<dyn BrokerLink>,
    pub profile: BrokerProfile,
    pub pump: JoinHandle<()>,
}

enum State {
    Disconnected,
    Connecting,
    Connected(Connection),
}

/// The bridge state machine.
pub(crate) struct BridgeState {
    state: State,
}

impl BridgeState {
    pub fn new() -> Self {
        Self {
            state: State::Disconnected,
        }
    }

    pub fn phase(&self) -> BridgePhase {
        match self.state {
            State::Disconnected => BridgePhase::Disconnected,
            State::Connecting => BridgePhase::Connecting,
            State::Connected(_) => BridgePhase::Connected,
        }
    }

    pub fn owner(&self) -> Option<&Owner> {
        match &self.state {
            State::Connected(conn) => Some(&conn.owner),
            _ => None,
        }
    }

    pub fn set_owner(&mut self, owner: Owner) {
        if let State::Connected(conn) = &mut self.state {
            conn.owner = owner;
        }
    }

    /// Disconnected → Connecting.
    pub fn begin_connect(&mut self) -> Result<(), HubError> {
        match self.state {
            State::Disconnected => {
                self.state = State::Connecting;
                Ok(())
            }
            State::Connecting => Err(HubError::AlreadyConnecting),
            State::Connected(_) => Err(HubError::AlreadyConnected),
        }
    }

    /// Connecting → Disconnected.
    pub fn abort_connect(&mut self) {
        if matches!(self.state, State::Connecting) {
            self.state = State::Disconnected;
        }
    }

    /// Connecting → Connected.
    pub fn complete_connect(&mut self, conn: Connection) {
        debug_assert!(matches!(self.state, State::Connecting));
        self.state = State::Connected(conn);
    }

    /// Connected → Disconnected, handing back the connection to drain.
    pub fn take_connection(&mut self) -> Result<Connection, HubError> {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Connected(conn) => Ok(conn),
            State::Connecting => {
                self.state = State::Connecting;
                Err(HubError::AlreadyConnecting)
            }
            State::Disconnected => Err(HubError::NotConnected),
        }
    }

    /// The link, if connected.
    pub fn link(&self) -> Result<Arc<dyn BrokerLink>, HubError> {
        match &self.state {
            State::Connected(conn) => Ok(Arc::clone(&conn.link)),
            _ => Err(HubError::NotConnected),
        }
    }
}

/// Result of establishing a connection.
pub(crate) struct Established {
    pub link: Arc<dyn BrokerLink>,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
    pub outcome: ConnectOutcome,
}

/// How a successful connect went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Whether the online marker was acknowledged.
    pub marker_published: bool,
    /// Subscriptions the broker refused.
    pub warnings: Vec<String>,
}

impl ConnectOutcome {
    /// Status line reported to the requester.
    #[must_use]
    pub fn status(&self) -> String {
        if self.marker_published {
            "Connected and published online status".to_string()
        } else {
            "Connected but failed to publish online status".to_string()
        }
    }
}

/// How a disconnect went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOutcome {
    /// Whether the offline marker was acknowledged.
    pub marker_published: bool,
}

impl DisconnectOutcome {
    /// Status line reported to the requester.
    #[must_use]
    pub fn status(&self) -> String {
        if self.marker_published {
            "Disconnected and published offline status".to_string()
        } else {
            "Disconnected but failed to publish offline status".to_string()
        }
    }
}

/// Transport work for bridge transitions.
#[derive(Clone)]
pub struct Bridge {
    transport: Arc<dyn BrokerTransport>,
    settings: Arc<BridgeSettings>,
}

impl Bridge {
    /// Create a bridge over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>, settings: BridgeSettings) -> Self {
        Self {
            transport,
            settings: Arc::new(settings),
        }
    }

    /// Bridge tuning.
    #[must_use]
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Topic the online/offline markers go to.
    #[must_use]
    pub fn marker_topic<'a>(&'a self, profile: &'a BrokerProfile) -> &'a str {
        profile
            .last_will
            .as_ref()
            .map_or(self.settings.status_topic.as_str(), |will| will.topic.as_str())
    }

    /// Build a fresh connect request for a profile.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::CertificateNotFound`] if the profile needs TLS
    /// and its CA material cannot be read.
    pub fn connect_request(&self, profile: &BrokerProfile) -> Result<ConnectRequest, HubError> {
        let (host, _) = profile.endpoint();
        let client_id = format!(
            "{}{}",
            self.settings.client_id_prefix,
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );

        let mut request = ConnectRequest {
            client_id,
            host: host.to_string(),
            port: profile.port,
            credentials: profile
                .username
                .clone()
                .map(|u| (u, profile.password.clone().unwrap_or_default())),
            clean_session: true,
            keep_alive: self.settings.keep_alive,
            reconnect_period: self.settings.reconnect_period,
            ca: None,
            last_will: None,
        };

        if profile.requires_tls() {
            request.ca = Some(profile.load_ca()?);
            request.last_will = Some(match &profile.last_will {
                Some(will) => LastWill {
                    topic: will.topic.clone(),
                    payload: Bytes::from(will.payload.clone()),
                    quality: will.quality,
                    retain: will.retain,
                },
                None => LastWill {
                    topic: self.settings.status_topic.clone(),
                    payload: Bytes::from(self.settings.offline_payload.clone()),
                    quality: Quality::AtLeastOnce,
                    retain: true,
                },
            });
        }

        Ok(request)
    }

    /// Open a link, wait for the broker, announce online, subscribe.
    pub(crate) async fn establish(&self, profile: &BrokerProfile) -> Result<Established, HubError> {
        let request = self.connect_request(profile)?;
        info!(
            profile = %profile.name,
            client_id = %request.client_id,
            secure = request.is_secure(),
            "Connecting to MQTT broker"
        );

        let opened = self
            .transport
            .open(request)
            .await
            .map_err(|e| HubError::ConnectFailed(e.to_string()))?;
        let link = opened.link;
        let mut events = opened.events;

        let waited = timeout(self.settings.connect_timeout, wait_connected(&mut events)).await;
        let failure = match waited {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some(format!(
                "timed out after {}ms",
                self.settings.connect_timeout.as_millis()
            )),
        };
        if let Some(reason) = failure {
            error!(profile = %profile.name, reason = %reason, "Connection to MQTT broker failed");
            if let Err(e) = link.close().await {
                debug!(error = %e, "Closing failed link");
            }
            return Err(HubError::ConnectFailed(reason));
        }

        let marker_published = self
            .publish_marker(link.as_ref(), profile, &self.settings.online_payload)
            .await;

        let warnings = self
            .subscribe_all(link.as_ref(), &profile.subscriptions())
            .await
            .into_iter()
            .map(|e| e.to_string())
            .collect();

        Ok(Established {
            link,
            events,
            outcome: ConnectOutcome {
                marker_published,
                warnings,
            },
        })
    }

    /// Subscribe to every topic. Failures are logged and returned, never fatal.
    pub(crate) async fn subscribe_all(
        &self,
        link: &dyn BrokerLink,
        subscriptions: &[TopicSubscription],
    ) -> Vec<HubError> {
        let mut failures = Vec::new();
        for sub in subscriptions {
            let result = timeout(
                self.settings.ack_timeout,
                link.subscribe(&sub.value, sub.quality),
            )
            .await;
            match result {
                Ok(Ok(())) => info!(topic = %sub.value, quality = ?sub.quality, "Subscribed"),
                Ok(Err(e)) => {
                    warn!(topic = %sub.value, error = %e, "Failed to subscribe");
                    failures.push(HubError::SubscribeFailed {
                        topic: sub.value.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(topic = %sub.value, "Subscribe timed out");
                    failures.push(HubError::SubscribeFailed {
                        topic: sub.value.clone(),
                        reason: "timed out".to_string(),
                    });
                }
            }
        }
        failures
    }

    /// Announce offline (best effort) and close the link.
    pub(crate) async fn shutdown(&self, conn: Connection) -> DisconnectOutcome {
        let marker_published = self
            .publish_marker(conn.link.as_ref(), &conn.profile, &self.settings.offline_payload)
            .await;

        if let Err(e) = conn.link.close().await {
            warn!(error = %e, "Error closing MQTT link");
        }
        conn.pump.abort();
        info!(profile = %conn.profile.name, "Disconnected from MQTT broker");

        DisconnectOutcome { marker_published }
    }

    /// Publish through a link and wait for the acknowledgment.
    pub(crate) async fn publish(
        &self,
        link: &dyn BrokerLink,
        topic: &str,
        payload: Bytes,
        quality: Quality,
        retain: bool,
    ) -> Result<(), HubError> {
        match timeout(
            self.settings.ack_timeout,
            link.publish(topic, payload, quality, retain),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(topic = %topic, retain, "Message published");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(topic = %topic, error = %e, "Failed to publish message");
                Err(HubError::PublishFailed(e.to_string()))
            }
            Err(_) => {
                warn!(topic = %topic, "Publish timed out");
                Err(HubError::PublishFailed("timed out".to_string()))
            }
        }
    }

    async fn publish_marker(
        &self,
        link: &dyn BrokerLink,
        profile: &BrokerProfile,
        payload: &str,
    ) -> bool {
        let topic = self.marker_topic(profile);
        match self
            .publish(
                link,
                topic,
                Bytes::from(payload.to_string()),
                Quality::AtLeastOnce,
                true,
            )
            .await
        {
            Ok(()) => {
                info!(topic = %topic, payload = %payload, "Published status marker");
                true
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to publish status marker");
                false
            }
        }
    }
}

/// Wait for the first connected/failed signal.
async fn wait_connected(events: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> Result<(), String> {
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Connected => return Ok(()),
            BrokerEvent::Failed { reason } => return Err(reason),
            BrokerEvent::Reconnecting { reason } => {
                warn!(reason = %reason, "MQTT reconnect attempt before connect settled");
            }
            BrokerEvent::Message { topic, .. } => {
                debug!(topic = %topic, "Message before connect settled, dropped");
            }
            BrokerEvent::Closed => break,
        }
    }
    Err("connection closed".to_string())
}
