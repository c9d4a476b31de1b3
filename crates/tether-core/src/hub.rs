//! The hub: registry, bridge and arbiter behind one lock.
//!
//! Every membership change, bridge transition and ownership decision runs
//! while holding [`Hub`]'s state lock. Two paths release it early:
//!
//! - `connect` marks the bridge Connecting, releases the lock while the
//!   broker handshake runs, then re-locks to commit. Concurrent connects
//!   and disconnects see Connecting and are rejected.
//! - `publish` snapshots the link under the lock and publishes outside it,
//!   so publishes never wait on each other.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tether_protocol::Reply;
use tether_transport::{BrokerEvent, BrokerLink, Quality};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::arbiter::{self, Departure, Owner, Settle};
use crate::auth::{AuthError, TokenIssuer};
use crate::bridge::{Bridge, BridgePhase, BridgeState, ConnectOutcome, Connection, DisconnectOutcome};
use crate::error::HubError;
use crate::profile::{BrokerProfile, ProfileSummary, TopicSubscription};
use crate::registry::Registry;
use crate::session::{Outbound, SessionHandle, SessionId, SessionTicket};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
        }
    }
}

/// Point-in-time view of the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub phase: BridgePhase,
    pub owner: Option<String>,
    /// Broker messages relayed since startup.
    pub relayed: u64,
}

struct HubState {
    registry: Registry,
    bridge: BridgeState,
    relayed: u64,
}

/// Shared context for every session and HTTP request.
#[derive(Clone)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
    bridge: Bridge,
    profiles: Arc<Vec<BrokerProfile>>,
    issuer: Arc<dyn TokenIssuer>,
}

impl Hub {
    /// Create a hub.
    #[must_use]
    pub fn new(
        config: HubConfig,
        bridge: Bridge,
        profiles: Vec<BrokerProfile>,
        issuer: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                registry: Registry::new(config.max_sessions),
                bridge: BridgeState::new(),
                relayed: 0,
            })),
            bridge,
            profiles: Arc::new(profiles),
            issuer,
        }
    }

    /// Profiles with secrets stripped.
    #[must_use]
    pub fn profile_summaries(&self) -> Vec<ProfileSummary> {
        self.profiles.iter().map(BrokerProfile::summary).collect()
    }

    /// Register a new session.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is full or no token can be issued.
    pub async fn join(&self, handle: SessionHandle) -> Result<SessionTicket, HubError> {
        let mut state = self.state.lock().await;
        let ticket = state.registry.register(handle, self.issuer.as_ref())?;
        info!(session = %ticket.id, members = state.registry.len(), "Session joined");
        Ok(ticket)
    }

    /// Remove a session and apply what its departure means for the bridge.
    pub async fn leave(&self, id: &SessionId) -> Departure {
        let mut state = self.state.lock().await;
        if state.registry.remove(id).is_none() {
            return Departure::Untouched;
        }

        let departure = arbiter::on_departure(
            state.bridge.phase(),
            state.bridge.owner(),
            id,
            &state.registry,
        );
        match &departure {
            Departure::Untouched => {}
            Departure::Reassigned(next) => {
                info!(from = %id, to = %next, "Connection ownership reassigned");
                state.bridge.set_owner(Owner::Session(next.clone()));
            }
            Departure::Drain => {
                info!(session = %id, "Last session left, draining broker connection");
                if let Ok(conn) = state.bridge.take_connection() {
                    let outcome = self.bridge.shutdown(conn).await;
                    debug!(status = %outcome.status(), "Drained");
                }
            }
        }
        info!(session = %id, members = state.registry.len(), "Session left");
        departure
    }

    /// Check an envelope token against the one issued to `id`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Auth`] on any mismatch.
    pub async fn authenticate(&self, id: &SessionId, token: Option<&str>) -> Result<(), HubError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let state = self.state.lock().await;
        let session = state.registry.get(id).ok_or(AuthError::UnknownSession)?;

        self.issuer.verify(token, id)?;
        if session.token != token {
            return Err(AuthError::NotIssued.into());
        }
        Ok(())
    }

    /// Record a probe response.
    pub async fn mark_alive(&self, id: &SessionId) {
        self.state.lock().await.registry.mark_alive(id);
    }

    /// Connect the bridge to the profile at `server_index`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad index, a state error if the
    /// bridge is not Disconnected, or an upstream error if the broker
    /// cannot be reached.
    pub async fn connect(
        &self,
        owner: Owner,
        server_index: Option<i64>,
    ) -> Result<ConnectOutcome, HubError> {
        let profile = self.select_profile(server_index)?.clone();
        self.state.lock().await.bridge.begin_connect()?;

        // Detached so a dropped caller cannot strand the bridge in Connecting.
        let hub = self.clone();
        tokio::spawn(async move { hub.finish_connect(owner, profile).await })
            .await
            .map_err(|e| HubError::ConnectFailed(e.to_string()))?
    }

    async fn finish_connect(
        &self,
        owner: Owner,
        profile: BrokerProfile,
    ) -> Result<ConnectOutcome, HubError> {
        let result = self.bridge.establish(&profile).await;

        let mut state = self.state.lock().await;
        let established = match result {
            Ok(established) => established,
            Err(e) => {
                state.bridge.abort_connect();
                return Err(e);
            }
        };

        let pump = self.spawn_pump(
            established.events,
            Arc::clone(&established.link),
            profile.subscriptions(),
        );
        info!(
            profile = %profile.name,
            owner = %owner,
            status = %established.outcome.status(),
            "Connected to MQTT broker"
        );
        state.bridge.complete_connect(Connection {
            owner: owner.clone(),
            link: established.link,
            profile,
            pump,
        });

        match arbiter::settle(owner, &state.registry) {
            Settle::Keep(owner) => state.bridge.set_owner(owner),
            Settle::Reassign(next) => {
                info!(to = %next, "Requester left during connect, ownership reassigned");
                state.bridge.set_owner(Owner::Session(next));
            }
            Settle::Drain => {
                info!("No sessions left after connect, draining broker connection");
                if let Ok(conn) = state.bridge.take_connection() {
                    self.bridge.shutdown(conn).await;
                }
            }
        }

        Ok(established.outcome)
    }

    /// Disconnect the bridge.
    ///
    /// A session may only drain the connection when it is the last member.
    /// `None` acts on behalf of an external caller and skips that check.
    ///
    /// # Errors
    ///
    /// Returns a state error if the bridge is not Connected or other
    /// sessions remain.
    pub async fn disconnect(
        &self,
        requester: Option<&SessionId>,
    ) -> Result<DisconnectOutcome, HubError> {
        let mut state = self.state.lock().await;
        if let Some(id) = requester {
            arbiter::check_disconnect(state.bridge.phase(), state.registry.len()).map_err(|e| {
                debug!(session = %id, reason = %e, "Disconnect refused");
                e
            })?;
        }

        let conn = state.bridge.take_connection()?;
        let outcome = self.bridge.shutdown(conn).await;
        Ok(outcome)
    }

    /// Publish through the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::MissingPublishFields`] for an empty topic,
    /// [`HubError::NotConnected`] unless Connected, or
    /// [`HubError::PublishFailed`] if the broker does not acknowledge.
    pub async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), HubError> {
        if topic.is_empty() {
            return Err(HubError::MissingPublishFields);
        }
        let link = self.state.lock().await.bridge.link()?;
        self.bridge
            .publish(link.as_ref(), topic, payload, Quality::AtLeastOnce, retain)
            .await
    }

    /// Forcibly close a session's socket. Registry membership is untouched;
    /// the socket task calls [`Hub::leave`] as it exits.
    pub async fn terminate(&self, id: &SessionId) {
        let state = self.state.lock().await;
        if let Some(session) = state.registry.get(id) {
            session.handle.send(Outbound::Terminate);
        }
    }

    /// One supervisor pass under the lock: returns sessions that missed the
    /// previous probe and probes the rest.
    pub(crate) async fn probe_sessions(&self) -> Vec<SessionId> {
        let mut state = self.state.lock().await;
        let mut dead = Vec::new();
        for session in state.registry.sessions_mut() {
            if session.alive {
                session.alive = false;
                session.handle.send(Outbound::Probe);
            } else {
                dead.push(session.id.clone());
            }
        }
        dead
    }

    /// Terminate every session and disconnect the bridge.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let sessions = state.registry.drain();
        for session in &sessions {
            session.handle.send(Outbound::Terminate);
        }
        info!(sessions = sessions.len(), "Sessions terminated");

        if let Ok(conn) = state.bridge.take_connection() {
            let outcome = self.bridge.shutdown(conn).await;
            info!(status = %outcome.status(), "Bridge shut down");
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> HubStats {
        let state = self.state.lock().await;
        HubStats {
            sessions: state.registry.len(),
            phase: state.bridge.phase(),
            owner: state.bridge.owner().map(ToString::to_string),
            relayed: state.relayed,
        }
    }

    fn select_profile(&self, server_index: Option<i64>) -> Result<&BrokerProfile, HubError> {
        let index = server_index
            .filter(|i| *i >= 0)
            .ok_or(HubError::MissingServerIndex)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| self.profiles.get(i))
            .ok_or_else(|| HubError::InvalidServerIndex(index.to_string()))
    }

    /// Relay inbound messages and re-subscribe after reconnects.
    fn spawn_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
        link: Arc<dyn BrokerLink>,
        subscriptions: Vec<TopicSubscription>,
    ) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let bridge = self.bridge.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    BrokerEvent::Message { topic, payload } => {
                        trace!(topic = %topic, bytes = payload.len(), "Broker message");
                        let reply = Reply::received(topic.as_str(), &payload);
                        let mut state = state.lock().await;
                        state.relayed += 1;
                        let delivered = state.registry.broadcast(&reply);
                        debug!(topic = %topic, delivered, "Relayed broker message");
                    }
                    BrokerEvent::Connected => {
                        info!(client_id = %link.client_id(), "Reconnected to MQTT broker, re-subscribing");
                        bridge.subscribe_all(link.as_ref(), &subscriptions).await;
                    }
                    BrokerEvent::Reconnecting { reason } => {
                        warn!(reason = %reason, "MQTT connection lost, reconnecting");
                    }
                    BrokerEvent::Failed { reason } => {
                        error!(reason = %reason, "MQTT link failed");
                    }
                    BrokerEvent::Closed => break,
                }
            }
            debug!("Broker event pump stopped");
        })
    }
}
