//! MQTT transport implementation.
//!
//! This module provides the broker link on top of `rumqttc`. A single
//! driver task owns the `EventLoop` and the `AsyncClient`; the link talks to
//! it over a request channel so every acknowledgment can be matched to the
//! request that caused it.
//!
//! Acknowledgments are matched in submission order, so the driver and
//! rumqttc must agree on what is outstanding. Requests are only handed to
//! rumqttc while connected, and a connection error fails every outstanding
//! request and discards whatever rumqttc would otherwise replay after the
//! reconnect.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    LastWill as MqttLastWill, MqttOptions, Outgoing, QoS, SubscribeReasonCode, TlsConfiguration,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::traits::{
    BrokerEvent, BrokerLink, BrokerTransport, ConnectRequest, Opened, Quality, TransportError,
};

/// Smallest keep-alive rumqttc accepts without complaint.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// MQTT transport configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Capacity of the rumqttc request channel.
    pub request_capacity: usize,
    /// Maximum incoming packet size in bytes.
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            request_capacity: 64,
            max_packet_size: 256 * 1024,
        }
    }
}

/// MQTT transport.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport {
    config: MqttConfig,
}

impl MqttTransport {
    /// Create a new MQTT transport.
    #[must_use]
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn options(&self, request: &ConnectRequest) -> MqttOptions {
        let mut options = MqttOptions::new(&request.client_id, &request.host, request.port);
        options.set_clean_session(request.clean_session);
        options.set_keep_alive(request.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);

        if let Some((username, password)) = &request.credentials {
            options.set_credentials(username, password);
        }

        if let Some(ca) = &request.ca {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: None,
            }));
        }

        if let Some(will) = &request.last_will {
            options.set_last_will(MqttLastWill::new(
                will.topic.clone(),
                will.payload.to_vec(),
                to_qos(will.quality),
                will.retain,
            ));
        }

        options
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn open(&self, request: ConnectRequest) -> Result<Opened, TransportError> {
        info!(
            client_id = %request.client_id,
            host = %request.host,
            port = request.port,
            secure = request.is_secure(),
            "Opening MQTT connection"
        );

        let options = self.options(&request);
        let (client, eventloop) = AsyncClient::new(options, self.config.request_capacity);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(
            client,
            eventloop,
            request_rx,
            event_tx,
            request.reconnect_period,
        );
        tokio::spawn(driver.run());

        let link = MqttLink {
            client_id: request.client_id,
            requests: request_tx,
        };

        Ok(Opened {
            link: Arc::new(link),
            events: event_rx,
        })
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

type Ack = oneshot::Sender<Result<(), TransportError>>;

enum Request {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        done: Ack,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        done: Ack,
    },
    Close {
        done: Ack,
    },
}

/// A handle to a running MQTT driver.
pub struct MqttLink {
    client_id: String,
    requests: mpsc::UnboundedSender<Request>,
}

impl MqttLink {
    async fn submit(
        &self,
        build: impl FnOnce(Ack) -> Request,
    ) -> Result<(), TransportError> {
        let (done, wait) = oneshot::channel();
        self.requests
            .send(build(done))
            .map_err(|_| TransportError::ConnectionClosed)?;
        wait.await.map_err(|_| TransportError::ConnectionClosed)?
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        quality: Quality,
        retain: bool,
    ) -> Result<(), TransportError> {
        let topic = topic.to_string();
        self.submit(|done| Request::Publish {
            topic,
            payload,
            qos: to_qos(quality),
            retain,
            done,
        })
        .await
    }

    async fn subscribe(&self, topic: &str, quality: Quality) -> Result<(), TransportError> {
        let topic = topic.to_string();
        self.submit(|done| Request::Subscribe {
            topic,
            qos: to_qos(quality),
            done,
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        match self.submit(|done| Request::Close { done }).await {
            // Driver already gone counts as closed.
            Err(TransportError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Owns the rumqttc event loop for one link.
struct Driver {
    client: AsyncClient,
    eventloop: EventLoop,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    reconnect_period: Duration,
    connected: bool,
    connected_once: bool,
    /// Requests handed to rumqttc, waiting for their packet id.
    queued_publishes: VecDeque<Ack>,
    queued_subscribes: VecDeque<(String, Ack)>,
    /// Requests on the wire, waiting for the broker.
    inflight_publishes: HashMap<u16, Ack>,
    inflight_subscribes: HashMap<u16, (String, Ack)>,
    closing: Option<Ack>,
}

impl Driver {
    fn new(
        client: AsyncClient,
        eventloop: EventLoop,
        requests: mpsc::UnboundedReceiver<Request>,
        events: mpsc::UnboundedSender<BrokerEvent>,
        reconnect_period: Duration,
    ) -> Self {
        Self {
            client,
            eventloop,
            requests,
            events,
            reconnect_period,
            connected: false,
            connected_once: false,
            queued_publishes: VecDeque::new(),
            queued_subscribes: VecDeque::new(),
            inflight_publishes: HashMap::new(),
            inflight_subscribes: HashMap::new(),
            closing: None,
        }
    }

    async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                biased;

                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("MQTT link dropped, stopping driver");
                        let _ = self.client.try_disconnect();
                        Flow::Stop
                    }
                },

                event = self.eventloop.poll() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(err) => self.handle_error(err).await,
                },
            };

            if flow == Flow::Stop {
                break;
            }
        }

        self.fail_pending();
        if let Some(done) = self.closing.take() {
            let _ = done.send(Ok(()));
        }
        let _ = self.events.send(BrokerEvent::Closed);
        debug!("MQTT driver stopped");
    }

    fn handle_request(&mut self, request: Request) -> Flow {
        match request {
            Request::Publish { done, .. } | Request::Subscribe { done, .. } if !self.connected => {
                let _ = done.send(Err(TransportError::ConnectionClosed));
            }
            Request::Publish {
                topic,
                payload,
                qos,
                retain,
                done,
            } => match self.client.try_publish(topic, qos, retain, payload.to_vec()) {
                Ok(()) => self.queued_publishes.push_back(done),
                Err(e) => {
                    let _ = done.send(Err(TransportError::PublishFailed(e.to_string())));
                }
            },
            Request::Subscribe { topic, qos, done } => {
                match self.client.try_subscribe(topic.clone(), qos) {
                    Ok(()) => self.queued_subscribes.push_back((topic, done)),
                    Err(e) => {
                        let _ = done.send(Err(TransportError::SubscribeFailed(e.to_string())));
                    }
                }
            }
            Request::Close { done } => {
                if !self.connected {
                    let _ = done.send(Ok(()));
                    return Flow::Stop;
                }
                if let Err(e) = self.client.try_disconnect() {
                    warn!(error = %e, "Failed to queue MQTT disconnect");
                    let _ = done.send(Ok(()));
                    return Flow::Stop;
                }
                self.closing = Some(done);
            }
        }
        Flow::Continue
    }

    fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Incoming(packet) => {
                trace!(packet = ?packet, "MQTT packet received");
                match packet {
                    Incoming::ConnAck(ack) => {
                        if ack.code != ConnectReturnCode::Success {
                            let reason = format!("{:?}", ack.code);
                            return self.refused(reason);
                        }
                        if self.connected_once {
                            info!("Reconnected to MQTT broker");
                        } else {
                            info!("Connected to MQTT broker");
                        }
                        self.connected = true;
                        self.connected_once = true;
                        let _ = self.events.send(BrokerEvent::Connected);
                    }
                    Incoming::Publish(publish) => {
                        let _ = self.events.send(BrokerEvent::Message {
                            topic: publish.topic,
                            payload: publish.payload,
                        });
                    }
                    Incoming::PubAck(ack) => self.settle_publish(ack.pkid),
                    Incoming::PubComp(comp) => self.settle_publish(comp.pkid),
                    Incoming::SubAck(ack) => {
                        if let Some((topic, done)) = self.inflight_subscribes.remove(&ack.pkid) {
                            let refused = ack
                                .return_codes
                                .iter()
                                .any(|code| matches!(code, SubscribeReasonCode::Failure));
                            let result = if refused {
                                Err(TransportError::SubscribeFailed(format!(
                                    "broker refused subscription to '{}'",
                                    topic
                                )))
                            } else {
                                Ok(())
                            };
                            let _ = done.send(result);
                        }
                    }
                    _ => {}
                }
            }
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => {
                    if let Some(done) = self.queued_publishes.pop_front() {
                        if pkid == 0 {
                            let _ = done.send(Ok(()));
                        } else {
                            self.inflight_publishes.insert(pkid, done);
                        }
                    }
                }
                Outgoing::Subscribe(pkid) => {
                    if let Some(entry) = self.queued_subscribes.pop_front() {
                        self.inflight_subscribes.insert(pkid, entry);
                    }
                }
                Outgoing::Disconnect => {
                    if self.closing.is_some() {
                        debug!("MQTT disconnect sent");
                        return Flow::Stop;
                    }
                }
                _ => {}
            },
        }
        Flow::Continue
    }

    async fn handle_error(&mut self, err: ConnectionError) -> Flow {
        if self.closing.is_some() {
            return Flow::Stop;
        }

        self.connected = false;
        self.discard_unsent();

        if let ConnectionError::ConnectionRefused(code) = &err {
            return self.refused(format!("{:?}", code));
        }

        if !self.connected_once {
            error!(error = %err, "MQTT connection failed");
            let _ = self.events.send(BrokerEvent::Failed {
                reason: err.to_string(),
            });
            return Flow::Stop;
        }

        warn!(
            error = %err,
            retry_in_ms = self.reconnect_period.as_millis() as u64,
            "MQTT connection lost, reconnecting"
        );
        let _ = self.events.send(BrokerEvent::Reconnecting {
            reason: err.to_string(),
        });
        tokio::time::sleep(self.reconnect_period).await;
        Flow::Continue
    }

    fn refused(&mut self, reason: String) -> Flow {
        error!(reason = %reason, "MQTT connection refused");
        let event = if self.connected_once {
            BrokerEvent::Reconnecting { reason }
        } else {
            BrokerEvent::Failed { reason }
        };
        let _ = self.events.send(event);
        if self.connected_once {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn settle_publish(&mut self, pkid: u16) {
        if let Some(done) = self.inflight_publishes.remove(&pkid) {
            let _ = done.send(Ok(()));
        }
    }

    /// Drop what rumqttc kept from the lost connection and fail its callers.
    fn discard_unsent(&mut self) {
        let replayed = self.eventloop.pending.len();
        if replayed > 0 {
            debug!(requests = replayed, "Discarding unacknowledged MQTT requests");
        }
        self.eventloop.pending.clear();
        self.eventloop.state.collision = None;
        self.eventloop
            .state
            .events
            .retain(|event| matches!(event, Event::Incoming(_)));
        self.fail_pending();
    }

    fn fail_pending(&mut self) {
        for done in self.queued_publishes.drain(..) {
            let _ = done.send(Err(TransportError::ConnectionClosed));
        }
        for (_, done) in self.inflight_publishes.drain() {
            let _ = done.send(Err(TransportError::ConnectionClosed));
        }
        for (_, done) in self.queued_subscribes.drain(..) {
            let _ = done.send(Err(TransportError::ConnectionClosed));
        }
        for (_, (_, done)) in self.inflight_subscribes.drain() {
            let _ = done.send(Err(TransportError::ConnectionClosed));
        }
    }
}

fn to_qos(quality: Quality) -> QoS {
    match quality {
        Quality::AtMostOnce => QoS::AtMostOnce,
        Quality::AtLeastOnce => QoS::AtLeastOnce,
        Quality::ExactlyOnce => QoS::ExactlyOnce,
    }
}
