//! Connection handlers for Tether server.
//!
//! This module handles the session lifecycle and route dispatch.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{
    Bridge, ErrorKind, Hub, HubConfig, HubError, JwtIssuer, Outbound, Owner, SessionHandle,
    SessionId, Supervisor,
};
use tether_protocol::{close_code, codec, Envelope, ProtocolError, Reply, Route, ServerIndex};
use tether_transport::MqttTransport;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const PROBE_PAYLOAD: &[u8] = b"ping";
const AUTH_FAILED_REASON: &str = "authentication failed";

/// Shared server state.
pub struct AppState {
    /// The bridge hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state with the MQTT transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker profiles cannot be loaded.
    pub fn new(config: Config) -> Result<Self> {
        let profiles = config.broker_profiles()?;
        if profiles.is_empty() {
            warn!("No broker profiles configured");
        }

        let ttl = Duration::from_secs(config.auth.token_ttl_secs);
        let issuer = match &config.auth.secret {
            Some(secret) => JwtIssuer::new(secret.as_bytes(), ttl),
            None => {
                info!("No auth secret configured, using a per-process secret");
                JwtIssuer::ephemeral(ttl)
            }
        };

        let bridge = Bridge::new(Arc::new(MqttTransport::default()), config.bridge_settings());
        let hub = Hub::new(
            HubConfig {
                max_sessions: config.limits.max_sessions,
            },
            bridge,
            profiles,
            Arc::new(issuer),
        );

        Ok(Self { hub, config })
    }
}

/// Build the HTTP/WebSocket router.
pub fn app(state: Arc<AppState>) -> Router {
    let prefix = state.config.transport.api_prefix.trim_end_matches('/');

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route(&format!("{prefix}/servers"), get(api::servers))
        .route(&format!("{prefix}/connect"), post(api::connect))
        .route(&format!("{prefix}/disconnect"), post(api::disconnect))
        .route(&format!("{prefix}/publish"), post(api::publish))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    let refresh = if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        let period = Duration::from_millis(config.metrics.refresh_ms.max(1));
        Some(metrics::spawn_hub_refresh(state.hub.clone(), period))
    } else {
        None
    };

    let supervisor = Supervisor::spawn(state.hub.clone(), config.heartbeat_interval());

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Tether server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    supervisor.abort();
    if let Some(refresh) = refresh {
        refresh.abort();
    }
    state.hub.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// What to do after an inbound frame.
#[derive(Debug, PartialEq)]
enum Verdict {
    Reply(Reply),
    Close,
}

/// Handle a WebSocket session.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (handle, mut outbound) = SessionHandle::with_capacity(state.config.limits.max_queued_frames);
    let ticket = match state.hub.join(handle).await {
        Ok(ticket) => ticket,
        Err(e) => {
            warn!(error = %e, "Rejecting session");
            metrics::record_error(e.kind().as_str());
            return;
        }
    };
    let _metrics_guard = SessionMetricsGuard::new();
    let id = ticket.id;

    debug!(session = %id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    if send_reply(&mut sender, &Reply::session(id.as_str(), ticket.token))
        .await
        .is_err()
    {
        error!(session = %id, "Failed to send session token");
        state.hub.leave(&id).await;
        return;
    }

    let limit = state.config.limits.max_message_size;

    loop {
        tokio::select! {
            biased;

            Some(instruction) = outbound.recv() => {
                let sent = match instruction {
                    Outbound::Reply(reply) => send_reply(&mut sender, &reply).await,
                    Outbound::Probe => sender
                        .send(Message::Ping(PROBE_PAYLOAD.to_vec()))
                        .await
                        .map_err(anyhow::Error::from),
                    Outbound::Terminate => {
                        debug!(session = %id, "Session terminated");
                        break;
                    }
                };
                if sent.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => codec::decode_with_limit(&text, limit),
                    Some(Ok(Message::Binary(data))) => codec::decode_bytes(&data, limit),
                    Some(Ok(Message::Ping(data))) => {
                        state.hub.mark_alive(&id).await;
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.hub.mark_alive(&id).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %id, "WebSocket stream ended");
                        break;
                    }
                };

                match process(&state.hub, &id, frame).await {
                    Verdict::Reply(reply) => {
                        if send_reply(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Verdict::Close => {
                        let close = Message::Close(Some(CloseFrame {
                            code: close_code::AUTH_FAILED,
                            reason: AUTH_FAILED_REASON.into(),
                        }));
                        if let Err(e) = sender.send(close).await {
                            debug!(session = %id, error = %e, "Failed to send close frame");
                        }
                        break;
                    }
                }
            }
        }
    }

    state.hub.leave(&id).await;
    metrics::refresh_hub(&state.hub).await;

    debug!(session = %id, "WebSocket disconnected");
}

/// Authenticate a decoded frame and dispatch it.
async fn process(hub: &Hub, session: &SessionId, frame: Result<Envelope, ProtocolError>) -> Verdict {
    let envelope = match frame {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(session = %session, error = %e, "Malformed message");
            metrics::record_error(ErrorKind::Validation.as_str());
            return Verdict::Reply(Reply::error("malformed message"));
        }
    };

    if let Err(e) = hub.authenticate(session, envelope.token()).await {
        warn!(session = %session, route = %envelope.route, error = %e, "Authentication failed");
        metrics::record_error(e.kind().as_str());
        return Verdict::Close;
    }

    let start = Instant::now();
    let reply = dispatch(hub, session, &envelope).await;
    metrics::record_latency(start.elapsed().as_secs_f64());

    metrics::refresh_hub(hub).await;

    Verdict::Reply(reply)
}

/// Run an authenticated route command.
async fn dispatch(hub: &Hub, session: &SessionId, envelope: &Envelope) -> Reply {
    let route = envelope.route();
    metrics::record_command(route.as_str());
    debug!(session = %session, route = %route, "Route command");

    match route {
        Route::Connect => {
            let index = match requested_index(envelope.server_index.clone()) {
                Ok(index) => index,
                Err(e) => return error_reply(e),
            };
            match hub.connect(Owner::Session(session.clone()), index).await {
                Ok(outcome) => Reply::status(outcome.status()),
                Err(e) => state_as_status(e),
            }
        }
        Route::Disconnect => match hub.disconnect(Some(session)).await {
            Ok(outcome) => Reply::status(outcome.status()),
            Err(e) => state_as_status(e),
        },
        Route::Publish => {
            let (Some(topic), Some(message)) = (envelope.topic(), envelope.message_text()) else {
                return error_reply(HubError::MissingPublishFields);
            };
            match hub
                .publish(topic, Bytes::from(message), envelope.retain())
                .await
            {
                Ok(()) => {
                    metrics::record_publish("realtime");
                    Reply::published(topic, "Message published successfully")
                }
                Err(e) => error_reply(e),
            }
        }
        Route::Unknown(name) => {
            warn!(session = %session, route = %name, "Unknown route");
            Reply::error(format!("unknown route: {}", name))
        }
    }
}

/// Integer profile index for the hub; non-integer requests are invalid.
pub(crate) fn requested_index(index: Option<ServerIndex>) -> Result<Option<i64>, HubError> {
    match index {
        None => Ok(None),
        Some(ServerIndex::Index(index)) => Ok(Some(index)),
        Some(ServerIndex::Invalid(raw)) => Err(HubError::InvalidServerIndex(raw.to_string())),
    }
}

/// Connect and disconnect report state conflicts as a status line.
fn state_as_status(e: HubError) -> Reply {
    if e.kind() == ErrorKind::State {
        debug!(reason = %e, "Request refused by bridge state");
        Reply::status(e.to_string())
    } else {
        error_reply(e)
    }
}

fn error_reply(e: HubError) -> Reply {
    metrics::record_error(e.kind().as_str());
    Reply::error(e.to_string())
}

/// Send a reply to the WebSocket.
async fn send_reply(sender: &mut SplitSink<WebSocket, Message>, reply: &Reply) -> Result<()> {
    let text = codec::encode(reply)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tether_core::{BridgePhase, BrokerProfile};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    pub(crate) fn profile() -> BrokerProfile {
        BrokerProfile {
            name: "Test Server".into(),
            host: "127.0.0.1".into(),
            // Nothing listens here; connects fail fast
            port: 1,
            username: None,
            password: None,
            tls_enabled: false,
            ca_material_ref: None,
            topics: vec![],
            topic: None,
            last_will: None,
        }
    }

    pub(crate) fn state() -> Arc<AppState> {
        let mut config = Config::default();
        config.auth.secret = Some("handler-secret".into());
        config.profiles = vec![profile()];
        config.metrics.enabled = false;
        Arc::new(AppState::new(config).unwrap())
    }

    async fn joined(state: &AppState) -> (tether_core::SessionTicket, tether_core::Outbox) {
        let (handle, rx) = SessionHandle::channel();
        (state.hub.join(handle).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session() {
        let state = state();
        let (ticket, _rx) = joined(&state).await;

        let verdict = process(&state.hub, &ticket.id, codec::decode("not json")).await;
        assert_eq!(verdict, Verdict::Reply(Reply::error("malformed message")));
    }

    #[tokio::test]
    async fn test_bad_token_closes_without_side_effects() {
        let state = state();
        let (ticket, _rx) = joined(&state).await;

        let envelope = Envelope::new("connect")
            .with_token("forged")
            .with_server_index(0);
        assert_eq!(process(&state.hub, &ticket.id, Ok(envelope)).await, Verdict::Close);

        let missing = Envelope::new("publish").with_publish("a/b", "hi");
        assert_eq!(process(&state.hub, &ticket.id, Ok(missing)).await, Verdict::Close);

        assert_eq!(state.hub.stats().await.phase, BridgePhase::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_typed_fields_still_authenticate() {
        let state = state();
        let (ticket, _rx) = joined(&state).await;

        let forged = codec::decode(r#"{"route":"connect","token":"forged","serverIndex":"0"}"#);
        assert_eq!(process(&state.hub, &ticket.id, forged).await, Verdict::Close);

        let numeric = codec::decode(r#"{"route":"connect","token":12345,"serverIndex":0}"#);
        assert_eq!(process(&state.hub, &ticket.id, numeric).await, Verdict::Close);

        let text = json!({"route": "connect", "token": ticket.token, "serverIndex": "0"}).to_string();
        assert_eq!(
            process(&state.hub, &ticket.id, codec::decode(&text)).await,
            Verdict::Reply(Reply::error("Invalid serverIndex"))
        );

        let not_object = codec::decode("[\"connect\"]");
        assert_eq!(
            process(&state.hub, &ticket.id, not_object).await,
            Verdict::Reply(Reply::error("malformed message"))
        );

        assert_eq!(state.hub.stats().await.phase, BridgePhase::Disconnected);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = state();
        let (ticket, _rx) = joined(&state).await;

        let envelope = Envelope::new("subscribe").with_token(ticket.token.clone());
        assert_eq!(
            process(&state.hub, &ticket.id, Ok(envelope)).await,
            Verdict::Reply(Reply::error("unknown route: subscribe"))
        );
    }

    #[tokio::test]
    async fn test_route_validation_replies() {
        let state = state();
        let (ticket, _rx) = joined(&state).await;
        let token = ticket.token.clone();

        let out_of_range = Envelope::new("connect").with_token(token.clone()).with_server_index(5);
        assert_eq!(
            dispatch(&state.hub, &ticket.id, &out_of_range).await,
            Reply::error("Invalid serverIndex")
        );

        let no_index = Envelope::new("connect").with_token(token.clone());
        assert_eq!(
            dispatch(&state.hub, &ticket.id, &no_index).await,
            Reply::error("serverIndex is required")
        );

        let no_message = Envelope {
            topic: Some("test/data".into()),
            ..Envelope::new("publish").with_token(token.clone())
        };
        assert_eq!(
            dispatch(&state.hub, &ticket.id, &no_message).await,
            Reply::error("topic and message are required")
        );

        let not_connected = Envelope::new("publish").with_token(token.clone()).with_publish("test/data", "1");
        assert_eq!(
            dispatch(&state.hub, &ticket.id, &not_connected).await,
            Reply::error("Not connected to MQTT broker")
        );

        let disconnect = Envelope::new("disconnect").with_token(token);
        assert_eq!(
            dispatch(&state.hub, &ticket.id, &disconnect).await,
            Reply::status("Not connected to MQTT broker")
        );
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker() {
        let state = state();
        let (ticket, _rx) = joined(&state).await;

        let envelope = Envelope::new("connect")
            .with_token(ticket.token.clone())
            .with_server_index(0);
        let reply = dispatch(&state.hub, &ticket.id, &envelope).await;
        assert!(reply.is_error());
        assert_eq!(state.hub.stats().await.phase, BridgePhase::Disconnected);
    }

    #[tokio::test]
    async fn test_websocket_session() {
        let state = state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(Arc::clone(&state));
        let server = tokio::spawn(async move { axum::serve(listener, router).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/ws", addr))
            .await
            .unwrap();

        let hello: Value = match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        };
        let token = hello["token"].as_str().unwrap().to_string();
        assert!(hello["sessionId"].is_string());

        ws.send(WsMessage::Text(
            json!({"route": "publish", "token": token, "topic": "a/b", "message": "hi"}).to_string(),
        ))
        .await
        .unwrap();
        let reply: Value = match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        };
        assert_eq!(reply, json!({"error": "Not connected to MQTT broker"}));

        ws.send(WsMessage::Text(json!({"route": "disconnect", "token": "forged"}).to_string()))
            .await
            .unwrap();
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), close_code::AUTH_FAILED);
                assert_eq!(frame.reason, AUTH_FAILED_REASON);
            }
            other => panic!("expected close, got {:?}", other),
        }

        // The session is gone once its socket task exits
        while state.hub.stats().await.sessions > 0 {
            tokio::task::yield_now().await;
        }
        server.abort();
    }
}
