//! HTTP API mirroring the realtime routes.
//!
//! Requests act without an owning session, and disconnect is not subject
//! to the "other sessions still connected" check.

use axum::{extract::State, http::StatusCode, Json};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tether_core::{ErrorKind, HubError, Owner};
use tether_protocol::ServerIndex;
use tracing::{debug, info};

use crate::handlers::{requested_index, AppState};
use crate::metrics;

type ApiResponse = (StatusCode, Json<Value>);

/// Body of `POST {prefix}/connect`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBody {
    #[serde(default)]
    pub server_index: Option<ServerIndex>,
}

/// Body of `POST {prefix}/publish`.
#[derive(Debug, Default, Deserialize)]
pub struct PublishBody {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub retain: Option<bool>,
}

/// `GET {prefix}/servers`: profiles with secrets stripped.
pub async fn servers(State(state): State<Arc<AppState>>) -> ApiResponse {
    let summaries = state.hub.profile_summaries();
    if summaries.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No servers found" })),
        );
    }
    (StatusCode::OK, Json(json!(summaries)))
}

/// `POST {prefix}/connect`.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ConnectBody>>,
) -> ApiResponse {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    metrics::record_command("connect");

    let index = match requested_index(body.server_index) {
        Ok(index) => index,
        Err(e) => return error_response(e),
    };
    let result = state.hub.connect(Owner::External, index).await;
    metrics::refresh_hub(&state.hub).await;

    match result {
        Ok(outcome) => {
            let mut reply = json!({ "status": outcome.status() });
            if !outcome.warnings.is_empty() {
                reply["warnings"] = json!(outcome.warnings);
            }
            (StatusCode::OK, Json(reply))
        }
        Err(e) => error_response(e),
    }
}

/// `POST {prefix}/disconnect`.
pub async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResponse {
    metrics::record_command("disconnect");

    let result = state.hub.disconnect(None).await;
    metrics::refresh_hub(&state.hub).await;

    match result {
        Ok(outcome) => (StatusCode::OK, Json(json!({ "status": outcome.status() }))),
        Err(e) => error_response(e),
    }
}

/// `POST {prefix}/publish`.
pub async fn publish(
    State(state): State<Arc<AppState>>,
    body: Option<Json<PublishBody>>,
) -> ApiResponse {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    metrics::record_command("publish");

    let topic = body.topic.filter(|t| !t.is_empty());
    let payload = body.message.as_ref().and_then(normalize_message);
    let (Some(topic), Some(payload)) = (topic, payload) else {
        return error_response(HubError::MissingPublishFields);
    };

    info!(topic = %topic, "Publishing message");
    debug!(topic = %topic, payload = %payload, "Message content");

    match state
        .hub
        .publish(&topic, Bytes::from(payload), body.retain.unwrap_or(false))
        .await
    {
        Ok(()) => {
            metrics::record_publish("http");
            (
                StatusCode::OK,
                Json(json!({ "status": "Message published successfully" })),
            )
        }
        Err(e) => error_response(e),
    }
}

/// Publishable JSON text for an HTTP message.
///
/// Strings holding JSON are published as that JSON; other strings are
/// wrapped as `{"content": text}`. Empty or null messages are absent.
fn normalize_message(message: &Value) -> Option<String> {
    match message {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(match serde_json::from_str::<Value>(s) {
            Ok(parsed) => parsed.to_string(),
            Err(_) => json!({ "content": s }).to_string(),
        }),
        other => Some(other.to_string()),
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::State => StatusCode::CONFLICT,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(e: HubError) -> ApiResponse {
    let kind = e.kind();
    metrics::record_error(kind.as_str());
    debug!(kind = kind.as_str(), error = %e, "API request failed");
    (status_for(kind), Json(json!({ "error": e.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::tests::state;

    #[test]
    fn test_normalize_message() {
        assert_eq!(
            normalize_message(&json!("{\"temp\": 21}")).unwrap(),
            "{\"temp\":21}"
        );
        assert_eq!(
            normalize_message(&json!("hello")).unwrap(),
            "{\"content\":\"hello\"}"
        );
        assert_eq!(normalize_message(&json!({"a": 1})).unwrap(), "{\"a\":1}");
        assert!(normalize_message(&json!("")).is_none());
        assert!(normalize_message(&Value::Null).is_none());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_for(HubError::MissingServerIndex.kind()), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(HubError::NotConnected.kind()), StatusCode::CONFLICT);
        assert_eq!(
            status_for(HubError::ConnectFailed("x".into()).kind()),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_servers_listing() {
        let (status, Json(body)) = servers(State(state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "Test Server");
        assert!(body[0].get("password").is_none());

        let mut config = Config::default();
        config.metrics.enabled = false;
        let empty = Arc::new(AppState::new(config).unwrap());
        let (status, Json(body)) = servers(State(empty)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "No servers found" }));
    }

    #[tokio::test]
    async fn test_connect_validation() {
        let state = state();

        let (status, Json(body)) = connect(
            State(Arc::clone(&state)),
            Some(Json(ConnectBody {
                server_index: Some(ServerIndex::Index(3)),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid serverIndex" }));

        let (status, _) = connect(State(Arc::clone(&state)), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let body: ConnectBody = serde_json::from_value(json!({ "serverIndex": "0" })).unwrap();
        let (status, Json(body)) = connect(State(state), Some(Json(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid serverIndex" }));
    }

    #[tokio::test]
    async fn test_connect_unreachable_broker() {
        let state = state();
        let (status, Json(body)) = connect(
            State(state),
            Some(Json(ConnectBody {
                server_index: Some(ServerIndex::Index(0)),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to connect to MQTT broker"));
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let (status, Json(body)) = disconnect(State(state())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, json!({ "error": "Not connected to MQTT broker" }));
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let state = state();

        let (status, Json(body)) = publish(
            State(Arc::clone(&state)),
            Some(Json(PublishBody {
                topic: Some("test/data".into()),
                message: None,
                retain: None,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "topic and message are required" }));

        let (status, _) = publish(
            State(state),
            Some(Json(PublishBody {
                topic: Some("test/data".into()),
                message: Some(json!("hello")),
                retain: Some(true),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
