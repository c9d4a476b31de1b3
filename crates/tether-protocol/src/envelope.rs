//! Client → server envelopes.
//!
//! An envelope is a flat JSON object: the route name, the session token and
//! whatever fields that route needs. Fields that a route does not use are
//! ignored.
//!
//! Any JSON object is an envelope. A field holding the wrong JSON type reads
//! as absent, except `serverIndex`, which keeps the raw value so the route
//! can reject it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A route named by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Open the shared broker connection.
    Connect,
    /// Drain the shared broker connection.
    Disconnect,
    /// Publish a message through the broker.
    Publish,
    /// Anything else, kept verbatim for the error reply.
    Unknown(String),
}

impl Route {
    /// Parse a route name.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "connect" => Route::Connect,
            "disconnect" => Route::Disconnect,
            "publish" => Route::Publish,
            other => Route::Unknown(other.to_string()),
        }
    }

    /// Route name as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Route::Connect => "connect",
            Route::Disconnect => "disconnect",
            Route::Publish => "publish",
            Route::Unknown(name) => name,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested broker profile index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerIndex {
    /// An integer index. Range checks happen against the profile list.
    Index(i64),
    /// Anything that is not an integer, kept verbatim.
    Invalid(Value),
}

impl ServerIndex {
    /// Classify a JSON value.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value.as_i64() {
            Some(index) => ServerIndex::Index(index),
            None => ServerIndex::Invalid(value),
        }
    }
}

/// A command sent by a realtime client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Route name.
    pub route: String,

    /// Session token issued when the socket was accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Index into the configured broker profiles (`connect`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_index: Option<ServerIndex>,

    /// Target topic (`publish`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Message body (`publish`). Non-string JSON is published as its
    /// serialized text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    /// Whether the broker should retain the message (`publish`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
}

impl Envelope {
    /// Create an envelope for a route.
    #[must_use]
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            ..Default::default()
        }
    }

    /// Attach a token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attach a server index.
    #[must_use]
    pub fn with_server_index(mut self, index: i64) -> Self {
        self.server_index = Some(ServerIndex::Index(index));
        self
    }

    /// Attach a topic and message.
    #[must_use]
    pub fn with_publish(mut self, topic: impl Into<String>, message: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self.message = Some(Value::String(message.into()));
        self
    }

    /// Read an envelope out of a JSON object.
    #[must_use]
    pub fn from_object(mut object: Map<String, Value>) -> Self {
        let server_index = match object.remove("serverIndex") {
            None | Some(Value::Null) => None,
            Some(value) => Some(ServerIndex::from_value(value)),
        };
        let retain = match object.remove("retain") {
            Some(Value::Bool(retain)) => Some(retain),
            _ => None,
        };

        Self {
            route: take_string(&mut object, "route").unwrap_or_default(),
            token: take_string(&mut object, "token"),
            server_index,
            topic: take_string(&mut object, "topic"),
            message: object.remove("message"),
            retain,
        }
    }

    /// The parsed route.
    #[must_use]
    pub fn route(&self) -> Route {
        Route::parse(&self.route)
    }

    /// The token, treating an empty string as absent.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    /// The topic, treating an empty string as absent.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref().filter(|t| !t.is_empty())
    }

    /// The message body as publishable text.
    ///
    /// Returns `None` for a missing, null or empty message.
    #[must_use]
    pub fn message_text(&self) -> Option<String> {
        match self.message.as_ref()? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Whether the publish should be retained.
    #[must_use]
    pub fn retain(&self) -> bool {
        self.retain.unwrap_or(false)
    }
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}
