//! # tether-protocol
//!
//! Realtime wire types for the Tether MQTT bridge.
//!
//! Clients talk to the bridge over a WebSocket using JSON text frames.
//! Every inbound frame is an [`Envelope`] naming a route and carrying the
//! session token; every outbound frame is a [`Reply`].
//!
//! ## Routes
//!
//! - `connect` - Open the shared broker connection (`serverIndex`)
//! - `disconnect` - Drain the shared broker connection
//! - `publish` - Publish `message` to `topic` through the broker
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, Reply, Route};
//!
//! let envelope = codec::decode(r#"{"route":"publish","token":"t","topic":"a/b","message":"hi"}"#).unwrap();
//! assert_eq!(envelope.route(), Route::Publish);
//!
//! let text = codec::encode(&Reply::published("a/b", "Message published successfully")).unwrap();
//! assert!(text.contains("\"topic\":\"a/b\""));
//! ```

pub mod codec;
pub mod envelope;
pub mod reply;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Envelope, Route, ServerIndex};
pub use reply::{close_code, Reply, STATUS_RECEIVED};
