//! # tether-transport
//!
//! Broker transport abstraction for the Tether bridge.
//!
//! The bridge never talks to a broker client library directly. It opens a
//! [`BrokerLink`] through a [`BrokerTransport`] and consumes the link's
//! [`BrokerEvent`] stream:
//!
//! - **MQTT** - `rumqttc` over TCP or TLS (feature `mqtt`, on by default)
//!
//! ```rust,ignore
//! use tether_transport::{BrokerTransport, BrokerEvent, ConnectRequest};
//!
//! async fn run(transport: &dyn BrokerTransport, request: ConnectRequest) {
//!     let mut opened = transport.open(request).await.unwrap();
//!     while let Some(event) = opened.events.recv().await {
//!         if let BrokerEvent::Message { topic, .. } = event {
//!             println!("{topic}");
//!         }
//!     }
//! }
//! ```

pub mod traits;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use traits::{
    BrokerEvent, BrokerLink, BrokerTransport, ConnectRequest, LastWill, Opened, Quality,
    TransportError,
};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
