//! # tether-core
//!
//! Multiplexes many realtime sessions onto one upstream broker connection.
//!
//! This crate provides the building blocks of the bridge:
//!
//! - **Registry** - Who is connected, their tokens and liveness
//! - **Supervisor** - Heartbeat sweep that reclaims dead sessions
//! - **Bridge** - The single broker connection and its state machine
//! - **Arbiter** - Which session owns the connection, and when it drains
//! - **Hub** - The context object tying them together behind one lock
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌────────┐
//! │   Session   │────▶│     Hub     │────▶│   Bridge    │────▶│ Broker │
//! └─────────────┘     └─────────────┘     └─────────────┘     └────────┘
//!        ▲                   │                    │
//!        │            ┌─────────────┐             │
//!        └────────────│  Registry   │◀────────────┘
//!                     └─────────────┘   inbound fan-out
//! ```

pub mod arbiter;
pub mod auth;
pub mod bridge;
pub mod error;
pub mod hub;
pub mod profile;
pub mod registry;
pub mod session;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod mock;

pub use arbiter::{Departure, Owner};
pub use auth::{AuthError, JwtIssuer, TokenIssuer};
pub use bridge::{Bridge, BridgePhase, BridgeSettings, ConnectOutcome, DisconnectOutcome};
pub use error::{ErrorKind, HubError};
pub use hub::{Hub, HubConfig, HubStats};
pub use profile::{BrokerProfile, LastWillProfile, ProfileSummary, TopicSubscription};
pub use registry::Registry;
pub use session::{
    Delivery, Outbound, Outbox, Session, SessionHandle, SessionId, SessionTicket,
    DEFAULT_QUEUE_CAPACITY,
};
pub use supervisor::Supervisor;
