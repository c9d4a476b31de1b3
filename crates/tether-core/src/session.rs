//! Realtime sessions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tether_protocol::Reply;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Default number of instructions a session may have queued.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Instructions pushed to a session's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Send a reply frame.
    Reply(Reply),
    /// Send a liveness probe (WebSocket ping).
    Probe,
    /// Drop the socket without a close handshake.
    Terminate,
}

/// Result of queueing an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the socket task.
    Queued,
    /// The queue just filled up; the session is now being terminated.
    Lagged,
    /// Not queued: the socket task is gone or already lagging.
    Dropped,
}

/// Write side of a session's connection.
///
/// The queue is bounded. A session whose queue fills up is marked as
/// lagging and its [`Outbox`] yields [`Outbound::Terminate`] from then on.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Outbound>,
    lagging: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Create a handle with the default queue capacity.
    #[must_use]
    pub fn channel() -> (Self, Outbox) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a handle and the outbox the socket task drains.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let lagging = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx,
                lagging: Arc::clone(&lagging),
            },
            Outbox { rx, lagging },
        )
    }

    /// Queue an instruction without waiting.
    pub fn send(&self, outbound: Outbound) -> Delivery {
        if self.is_lagging() {
            return Delivery::Dropped;
        }
        match self.tx.try_send(outbound) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                if self.lagging.swap(true, Ordering::AcqRel) {
                    Delivery::Dropped
                } else {
                    Delivery::Lagged
                }
            }
            Err(TrySendError::Closed(_)) => Delivery::Dropped,
        }
    }

    /// Whether the socket task is still draining.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Whether the queue has overflowed.
    #[must_use]
    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Acquire)
    }
}

/// Read side of a session's queue, owned by its socket task.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Outbound>,
    lagging: Arc<AtomicBool>,
}

impl Outbox {
    /// Next instruction. Cancel safe.
    pub async fn recv(&mut self) -> Option<Outbound> {
        if self.lagging.load(Ordering::Acquire) {
            return Some(Outbound::Terminate);
        }
        self.rx.recv().await
    }

    /// Next instruction if one is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is queued or every handle is gone.
    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        if self.lagging.load(Ordering::Acquire) {
            return Ok(Outbound::Terminate);
        }
        self.rx.try_recv()
    }
}

/// A registered session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub handle: SessionHandle,
    /// Cleared by each supervisor probe, set again by the probe response.
    pub alive: bool,
    /// Token issued at creation.
    pub token: String,
    /// Creation time, milliseconds since epoch.
    pub created_at: u64,
}

impl Session {
    pub(crate) fn new(id: SessionId, handle: SessionHandle, token: String) -> Self {
        Self {
            id,
            handle,
            alive: true,
            token,
            created_at: now_millis(),
        }
    }
}

/// What a newly registered session needs to know about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub id: SessionId,
    pub token: String,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
