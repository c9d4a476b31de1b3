//! Liveness supervision.
//!
//! Each tick, a session that has not answered the previous probe is
//! terminated and removed; every other session is marked unanswered and
//! probed again. One missed beat is fatal.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::hub::Hub;
use crate::session::SessionId;

/// Periodic heartbeat sweep over the hub's sessions.
pub struct Supervisor;

impl Supervisor {
    /// Run one sweep. Returns the sessions that were reclaimed.
    pub async fn sweep(hub: &Hub) -> Vec<SessionId> {
        let dead = hub.probe_sessions().await;
        for id in &dead {
            info!(session = %id, "Session missed heartbeat, terminating");
            hub.terminate(id).await;
            hub.leave(id).await;
        }
        dead
    }

    /// Sweep every `period` until the task is aborted.
    #[must_use]
    pub fn spawn(hub: Hub, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let reclaimed = Self::sweep(&hub).await;
                debug!(reclaimed = reclaimed.len(), "Heartbeat sweep");
            }
        })
    }
}
