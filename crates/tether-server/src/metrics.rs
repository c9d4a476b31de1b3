//! Metrics collection and export for Tether.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tether_core::{BridgePhase, Hub, HubStats};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "tether_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "tether_sessions_active";
    pub const COMMANDS_TOTAL: &str = "tether_commands_total";
    pub const RELAYED_TOTAL: &str = "tether_relayed_messages_total";
    pub const PUBLISHES_TOTAL: &str = "tether_publishes_total";
    pub const BRIDGE_STATE: &str = "tether_bridge_state";
    pub const LATENCY_SECONDS: &str = "tether_command_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of sessions");
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Route commands handled, by route");
    metrics::describe_counter!(
        names::RELAYED_TOTAL,
        "Broker messages relayed to sessions"
    );
    metrics::describe_counter!(names::PUBLISHES_TOTAL, "Publishes forwarded to the broker");
    metrics::describe_gauge!(
        names::BRIDGE_STATE,
        "Bridge phase: 0 disconnected, 1 connecting, 2 connected"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Route command handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors, by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a route command.
pub fn record_command(route: &str) {
    counter!(names::COMMANDS_TOTAL, "route" => route.to_string()).increment(1);
}

/// Record command handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a publish forwarded to the broker.
pub fn record_publish(origin: &str) {
    counter!(names::PUBLISHES_TOTAL, "origin" => origin.to_string()).increment(1);
}

/// Set the relayed-message counter to the hub's running total.
pub fn set_relayed(total: u64) {
    counter!(names::RELAYED_TOTAL).absolute(total);
}

/// Update the bridge phase gauge.
pub fn set_bridge_phase(phase: BridgePhase) {
    let value = match phase {
        BridgePhase::Disconnected => 0.0,
        BridgePhase::Connecting => 1.0,
        BridgePhase::Connected => 2.0,
    };
    gauge!(names::BRIDGE_STATE).set(value);
}

/// Copy hub counters into the exported metrics.
pub fn record_hub_stats(stats: &HubStats) {
    set_bridge_phase(stats.phase);
    set_relayed(stats.relayed);
}

/// Read the hub's counters and export them.
pub async fn refresh_hub(hub: &Hub) {
    record_hub_stats(&hub.stats().await);
}

/// Periodically export hub counters, so relayed traffic shows up even
/// while no route commands arrive.
pub fn spawn_hub_refresh(hub: Hub, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            refresh_hub(&hub).await;
        }
    })
}

/// Record an error.
pub fn record_error(kind: &str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Metrics guard that records the session end on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording must still be safe
        let _guard = SessionMetricsGuard::new();
        set_bridge_phase(BridgePhase::Connected);
        record_command("connect");
    }

    #[test]
    fn test_hub_stats_export() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_hub_stats(&HubStats {
                sessions: 2,
                phase: BridgePhase::Connected,
                owner: None,
                relayed: 7,
            });
        });

        let rendered = handle.render();
        assert!(rendered.contains("tether_relayed_messages_total 7"));
        assert!(rendered.contains("tether_bridge_state 2"));
    }
}
