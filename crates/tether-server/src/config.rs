//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (first of `tether.toml`,
//!   `/etc/tether/tether.toml`, `~/.config/tether/tether.toml`, or the
//!   path in `TETHER_CONFIG`)
//! - Environment variables (`TETHER_PORT`, `TETHER_AUTH__SECRET`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{BridgeSettings, BrokerProfile};

const CONFIG_PATHS: [&str; 3] = [
    "tether.toml",
    "/etc/tether/tether.toml",
    "~/.config/tether/tether.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Endpoint paths.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Session token configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Broker bridge tuning.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Inline broker profiles.
    #[serde(default)]
    pub profiles: Vec<BrokerProfile>,

    /// JSON file with more broker profiles, appended after the inline ones.
    #[serde(default)]
    pub profiles_file: Option<PathBuf>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Endpoint paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Prefix of the HTTP API.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound frames a session may have queued before it is terminated.
    #[serde(default = "default_max_queued_frames")]
    pub max_queued_frames: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Probe interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Session token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret. A random per-process secret is used when unset.
    #[serde(default)]
    pub secret: Option<String>,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

/// Broker bridge tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_ms: u64,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Marker topic for profiles without a Last-Will.
    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    #[serde(default = "default_online_payload")]
    pub online_payload: String,

    #[serde(default = "default_offline_payload")]
    pub offline_payload: String,

    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub counters are exported, in milliseconds.
    #[serde(default = "default_metrics_refresh_ms")]
    pub refresh_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/api/ws".to_string()
}

fn default_api_prefix() -> String {
    "/api/mqtt".to_string()
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_queued_frames() -> usize {
    tether_core::DEFAULT_QUEUE_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_connect_timeout() -> u64 {
    4000
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_reconnect_period() -> u64 {
    1000
}

fn default_keep_alive() -> u64 {
    30
}

fn default_status_topic() -> String {
    "test/online".to_string()
}

fn default_online_payload() -> String {
    "1".to_string()
}

fn default_offline_payload() -> String {
    "0".to_string()
}

fn default_client_id_prefix() -> String {
    "mqtt_".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_refresh_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            bridge: BridgeConfig::default(),
            profiles: Vec::new(),
            profiles_file: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            api_prefix: default_api_prefix(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_message_size: default_max_message_size(),
            max_queued_frames: default_max_queued_frames(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            reconnect_period_ms: default_reconnect_period(),
            keep_alive_secs: default_keep_alive(),
            status_topic: default_status_topic(),
            online_payload: default_online_payload(),
            offline_payload: default_offline_payload(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            refresh_ms: default_metrics_refresh_ms(),
        }
    }
}

/// Profiles section of a TOML file, read verbatim so camelCase keys survive.
#[derive(Deserialize)]
struct ProfilesSection {
    #[serde(default)]
    profiles: Vec<BrokerProfile>,
}

impl Config {
    /// Load configuration from the first file found plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("TETHER_CONFIG").ok();
        let path = explicit
            .iter()
            .map(String::as_str)
            .chain(CONFIG_PATHS)
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists());

        Self::layered(path.as_deref().map(Path::new))
    }

    /// Build configuration from an optional file plus `TETHER_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any source cannot be read or deserialized.
    pub fn layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TETHER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            config.profiles = toml::from_str::<ProfilesSection>(&contents)
                .with_context(|| format!("Failed to parse profiles in: {}", path.display()))?
                .profiles;
        }

        Ok(config)
    }

    /// Inline profiles followed by those from `profiles_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the profiles file cannot be read or parsed.
    pub fn broker_profiles(&self) -> Result<Vec<BrokerProfile>> {
        let mut profiles = self.profiles.clone();
        if let Some(file) = &self.profiles_file {
            let path = shellexpand::tilde(&file.to_string_lossy()).into_owned();
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read profiles file: {}", path))?;
            let mut listed: Vec<BrokerProfile> = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse profiles file: {}", path))?;
            profiles.append(&mut listed);
        }
        Ok(profiles)
    }

    /// Bridge settings derived from the `[bridge]` section.
    #[must_use]
    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            connect_timeout: Duration::from_millis(self.bridge.connect_timeout_ms),
            ack_timeout: Duration::from_millis(self.bridge.ack_timeout_ms),
            reconnect_period: Duration::from_millis(self.bridge.reconnect_period_ms),
            keep_alive: Duration::from_secs(self.bridge.keep_alive_secs),
            status_topic: self.bridge.status_topic.clone(),
            online_payload: self.bridge.online_payload.clone(),
            offline_payload: self.bridge.offline_payload.clone(),
            client_id_prefix: self.bridge.client_id_prefix.clone(),
        }
    }

    /// Heartbeat probe period.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("tether-{}-{}", std::process::id(), name));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents.as_bytes())
            .unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.transport.websocket_path, "/api/ws");
        assert_eq!(config.transport.api_prefix, "/api/mqtt");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.auth.secret.is_none());
        assert_eq!(config.auth.token_ttl_secs, 3600);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 5000);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_sessions = 500
            max_queued_frames = 32

            [bridge]
            connect_timeout_ms = 2500
            status_topic = "automat/online"

            [[profiles]]
            name = "Test Server"
            host = "mqtts://broker.example.com"
            port = 8883
            tlsEnabled = true
            caMaterialRef = "certs/ca.crt"
            topics = [{ value = "test/data", quality = 1 }]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_sessions, 500);
        assert_eq!(config.limits.max_queued_frames, 32);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.profiles.len(), 1);
        assert!(config.profiles[0].requires_tls());

        let settings = config.bridge_settings();
        assert_eq!(settings.connect_timeout, Duration::from_millis(2500));
        assert_eq!(settings.status_topic, "automat/online");
        assert_eq!(settings.offline_payload, "0");
    }

    #[test]
    fn test_layered_keeps_profile_keys() {
        let path = temp_file(
            "layered.toml",
            r#"
                port = 7000

                [[profiles]]
                name = "Private Server"
                host = "broker.local"
                port = 1883
                tlsEnabled = true
                caMaterialRef = "ca.crt"
                lastWill = { topic = "automat/online", payload = "0", quality = 1, retain = true }
            "#,
        );

        let config = Config::layered(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7000);
        let profile = &config.profiles[0];
        assert!(profile.tls_enabled);
        assert_eq!(profile.ca_material_ref, Some(PathBuf::from("ca.crt")));
        assert_eq!(profile.last_will.as_ref().unwrap().topic, "automat/online");
    }

    #[test]
    fn test_profiles_file_appended() {
        let json = temp_file(
            "servers.json",
            r#"[{"name": "Listed", "host": "mqtt://listed.local", "port": 1883, "topic": "test/data"}]"#,
        );
        let config = Config {
            profiles: vec![BrokerProfile {
                name: "Inline".into(),
                host: "inline.local".into(),
                port: 1883,
                username: None,
                password: None,
                tls_enabled: false,
                ca_material_ref: None,
                topics: vec![],
                topic: None,
                last_will: None,
            }],
            profiles_file: Some(json.clone()),
            ..Config::default()
        };

        let profiles = config.broker_profiles().unwrap();
        std::fs::remove_file(&json).unwrap();

        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].name, "Inline");
        assert_eq!(profiles[1].endpoint().0, "listed.local");
    }

    #[test]
    fn test_missing_profiles_file() {
        let config = Config {
            profiles_file: Some(PathBuf::from("/nonexistent/tether/servers.json")),
            ..Config::default()
        };
        assert!(config.broker_profiles().is_err());
    }
}
