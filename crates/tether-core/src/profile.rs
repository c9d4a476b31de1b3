//! Broker profiles.
//!
//! Profiles are loaded once at startup and selected by index when a
//! session asks the bridge to connect.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tether_transport::Quality;

use crate::error::HubError;

/// A topic the bridge subscribes to after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    /// Topic filter.
    pub value: String,
    /// Requested delivery quality.
    #[serde(default)]
    pub quality: Quality,
}

/// Last-Will-Testament settings of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWillProfile {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub retain: bool,
}

/// Connection settings for one upstream broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerProfile {
    /// Display name.
    pub name: String,
    /// Host, optionally prefixed with `mqtt://` or `mqtts://`.
    pub host: String,
    /// Port.
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Connect over TLS.
    #[serde(default, alias = "ssl")]
    pub tls_enabled: bool,
    /// Path to the PEM CA bundle used to verify the broker.
    #[serde(default, alias = "caPath")]
    pub ca_material_ref: Option<PathBuf>,
    /// Ordered topic subscriptions.
    #[serde(default)]
    pub topics: Vec<TopicSubscription>,
    /// Single-topic shorthand, subscribed at QoS 1 after `topics`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub last_will: Option<LastWillProfile>,
}

impl BrokerProfile {
    /// Host without scheme, and whether the scheme asked for TLS.
    #[must_use]
    pub fn endpoint(&self) -> (&str, bool) {
        const SECURE: [&str; 2] = ["mqtts://", "ssl://"];
        const PLAIN: [&str; 2] = ["mqtt://", "tcp://"];

        for scheme in SECURE {
            if let Some(host) = self.host.strip_prefix(scheme) {
                return (host.trim_end_matches('/'), true);
            }
        }
        for scheme in PLAIN {
            if let Some(host) = self.host.strip_prefix(scheme) {
                return (host.trim_end_matches('/'), false);
            }
        }
        (self.host.as_str(), false)
    }

    /// Whether connecting requires the secure protocol variant.
    #[must_use]
    pub fn requires_tls(&self) -> bool {
        self.tls_enabled || self.endpoint().1
    }

    /// Read the CA bundle.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::CertificateNotFound`] if no path is configured or
    /// the file cannot be read.
    pub fn load_ca(&self) -> Result<Vec<u8>, HubError> {
        let path = self
            .ca_material_ref
            .as_ref()
            .ok_or_else(|| HubError::CertificateNotFound(format!("{}: no CA configured", self.name)))?;

        std::fs::read(path)
            .map_err(|e| HubError::CertificateNotFound(format!("{}: {}", path.display(), e)))
    }

    /// All subscriptions in order, including the single-topic shorthand.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<TopicSubscription> {
        let mut subs = self.topics.clone();
        if let Some(topic) = self.topic.as_ref().filter(|t| !t.is_empty()) {
            if !subs.iter().any(|s| &s.value == topic) {
                subs.push(TopicSubscription {
                    value: topic.clone(),
                    quality: Quality::AtLeastOnce,
                });
            }
        }
        subs
    }

    /// Profile with secrets stripped, for listing to clients.
    #[must_use]
    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            name: self.name.clone(),
            host: self.endpoint().0.to_string(),
            port: self.port,
            tls_enabled: self.requires_tls(),
            topics: self.subscriptions(),
        }
    }
}

/// Public view of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub topics: Vec<TopicSubscription>,
}
