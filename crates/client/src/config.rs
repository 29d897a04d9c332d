//! Client configuration
//!
//! Construction-time options for [`PubSubClient`](crate::PubSubClient),
//! loadable from JSON. Every field except `url` and `consumer` has a default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

/// Root client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker base address, e.g. `http://localhost:5000`
    pub url: String,
    /// This client's identity
    pub consumer: String,
    /// Topics to subscribe to, in order (empty for publish-only clients)
    #[serde(default)]
    pub topics: Vec<String>,
    /// Path of the persistent socket endpoint, appended to `url`
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// Path of the one-shot publish endpoint, appended to `url`
    #[serde(default = "default_publish_path")]
    pub publish_path: String,
    /// Publish request timeout in milliseconds
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
    /// Emit a consumption acknowledgment after every dispatch
    #[serde(default = "default_true")]
    pub acknowledge: bool,
    /// Reconnection tuning passed through to the transport
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    /// Broker event names
    #[serde(default)]
    pub events: EventNames,
}

/// Reconnection policy of the persistent connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum reconnection attempts per outage, 0 for unlimited
    #[serde(default)]
    pub attempts: u32,
    /// Delay before the first reconnection attempt in milliseconds
    #[serde(default = "default_reconnection_delay")]
    pub delay_ms: u64,
    /// Upper bound of the exponential delay in milliseconds
    #[serde(default = "default_reconnection_delay_max")]
    pub delay_max_ms: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        ReconnectionConfig {
            enabled: true,
            attempts: 0,
            delay_ms: default_reconnection_delay(),
            delay_max_ms: default_reconnection_delay_max(),
        }
    }
}

impl ReconnectionConfig {
    /// Delay before reconnection attempt `attempt` (1-based): doubles each
    /// attempt, capped at `delay_max_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.delay_max_ms))
    }

    /// Whether another attempt is allowed after `attempts_made` failures
    pub fn allows_attempt(&self, attempts_made: u32) -> bool {
        self.enabled && (self.attempts == 0 || attempts_made < self.attempts)
    }
}

/// Event names agreed with the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNames {
    /// Inbound delivery of a message envelope
    #[serde(default = "default_message_event")]
    pub message: String,
    /// Inbound new-message notification (logged only)
    #[serde(default = "default_new_message_event")]
    pub new_message: String,
    /// Outbound subscription request
    #[serde(default = "default_subscribe_event")]
    pub subscribe: String,
    /// Outbound consumption acknowledgment
    #[serde(default = "default_consumed_event")]
    pub consumed: String,
}

impl Default for EventNames {
    fn default() -> Self {
        EventNames {
            message: default_message_event(),
            new_message: default_new_message_event(),
            subscribe: default_subscribe_event(),
            consumed: default_consumed_event(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with default tuning
    pub fn new<I, T>(url: impl Into<String>, consumer: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut config = ClientConfig {
            url: url.into(),
            consumer: consumer.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            socket_path: default_socket_path(),
            publish_path: default_publish_path(),
            publish_timeout_ms: default_publish_timeout(),
            acknowledge: true,
            reconnection: ReconnectionConfig::default(),
            events: EventNames::default(),
        };
        config.normalize();
        config
    }

    pub fn with_reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.reconnection = reconnection;
        self
    }

    pub fn with_acknowledge(mut self, acknowledge: bool) -> Self {
        self.acknowledge = acknowledge;
        self
    }

    /// Strip trailing slashes from the URL and duplicate topics
    pub fn normalize(&mut self) {
        let trimmed = self.url.trim_end_matches('/').len();
        self.url.truncate(trimmed);

        let mut seen = std::collections::HashSet::new();
        self.topics.retain(|topic| seen.insert(topic.clone()));
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer.is_empty() {
            return Err(ConfigError::Invalid("consumer must not be empty".into()));
        }

        let url = self.parse_url()?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        if let Some(position) = self.topics.iter().position(|t| t.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "topic at index {} is empty",
                position
            )));
        }

        for (name, path) in [
            ("socket_path", &self.socket_path),
            ("publish_path", &self.publish_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{} must start with '/': {}",
                    name, path
                )));
            }
        }

        if self.reconnection.delay_ms > self.reconnection.delay_max_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnection delay {}ms exceeds maximum {}ms",
                self.reconnection.delay_ms, self.reconnection.delay_max_ms
            )));
        }

        Ok(())
    }

    /// URL of the persistent socket endpoint (`http` → `ws`, `https` → `wss`)
    pub fn socket_url(&self) -> Result<String, ConfigError> {
        let mut url = self.parse_url()?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported URL scheme: {}",
                    other
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::Invalid(format!("cannot switch scheme of {}", self.url)))?;

        let path = format!("{}{}", url.path().trim_end_matches('/'), self.socket_path);
        url.set_path(&path);
        Ok(url.to_string())
    }

    /// URL of the one-shot publish endpoint
    pub fn publish_url(&self) -> String {
        format!("{}{}", self.url, self.publish_path)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    fn parse_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.url)
            .map_err(|e| ConfigError::Invalid(format!("invalid url {}: {}", self.url, e)))
    }
}

/// Load client configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Load client configuration from a JSON string
pub fn load_config_from_str(json: &str) -> Result<ClientConfig, ConfigError> {
    let mut config: ClientConfig = serde_json::from_str(json)?;
    config.normalize();
    config.validate()?;
    Ok(config)
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_socket_path() -> String {
    "/ws".to_string()
}

fn default_publish_path() -> String {
    "/publish".to_string()
}

fn default_publish_timeout() -> u64 {
    30_000
}

fn default_reconnection_delay() -> u64 {
    2000
}

fn default_reconnection_delay_max() -> u64 {
    10_000
}

fn default_message_event() -> String {
    "message".to_string()
}

fn default_new_message_event() -> String {
    "new_message".to_string()
}

fn default_subscribe_event() -> String {
    "subscribe".to_string()
}

fn default_consumed_event() -> String {
    "consumed".to_string()
}
