//! One-shot publishing over HTTP
//!
//! Publishing is independent of the persistent connection: each message is a
//! single request carrying the envelope representation, awaited by the caller
//! and never retried.

use async_trait::async_trait;
use pubsub_core::MessageEnvelope;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::ConnectionError;

/// Broker acknowledgment of a published message
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAck {
    pub status: u16,
    /// Response body, parsed as JSON when possible
    pub body: Value,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<PublishAck, ConnectionError>;
}

/// Publishes by POSTing the envelope representation to the broker
#[derive(Clone)]
pub struct HttpPublisher {
    client: Client,
    url: String,
}

impl HttpPublisher {
    pub fn new(
        base_url: &str,
        publish_path: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), publish_path);
        Self::with_url(url, timeout)
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ConnectionError> {
        Self::with_url(config.publish_url(), config.publish_timeout())
    }

    fn with_url(url: String, timeout: Duration) -> Result<Self, ConnectionError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpPublisher { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<PublishAck, ConnectionError> {
        let response = self
            .client
            .post(&self.url)
            .json(&envelope.to_representation())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ConnectionError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let body = if text.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(_) => Value::String(text),
            }
        };

        Ok(PublishAck {
            status: status.as_u16(),
            body,
        })
    }
}
