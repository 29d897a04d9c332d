//! Error types for the client crate

use pubsub_core::{EnvelopeError, MessageId};
use thiserror::Error;

/// Persistent connection errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Transport closed")]
    Closed,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Connection(e.to_string())
    }
}

/// One-shot publish request errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Publish request timed out")]
    Timeout,

    #[error("Broker rejected publish: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl From<reqwest::Error> for ConnectionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ConnectionError::Timeout
        } else {
            ConnectionError::Network(e.to_string())
        }
    }
}

/// An application handler failed while processing a message
#[derive(Error, Debug, Clone)]
#[error("handler for topic {topic} failed on message {message_id}: {reason}")]
pub struct HandlerError {
    pub topic: String,
    pub message_id: MessageId,
    pub reason: String,
}

/// Delivery queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Delivery queue closed")]
    Closed,

    #[error("Failed to spawn delivery worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Client-level errors (operations invoked by the application)
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Client already started")]
    AlreadyStarted,

    #[error("Client stopped while starting")]
    StoppedDuringStart,
}
