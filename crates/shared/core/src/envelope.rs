use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque message payload, passed through without interpretation
pub type Payload = Value;

/// Errors raised while building or decoding an envelope
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("message_id must not be empty")]
    EmptyMessageId,

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Unique identifier of a message
///
/// Generated ids are UUID v4 strings, but any non-empty string supplied by a
/// producer is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One message travelling through the fabric, with identity and metadata.
///
/// Envelopes are immutable once built. The serialized representation is the
/// JSON object `{message_id, topic, message, producer, consumer, created_at}`
/// used both as the publish request body and as the inbound delivery payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EnvelopeRepr")]
pub struct MessageEnvelope {
    message_id: MessageId,
    topic: String,
    message: Payload,
    producer: String,
    consumer: Option<String>,
    created_at: DateTime<Utc>,
}

/// Wire shape accepted when decoding; validated into `MessageEnvelope`
#[derive(Deserialize)]
struct EnvelopeRepr {
    message_id: MessageId,
    topic: String,
    message: Payload,
    producer: String,
    #[serde(default)]
    consumer: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    created_at: Option<DateTime<Utc>>,
}

/// Read a creation timestamp the way producers actually send it.
///
/// RFC 3339 strings keep their offset, naive ISO-8601 strings are taken as
/// UTC. Null, non-string and unparsable values decode as `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(text)) => parse_timestamp(&text),
        _ => None,
    })
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

impl TryFrom<EnvelopeRepr> for MessageEnvelope {
    type Error = EnvelopeError;

    fn try_from(repr: EnvelopeRepr) -> Result<Self, Self::Error> {
        let envelope = MessageEnvelope::new_with_time(
            repr.topic,
            repr.message,
            repr.producer,
            Some(repr.message_id),
            repr.created_at.unwrap_or_else(Utc::now),
        )?;
        Ok(match repr.consumer {
            Some(consumer) => envelope.with_consumer(consumer),
            None => envelope,
        })
    }
}

impl MessageEnvelope {
    /// Create a new envelope stamped with the current time.
    ///
    /// A fresh id is generated when `message_id` is `None`.
    pub fn new(
        topic: impl Into<String>,
        message: Payload,
        producer: impl Into<String>,
        message_id: Option<MessageId>,
    ) -> Result<Self, EnvelopeError> {
        Self::new_with_time(topic, message, producer, message_id, Utc::now())
    }

    /// Create a new envelope with an explicit creation timestamp
    pub fn new_with_time(
        topic: impl Into<String>,
        message: Payload,
        producer: impl Into<String>,
        message_id: Option<MessageId>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(EnvelopeError::EmptyTopic);
        }

        let message_id = message_id.unwrap_or_else(MessageId::generate);
        if message_id.is_empty() {
            return Err(EnvelopeError::EmptyMessageId);
        }

        Ok(Self {
            message_id,
            topic,
            message,
            producer: producer.into(),
            consumer: None,
            created_at,
        })
    }

    /// Address the envelope to a specific consumer
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Payload {
        &self.message
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn consumer(&self) -> Option<&str> {
        self.consumer.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Consume the envelope, keeping only its payload
    pub fn into_message(self) -> Payload {
        self.message
    }

    /// Serializable representation of the envelope
    pub fn to_representation(&self) -> Value {
        serde_json::json!({
            "message_id": self.message_id.as_str(),
            "topic": self.topic,
            "message": self.message,
            "producer": self.producer,
            "consumer": self.consumer,
            "created_at": self.created_at,
        })
    }

    /// Rebuild an envelope from its representation
    pub fn from_representation(value: Value) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Representation rendered as a JSON string
    pub fn to_json(&self) -> String {
        self.to_representation().to_string()
    }

    /// Decode an envelope from a JSON string
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(json)?)
    }
}
