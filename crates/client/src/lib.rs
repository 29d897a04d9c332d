//! Trading Pub/Sub Client
//!
//! Client side of the trading pub/sub fabric. Provides:
//! - A persistent broker connection with automatic reconnection and
//!   resubscription
//! - Topic → handler dispatch on a dedicated, ordered delivery worker
//! - One-shot publishing over HTTP
//!
//! ## Architecture
//!
//! ```text
//!           Broker
//!      ▲      │ message / new_message
//!      │      ▼
//!  POST /publish   ┌───────────┐  subscribe / consumed
//!      │           │ Transport │ ─────────────────────▶ Broker
//!      │           └─────┬─────┘
//! ┌────┴──────┐          │ decode + enqueue
//! │ Publisher │    ┌─────▼─────────┐
//! └────▲──────┘    │ DeliveryQueue │ (one worker thread)
//!      │           └─────┬─────────┘
//!      │                 │ dispatch
//! ┌────┴─────────┐ ┌─────▼───────────┐
//! │ PubSubClient │ │ HandlerRegistry │ → application handlers
//! └──────────────┘ └─────────────────┘
//! ```
//!
//! ## Transport
//!
//! [`WsTransport`] talks to the broker over a WebSocket with JSON event frames.
//! [`ChannelTransport`] keeps everything in-process, for tests and
//! single-process deployments.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientState, PubSubClient};
pub use config::{ClientConfig, EventNames, ReconnectionConfig, load_config, load_config_from_str};
pub use error::{
    ClientError, ConfigError, ConnectionError, HandlerError, QueueError, TransportError,
};
pub use handler::{DispatchOutcome, HandlerRegistry, MessageHandler};
pub use publisher::{HttpPublisher, PublishAck, Publisher};
pub use queue::{DeliveryHook, DeliveryQueue, QueueStats, ShutdownMode};
pub use transport::{
    BrokerHandle, ChannelTransport, EventCallback, EventFrame, Transport, WsTransport,
};

pub use pubsub_core::{EventType, MessageEnvelope, MessageId, Operation, Payload};
