//! Positions Service
//!
//! Keeps the ledger of trading positions in SQLite and serves it over the
//! pub/sub fabric: strategies publish requests (open, sell, query, cancel)
//! and receive the answers on the matching response topics.
//!
//! ```text
//!  *_request topics ──▶ PubSubClient ──▶ Responder ──▶ PositionStore
//!                                            │
//!                   response topics ◀── forwarder task
//! ```

pub mod error;
pub mod service;
pub mod store;

pub use error::{PositionsError, Result, UnknownStatus};
pub use service::{DEFAULT_CONSUMER, PositionService, SUBSCRIPTION_TOPICS, subscription_config};
pub use store::{Position, PositionEvent, PositionStatus, PositionStore};
