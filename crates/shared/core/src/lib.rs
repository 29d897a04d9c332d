//! Pub/Sub Core Domain
//!
//! Pure message types shared by producers and consumers of the trading
//! pub/sub fabric. This crate contains no async, no I/O, and is 100% unit
//! testable.

pub mod envelope;
pub mod events;
pub mod operation;

// Re-export commonly used types at crate root
pub use envelope::{EnvelopeError, MessageEnvelope, MessageId, Payload};
pub use events::{EventType, UnknownEventType};
pub use operation::{Operation, UnknownOperation};
