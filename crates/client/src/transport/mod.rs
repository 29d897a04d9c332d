//! Transport abstraction layer
//!
//! A persistent, event-based connection to the broker. Inbound events are
//! delivered to registered callbacks; outbound events are emitted as
//! `(name, payload)` pairs. Reconnection is the transport's business, the
//! client only observes the lifecycle pseudo-events.

pub mod channel;
pub mod frame;
pub mod websocket;

pub use channel::{BrokerHandle, ChannelTransport};
pub use frame::EventFrame;
pub use websocket::WsTransport;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::TransportError;
use crate::handler::panic_message;

/// Fired after every successful connection, before any inbound event of it
pub const CONNECT_EVENT: &str = "connect";
/// Fired when a live session ends
pub const DISCONNECT_EVENT: &str = "disconnect";
/// Fired when the reconnection attempts of an outage are exhausted
pub const RECONNECT_FAILED_EVENT: &str = "reconnect_failed";

/// Callback invoked with the payload of an event
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Persistent connection to the broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register a callback for `event`. Several callbacks per event fire in
    /// registration order.
    fn on(&self, event: &str, callback: EventCallback);

    /// Open the connection. Only the first attempt is reported here; later
    /// drops are handled by the transport's reconnection policy.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Send an event to the broker
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Close the connection and stop reconnecting
    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Event name → callbacks table shared by transport implementations
#[derive(Clone, Default)]
pub struct Callbacks {
    table: Arc<RwLock<HashMap<String, Vec<EventCallback>>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: &str, callback: EventCallback) {
        self.table
            .write()
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    /// Invoke every callback of `event`. Returns false if none is registered.
    pub fn fire(&self, event: &str, payload: Value) -> bool {
        // Snapshot so callbacks may register more callbacks
        let callbacks = match self.table.read().get(event) {
            Some(callbacks) if !callbacks.is_empty() => callbacks.clone(),
            _ => {
                log::trace!("No callback for event {}", event);
                return false;
            }
        };

        for callback in callbacks {
            let payload = payload.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                log::error!(
                    "Callback for event {} panicked: {}",
                    event,
                    panic_message(panic.as_ref())
                );
            }
        }
        true
    }

    pub fn has(&self, event: &str) -> bool {
        self.table
            .read()
            .get(event)
            .is_some_and(|callbacks| !callbacks.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    // Ensure the trait is object-safe
    fn _assert_transport_object_safe(_: &dyn Transport) {}

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let callbacks = Callbacks::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            callbacks.add(
                "message",
                Arc::new(move |payload: Value| seen.lock().push((tag, payload))),
            );
        }

        assert!(callbacks.fire("message", json!({"n": 1})));
        assert_eq!(
            *seen.lock(),
            vec![("first", json!({"n": 1})), ("second", json!({"n": 1}))]
        );
    }

    #[test]
    fn test_fire_unknown_event() {
        let callbacks = Callbacks::new();
        assert!(!callbacks.has("message"));
        assert!(!callbacks.fire("message", Value::Null));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let callbacks = Callbacks::new();
        let reached = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached);

        fn faulty(_: Value) {
            panic!("callback bug");
        }
        callbacks.add("connect", Arc::new(faulty));
        callbacks.add("connect", Arc::new(move |_: Value| *flag.lock() = true));

        assert!(callbacks.fire("connect", Value::Null));
        assert!(*reached.lock());
    }
}
