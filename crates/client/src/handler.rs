//! Topic → handler registry
//!
//! Each topic is bound to at most one [`MessageHandler`]. Registering a topic
//! again replaces the previous binding (last registration wins).

use dashmap::DashMap;
use pubsub_core::{MessageEnvelope, Payload};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::HandlerError;

/// Application callback for one topic
///
/// Handlers receive the message payload only, never the raw envelope, and run
/// on the delivery worker thread one at a time.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: &Payload) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, payload: &Payload) -> anyhow::Result<()> {
        self(payload)
    }
}

/// Result of dispatching one envelope
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The topic handler returned successfully
    Handled,
    /// No handler is registered for the topic
    Unhandled,
    /// The handler returned an error or panicked
    Failed(HandlerError),
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, DispatchOutcome::Handled)
    }
}

/// Concurrent mapping from topic to handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `topic`. Returns true if a previous binding was replaced.
    pub fn register(
        &self,
        topic: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> bool {
        self.register_arc(topic, Arc::new(handler))
    }

    /// Bind an already shared handler to `topic`
    pub fn register_arc(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> bool {
        let topic = topic.into();
        let replaced = self.handlers.insert(topic.clone(), handler).is_some();
        if replaced {
            log::debug!("Replaced handler for topic {}", topic);
        }
        replaced
    }

    /// Remove the binding for `topic`. Returns true if one existed.
    pub fn unregister(&self, topic: &str) -> bool {
        self.handlers.remove(topic).is_some()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Topics with a registered handler, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invoke the handler bound to the envelope's topic with its payload.
    ///
    /// Never fails: missing handlers, handler errors and handler panics are
    /// logged and reported through the returned outcome.
    pub fn dispatch(&self, envelope: &MessageEnvelope) -> DispatchOutcome {
        // Clone out of the map so no shard lock is held while the handler runs
        let handler = match self.handlers.get(envelope.topic()) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                log::warn!(
                    "No handler for topic {} (message {})",
                    envelope.topic(),
                    envelope.message_id()
                );
                return DispatchOutcome::Unhandled;
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(envelope.message())));
        let reason = match result {
            Ok(Ok(())) => return DispatchOutcome::Handled,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        let error = HandlerError {
            topic: envelope.topic().to_string(),
            message_id: envelope.message_id().clone(),
            reason,
        };
        log::error!("{}", error);
        DispatchOutcome::Failed(error)
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    fn envelope(topic: &str, message: Value) -> MessageEnvelope {
        MessageEnvelope::new(topic, message, "test_producer", None).unwrap()
    }

    #[test]
    fn test_dispatch_passes_payload_only() {
        let registry = HandlerRegistry::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        registry.register("topic1", move |payload: &Value| -> anyhow::Result<()> {
            sink.lock().push(payload.clone());
            Ok(())
        });

        let outcome = registry.dispatch(&envelope("topic1", json!({"data": "test"})));

        assert!(outcome.is_handled());
        assert_eq!(*received.lock(), vec![json!({"data": "test"})]);
    }

    #[test]
    fn test_register_replaces_previous_handler() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&calls);
        assert!(!registry.register("topic1", move |_: &Value| -> anyhow::Result<()> {
            first.lock().push("first");
            Ok(())
        }));
        let second = Arc::clone(&calls);
        assert!(registry.register("topic1", move |_: &Value| -> anyhow::Result<()> {
            second.lock().push("second");
            Ok(())
        }));

        registry.dispatch(&envelope("topic1", json!(null)));

        assert_eq!(registry.len(), 1);
        assert_eq!(*calls.lock(), vec!["second"]);
    }

    #[test]
    fn test_unhandled_topic_is_noop() {
        let registry = HandlerRegistry::new();
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        registry.register("A", move |_: &Value| -> anyhow::Result<()> {
            *flag.lock() = true;
            Ok(())
        });

        let outcome = registry.dispatch(&envelope("B", json!({})));

        assert!(matches!(outcome, DispatchOutcome::Unhandled));
        assert!(!*called.lock());
    }

    #[test]
    fn test_handler_error_is_contained() {
        let registry = HandlerRegistry::new();
        registry.register("topic1", |_: &Value| -> anyhow::Result<()> {
            anyhow::bail!("Handler error")
        });

        let env = envelope("topic1", json!("test"));
        match registry.dispatch(&env) {
            DispatchOutcome::Failed(error) => {
                assert_eq!(error.topic, "topic1");
                assert_eq!(&error.message_id, env.message_id());
                assert!(error.reason.contains("Handler error"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let registry = HandlerRegistry::new();
        registry.register("topic1", |_: &Value| -> anyhow::Result<()> {
            panic!("boom");
        });

        match registry.dispatch(&envelope("topic1", json!(1))) {
            DispatchOutcome::Failed(error) => assert!(error.reason.contains("boom")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register("topic1", move |_: &Value| -> anyhow::Result<()> {
            inner.register("topic2", |_: &Value| -> anyhow::Result<()> { Ok(()) });
            Ok(())
        });

        assert!(registry.dispatch(&envelope("topic1", json!(1))).is_handled());
        assert_eq!(registry.topics(), vec!["topic1", "topic2"]);
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry.register("topic1", |_: &Value| -> anyhow::Result<()> { Ok(()) });
        assert!(registry.contains("topic1"));
        assert!(registry.unregister("topic1"));
        assert!(!registry.unregister("topic1"));
        assert!(registry.is_empty());
    }
}
