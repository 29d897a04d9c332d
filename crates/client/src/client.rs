//! Pub/sub client
//!
//! Ties the pieces together: a [`Transport`] for the persistent broker
//! connection, a [`HandlerRegistry`] for topic dispatch, a [`DeliveryQueue`]
//! with its worker thread, and a [`Publisher`] for one-shot publishing.
//!
//! ```text
//!   Disconnected ──start──▶ Connecting ──connect──▶ Connected
//!        ▲                      │                     │  ▲
//!        │                 connect error        disconnect │ connect
//!        │                      ▼                     ▼  │
//!        └───────stop────── (any state) ◀──stop── Reconnecting
//! ```

use parking_lot::Mutex;
use pubsub_core::{MessageEnvelope, MessageId, Payload};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::handler::{DispatchOutcome, HandlerRegistry, MessageHandler};
use crate::publisher::{HttpPublisher, PublishAck, Publisher};
use crate::queue::{DeliveryHook, DeliveryQueue, QueueStats, ShutdownMode};
use crate::transport::{
    CONNECT_EVENT, DISCONNECT_EVENT, RECONNECT_FAILED_EVENT, Transport, WsTransport,
};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

struct Inner {
    config: ClientConfig,
    registry: Arc<HandlerRegistry>,
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publisher>,
    state: watch::Sender<ClientState>,
    queue: Mutex<Option<Arc<DeliveryQueue>>>,
    malformed: AtomicU64,
}

/// Client of the trading pub/sub broker
pub struct PubSubClient {
    inner: Arc<Inner>,
}

impl PubSubClient {
    /// Create a client using the WebSocket transport and HTTP publisher
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = Arc::new(WsTransport::new(config.reconnection.clone()));
        let publisher = Arc::new(HttpPublisher::from_config(&config)?);
        Self::with_components(config, transport, publisher)
    }

    /// Create a client with injected transport and publisher
    pub fn with_components(
        mut config: ClientConfig,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, ClientError> {
        config.normalize();
        config.validate()?;

        let (state, _) = watch::channel(ClientState::Disconnected);
        let inner = Arc::new(Inner {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            transport,
            publisher,
            state,
            queue: Mutex::new(None),
            malformed: AtomicU64::new(0),
        });
        Inner::install_callbacks(&inner);

        log::debug!(
            "[{}] Client created for {} (topics: {:?})",
            inner.config.consumer,
            inner.config.url,
            inner.config.topics
        );
        Ok(Self { inner })
    }

    /// Bind `handler` to `topic`, replacing any previous binding.
    /// Returns true if a binding was replaced.
    pub fn register_handler(
        &self,
        topic: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> bool {
        let topic = topic.into();
        log::debug!("[{}] Handler registered for {}", self.consumer(), topic);
        self.inner.registry.register(topic, handler)
    }

    /// Start the delivery worker and connect to the broker.
    ///
    /// Only valid from [`ClientState::Disconnected`]. A failure of the first
    /// connection attempt is returned and leaves the client disconnected.
    /// A [`stop`](Self::stop) issued while the handshake is pending abandons
    /// it, closes anything already opened and fails with
    /// [`ClientError::StoppedDuringStart`].
    pub async fn start(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        let consumer = &inner.config.consumer;

        let url = inner.config.socket_url()?;
        let started = inner.state.send_if_modified(|state| {
            if *state == ClientState::Disconnected {
                *state = ClientState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ClientError::AlreadyStarted);
        }
        let mut changes = inner.state.subscribe();

        let hook = inner.config.acknowledge.then(|| {
            Arc::new(AckHook {
                consumer: consumer.clone(),
                event: inner.config.events.consumed.clone(),
                transport: Arc::clone(&inner.transport),
            }) as Arc<dyn DeliveryHook>
        });
        let spawned = DeliveryQueue::spawn(consumer.clone(), Arc::clone(&inner.registry), hook);
        let queue = match spawned {
            Ok(queue) => Arc::new(queue),
            Err(e) => {
                inner.state.send_replace(ClientState::Disconnected);
                return Err(e.into());
            }
        };
        *inner.queue.lock() = Some(Arc::clone(&queue));

        log::info!("[{}] Connecting to {}", consumer, url);
        let connected = tokio::select! {
            result = inner.transport.connect(&url) => result,
            () = stopped(&mut changes) => {
                log::info!("[{}] Stopped while connecting to {}", consumer, url);
                inner.join_queue(queue, ShutdownMode::Discard).await;
                return Err(ClientError::StoppedDuringStart);
            }
        };

        if let Err(e) = connected {
            log::error!("[{}] Connection to {} failed: {}", consumer, url, e);
            inner.state.send_replace(ClientState::Disconnected);
            inner.join_queue(queue, ShutdownMode::Discard).await;
            return Err(e.into());
        }

        // A stop racing the end of the handshake may have missed the socket
        if *inner.state.borrow() == ClientState::Disconnected {
            log::info!("[{}] Stopped while connecting, closing {}", consumer, url);
            if let Err(e) = inner.transport.disconnect().await {
                log::warn!("[{}] Error closing connection: {}", consumer, e);
            }
            inner.join_queue(queue, ShutdownMode::Discard).await;
            return Err(ClientError::StoppedDuringStart);
        }
        Ok(())
    }

    /// Stop the client, draining queued messages
    pub async fn stop(&self) {
        self.stop_with(ShutdownMode::Drain).await;
    }

    /// Stop the client. Safe to call in any state and more than once.
    pub async fn stop_with(&self, mode: ShutdownMode) {
        let inner = &self.inner;
        let previous = inner.state.send_replace(ClientState::Disconnected);

        if let Err(e) = inner.transport.disconnect().await {
            log::warn!("[{}] Error closing connection: {}", inner.config.consumer, e);
        }
        inner.shutdown_queue(mode).await;

        if previous != ClientState::Disconnected {
            log::info!("[{}] Client stopped", inner.config.consumer);
        }
    }

    /// Publish a message. Awaited by the caller, never queued or retried.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        message: Payload,
        producer: impl Into<String>,
        message_id: Option<MessageId>,
    ) -> Result<PublishAck, ClientError> {
        let envelope = MessageEnvelope::new(topic, message, producer, message_id)?;
        self.publish_envelope(&envelope).await
    }

    /// Publish a pre-built envelope
    pub async fn publish_envelope(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<PublishAck, ClientError> {
        let consumer = &self.inner.config.consumer;
        match self.inner.publisher.publish(envelope).await {
            Ok(ack) => {
                log::info!(
                    "[{}] Message published to topic [{}] (ID={})",
                    consumer,
                    envelope.topic(),
                    envelope.message_id()
                );
                Ok(ack)
            }
            Err(e) => {
                log::error!(
                    "[{}] Failed to publish message {} to topic [{}]: {}",
                    consumer,
                    envelope.message_id(),
                    envelope.topic(),
                    e
                );
                Err(e.into())
            }
        }
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Wait until the client reaches `target`
    pub async fn wait_for_state(&self, target: ClientState) {
        let mut changes = self.inner.state.subscribe();
        // The sender lives as long as `self`
        let _ = changes.wait_for(|state| *state == target).await;
    }

    /// Counters of the current (or last) delivery queue
    pub fn queue_stats(&self) -> QueueStats {
        self.inner
            .queue
            .lock()
            .as_ref()
            .map(|queue| queue.stats())
            .unwrap_or_default()
    }

    /// Inbound events dropped because they did not decode as envelopes
    pub fn malformed_count(&self) -> u64 {
        self.inner.malformed.load(Ordering::Relaxed)
    }

    pub fn subscribed_topics(&self) -> &[String] {
        &self.inner.config.topics
    }

    pub fn consumer(&self) -> &str {
        &self.inner.config.consumer
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Shared handle on the publisher, for components that publish from
    /// their own tasks
    pub fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::clone(&self.inner.publisher)
    }
}

impl Inner {
    /// Install transport callbacks once. They hold a weak reference so the
    /// transport never keeps the client alive.
    fn install_callbacks(inner: &Arc<Inner>) {
        let transport = Arc::clone(&inner.transport);
        let events = &inner.config.events;

        let weak = Arc::downgrade(inner);
        transport.on(
            CONNECT_EVENT,
            Arc::new(move |_: Value| with_inner(&weak, |inner| inner.on_connect())),
        );
        let weak = Arc::downgrade(inner);
        transport.on(
            DISCONNECT_EVENT,
            Arc::new(move |_: Value| with_inner(&weak, |inner| inner.on_disconnect())),
        );
        let weak = Arc::downgrade(inner);
        transport.on(
            RECONNECT_FAILED_EVENT,
            Arc::new(move |data: Value| {
                with_inner(&weak, |inner| inner.on_reconnect_failed(&data))
            }),
        );
        let weak = Arc::downgrade(inner);
        transport.on(
            &events.message,
            Arc::new(move |data: Value| with_inner(&weak, |inner| inner.on_message(data))),
        );
        let weak = Arc::downgrade(inner);
        transport.on(
            &events.new_message,
            Arc::new(move |data: Value| {
                with_inner(&weak, |inner| inner.on_new_message(&data))
            }),
        );
    }

    /// Move to `to` unless the client is stopped. Returns true on change.
    fn transition(&self, to: ClientState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ClientState::Disconnected || *state == to {
                false
            } else {
                *state = to;
                true
            }
        })
    }

    fn on_connect(&self) {
        let consumer = &self.config.consumer;
        if *self.state.borrow() == ClientState::Disconnected {
            log::debug!("[{}] Ignoring connect while stopped", consumer);
            return;
        }
        self.transition(ClientState::Connected);
        log::info!("[{}] Connected to {}", consumer, self.config.url);

        let request = json!({
            "consumer": consumer,
            "topics": self.config.topics,
        });
        match self.transport.emit(&self.config.events.subscribe, request) {
            Ok(()) => log::info!(
                "[{}] Subscribed to topics: {:?}",
                consumer,
                self.config.topics
            ),
            Err(e) => log::error!("[{}] Subscription request failed: {}", consumer, e),
        }
    }

    fn on_disconnect(&self) {
        if self.transition(ClientState::Reconnecting) {
            log::info!("[{}] Disconnected from {}", self.config.consumer, self.config.url);
        }
    }

    fn on_reconnect_failed(&self, data: &Value) {
        log::error!(
            "[{}] Reconnection to {} abandoned: {}",
            self.config.consumer,
            self.config.url,
            data
        );
    }

    fn on_new_message(&self, data: &Value) {
        log::info!("[{}] New message notification: {}", self.config.consumer, data);
    }

    fn on_message(&self, data: Value) {
        let consumer = &self.config.consumer;
        let envelope = match MessageEnvelope::from_representation(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("[{}] Dropping malformed message: {}", consumer, e);
                return;
            }
        };

        let queue = self.queue.lock().clone();
        let Some(queue) = queue else {
            log::debug!(
                "[{}] Dropping message {}: client not started",
                consumer,
                envelope.message_id()
            );
            return;
        };
        let message_id = envelope.message_id().clone();
        if let Err(e) = queue.enqueue(envelope) {
            log::debug!("[{}] Dropping message {}: {}", consumer, message_id, e);
        }
    }

    async fn shutdown_queue(&self, mode: ShutdownMode) {
        let queue = self.queue.lock().clone();
        if let Some(queue) = queue {
            self.join_queue(queue, mode).await;
        }
    }

    /// Close `queue` and wait for its worker. No-op if already closed.
    async fn join_queue(&self, queue: Arc<DeliveryQueue>, mode: ShutdownMode) {
        let Some(handle) = queue.shutdown(mode) else {
            return;
        };

        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => log::error!("[{}] Delivery worker panicked", self.config.consumer),
            Err(e) => log::error!(
                "[{}] Failed to join delivery worker: {}",
                self.config.consumer,
                e
            ),
        }
    }
}

/// Resolves once the client is stopped
async fn stopped(changes: &mut watch::Receiver<ClientState>) {
    let _ = changes
        .wait_for(|state| *state == ClientState::Disconnected)
        .await;
}

fn with_inner(weak: &Weak<Inner>, f: impl FnOnce(&Inner)) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

/// Emits the consumption acknowledgment after every dispatch
struct AckHook {
    consumer: String,
    event: String,
    transport: Arc<dyn Transport>,
}

impl DeliveryHook for AckHook {
    fn after_dispatch(&self, envelope: &MessageEnvelope, _outcome: &DispatchOutcome) {
        let ack = json!({
            "consumer": self.consumer,
            "topic": envelope.topic(),
            "message_id": envelope.message_id(),
            "message": envelope.message(),
        });
        if let Err(e) = self.transport.emit(&self.event, ack) {
            log::debug!(
                "[{}] Acknowledgment of {} not sent: {}",
                self.consumer,
                envelope.message_id(),
                e
            );
        }
    }
}
