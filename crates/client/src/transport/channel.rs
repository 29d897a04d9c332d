//! In-process transport for single-process mode and tests
//!
//! [`ChannelTransport::pair`] returns the client side and a [`BrokerHandle`]
//! playing the broker: it delivers inbound events, observes emitted ones and
//! can drop or restore the connection. Callbacks run on the caller of the
//! handle method.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::frame::EventFrame;
use super::{
    CONNECT_EVENT, Callbacks, DISCONNECT_EVENT, EventCallback, RECONNECT_FAILED_EVENT, Transport,
};
use crate::error::TransportError;

#[derive(Default)]
struct LinkState {
    connected: bool,
    url: Option<String>,
    connect_count: u32,
    refuse: bool,
    handshake_delay: Option<Duration>,
}

struct Link {
    callbacks: Callbacks,
    state: Mutex<LinkState>,
    emitted: mpsc::UnboundedSender<EventFrame>,
}

/// Client side of an in-process connection
pub struct ChannelTransport {
    link: Arc<Link>,
}

/// Broker side of an in-process connection
pub struct BrokerHandle {
    link: Arc<Link>,
    emitted: mpsc::UnboundedReceiver<EventFrame>,
}

impl ChannelTransport {
    /// Create a transport/broker pair
    pub fn pair() -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            callbacks: Callbacks::new(),
            state: Mutex::new(LinkState::default()),
            emitted: tx,
        });
        (
            Self {
                link: Arc::clone(&link),
            },
            BrokerHandle { link, emitted: rx },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn on(&self, event: &str, callback: EventCallback) {
        self.link.callbacks.add(event, callback);
    }

    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let handshake_delay = self.link.state.lock().handshake_delay;
        if let Some(delay) = handshake_delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.link.state.lock();
            if state.refuse {
                return Err(TransportError::Connection(format!(
                    "connection to {} refused",
                    url
                )));
            }
            if state.connected {
                return Err(TransportError::Connection(format!(
                    "already connected to {}",
                    url
                )));
            }
            state.connected = true;
            state.url = Some(url.to_string());
            state.connect_count += 1;
        }
        self.link.callbacks.fire(CONNECT_EVENT, Value::Null);
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.link.state.lock().connected {
            return Err(TransportError::NotConnected);
        }
        self.link
            .emitted
            .send(EventFrame::new(event, payload))
            .map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.link.set_disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.state.lock().connected
    }
}

impl Link {
    /// Returns false if there was no live session
    fn set_disconnected(&self) -> bool {
        let was_connected = std::mem::replace(&mut self.state.lock().connected, false);
        if was_connected {
            self.callbacks.fire(DISCONNECT_EVENT, Value::Null);
        }
        was_connected
    }
}

impl BrokerHandle {
    /// Simulate an unexpected connection loss
    pub fn drop_connection(&self) -> bool {
        self.link.set_disconnected()
    }

    /// Simulate a successful reconnection to the last connected URL
    pub fn restore_connection(&self) -> bool {
        {
            let mut state = self.link.state.lock();
            if state.connected || state.url.is_none() {
                return false;
            }
            state.connected = true;
            state.connect_count += 1;
        }
        self.link.callbacks.fire(CONNECT_EVENT, Value::Null);
        true
    }

    /// Simulate the transport giving up on reconnection
    pub fn exhaust_reconnection(&self, attempts: u32) {
        self.link
            .callbacks
            .fire(RECONNECT_FAILED_EVENT, json!({ "attempts": attempts }));
    }

    /// Make later `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.link.state.lock().refuse = refuse;
    }

    /// Hold every later `connect` call for `delay` before it completes
    pub fn delay_connections(&self, delay: Option<Duration>) {
        self.link.state.lock().handshake_delay = delay;
    }

    /// Push an inbound event to the client. Returns false when disconnected.
    pub fn deliver(&self, event: &str, data: Value) -> bool {
        if !self.link.state.lock().connected {
            return false;
        }
        self.link.callbacks.fire(event, data);
        true
    }

    pub fn try_next_emitted(&mut self) -> Option<EventFrame> {
        self.emitted.try_recv().ok()
    }

    pub fn drain_emitted(&mut self) -> Vec<EventFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.emitted.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Wait for the next emitted frame
    pub async fn next_emitted(&mut self) -> Option<EventFrame> {
        self.emitted.recv().await
    }

    pub fn connected_url(&self) -> Option<String> {
        let state = self.link.state.lock();
        state.connected.then(|| state.url.clone()).flatten()
    }

    pub fn is_connected(&self) -> bool {
        self.link.state.lock().connected
    }

    pub fn connect_count(&self) -> u32 {
        self.link.state.lock().connect_count
    }
}
