//! WebSocket transport with automatic reconnection
//!
//! `connect` performs the first handshake itself and reports its failure.
//! From then on a supervisor task owns the socket: it reads frames and fires
//! callbacks, writes emitted frames, and on an unexpected drop retries with
//! exponential backoff until the policy gives up or `disconnect` is called.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::frame::EventFrame;
use super::{
    CONNECT_EVENT, Callbacks, DISCONNECT_EVENT, EventCallback, RECONNECT_FAILED_EVENT, Transport,
};
use crate::config::ReconnectionConfig;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared between the transport handle and its supervisor task
struct Shared {
    callbacks: Callbacks,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    reconnection: ReconnectionConfig,
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Dropped,
}

/// Live socket plus the receiving side of its outbound queue
struct Session {
    stream: WsStream,
    outbound: mpsc::UnboundedReceiver<Message>,
}

pub struct WsTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl WsTransport {
    pub fn new(reconnection: ReconnectionConfig) -> Self {
        WsTransport {
            shared: Arc::new(Shared {
                callbacks: Callbacks::new(),
                outbound: Mutex::new(None),
                connected: AtomicBool::new(false),
                reconnection,
            }),
            supervisor: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .as_ref()
            .is_some_and(|supervisor| !supervisor.task.is_finished())
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(ReconnectionConfig::default())
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn on(&self, event: &str, callback: EventCallback) {
        self.shared.callbacks.add(event, callback);
    }

    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        if self.is_running() {
            return Err(TransportError::Connection(format!(
                "already connected to {}",
                url
            )));
        }
        Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;

        let (stream, _) = connect_async(url).await?;
        log::info!("Connected to {}", url);

        let session = self.shared.open_session(stream);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            url.to_string(),
            session,
            shutdown_rx,
        ));

        *self.supervisor.lock() = Some(Supervisor {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let text = EventFrame::new(event, payload).to_text()?;
        let guard = self.shared.outbound.lock();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let supervisor = self.supervisor.lock().take();
        let Some(supervisor) = supervisor else {
            return Ok(());
        };

        // The supervisor may already be gone after exhausting reconnection
        let _ = supervisor.shutdown.send(true);
        supervisor
            .task
            .await
            .map_err(|e| TransportError::Connection(format!("supervisor task failed: {}", e)))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl Shared {
    fn open_session(&self, stream: WsStream) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::Release);
        self.callbacks.fire(CONNECT_EVENT, Value::Null);
        Session {
            stream,
            outbound: rx,
        }
    }

    fn close_session(&self) {
        self.outbound.lock().take();
        self.connected.store(false, Ordering::Release);
        self.callbacks.fire(DISCONNECT_EVENT, Value::Null);
    }

    fn dispatch_text(&self, text: &str) {
        match EventFrame::from_text(text) {
            Ok(frame) => {
                self.callbacks.fire(&frame.event, frame.data);
            }
            Err(e) => log::warn!("Skipping unparseable frame: {}", e),
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    url: String,
    mut session: Session,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let end = run_session(&shared, session, &mut shutdown).await;
        shared.close_session();

        if end == SessionEnd::Shutdown {
            log::info!("Disconnected from {}", url);
            break;
        }

        log::warn!("Connection to {} lost", url);
        match reconnect(&shared, &url, &mut shutdown).await {
            Some(stream) => session = shared.open_session(stream),
            None => break,
        }
    }
}

async fn run_session(
    shared: &Shared,
    session: Session,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut write, mut read) = session.stream.split();
    let mut outbound = session.outbound;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    log::debug!("Close frame not sent: {}", e);
                }
                return SessionEnd::Shutdown;
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = write.send(message).await {
                    log::warn!("WebSocket write failed: {}", e);
                    return SessionEnd::Dropped;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch_text(text.as_str()),
                Some(Ok(Message::Ping(data))) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("Server closed connection: {:?}", frame);
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket read failed: {}", e);
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            }
        }
    }
}

/// Retry the handshake with backoff. `None` on shutdown or exhaustion.
async fn reconnect(
    shared: &Shared,
    url: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    let policy = &shared.reconnection;
    let mut attempts = 0u32;

    while policy.allows_attempt(attempts) {
        attempts += 1;
        let delay = policy.delay_for_attempt(attempts);
        log::debug!("Reconnection attempt {} to {} in {:?}", attempts, url, delay);

        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            _ = shutdown.changed() => return None,
            result = connect_async(url) => result,
        };
        match result {
            Ok((stream, _)) => {
                log::info!("Reconnected to {} after {} attempt(s)", url, attempts);
                return Some(stream);
            }
            Err(e) => log::warn!("Reconnection attempt {} to {} failed: {}", attempts, url, e),
        }
    }

    log::error!("Giving up on {} after {} attempt(s)", url, attempts);
    shared
        .callbacks
        .fire(RECONNECT_FAILED_EVENT, json!({ "attempts": attempts }));
    None
}
