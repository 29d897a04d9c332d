//! Delivery queue
//!
//! Decouples message arrival (transport I/O context, any thread) from
//! application processing. Envelopes go into an unbounded FIFO channel that is
//! drained by exactly one dedicated worker thread, so handlers of one client
//! never run concurrently and always observe enqueue order.
//!
//! ```text
//!  transport callbacks ──enqueue──▶ [ e1 e2 e3 ... ] ──▶ worker thread
//!   (many producers)                unbounded FIFO        │
//!                                                          ├─▶ HandlerRegistry::dispatch
//!                                                          └─▶ DeliveryHook::after_dispatch
//! ```
//!
//! The queue has no backpressure: a producer rate sustained above the
//! consumer rate grows memory without bound.

use parking_lot::Mutex;
use pubsub_core::MessageEnvelope;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use crate::error::QueueError;
use crate::handler::{DispatchOutcome, HandlerRegistry, panic_message};

/// Hook invoked on the worker after every dispatch, whatever its outcome
pub trait DeliveryHook: Send + Sync {
    fn after_dispatch(&self, envelope: &MessageEnvelope, outcome: &DispatchOutcome);
}

/// What to do with undispatched envelopes on shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Dispatch everything enqueued before the shutdown, then stop
    #[default]
    Drain,
    /// Drop everything not yet dispatched
    Discard,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dispatched: u64,
    pub handled: u64,
    pub unhandled: u64,
    pub failed: u64,
    pub discarded: u64,
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    handled: AtomicU64,
    unhandled: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

/// Ordered queue with a single dedicated dispatch worker
pub struct DeliveryQueue {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<MessageEnvelope>>>,
    discard: Arc<AtomicBool>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    /// Create the queue and start its worker thread
    pub fn spawn(
        name: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        hook: Option<Arc<dyn DeliveryHook>>,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let discard = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            name: name.clone(),
            rx,
            registry,
            hook,
            discard: Arc::clone(&discard),
            counters: Arc::clone(&counters),
        };
        let handle = std::thread::Builder::new()
            .name(format!("pubsub-worker-{}", name))
            .spawn(move || worker.run())?;

        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            discard,
            counters,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Append an envelope to the tail of the queue
    pub fn enqueue(&self, envelope: MessageEnvelope) -> Result<(), QueueError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(QueueError::Closed)?;

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if tx.send(envelope).is_err() {
            self.counters.enqueued.fetch_sub(1, Ordering::Relaxed);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.counters;
        let enqueued = c.enqueued.load(Ordering::Relaxed);
        let dispatched = c.dispatched.load(Ordering::Relaxed);
        let discarded = c.discarded.load(Ordering::Relaxed);
        QueueStats {
            enqueued,
            dispatched,
            handled: c.handled.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            discarded,
            pending: enqueued.saturating_sub(dispatched + discarded),
        }
    }

    /// Close the queue to new envelopes and let the worker finish.
    ///
    /// Returns the worker handle on the first call so the caller can join it;
    /// later calls return `None`.
    pub fn shutdown(&self, mode: ShutdownMode) -> Option<JoinHandle<()>> {
        if let Some(tx) = self.tx.lock().take() {
            if mode == ShutdownMode::Discard {
                self.discard.store(true, Ordering::Release);
            }
            // Dropping the sender lets the worker drain and exit
            drop(tx);
            log::debug!("[{}] Delivery queue closed ({:?})", self.name, mode);
        }
        self.worker.lock().take()
    }
}

struct Worker {
    name: String,
    rx: mpsc::UnboundedReceiver<MessageEnvelope>,
    registry: Arc<HandlerRegistry>,
    hook: Option<Arc<dyn DeliveryHook>>,
    discard: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(mut self) {
        log::debug!("[{}] Delivery worker started", self.name);

        while let Some(envelope) = self.rx.blocking_recv() {
            if self.discard.load(Ordering::Acquire) {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.deliver(envelope);
        }

        log::debug!("[{}] Delivery worker stopped", self.name);
    }

    fn deliver(&self, envelope: MessageEnvelope) {
        log::debug!(
            "[{}] Processing message from topic [{}]: {} (from {}, ID={})",
            self.name,
            envelope.topic(),
            envelope.message(),
            envelope.producer(),
            envelope.message_id()
        );

        let outcome = self.registry.dispatch(&envelope);

        let counter = match &outcome {
            DispatchOutcome::Handled => &self.counters.handled,
            DispatchOutcome::Unhandled => &self.counters.unhandled,
            DispatchOutcome::Failed(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(hook) = &self.hook {
            let result =
                catch_unwind(AssertUnwindSafe(|| hook.after_dispatch(&envelope, &outcome)));
            if let Err(panic) = result {
                log::error!(
                    "[{}] Delivery hook panicked on message {}: {}",
                    self.name,
                    envelope.message_id(),
                    panic_message(panic.as_ref())
                );
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}
