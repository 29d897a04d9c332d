//! Positions service
//!
//! Subscribes to the position request topics, answers each request from the
//! [`PositionStore`] and publishes the answer on the matching response topic.
//! Handlers run on the client's delivery worker; responses are handed to a
//! single forwarding task so they are published in request order.

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use pubsub_client::{ClientConfig, PubSubClient, Publisher};
use pubsub_core::{EventType, MessageEnvelope, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::store::{Position, PositionStore};

pub const DEFAULT_CONSUMER: &str = "DatabaseManager";

/// Request topics the service subscribes to
pub const SUBSCRIPTION_TOPICS: [EventType; 11] = [
    EventType::AddPositionRequest,
    EventType::SellPositionRequest,
    EventType::RequestLastPurchasePrice,
    EventType::RequestOpenedPositions,
    EventType::RequestCountOpenedPositions,
    EventType::RequestMaxSalePrice,
    EventType::RequestAllPositionsData,
    EventType::RequestPurchasePriceForSellUpdate,
    EventType::SellPriceUpdateInDbRequested,
    EventType::CancelEventsRequest,
    EventType::CancelPositionsRequest,
];

/// Client configuration subscribed to every request topic
pub fn subscription_config(url: impl Into<String>, consumer: impl Into<String>) -> ClientConfig {
    ClientConfig::new(url, consumer, SUBSCRIPTION_TOPICS.iter().map(EventType::as_str))
}

pub struct PositionService {
    client: PubSubClient,
    store: Arc<PositionStore>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl PositionService {
    /// Service backed by the ledger at `db_path`, talking to the broker at `url`
    pub fn open<P: AsRef<Path>>(db_path: P, url: &str, consumer: &str) -> Result<Self> {
        let store = PositionStore::open(db_path)?;
        let client = PubSubClient::new(subscription_config(url, consumer))?;
        Ok(Self::new(client, store))
    }

    pub fn new(client: PubSubClient, store: PositionStore) -> Self {
        Self {
            client,
            store: Arc::new(store),
            forwarder: Mutex::new(None),
        }
    }

    /// Register the request handlers and connect
    pub async fn start(&self) -> Result<()> {
        let consumer = self.client.consumer().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let responder = Arc::new(Responder {
            store: Arc::clone(&self.store),
            producer: consumer.clone(),
            responses: tx,
        });
        register_handlers(&self.client, &responder);

        let forwarder = tokio::spawn(forward_responses(self.client.publisher(), consumer, rx));
        if let Some(previous) = self.forwarder.lock().replace(forwarder) {
            previous.abort();
        }

        self.client.start().await?;
        log::info!("[{}] Positions service started", self.client.consumer());
        Ok(())
    }

    /// Stop the client after draining pending requests, then flush responses
    pub async fn stop(&self) {
        self.client.stop().await;

        // Dropping the handlers closes the response channel
        for topic in SUBSCRIPTION_TOPICS {
            self.client.handlers().unregister(topic.as_str());
        }
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                log::error!("[{}] Response forwarder failed: {}", self.client.consumer(), e);
            }
        }
        log::info!("[{}] Positions service stopped", self.client.consumer());
    }

    pub fn client(&self) -> &PubSubClient {
        &self.client
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }
}

fn register_handlers(client: &PubSubClient, responder: &Arc<Responder>) {
    type Handler = fn(&Responder, &Payload) -> anyhow::Result<()>;
    let table: [(EventType, Handler); 11] = [
        (EventType::AddPositionRequest, Responder::add_position),
        (EventType::SellPositionRequest, Responder::sell_position),
        (EventType::RequestLastPurchasePrice, Responder::last_purchase_price),
        (EventType::RequestOpenedPositions, Responder::opened_positions),
        (EventType::RequestCountOpenedPositions, Responder::count_opened_positions),
        (EventType::RequestMaxSalePrice, Responder::max_sale_price),
        (EventType::RequestAllPositionsData, Responder::all_positions),
        (
            EventType::RequestPurchasePriceForSellUpdate,
            Responder::purchase_price_for_sell_update,
        ),
        (EventType::SellPriceUpdateInDbRequested, Responder::update_sell_price),
        (EventType::CancelEventsRequest, Responder::cancel_events),
        (EventType::CancelPositionsRequest, Responder::cancel_positions),
    ];

    for (topic, handler) in table {
        let responder = Arc::clone(responder);
        client.register_handler(
            topic.as_str(),
            move |payload: &Payload| -> anyhow::Result<()> { handler(&responder, payload) },
        );
    }
}

async fn forward_responses(
    publisher: Arc<dyn Publisher>,
    consumer: String,
    mut responses: mpsc::UnboundedReceiver<MessageEnvelope>,
) {
    while let Some(envelope) = responses.recv().await {
        match publisher.publish(&envelope).await {
            Ok(_) => log::debug!(
                "[{}] Response published to topic [{}] (ID={})",
                consumer,
                envelope.topic(),
                envelope.message_id()
            ),
            Err(e) => log::error!(
                "[{}] Failed to publish response to topic [{}]: {}",
                consumer,
                envelope.topic(),
                e
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SellUpdateRequest {
    position_id: Option<String>,
    percentage_change: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SellPriceUpdate {
    position_id: Option<String>,
    new_sell_price: Option<f64>,
}

/// Answers requests on the delivery worker thread
struct Responder {
    store: Arc<PositionStore>,
    producer: String,
    responses: mpsc::UnboundedSender<MessageEnvelope>,
}

impl Responder {
    fn respond(&self, event: EventType, message: Value) -> anyhow::Result<()> {
        let envelope = MessageEnvelope::new(event.as_str(), message, self.producer.as_str(), None)?;
        self.responses
            .send(envelope)
            .map_err(|_| anyhow!("response channel closed"))
    }

    /// Run `query`, answering with `fallback` when it fails
    fn respond_with<T: Serialize>(
        &self,
        event: EventType,
        fallback: T,
        query: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<()> {
        let value = query().unwrap_or_else(|e| {
            log::error!("[{}] {} failed: {:#}", self.producer, event, e);
            fallback
        });
        self.respond(event, serde_json::to_value(value)?)
    }

    fn add_position(&self, payload: &Payload) -> anyhow::Result<()> {
        let request = decode(payload);
        let position: Position =
            serde_json::from_value(request.clone()).context("malformed position")?;
        self.store
            .add_position(&position)
            .with_context(|| format!("failed to add position {}", position.id))?;
        self.respond(EventType::PositionOpened, request)
    }

    fn sell_position(&self, payload: &Payload) -> anyhow::Result<()> {
        let position_id = position_id(&decode(payload))?;
        self.store
            .sell_position(&position_id)
            .with_context(|| format!("failed to sell position {}", position_id))?;
        self.respond(EventType::PositionSold, json!(position_id))
    }

    fn cancel_events(&self, _: &Payload) -> anyhow::Result<()> {
        let cancelled = self.store.cancel_events().map(|_| ()).map_err(|e| {
            log::error!("[{}] Error cancelling events: {}", self.producer, e);
        });
        self.respond(EventType::EventsCancelled, json!(cancelled.is_ok()))
    }

    fn cancel_positions(&self, _: &Payload) -> anyhow::Result<()> {
        let closed = self.store.close_open_positions().map(|_| ()).map_err(|e| {
            log::error!("[{}] Error closing positions: {}", self.producer, e);
        });
        self.respond(EventType::PositionsClosed, json!(closed.is_ok()))
    }

    fn last_purchase_price(&self, payload: &Payload) -> anyhow::Result<()> {
        self.respond_with(EventType::LastPurchasePriceRetrieved, 0.0, || {
            Ok(self.store.last_purchase_price(&pools(payload)?)?)
        })
    }

    fn opened_positions(&self, payload: &Payload) -> anyhow::Result<()> {
        self.respond_with(EventType::OpenedPositionsRetrieved, Vec::new(), || {
            Ok(self.store.opened_positions(&pools(payload)?)?)
        })
    }

    fn count_opened_positions(&self, payload: &Payload) -> anyhow::Result<()> {
        self.respond_with(EventType::OpenedPositionsCountRetrieved, 0, || {
            Ok(self.store.count_opened(&pools(payload)?)?)
        })
    }

    fn max_sale_price(&self, payload: &Payload) -> anyhow::Result<()> {
        self.respond_with(EventType::MaxSalePriceRetrieved, 0.0, || {
            Ok(self.store.max_sale_price(&pools(payload)?)?)
        })
    }

    fn all_positions(&self, _: &Payload) -> anyhow::Result<()> {
        self.respond_with(EventType::AllPositionsRetrieved, Vec::new(), || {
            Ok(self.store.all_positions()?)
        })
    }

    fn purchase_price_for_sell_update(&self, payload: &Payload) -> anyhow::Result<()> {
        let request: SellUpdateRequest =
            serde_json::from_value(decode(payload)).context("malformed sell update request")?;
        let (Some(position_id), Some(percentage_change)) =
            (request.position_id, request.percentage_change)
        else {
            log::warn!(
                "[{}] Ignoring sell update request without position_id or percentage_change: {}",
                self.producer,
                payload
            );
            return Ok(());
        };

        match self.store.purchase_price(&position_id)? {
            Some(purchase_price) => {
                let new_sell_price = purchase_price * (1.0 + percentage_change / 100.0);
                self.respond(
                    EventType::SellPriceUpdateInDbRequested,
                    json!({"position_id": position_id, "new_sell_price": new_sell_price}),
                )
            }
            None => self.respond(EventType::PositionNotFoundForSellUpdate, json!(position_id)),
        }
    }

    fn update_sell_price(&self, payload: &Payload) -> anyhow::Result<()> {
        let request: SellPriceUpdate =
            serde_json::from_value(decode(payload)).context("malformed sell price update")?;
        let (Some(position_id), Some(new_sell_price)) =
            (request.position_id, request.new_sell_price)
        else {
            log::warn!(
                "[{}] Ignoring sell price update without position_id or new_sell_price: {}",
                self.producer,
                payload
            );
            return Ok(());
        };

        self.store
            .update_sell_price(&position_id, new_sell_price)
            .with_context(|| format!("failed to update sell price of {}", position_id))?;
        self.respond(
            EventType::SellPriceUpdated,
            json!({"position_id": position_id, "new_sell_price": new_sell_price}),
        )
    }
}

/// Payloads may arrive JSON-encoded inside a string
fn decode(payload: &Payload) -> Value {
    match payload {
        Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| payload.clone()),
        other => other.clone(),
    }
}

fn position_id(request: &Value) -> anyhow::Result<String> {
    request
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("position id must be a string, got {}", request))
}

/// Pool filter of a query request; null means every pool
fn pools(payload: &Payload) -> anyhow::Result<Vec<String>> {
    match decode(payload) {
        Value::Null => Ok(Vec::new()),
        value => serde_json::from_value(value).context("pool list must be an array of names"),
    }
}
