//! Topic catalogue
//!
//! Well-known topics exchanged by the trading services. Topics on the wire
//! stay plain strings; this enum only gives producers and consumers a shared,
//! typo-proof vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Commands (orchestrator and services)
    CommandActionsRegistered,

    // Position database requests
    AddPositionRequest,
    SellPositionRequest,
    RequestLastPurchasePrice,
    RequestOpenedPositions,
    RequestCountOpenedPositions,
    RequestMaxSalePrice,
    RequestAllPositionsData,
    RequestPurchasePriceForSellUpdate,
    SellPriceUpdateInDbRequested,
    CancelEventsRequest,
    CancelPositionsRequest,

    // Position database responses
    PositionOpened,
    PositionSold,
    EventsCancelled,
    PositionsClosed,
    LastPurchasePriceRetrieved,
    OpenedPositionsRetrieved,
    OpenedPositionsCountRetrieved,
    MaxSalePriceRetrieved,
    AllPositionsRetrieved,
    PositionNotFoundForSellUpdate,
    SellPriceUpdated,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl EventType {
    pub const ALL: [EventType; 23] = [
        EventType::CommandActionsRegistered,
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
        EventType::PositionOpened,
        EventType::PositionSold,
        EventType::EventsCancelled,
        EventType::PositionsClosed,
        EventType::LastPurchasePriceRetrieved,
        EventType::OpenedPositionsRetrieved,
        EventType::OpenedPositionsCountRetrieved,
        EventType::MaxSalePriceRetrieved,
        EventType::AllPositionsRetrieved,
        EventType::PositionNotFoundForSellUpdate,
        EventType::SellPriceUpdated,
    ];

    /// Topic string used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CommandActionsRegistered => "command_actions_registered",
            EventType::AddPositionRequest => "add_position_request",
            EventType::SellPositionRequest => "sell_position_request",
            EventType::RequestLastPurchasePrice => "request_last_purchase_price",
            EventType::RequestOpenedPositions => "request_opened_positions",
            EventType::RequestCountOpenedPositions => "request_count_opened_positions",
            EventType::RequestMaxSalePrice => "request_max_sale_price",
            EventType::RequestAllPositionsData => "request_all_positions_data",
            EventType::RequestPurchasePriceForSellUpdate => {
                "request_purchase_price_for_sell_update"
            }
            EventType::SellPriceUpdateInDbRequested => "sell_price_update_in_db_requested",
            EventType::CancelEventsRequest => "cancel_events_request",
            EventType::CancelPositionsRequest => "cancel_positions_request",
            EventType::PositionOpened => "position_opened",
            EventType::PositionSold => "position_sold",
            EventType::EventsCancelled => "events_cancelled",
            EventType::PositionsClosed => "positions_closed",
            EventType::LastPurchasePriceRetrieved => "last_purchase_price_retrieved",
            EventType::OpenedPositionsRetrieved => "opened_positions_retrieved",
            EventType::OpenedPositionsCountRetrieved => "opened_positions_count_retrieved",
            EventType::MaxSalePriceRetrieved => "max_sale_price_retrieved",
            EventType::AllPositionsRetrieved => "all_positions_retrieved",
            EventType::PositionNotFoundForSellUpdate => "position_not_found_for_sell_update",
            EventType::SellPriceUpdated => "sell_price_updated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}
