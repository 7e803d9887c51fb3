use crate::models::{PriceUpdate, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Gateway-assigned order handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderKind {
    StopMarket { trigger: f64 },
    Limit { price: f64 },
    Market,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub instrument: String,
    pub side: Side,
    pub quantity: u32,
    pub kind: OrderKind,
    /// Free-form label carried through to logs
    pub tag: String,
    /// Orders sharing a group cancel each other once any of them fills
    pub oco_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderRequest {
    Place(OrderSpec),
    /// Close the whole net position on an instrument at market
    Flatten { instrument: String, tag: String },
}

/// Asynchronous notifications from the broker side
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// `quantity` is the size of this fill only, never cumulative
    Filled {
        order_id: OrderId,
        instrument: String,
        side: Side,
        quantity: u32,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    Rejected {
        order_id: OrderId,
        reason: String,
    },
    Cancelled {
        order_id: OrderId,
    },
}

impl GatewayEvent {
    pub fn order_id(&self) -> &OrderId {
        match self {
            GatewayEvent::Filled { order_id, .. }
            | GatewayEvent::Rejected { order_id, .. }
            | GatewayEvent::Cancelled { order_id } => order_id,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unknown or inactive order {0}")]
    UnknownOrder(OrderId),

    #[error("order {0} cannot be modified")]
    NotModifiable(OrderId),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Broker seam. Calls are synchronous; results of accepted orders arrive
/// later through `poll_events`.
pub trait OrderGateway {
    fn submit(&mut self, request: OrderRequest) -> Result<OrderId, GatewayError>;

    fn cancel(&mut self, order_id: &OrderId) -> Result<(), GatewayError>;

    /// Move the trigger of a resting stop order
    fn modify_stop(&mut self, order_id: &OrderId, trigger: f64) -> Result<(), GatewayError>;

    fn poll_events(&mut self) -> Vec<GatewayEvent>;

    /// Market data hook for simulated gateways
    fn on_market(&mut self, _update: &PriceUpdate) {}
}

impl<G: OrderGateway + ?Sized> OrderGateway for Box<G> {
    fn submit(&mut self, request: OrderRequest) -> Result<OrderId, GatewayError> {
        (**self).submit(request)
    }

    fn cancel(&mut self, order_id: &OrderId) -> Result<(), GatewayError> {
        (**self).cancel(order_id)
    }

    fn modify_stop(&mut self, order_id: &OrderId, trigger: f64) -> Result<(), GatewayError> {
        (**self).modify_stop(order_id, trigger)
    }

    fn poll_events(&mut self) -> Vec<GatewayEvent> {
        (**self).poll_events()
    }

    fn on_market(&mut self, update: &PriceUpdate) {
        (**self).on_market(update)
    }
}
