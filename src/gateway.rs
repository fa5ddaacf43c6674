use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::{
    constraints::InstrumentConstraints,
    errors::GatewayResult,
    types::{BookLevel, FundingState, Leg, OrderType, Side, Tif},
};

/// Depth channel a book update arrived on. `Depth5` is the primary
/// multi-level snapshot channel; `Top` is the single-level fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BookChannel {
    Depth5,
    Top,
}

impl BookChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            BookChannel::Depth5 => "books5",
            BookChannel::Top => "books",
        }
    }
}

/// Wholesale book replacement for one leg: the levels supersede whatever was
/// previously held for that side, never a diff.
#[derive(Clone, Debug)]
pub struct DepthUpdate {
    pub leg: Leg,
    pub channel: BookChannel,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts_ms: i64,
}

/// Immutable order request handed to the gateway.
#[derive(Clone, Debug)]
pub struct OrderRequest {
    pub leg: Leg,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub tif: Tif,
    pub price: Option<f64>,
    pub size: f64,
    pub client_id: String,
    pub reduce_only: bool,
}

/// Acknowledgement of a placed order. `raw` carries the venue response for
/// the `res` field of log records.
#[derive(Clone, Debug)]
pub struct OrderAck {
    pub exch_order_id: String,
    pub accepted_ts_ms: i64,
    pub raw: Value,
}

#[derive(Clone, Debug)]
pub struct CancelRequest {
    pub leg: Leg,
    pub symbol: String,
    pub client_id: String,
    pub exch_order_id: Option<String>,
}

/// Cancel result. `AlreadyFilled` means the venue reported the order gone
/// because it executed; the OMS treats that as an imminent fill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    AlreadyFilled,
}

/// Order-state transition from the private stream.
#[derive(Clone, Debug)]
pub struct OrderEvent {
    pub leg: Leg,
    pub client_id: Option<String>,
    pub exch_order_id: String,
    pub status: OrderEventStatus,
    pub ts_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderEventStatus {
    Accepted,
    Canceled,
    Rejected { code: String, structural: bool },
}

/// Execution from the private stream. Spot fills commonly arrive without a
/// client id; the OMS reconstructs it from the placement ack.
#[derive(Clone, Debug)]
pub struct FillEvent {
    pub leg: Leg,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub client_id: Option<String>,
    pub exch_order_id: String,
    pub trade_id: Option<String>,
    pub fee: f64,
    pub ts_ms: i64,
    pub simulated: bool,
}

/// Position snapshot push for one leg, signed base quantity.
#[derive(Clone, Debug)]
pub struct PositionEvent {
    pub leg: Leg,
    pub net: f64,
    pub ts_ms: i64,
}

#[derive(Clone, Debug)]
pub enum PrivateEvent {
    Order(OrderEvent),
    Fill(FillEvent),
    Position(PositionEvent),
}

/// Private session connectivity, published through a watch channel so the
/// risk layer can time the reconnect grace window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Disconnected,
}

/// Capability interface over one exchange venue. Implementations own all
/// transport concerns (signing, framing, venue JSON, retry with bounded
/// backoff); the engine holds immutable requests and typed responses and
/// keeps no transport state.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Subscribe to depth snapshots for both legs of `symbol`. The gateway
    /// selects the primary channel and transparently falls back to the
    /// single-level channel, tagging each update accordingly.
    async fn subscribe_public_books(&self, symbol: &str)
        -> GatewayResult<mpsc::Receiver<DepthUpdate>>;

    /// Subscribe to private order/fill/position events, with a connection
    /// state signal for the reconnect grace window.
    async fn subscribe_private(
        &self,
        symbol: &str,
    ) -> GatewayResult<(mpsc::Receiver<PrivateEvent>, watch::Receiver<ConnState>)>;

    async fn get_funding_rate(&self, symbol: &str) -> GatewayResult<FundingState>;

    async fn load_constraints(&self, symbol: &str, leg: Leg)
        -> GatewayResult<InstrumentConstraints>;

    async fn get_position_mode(&self) -> GatewayResult<String>;

    async fn set_position_mode(&self, mode: &str) -> GatewayResult<()>;

    async fn place_order(&self, req: &OrderRequest) -> GatewayResult<OrderAck>;

    async fn cancel_order(&self, req: &CancelRequest) -> GatewayResult<CancelOutcome>;

    /// Open orders on one leg, used at startup to cancel leftovers carrying
    /// our deterministic client-id prefix.
    async fn open_orders(&self, symbol: &str, leg: Leg) -> GatewayResult<Vec<OpenOrder>>;

    /// Signed perpetual base position, used to seed inventory at startup.
    async fn position_snapshot(&self, symbol: &str) -> GatewayResult<f64>;
}

#[derive(Clone, Debug)]
pub struct OpenOrder {
    pub leg: Leg,
    pub client_id: String,
    pub exch_order_id: String,
}
