#![allow(clippy::too_many_arguments)]

pub mod clock;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod errors;
pub mod funding;
pub mod gateway;
pub mod jsonl;
pub mod marketdata;
pub mod sim;
pub mod types;

pub use config::EngineConfig;
pub use constraints::{ConstraintsStore, InstrumentConstraints};
pub use engine::{
    guards::{GuardAction, GuardConfig, GuardInputs, ModeMachine, RiskGuards},
    inventory::Inventory,
    oms::{HedgeStatus, HedgeTicket, Oms, OrderRecord, OrderStatus},
    orchestrator::Engine,
    strategy::{build_quote_plan, Quote, QuotePlan},
};
pub use errors::{EngineError, GatewayError, GatewayResult};
pub use gateway::{
    BookChannel, CancelOutcome, CancelRequest, ConnState, DepthUpdate, ExchangeGateway, FillEvent,
    OpenOrder, OrderAck, OrderEvent, OrderEventStatus, OrderRequest, PositionEvent, PrivateEvent,
};
pub use jsonl::{EventLog, EventRecord, EventSink, JsonlSink, MemorySink};
pub use marketdata::{BookState, MarketSnapshot};
pub use sim::SimGateway;
pub use types::{
    Bbo, BookLevel, FundingState, Intent, Leg, Mode, NormalizedFill, OrderLeg, OrderType, Side,
    Tif,
};
