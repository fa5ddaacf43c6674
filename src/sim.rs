//! Synthetic venue for dry-run operation: a random-walk book on both legs,
//! immediate acknowledgements, and no real executions. Lets the full engine
//! run end-to-end without exchange connectivity.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::{
    clock,
    constraints::InstrumentConstraints,
    errors::GatewayResult,
    gateway::{
        BookChannel, CancelOutcome, CancelRequest, ConnState, DepthUpdate, ExchangeGateway,
        OpenOrder, OrderAck, OrderRequest, PrivateEvent,
    },
    types::{BookLevel, FundingState, Leg},
};

const BOOK_INTERVAL_MS: u64 = 100;
const BOOK_LEVELS: usize = 5;

pub struct SimGateway {
    start_price: f64,
    funding_rate: f64,
    position_mode: String,
    next_order_id: AtomicU64,
}

impl SimGateway {
    pub fn new(start_price: f64, funding_rate: f64, position_mode: impl Into<String>) -> Self {
        Self {
            start_price,
            funding_rate,
            position_mode: position_mode.into(),
            next_order_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ExchangeGateway for SimGateway {
    async fn subscribe_public_books(
        &self,
        _symbol: &str,
    ) -> GatewayResult<mpsc::Receiver<DepthUpdate>> {
        let (tx, rx) = mpsc::channel(256);
        let start = self.start_price;
        tokio::spawn(async move {
            let mut rng = rand::rngs::StdRng::from_entropy();
            let mut mid = start;
            loop {
                mid *= 1.0 + rng.gen_range(-3e-5..3e-5);
                let ts_ms = clock::now_ms();
                for (leg, half_spread) in [(Leg::Perp, mid * 1e-4), (Leg::Spot, mid * 1.2e-4)] {
                    let update = DepthUpdate {
                        leg,
                        channel: BookChannel::Depth5,
                        bids: ladder(mid - half_spread, -0.01 * mid * 1e-2, &mut rng),
                        asks: ladder(mid + half_spread, 0.01 * mid * 1e-2, &mut rng),
                        ts_ms,
                    };
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(BOOK_INTERVAL_MS)).await;
            }
        });
        Ok(rx)
    }

    async fn subscribe_private(
        &self,
        _symbol: &str,
    ) -> GatewayResult<(mpsc::Receiver<PrivateEvent>, watch::Receiver<ConnState>)> {
        let (tx, rx) = mpsc::channel(64);
        let (_state_tx, state_rx) = watch::channel(ConnState::Connected);
        // Hold the senders open for the process lifetime; the simulated
        // venue emits no private events of its own.
        tokio::spawn(async move {
            let _tx = tx;
            let _state_tx = _state_tx;
            std::future::pending::<()>().await;
        });
        Ok((rx, state_rx))
    }

    async fn get_funding_rate(&self, _symbol: &str) -> GatewayResult<FundingState> {
        Ok(FundingState {
            rate: self.funding_rate,
            ts_ms: clock::now_ms(),
            next_settle_ms: None,
        })
    }

    async fn load_constraints(
        &self,
        _symbol: &str,
        _leg: Leg,
    ) -> GatewayResult<InstrumentConstraints> {
        Ok(InstrumentConstraints {
            price_tick: 0.01,
            size_step: 0.0001,
            min_size: 0.0001,
            min_notional: 1.0,
        })
    }

    async fn get_position_mode(&self) -> GatewayResult<String> {
        Ok(self.position_mode.clone())
    }

    async fn set_position_mode(&self, _mode: &str) -> GatewayResult<()> {
        Ok(())
    }

    async fn place_order(&self, _req: &OrderRequest) -> GatewayResult<OrderAck> {
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            exch_order_id: format!("SIM-{id}"),
            accepted_ts_ms: clock::now_ms(),
            raw: json!({ "code": "00000", "sim": true }),
        })
    }

    async fn cancel_order(&self, _req: &CancelRequest) -> GatewayResult<CancelOutcome> {
        Ok(CancelOutcome::Canceled)
    }

    async fn open_orders(&self, _symbol: &str, _leg: Leg) -> GatewayResult<Vec<OpenOrder>> {
        Ok(Vec::new())
    }

    async fn position_snapshot(&self, _symbol: &str) -> GatewayResult<f64> {
        Ok(0.0)
    }
}

fn ladder(touch: f64, step: f64, rng: &mut rand::rngs::StdRng) -> Vec<BookLevel> {
    (0..BOOK_LEVELS)
        .map(|i| BookLevel {
            price: touch + step * i as f64,
            size: rng.gen_range(0.5..8.0),
        })
        .collect()
}
