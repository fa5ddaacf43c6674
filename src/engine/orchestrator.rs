//! Supervisor for the trading loop. One task owns all domain state; market
//! data, funding and private events reach it over channels, so every state
//! mutation happens in a single logical thread.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::{
    select,
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{
    clock,
    config::EngineConfig,
    constraints::ConstraintsStore,
    engine::{
        guards::{GuardAction, GuardConfig, GuardInputs, ModeMachine, RiskGuards},
        oms::Oms,
        strategy::{build_quote_plan, QuotePlan},
    },
    errors::EngineError,
    funding::spawn_funding_monitor,
    gateway::{ConnState, ExchangeGateway, FillEvent, PrivateEvent},
    jsonl::{EventLog, EventRecord},
    marketdata::{spawn_normalizer, MarketSnapshot},
    types::{FundingState, Leg, Mode, Side},
};

/// Result of one strategy tick, used by the outer loop to decide whether to
/// keep running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    Halt,
}

pub struct Engine {
    cfg: EngineConfig,
    gateway: Arc<dyn ExchangeGateway>,
    log: EventLog,
}

impl Engine {
    pub fn new(cfg: EngineConfig, gateway: Arc<dyn ExchangeGateway>, log: EventLog) -> Self {
        Self { cfg, gateway, log }
    }

    /// Startup sequence, then the supervised event loop. Every startup
    /// failure is fail-closed: no order has been sent yet and the process
    /// exits non-zero.
    pub async fn run(self) -> Result<()> {
        let now = clock::now_ms();

        let mut constraints = ConstraintsStore::default();
        for leg in [Leg::Spot, Leg::Perp] {
            let loaded = self
                .gateway
                .load_constraints(&self.cfg.symbol, leg)
                .await
                .with_context(|| format!("loading {} constraints", leg.as_str()))?;
            constraints.set(leg, loaded);
        }
        if !constraints.ready() {
            return Err(EngineError::ConstraintsMissing("spot/perp").into());
        }
        self.log.log_at(
            now,
            EventRecord::new("constraints_loaded")
                .source("startup")
                .mode(Mode::Idle)
                .data(json!({
                    "spot": constraints.get(Leg::Spot).map(|c| json!({
                        "price_tick": c.price_tick,
                        "size_step": c.size_step,
                        "min_size": c.min_size,
                        "min_notional": c.min_notional,
                    })),
                    "perp": constraints.get(Leg::Perp).map(|c| json!({
                        "price_tick": c.price_tick,
                        "size_step": c.size_step,
                        "min_size": c.min_size,
                        "min_notional": c.min_notional,
                    })),
                })),
        );

        self.check_position_mode(now).await?;

        let book_rx = self
            .gateway
            .subscribe_public_books(&self.cfg.symbol)
            .await
            .context("subscribing public books")?;
        let (private_rx, conn_rx) = self
            .gateway
            .subscribe_private(&self.cfg.symbol)
            .await
            .context("subscribing private stream")?;

        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let normalizer = spawn_normalizer(book_rx, snapshot_tx, self.cfg.obi_levels);
        let (funding_tx, funding_rx) = watch::channel(None);
        let funding = spawn_funding_monitor(
            self.gateway.clone(),
            self.cfg.symbol.clone(),
            Duration::from_secs_f64(self.cfg.funding_poll_sec),
            funding_tx,
            self.log.clone(),
        );

        let mut oms = Oms::new(
            self.cfg.clone(),
            self.gateway.clone(),
            constraints,
            self.log.clone(),
        );
        oms.startup_reconcile(clock::now_ms()).await;

        info!(symbol = %self.cfg.symbol, dry_run = self.cfg.dry_run, "engine started");
        let result = self
            .event_loop(oms, snapshot_rx, funding_rx, private_rx, conn_rx)
            .await;

        normalizer.abort();
        funding.abort();
        result
    }

    async fn check_position_mode(&self, now: i64) -> Result<()> {
        let current = self
            .gateway
            .get_position_mode()
            .await
            .context("querying position mode")?;
        self.log.log_at(
            now,
            EventRecord::new("state")
                .source("startup")
                .mode(Mode::Idle)
                .reason("position_mode_check")
                .data(json!({
                    "current": current,
                    "expected": self.cfg.expected_position_mode,
                })),
        );
        if current == self.cfg.expected_position_mode {
            return Ok(());
        }
        if self.cfg.auto_set_position_mode && !self.cfg.dry_run {
            self.gateway
                .set_position_mode(&self.cfg.expected_position_mode)
                .await
                .context("setting position mode")?;
            let rechecked = self
                .gateway
                .get_position_mode()
                .await
                .context("re-querying position mode")?;
            if rechecked == self.cfg.expected_position_mode {
                return Ok(());
            }
            return Err(EngineError::PositionModeMismatch {
                current: rechecked,
                expected: self.cfg.expected_position_mode.clone(),
            }
            .into());
        }
        Err(EngineError::PositionModeMismatch {
            current,
            expected: self.cfg.expected_position_mode.clone(),
        }
        .into())
    }

    async fn event_loop(
        &self,
        oms: Oms,
        snapshot_rx: watch::Receiver<Option<MarketSnapshot>>,
        funding_rx: watch::Receiver<Option<FundingState>>,
        mut private_rx: tokio::sync::mpsc::Receiver<PrivateEvent>,
        mut conn_rx: watch::Receiver<ConnState>,
    ) -> Result<()> {
        let mut state = LoopState::new(
            self.cfg.clone(),
            oms,
            snapshot_rx,
            funding_rx,
            self.log.clone(),
        );

        let mut ticker = interval(Duration::from_secs_f64(self.cfg.tick_sec));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = ticker.tick() => {
                    if state.on_tick(clock::now_ms()).await == TickOutcome::Halt {
                        break;
                    }
                }
                event = private_rx.recv() => {
                    match event {
                        Some(event) => {
                            if state.on_private(event, clock::now_ms()).await == TickOutcome::Halt {
                                break;
                            }
                        }
                        None => {
                            // A dead private stream is a terminal child
                            // failure: fail closed.
                            warn!("private stream terminated");
                            state.halt("private_stream_closed", clock::now_ms()).await;
                            break;
                        }
                    }
                }
                changed = conn_rx.changed() => {
                    if changed.is_err() {
                        warn!("connection state channel dropped");
                        state.halt("gateway_gone", clock::now_ms()).await;
                        break;
                    }
                    let conn = *conn_rx.borrow();
                    state.on_conn_state(conn, clock::now_ms()).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    state.shutdown(clock::now_ms()).await;
                    return Ok(());
                }
            }
        }

        if state.modes.is_halted() {
            Err(EngineError::Halted(state.halt_reason.unwrap_or_else(|| "halted".into())).into())
        } else {
            Ok(())
        }
    }
}

/// All mutable loop state, separated from the select loop so ticks can be
/// driven directly in tests.
struct LoopState {
    cfg: EngineConfig,
    oms: Oms,
    guards: RiskGuards,
    modes: ModeMachine,
    snapshot_rx: watch::Receiver<Option<MarketSnapshot>>,
    funding_rx: watch::Receiver<Option<FundingState>>,
    log: EventLog,
    /// Set on private disconnect; feeds the reconnect grace guard.
    private_down_since_ms: Option<i64>,
    /// After a controlled reconnect, quoting resumes only once both legs
    /// produced a snapshot fresher than this floor.
    resume_floor_ms: Option<i64>,
    halt_reason: Option<String>,
    last_sim_ms: i64,
    sim_side: Side,
}

impl LoopState {
    fn new(
        cfg: EngineConfig,
        oms: Oms,
        snapshot_rx: watch::Receiver<Option<MarketSnapshot>>,
        funding_rx: watch::Receiver<Option<FundingState>>,
        log: EventLog,
    ) -> Self {
        let guards = RiskGuards::new(GuardConfig::from_engine(&cfg));
        Self {
            cfg,
            oms,
            guards,
            modes: ModeMachine::new(),
            snapshot_rx,
            funding_rx,
            log,
            private_down_since_ms: None,
            resume_floor_ms: None,
            halt_reason: None,
            last_sim_ms: 0,
            sim_side: Side::Buy,
        }
    }

    fn set_mode(&mut self, to: Mode, reason: &str, now_ms: i64) {
        if let Some((from, to)) = self.modes.transition(to) {
            self.oms.set_mode(to);
            self.log.log_at(
                now_ms,
                EventRecord::new("mode_change")
                    .source("engine")
                    .mode(to)
                    .reason(reason.to_string())
                    .data(json!({ "from": from.as_str(), "to": to.as_str() })),
            );
        }
    }

    /// Current snapshot, filtered by the post-reconnect freshness floor.
    fn current_snapshot(&mut self) -> Option<MarketSnapshot> {
        let snapshot = self.snapshot_rx.borrow().clone()?;
        if let Some(floor) = self.resume_floor_ms {
            if snapshot.spot.ts_ms <= floor || snapshot.perp.ts_ms <= floor {
                return None;
            }
            self.resume_floor_ms = None;
        }
        Some(snapshot)
    }

    async fn on_tick(&mut self, now_ms: i64) -> TickOutcome {
        if self.modes.is_halted() {
            return TickOutcome::Halt;
        }
        let snapshot = self.current_snapshot();
        let funding = *self.funding_rx.borrow();
        let spot_bbo = snapshot.as_ref().map(|s| s.spot);

        let mid = snapshot.as_ref().map(|s| s.spot_mid()).unwrap_or(0.0);
        let inputs = GuardInputs {
            now_ms,
            snapshot_ts: snapshot.as_ref().map(|s| s.ts_ms),
            funding_ts: funding.map(|f| f.ts_ms),
            constraints_ready: self.oms.constraints.ready(),
            unhedged_notional: self.oms.inventory().unhedged_notional(mid),
            oldest_ticket_age_ms: self.oms.oldest_ticket_age_ms(now_ms),
            reject_streak: self.oms.reject_streak(),
            private_down_since_ms: self.private_down_since_ms,
        };

        match self.guards.evaluate(&inputs) {
            GuardAction::Halt(reason) => {
                self.halt(reason, now_ms).await;
                return TickOutcome::Halt;
            }
            GuardAction::CancelAll { reason, unwind } => {
                self.oms.cancel_all_quotes(reason, "risk", now_ms).await;
                self.log.log_at(
                    now_ms,
                    EventRecord::new("risk")
                        .source("risk")
                        .mode(self.modes.mode())
                        .reason(reason)
                        .data(json!({ "unhedged_notional": inputs.unhedged_notional })),
                );
                if unwind {
                    self.oms.unwind_oldest_ticket(reason, now_ms).await;
                }
                self.guards.set_cooldown(now_ms);
                self.set_mode(Mode::Cooldown, reason, now_ms);
            }
            GuardAction::Block(reason) => {
                let plan = QuotePlan::none(reason);
                if let Some(snapshot) = snapshot.as_ref() {
                    self.oms.apply_plan(&plan, snapshot, now_ms).await;
                } else {
                    self.oms.cancel_all_quotes(reason, "risk", now_ms).await;
                }
                let mode = if reason == "cooldown" { Mode::Cooldown } else { Mode::Idle };
                self.set_mode(mode, reason, now_ms);
            }
            GuardAction::Pass => {
                // Guards hold; this tick may quote.
                let snapshot = snapshot.as_ref().expect("guard pass implies snapshot");
                let funding = funding.expect("guard pass implies funding");
                let perp = *self
                    .oms
                    .constraints
                    .get(Leg::Perp)
                    .expect("guard pass implies constraints");
                let plan = build_quote_plan(
                    &self.cfg,
                    &perp,
                    snapshot,
                    &funding,
                    self.oms.inventory().net(),
                    None,
                );
                self.oms.apply_plan(&plan, snapshot, now_ms).await;
                let mode = if self.oms.has_open_tickets() {
                    Mode::Hedging
                } else if plan.is_empty() {
                    Mode::Idle
                } else {
                    Mode::Quoting
                };
                self.set_mode(mode, plan.reason, now_ms);
                self.log_tick(snapshot, &funding, now_ms);
            }
        }

        self.oms.service(spot_bbo.as_ref(), now_ms).await;
        if self.cfg.simulate_fills {
            self.maybe_simulate_fill(now_ms).await;
        }
        if let Some(reason) = self.oms.take_halt_reason() {
            self.halt_owned(reason, now_ms).await;
            return TickOutcome::Halt;
        }
        TickOutcome::Continue
    }

    async fn on_private(&mut self, event: PrivateEvent, now_ms: i64) -> TickOutcome {
        let spot_bbo = self.snapshot_rx.borrow().clone().map(|s| s.spot);
        self.oms.handle_private(event, spot_bbo.as_ref(), now_ms).await;
        if let Some(reason) = self.oms.take_halt_reason() {
            self.halt_owned(reason, now_ms).await;
            return TickOutcome::Halt;
        }
        TickOutcome::Continue
    }

    async fn on_conn_state(&mut self, conn: ConnState, now_ms: i64) {
        match conn {
            ConnState::Disconnected => {
                if self.private_down_since_ms.is_none() {
                    self.private_down_since_ms = Some(now_ms);
                    self.log.log_at(
                        now_ms,
                        EventRecord::new("risk")
                            .source("engine")
                            .mode(self.modes.mode())
                            .reason("private_disconnected"),
                    );
                }
            }
            ConnState::Connected => {
                if self.private_down_since_ms.take().is_some() {
                    // Controlled reconnect: drop all quotes and wait for
                    // fresh snapshots on both legs before quoting again.
                    self.oms
                        .cancel_all_quotes("controlled_reconnect", "risk", now_ms)
                        .await;
                    self.resume_floor_ms = Some(now_ms);
                    self.log.log_at(
                        now_ms,
                        EventRecord::new("state")
                            .source("engine")
                            .mode(self.modes.mode())
                            .reason("controlled_reconnect"),
                    );
                }
            }
        }
    }

    async fn halt(&mut self, reason: &str, now_ms: i64) {
        self.halt_owned(reason.to_string(), now_ms).await;
    }

    async fn halt_owned(&mut self, reason: String, now_ms: i64) {
        self.oms.cancel_all_quotes(&reason, "risk", now_ms).await;
        self.log.log_at(
            now_ms,
            EventRecord::new("risk")
                .source("risk")
                .mode(Mode::Halted)
                .reason(reason.clone()),
        );
        self.set_mode(Mode::Halted, &reason, now_ms);
        self.halt_reason = Some(reason);
    }

    async fn shutdown(&mut self, now_ms: i64) {
        self.oms.cancel_all_quotes("shutdown", "signal", now_ms).await;
        self.log.log_at(
            now_ms,
            EventRecord::new("state")
                .source("signal")
                .mode(self.modes.mode())
                .reason("shutdown"),
        );
    }

    fn log_tick(&self, snapshot: &MarketSnapshot, funding: &FundingState, now_ms: i64) {
        self.log.log_at(
            now_ms,
            EventRecord::new("tick")
                .source("strategy")
                .mode(self.modes.mode())
                .cycle_id(self.oms.cycle())
                .data(json!({
                    "funding": funding.rate,
                    "obi": snapshot.obi,
                    "levels_used": snapshot.levels_used,
                    "fallback": snapshot.fallback,
                    "perp_bid": snapshot.perp.bid,
                    "perp_ask": snapshot.perp.ask,
                    "spot_bid": snapshot.spot.bid,
                    "spot_ask": snapshot.spot.ask,
                    "perp_pos": self.oms.inventory().perp_pos,
                    "spot_pos": self.oms.inventory().spot_pos,
                    "unhedged_notional": self.oms.inventory().unhedged_notional(snapshot.spot_mid()),
                })),
        );
    }

    /// Synthesizes a perpetual fill against our live quote to exercise the
    /// hedge path without venue state. Events carry `simulated=true` and go
    /// through the identical dedupe and hedge code.
    async fn maybe_simulate_fill(&mut self, now_ms: i64) {
        let interval_ms = (self.cfg.simulate_fill_interval_sec * 1000.0) as i64;
        if now_ms - self.last_sim_ms < interval_ms {
            return;
        }
        let side = match self.cfg.simulate_fill_side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            _ => {
                let side = self.sim_side;
                self.sim_side = side.opposite();
                side
            }
        };
        let Some(quote) = self.oms.live_quote(side).cloned() else {
            return;
        };
        let Some(price) = quote.price else { return };
        self.last_sim_ms = now_ms;
        let qty = self.cfg.simulate_qty().min(quote.size);
        let fill = PrivateEvent::Fill(FillEvent {
            leg: Leg::Perp,
            side,
            price,
            qty,
            client_id: Some(quote.client_id.clone()),
            exch_order_id: format!("SIM{now_ms}"),
            trade_id: Some(format!("SIM{now_ms}{}", side.as_str())),
            fee: 0.0,
            ts_ms: now_ms,
            simulated: true,
        });
        let spot_bbo = self.snapshot_rx.borrow().clone().map(|s| s.spot);
        self.oms.handle_private(fill, spot_bbo.as_ref(), now_ms).await;
    }
}
