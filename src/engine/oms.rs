//! Order management: translates quote plans into venue operations, keeps the
//! order registry and id maps, normalizes and deduplicates fills, and runs
//! the hedge-ticket protocol that keeps net exposure pinned near zero.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use serde_json::json;

use crate::{
    config::EngineConfig,
    constraints::ConstraintsStore,
    engine::inventory::Inventory,
    engine::strategy::{Quote, QuotePlan},
    gateway::{
        CancelOutcome, CancelRequest, ExchangeGateway, FillEvent, OrderEventStatus, OrderRequest,
        PrivateEvent,
    },
    jsonl::{EventLog, EventRecord},
    marketdata::MarketSnapshot,
    types::{
        client_id_intent, new_client_id, Bbo, Intent, Leg, Mode, NormalizedFill, OrderLeg,
        OrderType, Side, Tif,
    },
};

const DEDUPE_CAPACITY: usize = 10_000;
const PENDING_FILL_CAPACITY: usize = 64;
const PENDING_FILL_TIMEOUT_MS: i64 = 2_000;
const ORDER_RETENTION: usize = 4_096;

/// Order lifecycle: `PendingNew → Live → (Partial → Filled | Canceled |
/// Rejected)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderStatus {
    PendingNew,
    Live,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }
}

/// One order as the OMS knows it. Owned exclusively by the OMS.
#[derive(Clone, Debug)]
pub struct OrderRecord {
    pub client_id: String,
    pub order_leg: OrderLeg,
    pub intent: Intent,
    pub side: Side,
    pub symbol: String,
    pub price: Option<f64>,
    pub size: f64,
    pub filled: f64,
    pub status: OrderStatus,
    pub exch_order_id: Option<String>,
    pub created_ts_ms: i64,
    pub last_update_ts_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HedgeStatus {
    Open,
    Chasing,
    Done,
    Unwind,
}

impl HedgeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HedgeStatus::Open => "OPEN",
            HedgeStatus::Chasing => "CHASING",
            HedgeStatus::Done => "DONE",
            HedgeStatus::Unwind => "UNWIND",
        }
    }
}

/// Tracks one perpetual fill until the offsetting spot quantity (or the
/// perpetual unwind) has executed. `want_qty == filled_qty + remain()` at
/// all times.
#[derive(Clone, Debug)]
pub struct HedgeTicket {
    pub hedge_id: String,
    pub side: Side,
    pub want_qty: f64,
    pub filled_qty: f64,
    pub deadline_ts_ms: i64,
    pub tries: u32,
    pub status: HedgeStatus,
    pub created_ts_ms: i64,
    /// Last IOC send or fill; paces the chase.
    pub last_action_ms: i64,
}

impl HedgeTicket {
    pub fn remain(&self) -> f64 {
        (self.want_qty - self.filled_qty).max(0.0)
    }
}

/// Bounded replay-suppression set. Oldest keys fall out first once the
/// capacity is reached, which covers reconnect replay windows by a wide
/// margin.
#[derive(Debug, Default)]
struct DedupeSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupeSet {
    /// Returns false when the key was already present.
    fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= DEDUPE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

#[derive(Clone, Debug)]
struct PendingFill {
    fill: FillEvent,
    received_ms: i64,
}

pub struct Oms {
    cfg: EngineConfig,
    gateway: Arc<dyn ExchangeGateway>,
    log: EventLog,
    pub constraints: ConstraintsStore,
    inventory: Inventory,
    orders: HashMap<String, OrderRecord>,
    by_exch: HashMap<String, String>,
    live_bid: Option<String>,
    live_ask: Option<String>,
    dedupe: DedupeSet,
    tickets: HashMap<String, HedgeTicket>,
    ticket_by_client: HashMap<String, String>,
    ticket_by_exch: HashMap<String, String>,
    pending_fills: Vec<PendingFill>,
    closing: HashSet<Leg>,
    reject_streak: u32,
    halt_reason: Option<String>,
    cycle: u64,
    unhedged_since_ms: Option<i64>,
    mode: Mode,
}

impl Oms {
    pub fn new(
        cfg: EngineConfig,
        gateway: Arc<dyn ExchangeGateway>,
        constraints: ConstraintsStore,
        log: EventLog,
    ) -> Self {
        Self {
            cfg,
            gateway,
            log,
            constraints,
            inventory: Inventory::new(),
            orders: HashMap::new(),
            by_exch: HashMap::new(),
            live_bid: None,
            live_ask: None,
            dedupe: DedupeSet::default(),
            tickets: HashMap::new(),
            ticket_by_client: HashMap::new(),
            ticket_by_exch: HashMap::new(),
            pending_fills: Vec::new(),
            closing: HashSet::new(),
            reject_streak: 0,
            halt_reason: None,
            cycle: 0,
            unhedged_since_ms: None,
            mode: Mode::Idle,
        }
    }

    pub fn inventory(&self) -> Inventory {
        self.inventory
    }

    pub fn reject_streak(&self) -> u32 {
        self.reject_streak
    }

    /// Set when a structural reject or registry inconsistency demands a
    /// fail-closed halt; the orchestrator polls this after every event.
    pub fn take_halt_reason(&mut self) -> Option<String> {
        self.halt_reason.take()
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn has_open_tickets(&self) -> bool {
        self.tickets
            .values()
            .any(|t| matches!(t.status, HedgeStatus::Open | HedgeStatus::Chasing | HedgeStatus::Unwind))
    }

    pub fn oldest_ticket_age_ms(&self, now_ms: i64) -> Option<i64> {
        self.tickets
            .values()
            .filter(|t| !matches!(t.status, HedgeStatus::Done))
            .map(|t| now_ms - t.created_ts_ms)
            .max()
    }

    pub fn unhedged_since_ms(&self) -> Option<i64> {
        self.unhedged_since_ms
    }

    pub fn live_quote(&self, side: Side) -> Option<&OrderRecord> {
        let slot = match side {
            Side::Buy => self.live_bid.as_ref(),
            Side::Sell => self.live_ask.as_ref(),
        };
        slot.and_then(|id| self.orders.get(id))
    }

    #[cfg(test)]
    pub fn ticket(&self, hedge_id: &str) -> Option<&HedgeTicket> {
        self.tickets.get(hedge_id)
    }

    #[cfg(test)]
    pub fn tickets(&self) -> impl Iterator<Item = &HedgeTicket> {
        self.tickets.values()
    }

    // ---- quote reconciliation ----

    /// Reconciles the live quotes against the plan for this cycle. At most
    /// one live order per side; replacement is cancel-then-place, and the
    /// cancel must succeed before the new order goes out.
    pub async fn apply_plan(&mut self, plan: &QuotePlan, snapshot: &MarketSnapshot, now_ms: i64) {
        self.cycle += 1;
        let mid = snapshot.perp_mid();
        self.reconcile_side(Side::Buy, plan.bid, plan.reason, mid, now_ms)
            .await;
        self.reconcile_side(Side::Sell, plan.ask, plan.reason, mid, now_ms)
            .await;
    }

    async fn reconcile_side(
        &mut self,
        side: Side,
        desired: Option<Quote>,
        reason: &'static str,
        mid: f64,
        now_ms: i64,
    ) {
        let live = self.live_quote(side).cloned();
        match (desired, live) {
            (None, None) => {}
            (None, Some(_)) => {
                self.cancel_quote(side, reason, "strategy", now_ms).await;
            }
            (Some(quote), None) => {
                self.place_quote(side, quote, reason, now_ms).await;
            }
            (Some(quote), Some(live)) => {
                if !self.needs_replace(&live, &quote, mid) {
                    return;
                }
                let outcome = self.cancel_quote(side, "replace", "strategy", now_ms).await;
                if outcome == Some(CancelOutcome::AlreadyFilled) {
                    // The resting order executed while we tried to pull it;
                    // the fill is on its way, do not re-post this cycle.
                    return;
                }
                self.place_quote(side, quote, reason, now_ms).await;
            }
        }
    }

    fn needs_replace(&self, live: &OrderRecord, desired: &Quote, mid: f64) -> bool {
        let threshold = self.cfg.replace_threshold_bps * 1e-4 * mid;
        let price_moved = live
            .price
            .map(|p| (p - desired.price).abs() >= threshold)
            .unwrap_or(true);
        let size_step = self
            .constraints
            .get(Leg::Perp)
            .map(|c| c.size_step)
            .unwrap_or(0.0);
        let size_changed = (live.size - desired.size).abs() > size_step * 0.5;
        price_moved || size_changed
    }

    async fn place_quote(&mut self, side: Side, quote: Quote, reason: &'static str, now_ms: i64) {
        let order_leg = match side {
            Side::Buy => OrderLeg::PerpBid,
            Side::Sell => OrderLeg::PerpAsk,
        };
        let client_id = new_client_id(Intent::Quote, order_leg, self.cycle);
        let req = OrderRequest {
            leg: Leg::Perp,
            symbol: self.cfg.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            tif: Tif::PostOnly,
            price: Some(quote.price),
            size: quote.size,
            client_id: client_id.clone(),
            reduce_only: false,
        };
        if self
            .submit(req, Intent::Quote, order_leg, reason, now_ms)
            .await
            .is_some()
        {
            match side {
                Side::Buy => self.live_bid = Some(client_id),
                Side::Sell => self.live_ask = Some(client_id),
            }
        }
    }

    /// Cancels the live quote on `side`, if any. Returns the cancel outcome
    /// when a cancel was actually issued.
    pub async fn cancel_quote(
        &mut self,
        side: Side,
        reason: &str,
        source: &'static str,
        now_ms: i64,
    ) -> Option<CancelOutcome> {
        let client_id = match side {
            Side::Buy => self.live_bid.take(),
            Side::Sell => self.live_ask.take(),
        }?;
        let record = self.orders.get(&client_id)?.clone();
        let order_leg = record.order_leg;

        self.log.log_at(
            now_ms,
            EventRecord::new("order_cancel")
                .intent(Intent::Quote)
                .source(source)
                .mode(self.mode)
                .reason(reason.to_string())
                .leg(order_leg)
                .cycle_id(self.cycle)
                .client_id(client_id.clone())
                .maybe_exch_order_id(record.exch_order_id.clone())
                .data(json!({ "price": record.price, "size": record.size })),
        );

        if self.cfg.dry_run {
            self.finish_order(&client_id, OrderStatus::Canceled, now_ms);
            return Some(CancelOutcome::Canceled);
        }

        let req = CancelRequest {
            leg: Leg::Perp,
            symbol: self.cfg.symbol.clone(),
            client_id: client_id.clone(),
            exch_order_id: record.exch_order_id.clone(),
        };
        match self.gateway.cancel_order(&req).await {
            Ok(CancelOutcome::Canceled) => {
                self.finish_order(&client_id, OrderStatus::Canceled, now_ms);
                Some(CancelOutcome::Canceled)
            }
            Ok(CancelOutcome::AlreadyFilled) => {
                self.log.log_at(
                    now_ms,
                    EventRecord::new("order_skip")
                        .intent(Intent::Quote)
                        .source(source)
                        .mode(self.mode)
                        .reason("cancel_already_filled")
                        .leg(order_leg)
                        .cycle_id(self.cycle)
                        .client_id(client_id),
                );
                Some(CancelOutcome::AlreadyFilled)
            }
            Err(err) => {
                // Outcome unknown: report it and leave the record live so a
                // later sweep (guard cancel-all, startup reconcile) retires
                // it; the slot is already free.
                self.log.log_at(
                    now_ms,
                    EventRecord::new("risk")
                        .intent(Intent::Quote)
                        .source("oms")
                        .mode(self.mode)
                        .reason("cancel_state_unknown")
                        .leg(order_leg)
                        .cycle_id(self.cycle)
                        .client_id(client_id)
                        .data(json!({ "error": err.to_string() })),
                );
                Some(CancelOutcome::Canceled)
            }
        }
    }

    pub async fn cancel_all_quotes(&mut self, reason: &str, source: &'static str, now_ms: i64) {
        self.cancel_quote(Side::Buy, reason, source, now_ms).await;
        self.cancel_quote(Side::Sell, reason, source, now_ms).await;
    }

    /// Places one order: validates against constraints, logs, and in
    /// dry-run mode stops short of the gateway. Returns the acknowledged
    /// exchange id (dry-run orders return an empty marker).
    async fn submit(
        &mut self,
        req: OrderRequest,
        intent: Intent,
        order_leg: OrderLeg,
        reason: &str,
        now_ms: i64,
    ) -> Option<String> {
        let constraints = match self.constraints.get(req.leg) {
            Some(c) if c.is_ready() => *c,
            _ => {
                self.log.log_at(
                    now_ms,
                    EventRecord::new("order_skip")
                        .intent(intent)
                        .source("oms")
                        .mode(self.mode)
                        .reason("constraints_missing")
                        .leg(order_leg)
                        .cycle_id(self.cycle)
                        .client_id(req.client_id),
                );
                return None;
            }
        };
        if let Some(price) = req.price {
            if !constraints.validate(price, req.size) {
                self.log.log_at(
                    now_ms,
                    EventRecord::new("order_skip")
                        .intent(intent)
                        .source("oms")
                        .mode(self.mode)
                        .reason("below_min_constraints")
                        .leg(order_leg)
                        .cycle_id(self.cycle)
                        .client_id(req.client_id)
                        .data(json!({ "price": price, "size": req.size })),
                );
                return None;
            }
        }

        let record = OrderRecord {
            client_id: req.client_id.clone(),
            order_leg,
            intent,
            side: req.side,
            symbol: req.symbol.clone(),
            price: req.price,
            size: req.size,
            filled: 0.0,
            status: OrderStatus::PendingNew,
            exch_order_id: None,
            created_ts_ms: now_ms,
            last_update_ts_ms: now_ms,
        };
        self.orders.insert(req.client_id.clone(), record);

        let data = json!({
            "symbol": req.symbol,
            "side": req.side.as_str(),
            "type": req.order_type.as_str(),
            "tif": req.tif.as_str(),
            "price": req.price,
            "size": req.size,
            "reduce_only": req.reduce_only,
            "dry_run": self.cfg.dry_run,
        });

        if self.cfg.dry_run {
            self.log.log_at(
                now_ms,
                EventRecord::new("order_new")
                    .intent(intent)
                    .source("oms")
                    .mode(self.mode)
                    .reason(reason.to_string())
                    .leg(order_leg)
                    .cycle_id(self.cycle)
                    .client_id(req.client_id.clone())
                    .data(data),
            );
            if let Some(order) = self.orders.get_mut(&req.client_id) {
                order.status = OrderStatus::Live;
            }
            return Some(String::new());
        }

        match self.gateway.place_order(&req).await {
            Ok(ack) => {
                self.by_exch
                    .insert(ack.exch_order_id.clone(), req.client_id.clone());
                if let Some(order) = self.orders.get_mut(&req.client_id) {
                    order.status = OrderStatus::Live;
                    order.exch_order_id = Some(ack.exch_order_id.clone());
                    order.last_update_ts_ms = now_ms;
                }
                self.reject_streak = 0;
                self.log.log_at(
                    now_ms,
                    EventRecord::new("order_new")
                        .intent(intent)
                        .source("oms")
                        .mode(self.mode)
                        .reason(reason.to_string())
                        .leg(order_leg)
                        .cycle_id(self.cycle)
                        .client_id(req.client_id.clone())
                        .exch_order_id(ack.exch_order_id.clone())
                        .data(data)
                        .res(ack.raw.clone()),
                );
                self.flush_pending_fills(now_ms);
                Some(ack.exch_order_id)
            }
            Err(err) => {
                self.handle_place_error(&req, intent, order_leg, err, now_ms)
                    .await;
                None
            }
        }
    }

    async fn handle_place_error(
        &mut self,
        req: &OrderRequest,
        intent: Intent,
        order_leg: OrderLeg,
        err: crate::errors::GatewayError,
        now_ms: i64,
    ) {
        if err.is_state_unknown() {
            // The order may or may not rest on the venue; issue a
            // reconciliation cancel by client id so the outcome converges
            // to "gone or filled".
            self.log.log_at(
                now_ms,
                EventRecord::new("risk")
                    .intent(intent)
                    .source("oms")
                    .mode(self.mode)
                    .reason("order_state_unknown")
                    .leg(order_leg)
                    .cycle_id(self.cycle)
                    .client_id(req.client_id.clone())
                    .data(json!({ "error": err.to_string() })),
            );
            let cancel = CancelRequest {
                leg: req.leg,
                symbol: req.symbol.clone(),
                client_id: req.client_id.clone(),
                exch_order_id: None,
            };
            let _ = self.gateway.cancel_order(&cancel).await;
            self.finish_order(&req.client_id, OrderStatus::Canceled, now_ms);
            return;
        }

        let structural = err.is_structural_reject();
        self.finish_order(&req.client_id, OrderStatus::Rejected, now_ms);
        self.reject_streak = self.reject_streak.saturating_add(1);
        self.log.log_at(
            now_ms,
            EventRecord::new("order_skip")
                .intent(intent)
                .source("oms")
                .mode(self.mode)
                .reason("order_reject")
                .leg(order_leg)
                .cycle_id(self.cycle)
                .client_id(req.client_id.clone())
                .data(json!({
                    "error": err.to_string(),
                    "structural": structural,
                    "reject_streak": self.reject_streak,
                })),
        );
        if structural {
            self.halt_reason = Some(format!("structural reject: {err}"));
        }
    }

    fn finish_order(&mut self, client_id: &str, status: OrderStatus, now_ms: i64) {
        if let Some(order) = self.orders.get_mut(client_id) {
            order.status = status;
            order.last_update_ts_ms = now_ms;
        }
    }

    // ---- private event handling ----

    pub async fn handle_private(
        &mut self,
        event: PrivateEvent,
        spot_bbo: Option<&Bbo>,
        now_ms: i64,
    ) {
        match event {
            PrivateEvent::Order(order) => self.handle_order_event(order, now_ms),
            PrivateEvent::Fill(fill) => self.handle_fill(fill, spot_bbo, now_ms).await,
            PrivateEvent::Position(position) => {
                tracing::debug!(
                    leg = position.leg.as_str(),
                    net = position.net,
                    "position push"
                );
            }
        }
    }

    fn handle_order_event(&mut self, event: crate::gateway::OrderEvent, now_ms: i64) {
        let client_id = event
            .client_id
            .clone()
            .or_else(|| self.by_exch.get(&event.exch_order_id).cloned());
        let Some(client_id) = client_id else {
            tracing::debug!(exch_order_id = %event.exch_order_id, "order event for unknown order");
            return;
        };
        if !event.exch_order_id.is_empty() {
            self.by_exch
                .insert(event.exch_order_id.clone(), client_id.clone());
            if let Some(order) = self.orders.get_mut(&client_id) {
                if order.exch_order_id.is_none() {
                    order.exch_order_id = Some(event.exch_order_id.clone());
                }
            }
        }
        match event.status {
            OrderEventStatus::Accepted => {
                if let Some(order) = self.orders.get_mut(&client_id) {
                    if order.status == OrderStatus::PendingNew {
                        order.status = OrderStatus::Live;
                        order.last_update_ts_ms = now_ms;
                    }
                }
                self.flush_pending_fills(now_ms);
            }
            OrderEventStatus::Canceled => {
                self.finish_order(&client_id, OrderStatus::Canceled, now_ms);
                self.clear_slot_if(&client_id);
                self.closing_cleanup_for(&client_id);
            }
            OrderEventStatus::Rejected { code, structural } => {
                self.finish_order(&client_id, OrderStatus::Rejected, now_ms);
                self.clear_slot_if(&client_id);
                self.closing_cleanup_for(&client_id);
                self.reject_streak = self.reject_streak.saturating_add(1);
                let intent = client_id_intent(&client_id).unwrap_or(Intent::Quote);
                self.log.log_at(
                    now_ms,
                    EventRecord::new("order_skip")
                        .intent(intent)
                        .source("oms")
                        .mode(self.mode)
                        .reason("order_reject")
                        .client_id(client_id.clone())
                        .exch_order_id(event.exch_order_id)
                        .data(json!({
                            "code": code,
                            "structural": structural,
                            "reject_streak": self.reject_streak,
                        })),
                );
                if structural {
                    self.halt_reason = Some(format!("structural reject code {code}"));
                }
            }
        }
    }

    fn clear_slot_if(&mut self, client_id: &str) {
        if self.live_bid.as_deref() == Some(client_id) {
            self.live_bid = None;
        }
        if self.live_ask.as_deref() == Some(client_id) {
            self.live_ask = None;
        }
    }

    /// A terminal close-order event releases the per-leg closing flag.
    fn closing_cleanup_for(&mut self, client_id: &str) {
        match client_id_intent(client_id) {
            Some(Intent::Unwind) | Some(Intent::Flatten) => {
                if let Some(order) = self.orders.get(client_id) {
                    let leg = order.order_leg.leg();
                    self.closing.remove(&leg);
                }
            }
            _ => {}
        }
    }

    async fn handle_fill(&mut self, fill: FillEvent, spot_bbo: Option<&Bbo>, now_ms: i64) {
        // Spot pushes often omit the client id; recover it from the ack map.
        let client_id = fill
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| self.by_exch.get(&fill.exch_order_id).cloned());

        if client_id.is_none()
            && fill.leg == Leg::Spot
            && !self.by_exch.contains_key(&fill.exch_order_id)
        {
            // Fill raced its own placement ack; park it briefly.
            if self.pending_fills.len() < PENDING_FILL_CAPACITY {
                self.pending_fills.push(PendingFill {
                    fill,
                    received_ms: now_ms,
                });
                return;
            }
        }

        let normalized = NormalizedFill {
            leg: fill.leg,
            side: fill.side,
            price: fill.price,
            qty: fill.qty,
            client_id,
            exch_order_id: fill.exch_order_id.clone(),
            trade_id: fill.trade_id.clone(),
            fee: fill.fee,
            ts_ms: fill.ts_ms,
            simulated: fill.simulated,
        };
        self.apply_fill(normalized, spot_bbo, now_ms).await;
    }

    /// Applies one normalized fill. Dedupe runs before any side effect;
    /// duplicates are logged and dropped.
    async fn apply_fill(&mut self, fill: NormalizedFill, spot_bbo: Option<&Bbo>, now_ms: i64) {
        if !self.dedupe.insert(fill.dedupe_key()) {
            self.log.log_at(
                now_ms,
                EventRecord::new("order_skip")
                    .source("oms")
                    .mode(self.mode)
                    .reason("duplicate_fill")
                    .maybe_client_id(fill.client_id.clone())
                    .exch_order_id(fill.exch_order_id.clone())
                    .maybe_trade_id(fill.trade_id.clone())
                    .simulated(fill.simulated),
            );
            return;
        }

        let intent = fill.client_id.as_deref().and_then(client_id_intent);
        self.log.log_at(
            now_ms,
            EventRecord::new("fill")
                .source("oms")
                .mode(self.mode)
                .maybe_client_id(fill.client_id.clone())
                .exch_order_id(fill.exch_order_id.clone())
                .maybe_trade_id(fill.trade_id.clone())
                .data(json!({
                    "leg": fill.leg.as_str(),
                    "side": fill.side.as_str(),
                    "price": fill.price,
                    "size": fill.qty,
                    "fee": fill.fee,
                    "intent": intent.map(Intent::as_str),
                }))
                .simulated(fill.simulated),
        );

        self.inventory.apply_fill(fill.leg, fill.side, fill.qty);
        self.update_order_on_fill(&fill, now_ms);
        self.update_unhedged_timer(now_ms);

        let ticket_id = self.ticket_for_fill(&fill);
        match (intent, ticket_id) {
            (_, Some(ticket_id)) => self.apply_ticket_fill(&ticket_id, &fill, now_ms),
            (Some(Intent::Quote), None) if fill.leg == Leg::Perp => {
                self.open_hedge(&fill, spot_bbo, now_ms).await;
            }
            (Some(Intent::Flatten), None) | (Some(Intent::Unwind), None) => {
                if let Some(client_id) = fill.client_id.as_deref() {
                    self.closing_cleanup_for(client_id);
                }
            }
            _ => {}
        }
        self.update_unhedged_timer(now_ms);
    }

    fn update_order_on_fill(&mut self, fill: &NormalizedFill, now_ms: i64) {
        let step = self
            .constraints
            .get(fill.leg)
            .map(|c| c.size_step)
            .unwrap_or(0.0);
        let Some(client_id) = fill.client_id.clone() else {
            return;
        };
        let mut fully_filled = false;
        if let Some(order) = self.orders.get_mut(&client_id) {
            order.filled += fill.qty;
            order.last_update_ts_ms = now_ms;
            if order.filled >= order.size - step * 0.5 {
                order.status = OrderStatus::Filled;
                fully_filled = true;
            } else {
                order.status = OrderStatus::Partial;
            }
        }
        if fully_filled {
            self.clear_slot_if(&client_id);
        }
    }

    fn update_unhedged_timer(&mut self, now_ms: i64) {
        let step = self
            .constraints
            .get(Leg::Spot)
            .map(|c| c.size_step)
            .unwrap_or(0.0);
        if self.inventory.is_flat(step.max(1e-9)) {
            self.unhedged_since_ms = None;
        } else if self.unhedged_since_ms.is_none() {
            self.unhedged_since_ms = Some(now_ms);
        }
    }

    fn ticket_for_fill(&self, fill: &NormalizedFill) -> Option<String> {
        if let Some(client_id) = fill.client_id.as_deref() {
            if let Some(ticket_id) = self.ticket_by_client.get(client_id) {
                return Some(ticket_id.clone());
            }
        }
        self.ticket_by_exch.get(&fill.exch_order_id).cloned()
    }

    // ---- hedge protocol ----

    async fn open_hedge(&mut self, fill: &NormalizedFill, spot_bbo: Option<&Bbo>, now_ms: i64) {
        let hedge_side = fill.side.opposite();
        let hedge_id = new_client_id(Intent::Hedge, OrderLeg::SpotIoc, self.cycle);
        let ticket = HedgeTicket {
            hedge_id: hedge_id.clone(),
            side: hedge_side,
            want_qty: fill.qty,
            filled_qty: 0.0,
            deadline_ts_ms: now_ms + self.cfg.hedge_deadline_ms as i64,
            tries: 0,
            status: HedgeStatus::Open,
            created_ts_ms: now_ms,
            last_action_ms: now_ms,
        };
        self.log.log_at(
            now_ms,
            EventRecord::new("hedge_ticket_open")
                .intent(Intent::Hedge)
                .source("oms")
                .mode(self.mode)
                .reason(format!("perp_fill:{}", fill.side.as_str()))
                .leg(OrderLeg::SpotIoc)
                .cycle_id(self.cycle)
                .client_id(hedge_id.clone())
                .data(json!({
                    "side": hedge_side.as_str(),
                    "want_qty": ticket.want_qty,
                    "deadline_ts": ticket.deadline_ts_ms,
                }))
                .simulated(fill.simulated),
        );
        self.tickets.insert(hedge_id.clone(), ticket);

        match spot_bbo {
            Some(bbo) => {
                self.send_hedge_order(&hedge_id, *bbo, self.cfg.hedge_slip_bps, "hedge", now_ms)
                    .await;
            }
            None => {
                self.log.log_at(
                    now_ms,
                    EventRecord::new("risk")
                        .intent(Intent::Hedge)
                        .source("oms")
                        .mode(self.mode)
                        .reason("hedge_no_spot_book")
                        .leg(OrderLeg::SpotIoc)
                        .client_id(hedge_id),
                );
            }
        }
    }

    /// Sends one spot IOC for a ticket's remainder at the given slip. The
    /// first send reuses the ticket id as client id; chases get fresh ids.
    async fn send_hedge_order(
        &mut self,
        hedge_id: &str,
        spot_bbo: Bbo,
        slip_bps: f64,
        reason: &str,
        now_ms: i64,
    ) {
        let Some(ticket) = self.tickets.get(hedge_id) else {
            return;
        };
        let remain = ticket.remain();
        let side = ticket.side;
        let first_send = ticket.tries == 0;
        if remain <= 0.0 {
            return;
        }
        let Some(spot) = self.constraints.get(Leg::Spot).copied() else {
            return;
        };

        // Round toward making the order marketable.
        let slip = slip_bps * 1e-4;
        let price = match side {
            Side::Buy => spot.round_price_up(spot_bbo.ask * (1.0 + slip)),
            Side::Sell => spot.round_price_down(spot_bbo.bid * (1.0 - slip)),
        };
        let size = spot.round_size_down(remain);
        if size < spot.min_size || !spot.validate(price, size) {
            self.log.log_at(
                now_ms,
                EventRecord::new("order_skip")
                    .intent(Intent::Hedge)
                    .source("oms")
                    .mode(self.mode)
                    .reason("below_min_constraints")
                    .leg(OrderLeg::SpotIoc)
                    .cycle_id(self.cycle)
                    .client_id(hedge_id.to_string())
                    .data(json!({ "price": price, "size": size, "remain": remain })),
            );
            return;
        }

        let client_id = if first_send {
            hedge_id.to_string()
        } else {
            new_client_id(Intent::Hedge, OrderLeg::SpotIoc, self.cycle)
        };
        self.ticket_by_client
            .insert(client_id.clone(), hedge_id.to_string());

        let req = OrderRequest {
            leg: Leg::Spot,
            symbol: self.cfg.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            tif: Tif::Ioc,
            price: Some(price),
            size,
            client_id,
            reduce_only: false,
        };
        let exch_id = self
            .submit(req, Intent::Hedge, OrderLeg::SpotIoc, reason, now_ms)
            .await;
        if let Some(exch_id) = exch_id {
            if !exch_id.is_empty() {
                self.ticket_by_exch.insert(exch_id, hedge_id.to_string());
            }
        }
        if let Some(ticket) = self.tickets.get_mut(hedge_id) {
            ticket.last_action_ms = now_ms;
        }
    }

    fn apply_ticket_fill(&mut self, hedge_id: &str, fill: &NormalizedFill, now_ms: i64) {
        let step = self
            .constraints
            .get(Leg::Spot)
            .map(|c| c.size_step)
            .unwrap_or(0.0);
        let Some(ticket) = self.tickets.get_mut(hedge_id) else {
            return;
        };
        ticket.filled_qty += fill.qty;
        ticket.last_action_ms = now_ms;
        let remain = ticket.remain();
        if remain <= step * 0.5 {
            let was_unwind = ticket.status == HedgeStatus::Unwind;
            ticket.status = HedgeStatus::Done;
            let summary = json!({
                "want_qty": ticket.want_qty,
                "filled_qty": ticket.filled_qty,
                "remain": remain,
                "tries": ticket.tries,
            });
            self.log.log_at(
                now_ms,
                EventRecord::new("hedge_ticket_done")
                    .intent(Intent::Hedge)
                    .source("oms")
                    .mode(self.mode)
                    .reason(if was_unwind { "unwind_fill" } else { "hedged" })
                    .leg(if was_unwind { OrderLeg::PerpUnwind } else { OrderLeg::SpotIoc })
                    .client_id(hedge_id.to_string())
                    .data(summary)
                    .simulated(fill.simulated),
            );
            if was_unwind {
                self.closing.remove(&Leg::Perp);
            }
            self.cleanup_ticket(hedge_id);
        }
    }

    fn cleanup_ticket(&mut self, hedge_id: &str) {
        self.tickets.remove(hedge_id);
        self.ticket_by_client.retain(|_, v| v != hedge_id);
        self.ticket_by_exch.retain(|_, v| v != hedge_id);
    }

    /// Periodic housekeeping: expires parked fills and advances the
    /// chase/unwind state of every open ticket.
    pub async fn service(&mut self, spot_bbo: Option<&Bbo>, now_ms: i64) {
        self.expire_pending_fills(spot_bbo, now_ms).await;

        if self.orders.len() > ORDER_RETENTION {
            self.orders.retain(|_, o| !o.status.is_terminal());
            let orders = &self.orders;
            self.by_exch.retain(|_, client_id| orders.contains_key(client_id));
        }

        let due: Vec<(String, u32)> = self
            .tickets
            .iter()
            .filter(|(_, t)| {
                matches!(t.status, HedgeStatus::Open | HedgeStatus::Chasing) && t.remain() > 0.0
            })
            .map(|(id, t)| (id.clone(), t.tries))
            .collect();

        for (hedge_id, tries) in due {
            let (deadline, last_action) = match self.tickets.get(&hedge_id) {
                Some(t) => (t.deadline_ts_ms, t.last_action_ms),
                None => continue,
            };
            if tries >= self.cfg.hedge_max_tries || now_ms > deadline {
                self.unwind_ticket(&hedge_id, "hedge_unwind", now_ms).await;
                continue;
            }
            let chase_ms = (self.cfg.hedge_chase_sec * 1000.0) as i64;
            if now_ms - last_action >= chase_ms {
                let Some(bbo) = spot_bbo else { continue };
                let slip =
                    self.cfg.hedge_slip_bps * (1.0 + (tries + 1) as f64 * self.cfg.chase_gain);
                if let Some(ticket) = self.tickets.get_mut(&hedge_id) {
                    ticket.tries += 1;
                    ticket.status = HedgeStatus::Chasing;
                }
                self.log.log_at(
                    now_ms,
                    EventRecord::new("risk")
                        .intent(Intent::Hedge)
                        .source("oms")
                        .mode(self.mode)
                        .reason("hedge_chase")
                        .leg(OrderLeg::SpotIoc)
                        .client_id(hedge_id.clone())
                        .data(json!({ "tries": tries + 1, "slip_bps": slip })),
                );
                self.send_hedge_order(&hedge_id, *bbo, slip, "hedge_chase", now_ms)
                    .await;
            }
        }
    }

    async fn expire_pending_fills(&mut self, spot_bbo: Option<&Bbo>, now_ms: i64) {
        let expired: Vec<FillEvent> = {
            let (expired, keep): (Vec<_>, Vec<_>) = self
                .pending_fills
                .drain(..)
                .partition(|p| now_ms - p.received_ms >= PENDING_FILL_TIMEOUT_MS);
            self.pending_fills = keep;
            expired.into_iter().map(|p| p.fill).collect()
        };
        for fill in expired {
            // The ack never arrived; process with whatever mapping exists
            // now, logging client_id null when unresolved.
            let client_id = self.by_exch.get(&fill.exch_order_id).cloned();
            let normalized = NormalizedFill {
                leg: fill.leg,
                side: fill.side,
                price: fill.price,
                qty: fill.qty,
                client_id,
                exch_order_id: fill.exch_order_id.clone(),
                trade_id: fill.trade_id.clone(),
                fee: fill.fee,
                ts_ms: fill.ts_ms,
                simulated: fill.simulated,
            };
            self.apply_fill(normalized, spot_bbo, now_ms).await;
        }
    }

    fn flush_pending_fills(&mut self, now_ms: i64) {
        // A parked fill whose ack mapping has appeared is made immediately
        // due; the next service pass applies it with the recovered id.
        for pending in &mut self.pending_fills {
            if self.by_exch.contains_key(&pending.fill.exch_order_id) {
                pending.received_ms = now_ms - PENDING_FILL_TIMEOUT_MS;
            }
        }
    }

    /// Moves a ticket to UNWIND: a reduce-only aggressive order on the
    /// perpetual removes the residual exposure. Guarded by the per-leg
    /// closing flag so a guard-triggered unwind cannot double-fire with a
    /// deadline-triggered one.
    pub async fn unwind_ticket(&mut self, hedge_id: &str, reason: &str, now_ms: i64) {
        if self.closing.contains(&Leg::Perp) {
            self.log.log_at(
                now_ms,
                EventRecord::new("order_skip")
                    .intent(Intent::Unwind)
                    .source("oms")
                    .mode(self.mode)
                    .reason("close_inflight")
                    .leg(OrderLeg::PerpUnwind)
                    .client_id(hedge_id.to_string()),
            );
            return;
        }
        let Some(ticket) = self.tickets.get_mut(hedge_id) else {
            return;
        };
        let remain = ticket.remain();
        if remain <= 0.0 {
            return;
        }
        ticket.status = HedgeStatus::Unwind;
        let side = ticket.side;
        let tries = ticket.tries;
        self.closing.insert(Leg::Perp);

        let client_id = new_client_id(Intent::Unwind, OrderLeg::PerpUnwind, self.cycle);
        self.ticket_by_client
            .insert(client_id.clone(), hedge_id.to_string());
        self.log.log_at(
            now_ms,
            EventRecord::new("risk")
                .intent(Intent::Unwind)
                .source("oms")
                .mode(self.mode)
                .reason(reason.to_string())
                .leg(OrderLeg::PerpUnwind)
                .client_id(client_id.clone())
                .data(json!({ "hedge_id": hedge_id, "remain": remain, "tries": tries })),
        );
        let req = OrderRequest {
            leg: Leg::Perp,
            symbol: self.cfg.symbol.clone(),
            side,
            order_type: OrderType::Market,
            tif: Tif::Ioc,
            price: None,
            size: remain,
            client_id,
            reduce_only: true,
        };
        let exch_id = self
            .submit(req, Intent::Unwind, OrderLeg::PerpUnwind, reason, now_ms)
            .await;
        match exch_id {
            Some(exch_id) => {
                if !exch_id.is_empty() {
                    self.ticket_by_exch.insert(exch_id, hedge_id.to_string());
                }
            }
            None => {
                // Submission failed, so no terminal order event will ever
                // release the flag; retry the unwind on a later pass.
                self.closing.remove(&Leg::Perp);
                if let Some(ticket) = self.tickets.get_mut(hedge_id) {
                    ticket.status = HedgeStatus::Chasing;
                }
            }
        }
    }

    /// Unwinds whichever open ticket has the oldest exposure; used by the
    /// unhedged-exposure guard.
    pub async fn unwind_oldest_ticket(&mut self, reason: &str, now_ms: i64) {
        let oldest = self
            .tickets
            .iter()
            .filter(|(_, t)| matches!(t.status, HedgeStatus::Open | HedgeStatus::Chasing))
            .min_by_key(|(_, t)| t.created_ts_ms)
            .map(|(id, _)| id.clone());
        if let Some(hedge_id) = oldest {
            self.unwind_ticket(&hedge_id, reason, now_ms).await;
        }
    }

    // ---- flatten & startup ----

    /// Cancels quotes and closes both legs with aggressive reduce-only
    /// orders. Subject to the same per-leg close exclusion as unwinds.
    pub async fn flatten(&mut self, spot_bbo: Option<&Bbo>, reason: &str, now_ms: i64) {
        self.cancel_all_quotes(reason, "risk", now_ms).await;

        let perp_pos = self.inventory.perp_pos;
        if perp_pos.abs() > 0.0 {
            if self.closing.contains(&Leg::Perp) {
                self.log_close_inflight(OrderLeg::PerpUnwind, now_ms);
            } else {
                self.closing.insert(Leg::Perp);
                let side = if perp_pos > 0.0 { Side::Sell } else { Side::Buy };
                let req = OrderRequest {
                    leg: Leg::Perp,
                    symbol: self.cfg.symbol.clone(),
                    side,
                    order_type: OrderType::Market,
                    tif: Tif::Ioc,
                    price: None,
                    size: perp_pos.abs(),
                    client_id: new_client_id(Intent::Flatten, OrderLeg::PerpUnwind, self.cycle),
                    reduce_only: true,
                };
                if self
                    .submit(req, Intent::Flatten, OrderLeg::PerpUnwind, reason, now_ms)
                    .await
                    .is_none()
                {
                    self.closing.remove(&Leg::Perp);
                }
            }
        }

        let spot_pos = self.inventory.spot_pos;
        if spot_pos.abs() > 0.0 {
            if self.closing.contains(&Leg::Spot) {
                self.log_close_inflight(OrderLeg::SpotUnwind, now_ms);
            } else if let Some(bbo) = spot_bbo {
                self.closing.insert(Leg::Spot);
                let side = if spot_pos > 0.0 { Side::Sell } else { Side::Buy };
                let price = match side {
                    Side::Buy => bbo.ask,
                    Side::Sell => bbo.bid,
                };
                let req = OrderRequest {
                    leg: Leg::Spot,
                    symbol: self.cfg.symbol.clone(),
                    side,
                    order_type: OrderType::Limit,
                    tif: Tif::Ioc,
                    price: Some(price),
                    size: spot_pos.abs(),
                    client_id: new_client_id(Intent::Flatten, OrderLeg::SpotUnwind, self.cycle),
                    reduce_only: false,
                };
                if self
                    .submit(req, Intent::Flatten, OrderLeg::SpotUnwind, reason, now_ms)
                    .await
                    .is_none()
                {
                    self.closing.remove(&Leg::Spot);
                }
            }
        }
    }

    fn log_close_inflight(&self, leg: OrderLeg, now_ms: i64) {
        self.log.log_at(
            now_ms,
            EventRecord::new("order_skip")
                .intent(Intent::Flatten)
                .source("oms")
                .mode(self.mode)
                .reason("close_inflight")
                .leg(leg),
        );
    }

    /// Crash recovery: cancel every open order carrying our deterministic
    /// client-id prefix, seed inventory from the venue's position snapshot,
    /// and immediately unwind any residual exposure.
    pub async fn startup_reconcile(&mut self, now_ms: i64) {
        for leg in [Leg::Perp, Leg::Spot] {
            let open = match self.gateway.open_orders(&self.cfg.symbol, leg).await {
                Ok(open) => open,
                Err(err) => {
                    tracing::warn!(leg = leg.as_str(), "open order listing failed: {err}");
                    continue;
                }
            };
            for order in open {
                if client_id_intent(&order.client_id).is_none() {
                    continue;
                }
                let req = CancelRequest {
                    leg,
                    symbol: self.cfg.symbol.clone(),
                    client_id: order.client_id.clone(),
                    exch_order_id: Some(order.exch_order_id.clone()),
                };
                let _ = self.gateway.cancel_order(&req).await;
                self.log.log_at(
                    now_ms,
                    EventRecord::new("order_cancel")
                        .source("startup")
                        .mode(self.mode)
                        .reason("startup_reconcile")
                        .client_id(order.client_id)
                        .exch_order_id(order.exch_order_id),
                );
            }
        }

        match self.gateway.position_snapshot(&self.cfg.symbol).await {
            Ok(perp_pos) => {
                self.inventory.perp_pos = perp_pos;
                self.log.log_at(
                    now_ms,
                    EventRecord::new("state")
                        .source("startup")
                        .mode(self.mode)
                        .reason("positions_sync")
                        .data(json!({
                            "perp_pos": self.inventory.perp_pos,
                            "spot_pos": self.inventory.spot_pos,
                        })),
                );
            }
            Err(err) => {
                tracing::warn!("position snapshot failed: {err}");
            }
        }

        let step = self
            .constraints
            .get(Leg::Spot)
            .map(|c| c.size_step)
            .unwrap_or(1e-9);
        if !self.inventory.is_flat(step) {
            // A hedge was mid-flight when the last run died; clear the
            // exposure before quoting starts.
            let net = self.inventory.net();
            let side = if net > 0.0 { Side::Sell } else { Side::Buy };
            self.closing.insert(Leg::Perp);
            let req = OrderRequest {
                leg: Leg::Perp,
                symbol: self.cfg.symbol.clone(),
                side,
                order_type: OrderType::Market,
                tif: Tif::Ioc,
                price: None,
                size: net.abs(),
                client_id: new_client_id(Intent::Unwind, OrderLeg::PerpUnwind, self.cycle),
                reduce_only: true,
            };
            if self
                .submit(req, Intent::Unwind, OrderLeg::PerpUnwind, "startup_residual", now_ms)
                .await
                .is_none()
            {
                self.closing.remove(&Leg::Perp);
            }
            self.update_unhedged_timer(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::strategy::build_quote_plan;
    use crate::gateway::{mock::MockGateway, FillEvent, OpenOrder, OrderEvent};
    use crate::jsonl::MemorySink;
    use crate::types::{Bbo, BookLevel, FundingState};

    const T0: i64 = 1_000_000;

    fn config(dry_run: bool) -> EngineConfig {
        let mut cfg: EngineConfig = toml::from_str(
            r#"
            symbol = "ETHUSDT"
            quote_qty = 0.05
            hedge_slip_bps = 5.0
            hedge_chase_sec = 1.0
            hedge_max_tries = 2
            hedge_deadline_ms = 10000
            chase_gain = 1.0
            replace_threshold_bps = 0.2
            "#,
        )
        .unwrap();
        cfg.dry_run = dry_run;
        cfg
    }

    fn constraints_store() -> ConstraintsStore {
        let mut store = ConstraintsStore::default();
        let c = crate::constraints::InstrumentConstraints {
            price_tick: 0.1,
            size_step: 0.001,
            min_size: 0.001,
            min_notional: 5.0,
        };
        store.set(Leg::Spot, c);
        store.set(Leg::Perp, c);
        store
    }

    fn make_oms(dry_run: bool) -> (Oms, Arc<MockGateway>, Arc<MemorySink>) {
        let gateway = Arc::new(MockGateway::new());
        let sink = Arc::new(MemorySink::new());
        let oms = Oms::new(
            config(dry_run),
            gateway.clone(),
            constraints_store(),
            EventLog::new(sink.clone()),
        );
        (oms, gateway, sink)
    }

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            spot: spot_bbo(),
            perp: Bbo {
                bid: 1000.0,
                ask: 1000.2,
                bid_size: 10.0,
                ask_size: 10.0,
                ts_ms: T0,
            },
            perp_bids: vec![BookLevel { price: 1000.0, size: 10.0 }],
            perp_asks: vec![BookLevel { price: 1000.2, size: 10.0 }],
            obi: 0.0,
            levels_used: 5,
            fallback: false,
            ts_ms: T0,
        }
    }

    fn spot_bbo() -> Bbo {
        Bbo {
            bid: 1000.1,
            ask: 1000.3,
            bid_size: 10.0,
            ask_size: 10.0,
            ts_ms: T0,
        }
    }

    fn perp_fill(side: Side, qty: f64, price: f64, client_id: &str, trade_id: &str) -> PrivateEvent {
        PrivateEvent::Fill(FillEvent {
            leg: Leg::Perp,
            side,
            price,
            qty,
            client_id: Some(client_id.to_string()),
            exch_order_id: format!("P-{trade_id}"),
            trade_id: Some(trade_id.to_string()),
            fee: 0.0,
            ts_ms: T0,
            simulated: false,
        })
    }

    fn spot_fill(side: Side, qty: f64, price: f64, exch_order_id: &str, trade_id: &str) -> PrivateEvent {
        PrivateEvent::Fill(FillEvent {
            leg: Leg::Spot,
            side,
            price,
            qty,
            client_id: None,
            exch_order_id: exch_order_id.to_string(),
            trade_id: Some(trade_id.to_string()),
            fee: 0.0,
            ts_ms: T0,
            simulated: false,
        })
    }

    fn events_named(sink: &MemorySink, event: &str) -> Vec<serde_json::Value> {
        sink.records()
            .into_iter()
            .filter(|r| r["event"] == event)
            .collect()
    }

    fn quote_plan() -> QuotePlan {
        build_quote_plan(
            &config(true),
            &crate::constraints::InstrumentConstraints {
                price_tick: 0.1,
                size_step: 0.001,
                min_size: 0.001,
                min_notional: 5.0,
            },
            &snapshot(),
            &FundingState {
                rate: 0.0005,
                ts_ms: T0,
                next_settle_ms: None,
            },
            0.0,
            None,
        )
    }

    // Dry-run quoting emits order records but never touches the venue.
    #[tokio::test]
    async fn dry_run_quotes_log_without_rest_calls() {
        let (mut oms, gateway, sink) = make_oms(true);
        let plan = quote_plan();
        assert!(plan.bid.is_some() && plan.ask.is_some());
        oms.apply_plan(&plan, &snapshot(), T0).await;

        let new_orders = events_named(&sink, "order_new");
        assert_eq!(new_orders.len(), 2);
        let bid = new_orders.iter().find(|r| r["leg"] == "perp_bid").unwrap();
        let ask = new_orders.iter().find(|r| r["leg"] == "perp_ask").unwrap();
        assert!(bid["data"]["price"].as_f64().unwrap() <= 1000.0);
        assert!(ask["data"]["price"].as_f64().unwrap() >= 1000.2);
        assert_eq!(bid["intent"], "quote");
        assert!(gateway.placed_orders().is_empty());
        assert!(gateway.canceled_orders().is_empty());
    }

    // Re-applying an unchanged plan leaves the single live order per
    // side untouched.
    #[tokio::test]
    async fn unchanged_plan_does_not_replace() {
        let (mut oms, gateway, _sink) = make_oms(false);
        let plan = quote_plan();
        oms.apply_plan(&plan, &snapshot(), T0).await;
        assert_eq!(gateway.placed_orders().len(), 2);
        oms.apply_plan(&plan, &snapshot(), T0 + 250).await;
        assert_eq!(gateway.placed_orders().len(), 2);
        assert!(gateway.canceled_orders().is_empty());
        assert!(oms.live_quote(Side::Buy).is_some());
        assert!(oms.live_quote(Side::Sell).is_some());
    }

    #[tokio::test]
    async fn moved_price_cancels_before_replacing() {
        let (mut oms, gateway, _sink) = make_oms(false);
        let mut plan = quote_plan();
        oms.apply_plan(&plan, &snapshot(), T0).await;

        let bid = plan.bid.as_mut().unwrap();
        bid.price -= 1.0;
        oms.apply_plan(&plan, &snapshot(), T0 + 250).await;

        assert_eq!(gateway.canceled_orders().len(), 1);
        assert_eq!(gateway.placed_orders().len(), 3);
        let replaced = &gateway.placed_orders()[2];
        assert_eq!(replaced.side, Side::Buy);
        assert_eq!(replaced.tif, Tif::PostOnly);
    }

    #[tokio::test]
    async fn cancel_already_filled_suppresses_repost() {
        let (mut oms, gateway, sink) = make_oms(false);
        let mut plan = quote_plan();
        oms.apply_plan(&plan, &snapshot(), T0).await;

        gateway.push_cancel_outcome(CancelOutcome::AlreadyFilled);
        plan.bid.as_mut().unwrap().price -= 1.0;
        oms.apply_plan(&plan, &snapshot(), T0 + 250).await;

        // Cancel was issued but no replacement followed.
        assert_eq!(gateway.canceled_orders().len(), 1);
        assert_eq!(gateway.placed_orders().len(), 2);
        assert!(events_named(&sink, "order_skip")
            .iter()
            .any(|r| r["reason"] == "cancel_already_filled"));
        assert!(oms.live_quote(Side::Buy).is_none());
    }

    // A perpetual buy fill opens a sell-side spot hedge that completes
    // on the first IOC.
    #[tokio::test]
    async fn perp_fill_hedges_on_spot_and_completes() {
        let (mut oms, gateway, sink) = make_oms(false);
        let client_id = new_client_id(Intent::Quote, OrderLeg::PerpBid, 1);
        oms.handle_private(
            perp_fill(Side::Buy, 0.05, 1000.0, &client_id, "t-perp-1"),
            Some(&spot_bbo()),
            T0,
        )
        .await;

        assert_eq!(events_named(&sink, "hedge_ticket_open").len(), 1);
        let placed = gateway.placed_orders();
        assert_eq!(placed.len(), 1);
        let hedge = &placed[0];
        assert_eq!(hedge.leg, Leg::Spot);
        assert_eq!(hedge.side, Side::Sell);
        assert_eq!(hedge.tif, Tif::Ioc);
        assert!((hedge.size - 0.05).abs() < 1e-9);
        let max_price = 1000.1 * (1.0 - 5.0 * 1e-4);
        assert!(hedge.price.unwrap() <= max_price + 1e-9);

        // The spot fill arrives without a client id; the ack map resolves it.
        oms.handle_private(
            spot_fill(Side::Sell, 0.05, hedge.price.unwrap(), "X0", "t-spot-1"),
            Some(&spot_bbo()),
            T0 + 100,
        )
        .await;

        let done = events_named(&sink, "hedge_ticket_done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["reason"], "hedged");
        assert!(done[0]["data"]["remain"].as_f64().unwrap().abs() < 1e-9);
        assert!(oms.tickets().next().is_none());
        assert!(oms.inventory().net().abs() < 1e-9);
        assert_eq!(oms.unhedged_since_ms(), None);
    }

    // A partial hedge is chased once at a wider slip and then completes
    // with tries == 1.
    #[tokio::test]
    async fn partial_hedge_chases_at_wider_slip() {
        let (mut oms, gateway, sink) = make_oms(false);
        let client_id = new_client_id(Intent::Quote, OrderLeg::PerpAsk, 1);
        oms.handle_private(
            perp_fill(Side::Sell, 0.08, 1000.2, &client_id, "t-perp-2"),
            Some(&spot_bbo()),
            T0,
        )
        .await;

        let first = gateway.placed_orders()[0].clone();
        assert_eq!(first.side, Side::Buy);
        assert!((first.size - 0.08).abs() < 1e-9);

        oms.handle_private(
            spot_fill(Side::Buy, 0.05, first.price.unwrap(), "X0", "t-spot-2"),
            Some(&spot_bbo()),
            T0 + 200,
        )
        .await;
        let ticket = oms.tickets().next().unwrap();
        assert!((ticket.remain() - 0.03).abs() < 1e-9);
        assert_eq!(ticket.status, HedgeStatus::Open);

        // Nothing further fills within the chase window.
        oms.service(Some(&spot_bbo()), T0 + 1_300).await;
        let placed = gateway.placed_orders();
        assert_eq!(placed.len(), 2);
        let chase = &placed[1];
        assert!((chase.size - 0.03).abs() < 1e-9);
        // Chase slip widens: 5 * (1 + 1*1.0) = 10 bps above the ask.
        let min_price = 1000.3 * (1.0 + 10.0 * 1e-4);
        assert!(chase.price.unwrap() >= min_price - 0.1 - 1e-9);
        assert!(chase.price.unwrap() > first.price.unwrap());

        oms.handle_private(
            spot_fill(Side::Buy, 0.03, chase.price.unwrap(), "X1", "t-spot-3"),
            Some(&spot_bbo()),
            T0 + 1_400,
        )
        .await;
        let done = events_named(&sink, "hedge_ticket_done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["data"]["tries"], 1);
        assert!(oms.inventory().net().abs() < 1e-9);
    }

    // Three unfilled IOCs exhaust the try budget and the ticket unwinds
    // on the perpetual with a reduce-only order.
    #[tokio::test]
    async fn exhausted_hedge_unwinds_on_perp() {
        let (mut oms, gateway, sink) = make_oms(false);
        let client_id = new_client_id(Intent::Quote, OrderLeg::PerpAsk, 1);
        oms.handle_private(
            perp_fill(Side::Sell, 0.05, 1000.2, &client_id, "t-perp-3"),
            Some(&spot_bbo()),
            T0,
        )
        .await;
        oms.service(Some(&spot_bbo()), T0 + 1_100).await; // chase 1
        oms.service(Some(&spot_bbo()), T0 + 2_200).await; // chase 2
        assert_eq!(gateway.placed_orders().len(), 3);
        {
            let ticket = oms.tickets().next().unwrap();
            assert_eq!(ticket.tries, 2);
            assert_eq!(ticket.status, HedgeStatus::Chasing);
        }

        oms.service(Some(&spot_bbo()), T0 + 3_300).await; // tries exhausted
        let placed = gateway.placed_orders();
        assert_eq!(placed.len(), 4);
        let unwind = &placed[3];
        assert_eq!(unwind.leg, Leg::Perp);
        assert_eq!(unwind.order_type, OrderType::Market);
        assert!(unwind.reduce_only);
        assert_eq!(unwind.side, Side::Buy);
        assert!((unwind.size - 0.05).abs() < 1e-9);
        assert!(events_named(&sink, "risk")
            .iter()
            .any(|r| r["reason"] == "hedge_unwind"));

        // The unwind execution closes the ticket.
        oms.handle_private(
            PrivateEvent::Fill(FillEvent {
                leg: Leg::Perp,
                side: Side::Buy,
                price: 1000.3,
                qty: 0.05,
                client_id: Some(unwind.client_id.clone()),
                exch_order_id: "X3".into(),
                trade_id: Some("t-unwind-1".into()),
                fee: 0.0,
                ts_ms: T0 + 3_400,
                simulated: false,
            }),
            Some(&spot_bbo()),
            T0 + 3_400,
        )
        .await;
        let done = events_named(&sink, "hedge_ticket_done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["reason"], "unwind_fill");
        assert!(oms.tickets().next().is_none());
        assert!(oms.inventory().net().abs() < 1e-9);
    }

    // A replayed fill changes nothing and is logged as a skip.
    #[tokio::test]
    async fn duplicate_fill_is_dropped_before_side_effects() {
        let (mut oms, _gateway, sink) = make_oms(false);
        let client_id = new_client_id(Intent::Quote, OrderLeg::PerpBid, 1);
        let fill = perp_fill(Side::Buy, 0.05, 1000.0, &client_id, "t-dup-1");
        oms.handle_private(fill.clone(), Some(&spot_bbo()), T0).await;
        let inv_after_first = oms.inventory();
        let tickets_after_first = oms.tickets().count();

        oms.handle_private(fill, Some(&spot_bbo()), T0 + 10).await;
        assert_eq!(oms.inventory(), inv_after_first);
        assert_eq!(oms.tickets().count(), tickets_after_first);
        assert!(events_named(&sink, "order_skip")
            .iter()
            .any(|r| r["reason"] == "duplicate_fill"));
        assert_eq!(events_named(&sink, "hedge_ticket_open").len(), 1);
    }

    // Close exclusion: a second concurrent close on the same symbol is
    // refused while the first is in flight.
    #[tokio::test]
    async fn concurrent_unwinds_are_mutually_exclusive() {
        let (mut oms, gateway, sink) = make_oms(false);
        for (idx, trade) in ["t-a", "t-b"].iter().enumerate() {
            let client_id = new_client_id(Intent::Quote, OrderLeg::PerpBid, idx as u64 + 1);
            oms.handle_private(
                perp_fill(Side::Buy, 0.05, 1000.0, &client_id, trade),
                None,
                T0,
            )
            .await;
        }
        let ids: Vec<String> = oms.tickets().map(|t| t.hedge_id.clone()).collect();
        assert_eq!(ids.len(), 2);

        oms.unwind_ticket(&ids[0], "hedge_unwind", T0 + 100).await;
        let placed_after_first = gateway.placed_orders().len();
        oms.unwind_ticket(&ids[1], "hedge_unwind", T0 + 100).await;
        assert_eq!(gateway.placed_orders().len(), placed_after_first);
        assert!(events_named(&sink, "order_skip")
            .iter()
            .any(|r| r["reason"] == "close_inflight"));
    }

    // A fill racing its own placement ack is parked and applied once the
    // ack's id mapping shows up.
    #[tokio::test]
    async fn early_spot_fill_waits_for_ack_mapping() {
        let (mut oms, _gateway, sink) = make_oms(false);
        oms.handle_private(
            spot_fill(Side::Sell, 0.05, 999.0, "UNSEEN", "t-early-1"),
            Some(&spot_bbo()),
            T0,
        )
        .await;
        assert!(oms.inventory().spot_pos.abs() < 1e-12);
        assert!(events_named(&sink, "fill").is_empty());

        let hedge_client = new_client_id(Intent::Hedge, OrderLeg::SpotIoc, 3);
        oms.handle_private(
            PrivateEvent::Order(OrderEvent {
                leg: Leg::Spot,
                client_id: Some(hedge_client.clone()),
                exch_order_id: "UNSEEN".into(),
                status: OrderEventStatus::Accepted,
                ts_ms: T0 + 50,
            }),
            Some(&spot_bbo()),
            T0 + 50,
        )
        .await;
        oms.service(Some(&spot_bbo()), T0 + 60).await;

        assert!((oms.inventory().spot_pos + 0.05).abs() < 1e-9);
        let fills = events_named(&sink, "fill");
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0]["client_id"], hedge_client.as_str());
    }

    #[tokio::test]
    async fn unmatched_spot_fill_applies_after_timeout_with_null_client() {
        let (mut oms, _gateway, sink) = make_oms(false);
        oms.handle_private(
            spot_fill(Side::Buy, 0.02, 999.0, "GHOST", "t-ghost-1"),
            Some(&spot_bbo()),
            T0,
        )
        .await;
        assert!(oms.inventory().spot_pos.abs() < 1e-12);

        oms.service(Some(&spot_bbo()), T0 + 2_100).await;
        assert!((oms.inventory().spot_pos - 0.02).abs() < 1e-9);
        let fills = events_named(&sink, "fill");
        assert_eq!(fills.len(), 1);
        assert!(fills[0]["client_id"].is_null());
    }

    #[tokio::test]
    async fn recoverable_rejects_feed_the_streak_and_success_resets_it() {
        let (mut oms, gateway, _sink) = make_oms(false);
        gateway.push_place_error(crate::errors::GatewayError::Rejected {
            code: "429".into(),
            reason: "rate limited".into(),
            structural: false,
        });
        gateway.push_place_error(crate::errors::GatewayError::Rejected {
            code: "429".into(),
            reason: "rate limited".into(),
            structural: false,
        });
        let plan = quote_plan();
        oms.apply_plan(&plan, &snapshot(), T0).await;
        assert_eq!(oms.reject_streak(), 2);
        assert!(oms.take_halt_reason().is_none());

        oms.apply_plan(&plan, &snapshot(), T0 + 250).await;
        assert_eq!(oms.reject_streak(), 0);
    }

    #[tokio::test]
    async fn structural_reject_requests_halt() {
        let (mut oms, gateway, _sink) = make_oms(false);
        gateway.push_place_error(crate::errors::GatewayError::Rejected {
            code: "40034".into(),
            reason: "symbol not found".into(),
            structural: true,
        });
        oms.apply_plan(&quote_plan(), &snapshot(), T0).await;
        let halt = oms.take_halt_reason();
        assert!(halt.is_some(), "structural reject must demand a halt");
    }

    #[tokio::test]
    async fn state_unknown_place_triggers_reconciliation_cancel() {
        let (mut oms, gateway, sink) = make_oms(false);
        gateway.push_place_error(crate::errors::GatewayError::Timeout(3_000));
        let mut plan = quote_plan();
        plan.ask = None;
        oms.apply_plan(&plan, &snapshot(), T0).await;

        let canceled = gateway.canceled_orders();
        assert_eq!(canceled.len(), 1);
        assert!(canceled[0].client_id.starts_with("quote-perp_bid-"));
        assert!(events_named(&sink, "risk")
            .iter()
            .any(|r| r["reason"] == "order_state_unknown"));
        assert!(oms.live_quote(Side::Buy).is_none());
    }

    // Replaying an identical private stream yields an identical
    // terminal state.
    #[tokio::test]
    async fn replayed_stream_is_deterministic() {
        let client_id = new_client_id(Intent::Quote, OrderLeg::PerpBid, 1);
        let stream = vec![
            perp_fill(Side::Buy, 0.05, 1000.0, &client_id, "t-r1"),
            spot_fill(Side::Sell, 0.05, 999.5, "X0", "t-r2"),
        ];

        let (mut a, _ga, _sa) = make_oms(false);
        let (mut b, _gb, _sb) = make_oms(false);
        for event in &stream {
            a.handle_private(event.clone(), Some(&spot_bbo()), T0).await;
            b.handle_private(event.clone(), Some(&spot_bbo()), T0).await;
        }
        assert_eq!(a.inventory(), b.inventory());
        assert_eq!(a.tickets().count(), b.tickets().count());

        // A second replay into the same instance is fully absorbed.
        let inv = a.inventory();
        for event in &stream {
            a.handle_private(event.clone(), Some(&spot_bbo()), T0 + 500).await;
        }
        assert_eq!(a.inventory(), inv);
    }

    // Startup reconciliation: recognizable leftovers are cancelled,
    // inventory is rebuilt from the snapshot, residual exposure unwinds.
    #[tokio::test]
    async fn startup_cancels_own_orders_and_unwinds_residual() {
        let (mut oms, gateway, sink) = make_oms(false);
        *gateway.position.lock().unwrap() = 0.05;
        gateway.open.lock().unwrap().extend([
            OpenOrder {
                leg: Leg::Perp,
                client_id: new_client_id(Intent::Quote, OrderLeg::PerpBid, 9),
                exch_order_id: "OLD-1".into(),
            },
            OpenOrder {
                leg: Leg::Perp,
                client_id: "manual-order-from-ui".into(),
                exch_order_id: "OLD-2".into(),
            },
        ]);

        oms.startup_reconcile(T0).await;

        let canceled = gateway.canceled_orders();
        assert_eq!(canceled.len(), 1, "only our prefix is cancelled");
        assert_eq!(canceled[0].exch_order_id.as_deref(), Some("OLD-1"));
        assert!((oms.inventory().perp_pos - 0.05).abs() < 1e-12);

        let placed = gateway.placed_orders();
        assert_eq!(placed.len(), 1, "residual exposure unwinds immediately");
        assert_eq!(placed[0].side, Side::Sell);
        assert!(placed[0].reduce_only);
        assert!((placed[0].size - 0.05).abs() < 1e-12);
        assert!(events_named(&sink, "state")
            .iter()
            .any(|r| r["reason"] == "positions_sync"));
    }

    // want/filled/remain stay reconciled across every ticket mutation.
    #[tokio::test]
    async fn ticket_quantities_always_reconcile() {
        let (mut oms, gateway, _sink) = make_oms(false);
        let client_id = new_client_id(Intent::Quote, OrderLeg::PerpAsk, 1);
        oms.handle_private(
            perp_fill(Side::Sell, 0.08, 1000.2, &client_id, "t-i1"),
            Some(&spot_bbo()),
            T0,
        )
        .await;
        let check = |oms: &Oms| {
            for ticket in oms.tickets() {
                assert!(
                    (ticket.want_qty - (ticket.filled_qty + ticket.remain())).abs() < 1e-12
                );
                assert!(ticket.remain() >= 0.0);
            }
        };
        check(&oms);
        let first = gateway.placed_orders()[0].clone();
        oms.handle_private(
            spot_fill(Side::Buy, 0.03, first.price.unwrap(), "X0", "t-i1-a"),
            Some(&spot_bbo()),
            T0 + 100,
        )
        .await;
        check(&oms);
        oms.service(Some(&spot_bbo()), T0 + 1_200).await;
        check(&oms);
    }
}
