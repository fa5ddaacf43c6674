//! Quote construction. Pure computation: same inputs, same plan, no I/O and
//! no clock access, so every pricing decision is replayable in tests.

use crate::{
    config::EngineConfig,
    constraints::InstrumentConstraints,
    marketdata::MarketSnapshot,
    types::FundingState,
};

/// One desired resting order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quote {
    pub price: f64,
    pub size: f64,
}

/// Desired quoting state for the cycle. An absent side means "do not quote
/// this side"; `reason` explains the plan for the decision log.
#[derive(Clone, Debug, PartialEq)]
pub struct QuotePlan {
    pub bid: Option<Quote>,
    pub ask: Option<Quote>,
    pub reason: &'static str,
}

impl QuotePlan {
    pub fn none(reason: &'static str) -> Self {
        Self {
            bid: None,
            ask: None,
            reason,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bid.is_none() && self.ask.is_none()
    }
}

// A side never tightens below this fraction of the base half-spread, no
// matter how hard inventory and funding pull on it.
const MIN_HALF_SPREAD_FRACTION: f64 = 0.1;

/// Builds the quote plan for one strategy cycle.
///
/// Pricing follows the reservation-price scheme: the perpetual mid is shifted
/// by the book imbalance, then each side's half-spread is skewed by current
/// net inventory and by the funding direction. Rounding is always conservative
/// (bid down, ask up) and both sides are clamped to their own touch so a
/// post-only order can never trade through.
pub fn build_quote_plan(
    cfg: &EngineConfig,
    perp: &InstrumentConstraints,
    snapshot: &MarketSnapshot,
    funding: &FundingState,
    net_inventory: f64,
    guard_block: Option<&'static str>,
) -> QuotePlan {
    if let Some(reason) = guard_block {
        return QuotePlan::none(reason);
    }
    if funding.rate.abs() < cfg.min_abs_funding {
        return QuotePlan::none("funding_too_thin");
    }

    let mid = snapshot.perp_mid();
    if mid <= 0.0 {
        return QuotePlan::none("no_mid");
    }

    let reservation = mid * (1.0 + cfg.k_obi * 1e-4 * snapshot.obi);

    // Inventory pulls both quotes away from the side we are long on;
    // funding tightens the side whose fill earns the funding stream.
    let inventory_skew = cfg.inventory_skew_bps * (net_inventory / cfg.quote_qty);
    let funding_skew = cfg.funding_skew_bps * funding.rate.signum();
    let floor = cfg.base_half_spread_bps * MIN_HALF_SPREAD_FRACTION;
    let bid_half_bps = (cfg.base_half_spread_bps + inventory_skew + funding_skew).max(floor);
    let ask_half_bps = (cfg.base_half_spread_bps - inventory_skew - funding_skew).max(floor);

    let size = perp.round_size_down(cfg.quote_qty);
    if size < perp.min_size {
        return QuotePlan::none("below_min_size");
    }

    let raw_bid = reservation * (1.0 - bid_half_bps * 1e-4);
    let raw_ask = reservation * (1.0 + ask_half_bps * 1e-4);

    let bid = build_side_bid(perp, snapshot, raw_bid, size);
    let ask = build_side_ask(perp, snapshot, raw_ask, size);

    let reason = if bid.is_some() || ask.is_some() {
        "quote"
    } else {
        "no_quotable_side"
    };
    QuotePlan { bid, ask, reason }
}

fn build_side_bid(
    perp: &InstrumentConstraints,
    snapshot: &MarketSnapshot,
    raw_price: f64,
    size: f64,
) -> Option<Quote> {
    let mut price = perp.round_price_down(raw_price);
    if price >= snapshot.perp.ask {
        // Would cross the opposite touch even before clamping; drop.
        return None;
    }
    if price > snapshot.perp.bid {
        price = snapshot.perp.bid;
    }
    if price <= 0.0 || !perp.validate(price, size) {
        return None;
    }
    Some(Quote { price, size })
}

fn build_side_ask(
    perp: &InstrumentConstraints,
    snapshot: &MarketSnapshot,
    raw_price: f64,
    size: f64,
) -> Option<Quote> {
    let mut price = perp.round_price_up(raw_price);
    if price <= snapshot.perp.bid {
        return None;
    }
    if price < snapshot.perp.ask {
        price = snapshot.perp.ask;
    }
    if !perp.validate(price, size) {
        return None;
    }
    Some(Quote { price, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bbo, BookLevel};

    fn config() -> EngineConfig {
        toml::from_str(
            r#"
            symbol = "ETHUSDT"
            quote_qty = 0.05
            base_half_spread_bps = 2.0
            k_obi = 0.8
            inventory_skew_bps = 1.0
            funding_skew_bps = 0.6
            min_abs_funding = 0.00002
            "#,
        )
        .unwrap()
    }

    fn constraints() -> InstrumentConstraints {
        InstrumentConstraints {
            price_tick: 0.1,
            size_step: 0.001,
            min_size: 0.001,
            min_notional: 5.0,
        }
    }

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            spot: Bbo {
                bid: 1000.1,
                ask: 1000.3,
                bid_size: 10.0,
                ask_size: 10.0,
                ts_ms: 1_000,
            },
            perp: Bbo {
                bid: 1000.0,
                ask: 1000.2,
                bid_size: 10.0,
                ask_size: 10.0,
                ts_ms: 1_000,
            },
            perp_bids: vec![BookLevel { price: 1000.0, size: 10.0 }],
            perp_asks: vec![BookLevel { price: 1000.2, size: 10.0 }],
            obi: 0.0,
            levels_used: 5,
            fallback: false,
            ts_ms: 1_000,
        }
    }

    fn funding(rate: f64) -> FundingState {
        FundingState {
            rate,
            ts_ms: 1_000,
            next_settle_ms: None,
        }
    }

    #[test]
    fn two_sided_quote_inside_post_only_bounds() {
        let plan = build_quote_plan(
            &config(),
            &constraints(),
            &snapshot(),
            &funding(0.0005),
            0.0,
            None,
        );
        let bid = plan.bid.expect("bid quoted");
        let ask = plan.ask.expect("ask quoted");
        assert_eq!(plan.reason, "quote");
        assert!(bid.price <= 1000.0, "bid {} must not cross the touch", bid.price);
        assert!(ask.price >= 1000.2, "ask {} must not cross the touch", ask.price);
        assert!((bid.size - 0.05).abs() < 1e-9);
        assert!((ask.size - 0.05).abs() < 1e-9);
        // Prices land on the tick grid.
        assert!((bid.price / 0.1 - (bid.price / 0.1).round()).abs() < 1e-6);
        assert!((ask.price / 0.1 - (ask.price / 0.1).round()).abs() < 1e-6);
    }

    #[test]
    fn guard_block_short_circuits() {
        let plan = build_quote_plan(
            &config(),
            &constraints(),
            &snapshot(),
            &funding(0.0005),
            0.0,
            Some("book_stale"),
        );
        assert!(plan.is_empty());
        assert_eq!(plan.reason, "book_stale");
    }

    #[test]
    fn thin_funding_quotes_nothing() {
        let plan = build_quote_plan(
            &config(),
            &constraints(),
            &snapshot(),
            &funding(0.00001),
            0.0,
            None,
        );
        assert!(plan.is_empty());
        assert_eq!(plan.reason, "funding_too_thin");
    }

    #[test]
    fn plan_is_deterministic() {
        let cfg = config();
        let c = constraints();
        let snap = snapshot();
        let f = funding(-0.0004);
        let a = build_quote_plan(&cfg, &c, &snap, &f, 0.02, None);
        let b = build_quote_plan(&cfg, &c, &snap, &f, 0.02, None);
        assert_eq!(a, b);
    }

    #[test]
    fn long_inventory_pushes_quotes_down() {
        let cfg = config();
        let c = constraints();
        let snap = snapshot();
        let f = funding(0.0005);
        let flat = build_quote_plan(&cfg, &c, &snap, &f, 0.0, None);
        let long = build_quote_plan(&cfg, &c, &snap, &f, 0.10, None);
        let flat_bid = flat.bid.unwrap().price;
        let long_bid = long.bid.unwrap().price;
        assert!(
            long_bid <= flat_bid,
            "long inventory must not raise the bid ({long_bid} vs {flat_bid})"
        );
    }

    #[test]
    fn positive_funding_tightens_ask_side() {
        // Spreads wider than the touch so the post-only clamp does not mask
        // the skew.
        let mut cfg = config();
        cfg.base_half_spread_bps = 20.0;
        cfg.funding_skew_bps = 5.0;
        let c = constraints();
        let snap = snapshot();
        let pos = build_quote_plan(&cfg, &c, &snap, &funding(0.0005), 0.0, None);
        let neg = build_quote_plan(&cfg, &c, &snap, &funding(-0.0005), 0.0, None);
        let pos_ask = pos.ask.unwrap().price;
        let neg_ask = neg.ask.unwrap().price;
        assert!(
            pos_ask < neg_ask,
            "positive funding should quote a tighter ask ({pos_ask} vs {neg_ask})"
        );
    }

    #[test]
    fn obi_shifts_reservation_price() {
        let cfg = config();
        let c = constraints();
        let f = funding(0.0005);
        let mut bid_heavy = snapshot();
        bid_heavy.obi = 1.0;
        let mut ask_heavy = snapshot();
        ask_heavy.obi = -1.0;
        let up = build_quote_plan(&cfg, &c, &bid_heavy, &f, 0.0, None);
        let down = build_quote_plan(&cfg, &c, &ask_heavy, &f, 0.0, None);
        assert!(up.bid.unwrap().price > down.bid.unwrap().price);
    }

    #[test]
    fn sub_notional_side_is_dropped() {
        let mut c = constraints();
        c.min_notional = 100.0;
        let plan = build_quote_plan(&config(), &c, &snapshot(), &funding(0.0005), 0.0, None);
        // 0.05 * ~1000 = ~50 < 100: both sides fail the notional floor.
        assert!(plan.is_empty());
        assert_eq!(plan.reason, "no_quotable_side");
    }

    #[test]
    fn undersized_quote_qty_is_dropped() {
        let mut cfg = config();
        cfg.quote_qty = 0.0004;
        let plan = build_quote_plan(&cfg, &constraints(), &snapshot(), &funding(0.0005), 0.0, None);
        assert!(plan.is_empty());
        assert_eq!(plan.reason, "below_min_size");
    }

    #[test]
    fn extreme_skew_never_crosses_book() {
        let mut cfg = config();
        cfg.inventory_skew_bps = 50.0;
        let plan = build_quote_plan(
            &cfg,
            &constraints(),
            &snapshot(),
            &funding(0.0005),
            -1.0,
            None,
        );
        if let Some(bid) = plan.bid {
            assert!(bid.price <= 1000.0);
        }
        if let Some(ask) = plan.ask {
            assert!(ask.price >= 1000.2);
        }
    }
}
