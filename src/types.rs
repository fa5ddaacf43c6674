use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Instrument leg a request or event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    Spot,
    Perp,
}

impl Leg {
    pub fn as_str(self) -> &'static str {
        match self {
            Leg::Spot => "spot",
            Leg::Perp => "perp",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells, applied to base quantities.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

/// Abstract time-in-force. The venue-specific parameter naming
/// (`timeInForceValue` on the perp API, `force` on spot) is the gateway's
/// concern; the core only speaks these three.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    PostOnly,
    Ioc,
    Gtc,
}

impl Tif {
    pub fn as_str(self) -> &'static str {
        match self {
            Tif::PostOnly => "post_only",
            Tif::Ioc => "ioc",
            Tif::Gtc => "gtc",
        }
    }
}

/// Why an order exists. First segment of every client order id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Quote,
    Hedge,
    Unwind,
    Flatten,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Quote => "quote",
            Intent::Hedge => "hedge",
            Intent::Unwind => "unwind",
            Intent::Flatten => "flatten",
        }
    }

    pub const ALL: [Intent; 4] = [Intent::Quote, Intent::Hedge, Intent::Unwind, Intent::Flatten];
}

/// Order placement slot, second segment of every client order id and the
/// `leg` field of structured log records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderLeg {
    PerpBid,
    PerpAsk,
    SpotIoc,
    PerpUnwind,
    SpotUnwind,
}

impl OrderLeg {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderLeg::PerpBid => "perp_bid",
            OrderLeg::PerpAsk => "perp_ask",
            OrderLeg::SpotIoc => "spot_ioc",
            OrderLeg::PerpUnwind => "perp_unwind",
            OrderLeg::SpotUnwind => "spot_unwind",
        }
    }

    pub fn leg(self) -> Leg {
        match self {
            OrderLeg::PerpBid | OrderLeg::PerpAsk | OrderLeg::PerpUnwind => Leg::Perp,
            OrderLeg::SpotIoc | OrderLeg::SpotUnwind => Leg::Spot,
        }
    }
}

/// Engine lifecycle mode. `Halted` is absorbing: only an operator restart
/// leaves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Idle,
    Quoting,
    Hedging,
    Cooldown,
    Halted,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Idle => "IDLE",
            Mode::Quoting => "QUOTING",
            Mode::Hedging => "HEDGING",
            Mode::Cooldown => "COOLDOWN",
            Mode::Halted => "HALTED",
        }
    }
}

/// One price level of a depth snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Best bid/offer with sizes and the timestamp of the contributing update.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bbo {
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub ts_ms: i64,
}

impl Bbo {
    pub fn mid(&self) -> f64 {
        0.5 * (self.bid + self.ask)
    }
}

/// Latest funding observation. `ts_ms` advances only on successful polls.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundingState {
    pub rate: f64,
    pub ts_ms: i64,
    pub next_settle_ms: Option<i64>,
}

/// Fully resolved fill after client-id reconstruction, ready for dedupe and
/// inventory application.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedFill {
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

impl NormalizedFill {
    /// Replay-suppression key: `(leg, trade_id)` when the venue supplies a
    /// trade id, otherwise a composite of the order id and fill terms.
    pub fn dedupe_key(&self) -> String {
        match &self.trade_id {
            Some(trade_id) if !trade_id.is_empty() => {
                format!("{}:{}", self.leg.as_str(), trade_id)
            }
            _ => format!(
                "{}:{}:{}:{}:{}",
                self.leg.as_str(),
                self.exch_order_id,
                self.ts_ms,
                self.price,
                self.qty
            ),
        }
    }
}

/// Builds a client order id of the shape `{intent}-{leg}-{cycle}-{nonce}`.
///
/// The cycle counter is rendered as fixed-width hex and the nonce is a short
/// random suffix, keeping ids under the 36-character venue limit while
/// staying collision-free across restarts.
pub fn new_client_id(intent: Intent, leg: OrderLeg, cycle: u64) -> String {
    let nonce: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!(
        "{}-{}-{:08x}-{:06x}",
        intent.as_str(),
        leg.as_str(),
        cycle & 0xFFFF_FFFF,
        nonce
    )
}

/// Intent prefix parse, used to route fills and to recognize our own orders
/// when cancelling leftovers at startup.
pub fn client_id_intent(client_id: &str) -> Option<Intent> {
    Intent::ALL
        .into_iter()
        .find(|intent| is_prefixed(client_id, intent.as_str()))
}

fn is_prefixed(client_id: &str, prefix: &str) -> bool {
    client_id.len() > prefix.len()
        && client_id.starts_with(prefix)
        && client_id.as_bytes()[prefix.len()] == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_shape_and_length() {
        for intent in Intent::ALL {
            for leg in [
                OrderLeg::PerpBid,
                OrderLeg::PerpAsk,
                OrderLeg::SpotIoc,
                OrderLeg::PerpUnwind,
                OrderLeg::SpotUnwind,
            ] {
                let id = new_client_id(intent, leg, u64::MAX);
                assert!(id.len() <= 36, "{} is {} chars", id, id.len());
                assert_eq!(client_id_intent(&id), Some(intent));
            }
        }
    }

    #[test]
    fn client_id_intent_rejects_foreign_ids() {
        assert_eq!(client_id_intent("quoteX-perp_bid-0-0"), None);
        assert_eq!(client_id_intent("someoneelse-1234"), None);
        assert_eq!(client_id_intent(""), None);
        assert_eq!(client_id_intent("quote"), None);
    }

    #[test]
    fn dedupe_key_prefers_trade_id() {
        let mut fill = NormalizedFill {
            leg: Leg::Perp,
            side: Side::Buy,
            price: 1000.0,
            qty: 0.05,
            client_id: None,
            exch_order_id: "oid-1".into(),
            trade_id: Some("t-1".into()),
            fee: 0.0,
            ts_ms: 1,
            simulated: false,
        };
        assert_eq!(fill.dedupe_key(), "perp:t-1");
        fill.trade_id = None;
        assert_eq!(fill.dedupe_key(), "perp:oid-1:1:1000:0.05");
    }

    #[test]
    fn side_helpers() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.sign(), -1.0);
    }
}
