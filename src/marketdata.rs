use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::{
    gateway::{BookChannel, DepthUpdate},
    types::{Bbo, BookLevel, Leg},
};

const OBI_EPS: f64 = 1e-12;

/// Normalized view of both legs used by the strategy each tick.
#[derive(Clone, Debug, PartialEq)]
pub struct MarketSnapshot {
    pub spot: Bbo,
    pub perp: Bbo,
    pub perp_bids: Vec<BookLevel>,
    pub perp_asks: Vec<BookLevel>,
    /// Signed near-touch size imbalance over `levels_used`, in [-1, +1].
    pub obi: f64,
    /// Depth actually contributing to OBI; shrinks on the fallback channel.
    pub levels_used: usize,
    /// True when either leg is currently served by the single-level channel.
    pub fallback: bool,
    /// Timestamp of the most recent contributing update.
    pub ts_ms: i64,
}

impl MarketSnapshot {
    pub fn perp_mid(&self) -> f64 {
        self.perp.mid()
    }

    pub fn spot_mid(&self) -> f64 {
        self.spot.mid()
    }
}

#[derive(Clone, Debug)]
struct LegBook {
    channel: BookChannel,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    ts_ms: i64,
}

/// Per-leg book state with wholesale-replace semantics: every update
/// supersedes the stored levels for that leg, never patches them.
#[derive(Debug, Default)]
pub struct BookState {
    obi_levels: usize,
    spot: Option<LegBook>,
    perp: Option<LegBook>,
}

impl BookState {
    pub fn new(obi_levels: usize) -> Self {
        Self {
            obi_levels: obi_levels.max(1),
            spot: None,
            perp: None,
        }
    }

    pub fn apply(&mut self, update: DepthUpdate) {
        let book = LegBook {
            channel: update.channel,
            bids: update.bids,
            asks: update.asks,
            ts_ms: update.ts_ms,
        };
        match update.leg {
            Leg::Spot => self.spot = Some(book),
            Leg::Perp => self.perp = Some(book),
        }
    }

    pub fn last_update_ms(&self) -> Option<i64> {
        match (&self.spot, &self.perp) {
            (Some(s), Some(p)) => Some(s.ts_ms.max(p.ts_ms)),
            (Some(s), None) => Some(s.ts_ms),
            (None, Some(p)) => Some(p.ts_ms),
            (None, None) => None,
        }
    }

    /// Assembles the current snapshot, or `None` while either leg is missing
    /// or crossed (bid >= ask); crossed books are discarded wholesale.
    pub fn snapshot(&self) -> Option<MarketSnapshot> {
        let spot = self.spot.as_ref()?;
        let perp = self.perp.as_ref()?;
        let spot_bbo = top_of_book(spot)?;
        let perp_bbo = top_of_book(perp)?;
        if spot_bbo.bid >= spot_bbo.ask || perp_bbo.bid >= perp_bbo.ask {
            return None;
        }

        let levels_used = self
            .obi_levels
            .min(perp.bids.len().max(1))
            .min(perp.asks.len().max(1));
        let obi = imbalance(&perp.bids, &perp.asks, levels_used);

        Some(MarketSnapshot {
            spot: spot_bbo,
            perp: perp_bbo,
            perp_bids: perp.bids.iter().take(levels_used).copied().collect(),
            perp_asks: perp.asks.iter().take(levels_used).copied().collect(),
            obi,
            levels_used,
            fallback: spot.channel == BookChannel::Top || perp.channel == BookChannel::Top,
            ts_ms: spot.ts_ms.max(perp.ts_ms),
        })
    }
}

fn top_of_book(book: &LegBook) -> Option<Bbo> {
    let bid = book.bids.first()?;
    let ask = book.asks.first()?;
    if bid.price <= 0.0 || ask.price <= 0.0 {
        return None;
    }
    Some(Bbo {
        bid: bid.price,
        ask: ask.price,
        bid_size: bid.size,
        ask_size: ask.size,
        ts_ms: book.ts_ms,
    })
}

/// `(Σ bid sizes − Σ ask sizes) / (Σ bid + Σ ask + ε)` over `levels`,
/// clipped to [-1, +1]. The ε keeps a one-sided or empty book finite.
fn imbalance(bids: &[BookLevel], asks: &[BookLevel], levels: usize) -> f64 {
    let bid_qty: f64 = bids.iter().take(levels).map(|l| l.size).sum();
    let ask_qty: f64 = asks.iter().take(levels).map(|l| l.size).sum();
    let raw = (bid_qty - ask_qty) / (bid_qty + ask_qty + OBI_EPS);
    raw.clamp(-1.0, 1.0)
}

/// Drains depth updates into the book state and republishes the freshest
/// snapshot through a single-slot mailbox: readers always see the latest,
/// intermediate snapshots may be skipped.
pub fn spawn_normalizer(
    mut updates: mpsc::Receiver<DepthUpdate>,
    snapshots: watch::Sender<Option<MarketSnapshot>>,
    obi_levels: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = BookState::new(obi_levels);
        while let Some(update) = updates.recv().await {
            state.apply(update);
            match state.snapshot() {
                Some(snapshot) => {
                    let _ = snapshots.send_replace(Some(snapshot));
                }
                None => {
                    tracing::debug!("discarding unusable book state (missing or crossed)");
                }
            }
        }
        tracing::warn!("depth update stream closed");
    })
}
