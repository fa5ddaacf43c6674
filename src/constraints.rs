use crate::types::Leg;

/// Exchange trading rules for one instrument, loaded once at startup and
/// immutable afterwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstrumentConstraints {
    pub price_tick: f64,
    pub size_step: f64,
    pub min_size: f64,
    pub min_notional: f64,
}

// Tolerance for float division landing a hair under the exact multiple.
const STEP_EPS: f64 = 1e-9;

impl InstrumentConstraints {
    pub fn is_ready(&self) -> bool {
        self.price_tick > 0.0 && self.size_step > 0.0 && self.min_size > 0.0
    }

    pub fn round_price_down(&self, price: f64) -> f64 {
        if self.price_tick <= 0.0 {
            return price;
        }
        (price / self.price_tick + STEP_EPS).floor() * self.price_tick
    }

    pub fn round_price_up(&self, price: f64) -> f64 {
        if self.price_tick <= 0.0 {
            return price;
        }
        (price / self.price_tick - STEP_EPS).ceil() * self.price_tick
    }

    pub fn round_size_down(&self, size: f64) -> f64 {
        if self.size_step <= 0.0 {
            return size;
        }
        (size / self.size_step + STEP_EPS).floor() * self.size_step
    }

    pub fn validate(&self, price: f64, size: f64) -> bool {
        if size < self.min_size {
            return false;
        }
        if self.min_notional > 0.0 && price * size < self.min_notional {
            return false;
        }
        true
    }
}

/// Per-leg constraints registry queried by the OMS for rounding and
/// validation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstraintsStore {
    spot: Option<InstrumentConstraints>,
    perp: Option<InstrumentConstraints>,
}

impl ConstraintsStore {
    pub fn set(&mut self, leg: Leg, constraints: InstrumentConstraints) {
        match leg {
            Leg::Spot => self.spot = Some(constraints),
            Leg::Perp => self.perp = Some(constraints),
        }
    }

    pub fn get(&self, leg: Leg) -> Option<&InstrumentConstraints> {
        match leg {
            Leg::Spot => self.spot.as_ref(),
            Leg::Perp => self.perp.as_ref(),
        }
    }

    pub fn ready(&self) -> bool {
        matches!((&self.spot, &self.perp), (Some(s), Some(p)) if s.is_ready() && p.is_ready())
    }
}
