use crate::types::{Leg, Side};

/// Signed base positions per leg, maintained as a running sum over fills.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Inventory {
    pub perp_pos: f64,
    pub spot_pos: f64,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_fill(&mut self, leg: Leg, side: Side, qty: f64) {
        let delta = side.sign() * qty;
        match leg {
            Leg::Perp => self.perp_pos += delta,
            Leg::Spot => self.spot_pos += delta,
        }
    }

    /// Net signed exposure to the base asset across both legs.
    pub fn net(&self) -> f64 {
        self.perp_pos + self.spot_pos
    }

    pub fn unhedged_notional(&self, mid: f64) -> f64 {
        self.net().abs() * mid
    }

    /// Flat within half a size step, the same tolerance hedge tickets use.
    pub fn is_flat(&self, size_step: f64) -> bool {
        self.net().abs() <= size_step * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_accumulate_signed() {
        let mut inv = Inventory::new();
        inv.apply_fill(Leg::Perp, Side::Buy, 0.05);
        inv.apply_fill(Leg::Spot, Side::Sell, 0.05);
        assert_eq!(inv.perp_pos, 0.05);
        assert_eq!(inv.spot_pos, -0.05);
        assert!(inv.net().abs() < 1e-12);
        assert!(inv.is_flat(0.001));
    }

    #[test]
    fn unhedged_notional_uses_net() {
        let mut inv = Inventory::new();
        inv.apply_fill(Leg::Perp, Side::Sell, 0.08);
        inv.apply_fill(Leg::Spot, Side::Buy, 0.05);
        assert!((inv.net() + 0.03).abs() < 1e-12);
        assert!((inv.unhedged_notional(1000.0) - 30.0).abs() < 1e-9);
        assert!(!inv.is_flat(0.001));
    }
}
