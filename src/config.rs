use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Engine configuration, loaded from a TOML file with `DELTAMM_*`
/// environment overrides applied on top.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub symbol: String,

    // Quoting
    #[serde(default = "default_tick_sec")]
    pub tick_sec: f64,
    pub quote_qty: f64,
    #[serde(default = "default_base_half_spread_bps")]
    pub base_half_spread_bps: f64,
    #[serde(default = "default_k_obi")]
    pub k_obi: f64,
    #[serde(default = "default_inventory_skew_bps")]
    pub inventory_skew_bps: f64,
    #[serde(default = "default_funding_skew_bps")]
    pub funding_skew_bps: f64,
    #[serde(default = "default_min_abs_funding")]
    pub min_abs_funding: f64,
    #[serde(default = "default_replace_threshold_bps")]
    pub replace_threshold_bps: f64,
    #[serde(default = "default_obi_levels")]
    pub obi_levels: usize,

    // Hedging
    #[serde(default = "default_hedge_slip_bps")]
    pub hedge_slip_bps: f64,
    #[serde(default = "default_hedge_chase_sec")]
    pub hedge_chase_sec: f64,
    #[serde(default = "default_hedge_max_tries")]
    pub hedge_max_tries: u32,
    #[serde(default = "default_hedge_deadline_ms")]
    pub hedge_deadline_ms: u64,
    #[serde(default = "default_chase_gain")]
    pub chase_gain: f64,

    // Risk
    #[serde(default = "default_book_stale_sec")]
    pub book_stale_sec: f64,
    #[serde(default = "default_funding_stale_sec")]
    pub funding_stale_sec: f64,
    #[serde(default = "default_funding_poll_sec")]
    pub funding_poll_sec: f64,
    #[serde(default = "default_max_unhedged_notional")]
    pub max_unhedged_notional: f64,
    #[serde(default = "default_max_unhedged_sec")]
    pub max_unhedged_sec: f64,
    #[serde(default = "default_reject_streak_halt")]
    pub reject_streak_halt: u32,
    #[serde(default = "default_controlled_reconnect_grace_sec")]
    pub controlled_reconnect_grace_sec: f64,
    #[serde(default)]
    pub cooldown_sec: f64,

    // Account
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_expected_position_mode")]
    pub expected_position_mode: String,
    #[serde(default = "default_true")]
    pub auto_set_position_mode: bool,

    // Logging
    #[serde(default = "default_log_path")]
    pub log_path: String,

    // Synthetic fills for exercising the hedge path without venue state.
    // Off by default; events carry `simulated=true` in the log.
    #[serde(default)]
    pub simulate_fills: bool,
    #[serde(default = "default_simulate_fill_interval_sec")]
    pub simulate_fill_interval_sec: f64,
    #[serde(default)]
    pub simulate_fill_qty: f64,
    #[serde(default = "default_simulate_fill_side")]
    pub simulate_fill_side: String,
}

fn default_true() -> bool {
    true
}

fn default_tick_sec() -> f64 {
    0.25
}

fn default_base_half_spread_bps() -> f64 {
    2.0
}

fn default_k_obi() -> f64 {
    0.8
}

fn default_inventory_skew_bps() -> f64 {
    1.0
}

fn default_funding_skew_bps() -> f64 {
    0.6
}

fn default_min_abs_funding() -> f64 {
    0.00002
}

fn default_replace_threshold_bps() -> f64 {
    0.2
}

fn default_obi_levels() -> usize {
    5
}

fn default_hedge_slip_bps() -> f64 {
    5.0
}

fn default_hedge_chase_sec() -> f64 {
    1.0
}

fn default_hedge_max_tries() -> u32 {
    2
}

fn default_hedge_deadline_ms() -> u64 {
    1500
}

fn default_chase_gain() -> f64 {
    1.0
}

fn default_book_stale_sec() -> f64 {
    2.0
}

fn default_funding_stale_sec() -> f64 {
    120.0
}

fn default_funding_poll_sec() -> f64 {
    30.0
}

fn default_max_unhedged_notional() -> f64 {
    200.0
}

fn default_max_unhedged_sec() -> f64 {
    2.0
}

fn default_reject_streak_halt() -> u32 {
    3
}

fn default_controlled_reconnect_grace_sec() -> f64 {
    3.0
}

fn default_expected_position_mode() -> String {
    "one_way_mode".to_string()
}

fn default_log_path() -> String {
    "logs/deltamm.jsonl".to_string()
}

fn default_simulate_fill_interval_sec() -> f64 {
    5.0
}

fn default_simulate_fill_side() -> String {
    "both".to_string()
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        let mut raw: toml::Value = toml::from_str(&data).with_context(|| "Failed to parse TOML config")?;
        // Support a nested [engine] table or top-level entries.
        let table = if let Some(table) = raw.get_mut("engine").and_then(|v| v.as_table_mut()).cloned() {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid engine config structure"))?
        };
        let mut cfg: EngineConfig = toml::from_str(&toml::to_string(&table)?)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("DELTAMM_SYMBOL") {
            if !value.is_empty() {
                self.symbol = value;
            }
        }
        override_f64("DELTAMM_TICK_SEC", &mut self.tick_sec);
        override_f64("DELTAMM_QUOTE_QTY", &mut self.quote_qty);
        override_f64("DELTAMM_BASE_HALF_SPREAD_BPS", &mut self.base_half_spread_bps);
        override_f64("DELTAMM_K_OBI", &mut self.k_obi);
        override_f64("DELTAMM_INVENTORY_SKEW_BPS", &mut self.inventory_skew_bps);
        override_f64("DELTAMM_FUNDING_SKEW_BPS", &mut self.funding_skew_bps);
        override_f64("DELTAMM_MIN_ABS_FUNDING", &mut self.min_abs_funding);
        override_f64("DELTAMM_REPLACE_THRESHOLD_BPS", &mut self.replace_threshold_bps);
        override_usize("DELTAMM_OBI_LEVELS", &mut self.obi_levels);
        override_f64("DELTAMM_HEDGE_SLIP_BPS", &mut self.hedge_slip_bps);
        override_f64("DELTAMM_HEDGE_CHASE_SEC", &mut self.hedge_chase_sec);
        override_u32("DELTAMM_HEDGE_MAX_TRIES", &mut self.hedge_max_tries);
        override_u64("DELTAMM_HEDGE_DEADLINE_MS", &mut self.hedge_deadline_ms);
        override_f64("DELTAMM_CHASE_GAIN", &mut self.chase_gain);
        override_f64("DELTAMM_BOOK_STALE_SEC", &mut self.book_stale_sec);
        override_f64("DELTAMM_FUNDING_STALE_SEC", &mut self.funding_stale_sec);
        override_f64("DELTAMM_FUNDING_POLL_SEC", &mut self.funding_poll_sec);
        override_f64("DELTAMM_MAX_UNHEDGED_NOTIONAL", &mut self.max_unhedged_notional);
        override_f64("DELTAMM_MAX_UNHEDGED_SEC", &mut self.max_unhedged_sec);
        override_u32("DELTAMM_REJECT_STREAK_HALT", &mut self.reject_streak_halt);
        override_f64(
            "DELTAMM_CONTROLLED_RECONNECT_GRACE_SEC",
            &mut self.controlled_reconnect_grace_sec,
        );
        override_f64("DELTAMM_COOLDOWN_SEC", &mut self.cooldown_sec);
        override_bool("DELTAMM_DRY_RUN", &mut self.dry_run);
        if let Ok(value) = env::var("DELTAMM_EXPECTED_POSITION_MODE") {
            if !value.is_empty() {
                self.expected_position_mode = value;
            }
        }
        override_bool("DELTAMM_AUTO_SET_POSITION_MODE", &mut self.auto_set_position_mode);
        if let Ok(value) = env::var("DELTAMM_LOG_PATH") {
            if !value.is_empty() {
                self.log_path = value;
            }
        }
        override_bool("DELTAMM_SIMULATE_FILLS", &mut self.simulate_fills);
        override_f64(
            "DELTAMM_SIMULATE_FILL_INTERVAL_SEC",
            &mut self.simulate_fill_interval_sec,
        );
        override_f64("DELTAMM_SIMULATE_FILL_QTY", &mut self.simulate_fill_qty);
        if let Ok(value) = env::var("DELTAMM_SIMULATE_FILL_SIDE") {
            if !value.is_empty() {
                self.simulate_fill_side = value;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.symbol.is_empty(), "symbol must be set");
        anyhow::ensure!(self.tick_sec > 0.0, "tick_sec must be positive");
        anyhow::ensure!(self.quote_qty > 0.0, "quote_qty must be positive");
        anyhow::ensure!(
            self.base_half_spread_bps > 0.0,
            "base_half_spread_bps must be positive"
        );
        anyhow::ensure!(self.min_abs_funding >= 0.0, "min_abs_funding must be non-negative");
        anyhow::ensure!(
            self.replace_threshold_bps >= 0.0,
            "replace_threshold_bps must be non-negative"
        );
        anyhow::ensure!(
            (1..=50).contains(&self.obi_levels),
            "obi_levels must be between 1 and 50"
        );
        anyhow::ensure!(self.hedge_slip_bps >= 0.0, "hedge_slip_bps must be non-negative");
        anyhow::ensure!(self.hedge_chase_sec > 0.0, "hedge_chase_sec must be positive");
        anyhow::ensure!(self.hedge_deadline_ms > 0, "hedge_deadline_ms must be positive");
        anyhow::ensure!(self.chase_gain >= 0.0, "chase_gain must be non-negative");
        anyhow::ensure!(self.book_stale_sec > 0.0, "book_stale_sec must be positive");
        anyhow::ensure!(self.funding_stale_sec > 0.0, "funding_stale_sec must be positive");
        anyhow::ensure!(self.funding_poll_sec > 0.0, "funding_poll_sec must be positive");
        anyhow::ensure!(
            self.max_unhedged_notional > 0.0,
            "max_unhedged_notional must be positive"
        );
        anyhow::ensure!(self.max_unhedged_sec > 0.0, "max_unhedged_sec must be positive");
        anyhow::ensure!(self.reject_streak_halt > 0, "reject_streak_halt must be positive");
        anyhow::ensure!(
            matches!(self.simulate_fill_side.as_str(), "buy" | "sell" | "both"),
            "simulate_fill_side must be buy, sell or both"
        );
        Ok(())
    }

    /// Quantity used by the synthetic-fill loop; falls back to the quote
    /// size when unset.
    pub fn simulate_qty(&self) -> f64 {
        if self.simulate_fill_qty > 0.0 {
            self.simulate_fill_qty
        } else {
            self.quote_qty
        }
    }
}

fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

fn override_u32(key: &str, field: &mut u32) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u32>() {
            *field = parsed;
        }
    }
}

fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}

fn override_usize(key: &str, field: &mut usize) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<usize>() {
            *field = parsed;
        }
    }
}

fn override_bool(key: &str, field: &mut bool) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<bool>() {
            *field = parsed;
        }
    }
}
