use crate::config::EngineConfig;
use crate::types::Mode;

/// Guard thresholds, all in milliseconds/notional units so evaluation is a
/// pure comparison against the inputs of the current tick.
#[derive(Clone, Copy, Debug)]
pub struct GuardConfig {
    pub book_stale_ms: i64,
    pub funding_stale_ms: i64,
    pub max_unhedged_notional: f64,
    pub max_unhedged_ms: i64,
    pub reject_streak_halt: u32,
    pub reconnect_grace_ms: i64,
    pub cooldown_ms: i64,
}

impl GuardConfig {
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self {
            book_stale_ms: (cfg.book_stale_sec * 1000.0) as i64,
            funding_stale_ms: (cfg.funding_stale_sec * 1000.0) as i64,
            max_unhedged_notional: cfg.max_unhedged_notional,
            max_unhedged_ms: (cfg.max_unhedged_sec * 1000.0) as i64,
            reject_streak_halt: cfg.reject_streak_halt,
            reconnect_grace_ms: (cfg.controlled_reconnect_grace_sec * 1000.0) as i64,
            cooldown_ms: (cfg.cooldown_sec * 1000.0) as i64,
        }
    }
}

/// Everything the guard layer looks at on one tick.
#[derive(Clone, Copy, Debug)]
pub struct GuardInputs {
    pub now_ms: i64,
    pub snapshot_ts: Option<i64>,
    pub funding_ts: Option<i64>,
    pub constraints_ready: bool,
    pub unhedged_notional: f64,
    /// Age of the oldest unhedged ticket still open, if any.
    pub oldest_ticket_age_ms: Option<i64>,
    pub reject_streak: u32,
    pub private_down_since_ms: Option<i64>,
}

/// Outcome of a guard pass, ordered by severity. `Halt` is fail-closed and
/// terminal; `CancelAll` pulls quotes and may start a cooldown; `Block`
/// suppresses quoting for the tick without touching live state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardAction {
    Pass,
    Block(&'static str),
    CancelAll {
        reason: &'static str,
        unwind: bool,
    },
    Halt(&'static str),
}

/// Evaluates guard predicates every tick and owns the cooldown timer.
#[derive(Clone, Copy, Debug)]
pub struct RiskGuards {
    cfg: GuardConfig,
    cooldown_until_ms: i64,
}

impl RiskGuards {
    pub fn new(cfg: GuardConfig) -> Self {
        Self {
            cfg,
            cooldown_until_ms: 0,
        }
    }

    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        now_ms < self.cooldown_until_ms
    }

    pub fn set_cooldown(&mut self, now_ms: i64) {
        if self.cfg.cooldown_ms > 0 {
            self.cooldown_until_ms = now_ms + self.cfg.cooldown_ms;
        }
    }

    /// Most severe applicable action wins; softer conditions are not even
    /// reported once a harder one fires.
    pub fn evaluate(&self, inputs: &GuardInputs) -> GuardAction {
        if inputs.reject_streak >= self.cfg.reject_streak_halt {
            return GuardAction::Halt("reject_streak");
        }
        if let Some(down_since) = inputs.private_down_since_ms {
            if inputs.now_ms - down_since > self.cfg.reconnect_grace_ms {
                return GuardAction::Halt("private_ws_down");
            }
        }

        match inputs.snapshot_ts {
            None => return GuardAction::CancelAll { reason: "no_book", unwind: false },
            Some(ts) if inputs.now_ms - ts > self.cfg.book_stale_ms => {
                return GuardAction::CancelAll { reason: "book_stale", unwind: false };
            }
            _ => {}
        }
        match inputs.funding_ts {
            None => return GuardAction::CancelAll { reason: "no_funding", unwind: false },
            Some(ts) if inputs.now_ms - ts > self.cfg.funding_stale_ms => {
                return GuardAction::CancelAll { reason: "funding_stale", unwind: false };
            }
            _ => {}
        }

        if inputs.unhedged_notional > self.cfg.max_unhedged_notional {
            return GuardAction::CancelAll { reason: "unhedged_notional", unwind: true };
        }
        if let Some(age) = inputs.oldest_ticket_age_ms {
            if age > self.cfg.max_unhedged_ms {
                return GuardAction::CancelAll { reason: "unhedged_timeout", unwind: true };
            }
        }

        if self.in_cooldown(inputs.now_ms) {
            return GuardAction::Block("cooldown");
        }
        if !inputs.constraints_ready {
            return GuardAction::Block("constraints_missing");
        }
        GuardAction::Pass
    }
}

/// Mode state machine. All transitions flow through `transition` so the
/// orchestrator can log every `mode_change`; `Halted` is absorbing.
#[derive(Clone, Copy, Debug)]
pub struct ModeMachine {
    mode: Mode,
}

impl ModeMachine {
    pub fn new() -> Self {
        Self { mode: Mode::Idle }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_halted(&self) -> bool {
        self.mode == Mode::Halted
    }

    /// Applies a transition, returning `(from, to)` when the mode actually
    /// changed. Requests to leave `Halted` are ignored.
    pub fn transition(&mut self, to: Mode) -> Option<(Mode, Mode)> {
        if self.mode == Mode::Halted || self.mode == to {
            return None;
        }
        let from = self.mode;
        self.mode = to;
        Some((from, to))
    }
}

impl Default for ModeMachine {
    fn default() -> Self {
        Self::new()
    }
}
