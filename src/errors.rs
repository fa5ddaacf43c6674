use thiserror::Error;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by an exchange gateway after its own bounded retries.
///
/// The taxonomy follows handling policy rather than transport detail: the
/// OMS reacts to the category, never to venue-specific codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport failure with the request outcome unknown (timeout, dropped
    /// connection mid-flight). The OMS must reconcile by client id.
    #[error("transport error, outcome unknown: {0}")]
    Transport(String),
    /// Request timed out after the configured upper bound.
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    /// Venue rejected the request. `structural` rejects (bad symbol, bad
    /// tick, permission, position-mode) halt the engine; the rest count
    /// toward the reject streak.
    #[error("order rejected: {reason} (code {code})")]
    Rejected {
        code: String,
        reason: String,
        structural: bool,
    },
    /// Response arrived but could not be interpreted.
    #[error("malformed venue response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// True when the request may or may not have reached the venue, so the
    /// order state must be treated as unknown.
    pub fn is_state_unknown(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Timeout(_))
    }

    pub fn is_structural_reject(&self) -> bool {
        matches!(self, GatewayError::Rejected { structural: true, .. })
    }
}

/// Engine-level failures that end the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("constraints missing for {0} at startup")]
    ConstraintsMissing(&'static str),
    #[error("position mode mismatch: venue reports {current:?}, expected {expected:?}")]
    PositionModeMismatch { current: String, expected: String },
    #[error("order registry inconsistent: {0}")]
    RegistryInconsistent(String),
    #[error("halted: {0}")]
    Halted(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
