//! Stop-condition evaluator: runs after every frame's terminal transition and
//! decides whether the run should halt. Conditions are checked in a fixed
//! priority; the first to trigger becomes the stop reason.

use crate::codes::ReasonCode;
use crate::manifest::StopThresholds;
use crate::state::RunState;

/// Snapshot of the numbers behind a stop decision, kept for diagnostics.
#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct StopMetrics {
    pub retry_rate: f64,
    pub reject_rate: f64,
    pub consecutive_fails: u32,
    pub total_attempts: u32,
}

impl StopMetrics {
    pub fn from_state(state: &RunState) -> StopMetrics {
        StopMetrics {
            retry_rate: state.retry_rate(),
            reject_rate: state.reject_rate(),
            consecutive_fails: state.consecutive_fails(),
            total_attempts: state.total_attempts(),
        }
    }
}

pub struct StopEvaluator {
    thresholds: StopThresholds,
}

impl StopEvaluator {
    pub fn new(thresholds: StopThresholds) -> StopEvaluator {
        StopEvaluator { thresholds }
    }

    pub fn thresholds(&self) -> &StopThresholds {
        &self.thresholds
    }

    /// Priority: CIRCUIT_BREAKER > CONSECUTIVE_FAILS > REJECT_RATE >
    /// RETRY_RATE > USER_INTERRUPT.
    pub fn evaluate(&self, state: &RunState, abort_requested: bool) -> Option<ReasonCode> {
        let m = StopMetrics::from_state(state);
        let t = &self.thresholds;
        if m.total_attempts >= t.circuit_breaker_limit {
            return Some(ReasonCode::CircuitBreaker);
        }
        if m.consecutive_fails >= t.max_consecutive_fails {
            return Some(ReasonCode::ConsecutiveFails);
        }
        if m.reject_rate > t.max_reject_rate {
            return Some(ReasonCode::RejectRateExceeded);
        }
        if m.retry_rate > t.max_retry_rate {
            return Some(ReasonCode::RetryRateExceeded);
        }
        if abort_requested {
            return Some(ReasonCode::UserInterrupt);
        }
        None
    }
}
