//! Retry ladder: deterministic mapping from a failed attempt's primary reason
//! code to the next corrective action, with escalation rules that terminate a
//! frame when the oracle is visibly stuck (identity collapse, oscillation,
//! attempt budget, exhausted ladder).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::codes::ReasonCode;
use crate::state::FrameStatus;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    RerollSeed,
    IdentityRescue,
    ReAnchor,
    TightenNegative,
    PostProcessOnly,
    DefaultRegenerate,
}

impl RetryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryAction::RerollSeed => "reroll_seed",
            RetryAction::IdentityRescue => "identity_rescue",
            RetryAction::ReAnchor => "re_anchor",
            RetryAction::TightenNegative => "tighten_negative",
            RetryAction::PostProcessOnly => "post_process_only",
            RetryAction::DefaultRegenerate => "default_regenerate",
        }
    }

    /// Actions that re-assert the anchor; two of these in a row with low
    /// identity scores signal collapse.
    pub fn reasserts_anchor(&self) -> bool {
        matches!(self, RetryAction::ReAnchor | RetryAction::IdentityRescue)
    }
}

/// Escalation order for a primary reason code. Codes outside the table (hard
/// gates, generator failures) regenerate with fresh entropy.
pub fn escalation_for(code: ReasonCode) -> &'static [RetryAction] {
    match code {
        ReasonCode::Sf01IdentityDrift => &[
            RetryAction::RerollSeed,
            RetryAction::IdentityRescue,
            RetryAction::ReAnchor,
            RetryAction::DefaultRegenerate,
        ],
        ReasonCode::Sf02PaletteDrift => &[
            RetryAction::TightenNegative,
            RetryAction::RerollSeed,
            RetryAction::ReAnchor,
        ],
        ReasonCode::Sf03BaselineDrift => {
            &[RetryAction::PostProcessOnly, RetryAction::RerollSeed]
        }
        ReasonCode::Sf04TemporalIncoherence => {
            &[RetryAction::RerollSeed, RetryAction::IdentityRescue]
        }
        ReasonCode::SfPixelNoise | ReasonCode::SfAlphaHalo => &[
            RetryAction::PostProcessOnly,
            RetryAction::DefaultRegenerate,
        ],
        _ => &[RetryAction::RerollSeed, RetryAction::DefaultRegenerate],
    }
}

/// Outcome of consulting the ladder after a failed attempt.
#[derive(Clone, PartialEq, Debug)]
pub enum RetryDecision {
    Retry(RetryAction),
    Terminate {
        code: ReasonCode,
        status: FrameStatus,
    },
}

/// One attempt's worth of evidence for the ladder.
#[derive(Clone, PartialEq, Debug)]
pub struct AttemptEvidence {
    pub passed: bool,
    pub primary_reason: Option<ReasonCode>,
    pub identity_score: Option<f64>,
}

/// Per-frame ladder state. Reset for every new frame.
#[derive(Clone, Debug, Default)]
pub struct LadderState {
    actions_tried: Vec<RetryAction>,
    consecutive_reanchor_count: u32,
    /// Most recent SF01 scores, newest last (capacity 5).
    sf01_scores: VecDeque<f64>,
    /// Most recent pass/fail results, newest last (capacity 6).
    results: VecDeque<bool>,
}

const SF01_RING: usize = 5;
const RESULT_RING: usize = 6;

impl LadderState {
    pub fn new() -> LadderState {
        LadderState::default()
    }

    pub fn actions_tried(&self) -> &[RetryAction] {
        &self.actions_tried
    }

    /// Record an attempt's outcome before deciding what to do next.
    pub fn record(&mut self, evidence: &AttemptEvidence) {
        if self.results.len() == RESULT_RING {
            self.results.pop_front();
        }
        self.results.push_back(evidence.passed);
        if let Some(s) = evidence.identity_score {
            if self.sf01_scores.len() == SF01_RING {
                self.sf01_scores.pop_front();
            }
            self.sf01_scores.push_back(s);
        }
    }

    /// Choose the next corrective action or terminate the frame.
    ///
    /// `attempts_made` is the number of attempts already recorded for this
    /// frame; the ladder refuses to start attempt `max_attempts + 1`.
    pub fn decide(
        &mut self,
        evidence: &AttemptEvidence,
        attempts_made: u32,
        max_attempts: u32,
    ) -> RetryDecision {
        // Escalation checks run before the mapping.
        if self.identity_collapsed() {
            return RetryDecision::Terminate {
                code: ReasonCode::HfIdentityCollapse,
                status: FrameStatus::Rejected,
            };
        }
        if self.oscillating() {
            return RetryDecision::Terminate {
                code: ReasonCode::OscillationDetected,
                status: FrameStatus::Rejected,
            };
        }
        if attempts_made >= max_attempts {
            return RetryDecision::Terminate {
                code: ReasonCode::HfMaxAttempts,
                status: FrameStatus::Failed,
            };
        }

        let primary = evidence
            .primary_reason
            .unwrap_or(ReasonCode::SysUnknownError);
        let ladder = escalation_for(primary);
        let next = ladder
            .iter()
            .copied()
            .find(|a| !self.actions_tried.contains(a));
        match next {
            Some(action) => {
                self.actions_tried.push(action);
                if action.reasserts_anchor() {
                    self.consecutive_reanchor_count += 1;
                } else {
                    self.consecutive_reanchor_count = 0;
                }
                RetryDecision::Retry(action)
            }
            None => RetryDecision::Terminate {
                code: ReasonCode::LadderExhausted,
                status: FrameStatus::Failed,
            },
        }
    }

    /// Two consecutive anchor re-assertions whose identity scores both stayed
    /// below 0.9: the oracle has lost the character.
    fn identity_collapsed(&self) -> bool {
        if self.consecutive_reanchor_count < 2 {
            return false;
        }
        let n = self.sf01_scores.len();
        if n < 2 {
            return false;
        }
        self.sf01_scores[n - 1] < 0.9 && self.sf01_scores[n - 2] < 0.9
    }

    /// Last four results strictly alternating pass/fail.
    fn oscillating(&self) -> bool {
        let n = self.results.len();
        if n < 4 {
            return false;
        }
        let tail: Vec<bool> = self.results.iter().copied().skip(n - 4).collect();
        tail[0] != tail[1] && tail[1] != tail[2] && tail[2] != tail[3]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(reason: ReasonCode, sf01: Option<f64>) -> AttemptEvidence {
        AttemptEvidence {
            passed: false,
            primary_reason: Some(reason),
            identity_score: sf01,
        }
    }

    #[test]
    fn test_identity_escalation_order() {
        let mut st = LadderState::new();
        let ev = fail(ReasonCode::Sf01IdentityDrift, Some(0.78));
        st.record(&ev);
        assert_eq!(
            st.decide(&ev, 1, 5),
            RetryDecision::Retry(RetryAction::RerollSeed)
        );
        st.record(&ev);
        assert_eq!(
            st.decide(&ev, 2, 5),
            RetryDecision::Retry(RetryAction::IdentityRescue)
        );
        st.record(&ev);
        assert_eq!(
            st.decide(&ev, 3, 5),
            RetryDecision::Retry(RetryAction::ReAnchor)
        );
    }

    #[test]
    fn test_baseline_prefers_post_process() {
        let mut st = LadderState::new();
        let ev = fail(ReasonCode::Sf03BaselineDrift, None);
        st.record(&ev);
        assert_eq!(
            st.decide(&ev, 1, 5),
            RetryDecision::Retry(RetryAction::PostProcessOnly)
        );
    }

    #[test]
    fn test_identity_collapse_terminates_rejected() {
        let mut st = LadderState::new();
        // Walk the ladder until two anchor re-assertions are in play.
        let ev = fail(ReasonCode::Sf01IdentityDrift, Some(0.80));
        st.record(&ev);
        assert!(matches!(st.decide(&ev, 1, 9), RetryDecision::Retry(_))); // reroll
        st.record(&ev);
        assert_eq!(
            st.decide(&ev, 2, 9),
            RetryDecision::Retry(RetryAction::IdentityRescue)
        );
        let ev2 = fail(ReasonCode::Sf01IdentityDrift, Some(0.82));
        st.record(&ev2);
        assert_eq!(
            st.decide(&ev2, 3, 9),
            RetryDecision::Retry(RetryAction::ReAnchor)
        );
        let ev3 = fail(ReasonCode::Sf01IdentityDrift, Some(0.80));
        st.record(&ev3);
        assert_eq!(
            st.decide(&ev3, 4, 9),
            RetryDecision::Terminate {
                code: ReasonCode::HfIdentityCollapse,
                status: FrameStatus::Rejected,
            }
        );
    }

    #[test]
    fn test_max_attempts_fires_at_limit() {
        let mut st = LadderState::new();
        let ev = fail(ReasonCode::Sf02PaletteDrift, None);
        st.record(&ev);
        assert_eq!(
            st.decide(&ev, 5, 5),
            RetryDecision::Terminate {
                code: ReasonCode::HfMaxAttempts,
                status: FrameStatus::Failed,
            }
        );
    }

    #[test]
    fn test_ladder_exhausted_when_all_actions_tried() {
        let mut st = LadderState::new();
        let ev = fail(ReasonCode::Sf03BaselineDrift, None);
        st.record(&ev);
        assert!(matches!(st.decide(&ev, 1, 10), RetryDecision::Retry(_)));
        st.record(&ev);
        assert!(matches!(st.decide(&ev, 2, 10), RetryDecision::Retry(_)));
        st.record(&ev);
        assert_eq!(
            st.decide(&ev, 3, 10),
            RetryDecision::Terminate {
                code: ReasonCode::LadderExhausted,
                status: FrameStatus::Failed,
            }
        );
    }

    #[test]
    fn test_oscillation_detected() {
        let mut st = LadderState::new();
        for passed in [true, false, true, false] {
            st.record(&AttemptEvidence {
                passed,
                primary_reason: (!passed).then_some(ReasonCode::Sf02PaletteDrift),
                identity_score: None,
            });
        }
        let ev = fail(ReasonCode::Sf02PaletteDrift, None);
        assert_eq!(
            st.decide(&ev, 4, 10),
            RetryDecision::Terminate {
                code: ReasonCode::OscillationDetected,
                status: FrameStatus::Rejected,
            }
        );
    }

    #[test]
    fn test_reanchor_counter_resets_on_other_action() {
        let mut st = LadderState::new();
        let idn = fail(ReasonCode::Sf01IdentityDrift, Some(0.80));
        st.record(&idn);
        let _ = st.decide(&idn, 1, 10); // reroll_seed
        st.record(&idn);
        let _ = st.decide(&idn, 2, 10); // identity_rescue -> count 1
        assert_eq!(st.consecutive_reanchor_count, 1);
        let base = fail(ReasonCode::Sf03BaselineDrift, None);
        st.record(&base);
        let d = st.decide(&base, 3, 10); // post_process_only resets
        assert_eq!(d, RetryDecision::Retry(RetryAction::PostProcessOnly));
        assert_eq!(st.consecutive_reanchor_count, 0);
    }
}
