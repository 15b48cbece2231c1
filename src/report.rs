//! Reporter: derives the live status line, the completion summary and the
//! post-mortem diagnostic from a RunState. Pure functions over state; nothing
//! here mutates a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::codes::ReasonCode;
use crate::manifest::StopThresholds;
use crate::retry::RetryAction;
use crate::state::{FrameStatus, RunState, RunStatus};
use crate::stop::StopMetrics;

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub reason: ReasonCode,
    pub frames_approved: u32,
    pub total_frames: u32,
    pub total_attempts: u32,
    pub retry_rate: f64,
    pub reject_rate: f64,
    pub started_at: String,
    pub finished_at: String,
}

/// Overall reason code for a finished or running state.
pub fn overall_reason(state: &RunState) -> ReasonCode {
    match state.status {
        RunStatus::Completed => {
            if state.approved_count() == state.total_frames {
                ReasonCode::AllFramesApproved
            } else {
                ReasonCode::PartialSuccess
            }
        }
        RunStatus::Stopped | RunStatus::Failed => {
            state.stop_reason.unwrap_or(ReasonCode::SysUnknownError)
        }
        _ => ReasonCode::Generating,
    }
}

pub fn summarize(state: &RunState) -> RunSummary {
    RunSummary {
        run_id: state.run_id.clone(),
        status: state.status,
        reason: overall_reason(state),
        frames_approved: state.approved_count(),
        total_frames: state.total_frames,
        total_attempts: state.total_attempts(),
        retry_rate: state.retry_rate(),
        reject_rate: state.reject_rate(),
        started_at: state.started_at.clone(),
        finished_at: state.updated_at.clone(),
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct LiveStatus {
    pub status: String,
    pub reason: ReasonCode,
    pub fsm_state: Option<String>,
    pub frames_approved: u32,
    pub total_frames: u32,
    pub retry_rate: f64,
    pub reject_rate: f64,
    pub elapsed_ms: u64,
    /// Estimated remaining, from the observed mean per-frame time.
    pub eta_ms: Option<u64>,
    pub resume_command: Option<String>,
}

pub fn live_status(state: &RunState, fsm_state: Option<&str>) -> LiveStatus {
    let status = match state.status {
        RunStatus::Completed => "completed",
        RunStatus::Stopped => "stopped",
        RunStatus::Failed => "failed",
        _ => "in-progress",
    };
    let elapsed_ms = elapsed_between(&state.started_at, &state.updated_at);
    let complete = state.frames_complete();
    let eta_ms = if complete > 0 && !state.status.is_terminal() {
        let per_frame = elapsed_ms / complete as u64;
        Some(per_frame * (state.total_frames - complete) as u64)
    } else {
        None
    };
    let recoverable = state
        .stop_reason
        .map(|r| r.is_recoverable_stop())
        .unwrap_or(false);
    let resume_command = (state.status == RunStatus::Stopped && recoverable)
        .then(|| format!("pipeline run --resume {}", state.run_id));

    LiveStatus {
        status: status.to_string(),
        reason: overall_reason(state),
        fsm_state: fsm_state.map(|s| s.to_string()),
        frames_approved: state.approved_count(),
        total_frames: state.total_frames,
        retry_rate: state.retry_rate(),
        reject_rate: state.reject_rate(),
        elapsed_ms,
        eta_ms,
        resume_command,
    }
}

fn elapsed_between(start: &str, end: &str) -> u64 {
    let parse = |s: &str| OffsetDateTime::parse(s, &Rfc3339).ok();
    match (parse(start), parse(end)) {
        (Some(a), Some(b)) if b > a => ((b - a).whole_milliseconds() as i64).max(0) as u64,
        _ => 0,
    }
}

// -- diagnostic -----------------------------------------------------------

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct StopComparison {
    pub metric: String,
    pub actual: f64,
    pub threshold: f64,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FrameBreakdown {
    pub index: u32,
    pub status: FrameStatus,
    pub attempt_count: u32,
    /// Deduplicated, in first-seen order.
    pub reason_codes: Vec<ReasonCode>,
    pub actions_tried: Vec<RetryAction>,
    pub total_duration_ms: u64,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ReasonIncidence {
    pub code: ReasonCode,
    pub frame_count: u32,
    pub example_frames: Vec<u32>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RootCause {
    pub summary: String,
    pub confidence: Confidence,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub action: String,
    pub effort: Effort,
    pub addresses: Vec<ReasonCode>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub run_id: String,
    pub status: RunStatus,
    pub stop_reason: Option<ReasonCode>,
    pub stop_comparison: Option<StopComparison>,
    pub metrics: StopMetrics,
    pub frames: Vec<FrameBreakdown>,
    pub top_reasons: Vec<ReasonIncidence>,
    pub root_cause: Option<RootCause>,
    pub recovery_actions: Vec<RecoveryAction>,
    pub resume_command: Option<String>,
}

pub fn diagnose(state: &RunState, thresholds: &StopThresholds) -> DiagnosticReport {
    let metrics = StopMetrics::from_state(state);

    let stop_comparison = state.stop_reason.and_then(|r| match r {
        ReasonCode::CircuitBreaker => Some(StopComparison {
            metric: "total_attempts".into(),
            actual: metrics.total_attempts as f64,
            threshold: thresholds.circuit_breaker_limit as f64,
        }),
        ReasonCode::ConsecutiveFails => Some(StopComparison {
            metric: "consecutive_fails".into(),
            actual: metrics.consecutive_fails as f64,
            threshold: thresholds.max_consecutive_fails as f64,
        }),
        ReasonCode::RejectRateExceeded => Some(StopComparison {
            metric: "reject_rate".into(),
            actual: metrics.reject_rate,
            threshold: thresholds.max_reject_rate,
        }),
        ReasonCode::RetryRateExceeded => Some(StopComparison {
            metric: "retry_rate".into(),
            actual: metrics.retry_rate,
            threshold: thresholds.max_retry_rate,
        }),
        _ => None,
    });

    let frames: Vec<FrameBreakdown> = state
        .frame_states
        .iter()
        .map(|f| {
            let mut codes: Vec<ReasonCode> = Vec::new();
            for a in &f.attempts {
                for c in &a.reason_codes {
                    if !codes.contains(c) {
                        codes.push(*c);
                    }
                }
            }
            if let Some(r) = f.final_reason {
                if !codes.contains(&r) {
                    codes.push(r);
                }
            }
            FrameBreakdown {
                index: f.index,
                status: f.status,
                attempt_count: f.attempts.len() as u32,
                reason_codes: codes,
                actions_tried: f.attempts.iter().filter_map(|a| a.strategy).collect(),
                total_duration_ms: f.attempts.iter().map(|a| a.duration_ms).sum(),
            }
        })
        .collect();

    // Reason incidence by frame, ranked; top three with examples.
    let mut incidence: BTreeMap<ReasonCode, Vec<u32>> = BTreeMap::new();
    for f in &frames {
        for c in &f.reason_codes {
            incidence.entry(*c).or_default().push(f.index);
        }
    }
    let mut top_reasons: Vec<ReasonIncidence> = incidence
        .into_iter()
        .map(|(code, frames)| ReasonIncidence {
            code,
            frame_count: frames.len() as u32,
            example_frames: frames.into_iter().take(3).collect(),
        })
        .collect();
    top_reasons.sort_by(|a, b| b.frame_count.cmp(&a.frame_count).then(a.code.cmp(&b.code)));
    top_reasons.truncate(3);

    let root_cause = root_cause_for(&frames, &top_reasons);
    let observed: Vec<ReasonCode> = top_reasons.iter().map(|r| r.code).collect();
    let recovery_actions = recovery_actions_for(&observed);

    let recoverable = state
        .stop_reason
        .map(|r| r.is_recoverable_stop())
        .unwrap_or(false);

    DiagnosticReport {
        run_id: state.run_id.clone(),
        status: state.status,
        stop_reason: state.stop_reason,
        stop_comparison,
        metrics,
        frames,
        top_reasons,
        root_cause,
        recovery_actions,
        resume_command: recoverable.then(|| format!("pipeline run --resume {}", state.run_id)),
    }
}

/// Rule-based root-cause suggestion from reason-code dominance.
fn root_cause_for(
    frames: &[FrameBreakdown],
    top: &[ReasonIncidence],
) -> Option<RootCause> {
    let failing = frames
        .iter()
        .filter(|f| !f.reason_codes.is_empty())
        .count() as f64;
    if failing == 0.0 {
        return None;
    }
    let dominance = |code: ReasonCode| {
        top.iter()
            .find(|r| r.code == code)
            .map(|r| r.frame_count as f64 / failing)
            .unwrap_or(0.0)
    };

    if dominance(ReasonCode::Sf01IdentityDrift) >= 0.5 {
        return Some(RootCause {
            summary: "Anchor lacks distinctive features; the model cannot hold the \
                      character's identity across frames. Use a higher-contrast anchor \
                      with a clearer silhouette."
                .into(),
            confidence: Confidence::High,
        });
    }
    if dominance(ReasonCode::Sf02PaletteDrift) >= 0.5 {
        return Some(RootCause {
            summary: "Palette drift dominates; the anchor palette may be too large or \
                      too subtle for the model to reproduce. Reduce the palette or \
                      switch to chroma-key transparency."
                .into(),
            confidence: Confidence::Medium,
        });
    }
    if dominance(ReasonCode::Sf03BaselineDrift) >= 0.5 {
        return Some(RootCause {
            summary: "Baseline drift dominates; candidates land off the ground line. \
                      Verify the anchor's feet touch its baseline and that vertical \
                      alignment is enabled."
                .into(),
            confidence: Confidence::Medium,
        });
    }
    if dominance(ReasonCode::Sf04TemporalIncoherence) >= 0.5 {
        return Some(RootCause {
            summary: "Frame-to-frame motion is too large for this move's coherence \
                      budget. Add explicit pose descriptions or more frames."
                .into(),
            confidence: Confidence::Medium,
        });
    }
    if dominance(ReasonCode::HfGeneratorError) >= 0.5 {
        return Some(RootCause {
            summary: "The image model endpoint failed repeatedly; see DEP_API_UNAVAILABLE \
                      guidance (key, quota, endpoint reachability)."
                .into(),
            confidence: Confidence::High,
        });
    }
    None
}

fn recovery_actions_for(observed: &[ReasonCode]) -> Vec<RecoveryAction> {
    let catalog = [
        RecoveryAction {
            action: "Resume the run; transient failures often clear on a fresh attempt"
                .into(),
            effort: Effort::Low,
            addresses: vec![ReasonCode::HfGeneratorError, ReasonCode::CircuitBreaker],
        },
        RecoveryAction {
            action: "Replace the anchor with a higher-contrast, cleaner-silhouette sprite"
                .into(),
            effort: Effort::Medium,
            addresses: vec![
                ReasonCode::Sf01IdentityDrift,
                ReasonCode::HfIdentityCollapse,
            ],
        },
        RecoveryAction {
            action: "Reduce the anchor palette below 32 colors".into(),
            effort: Effort::Medium,
            addresses: vec![ReasonCode::Sf02PaletteDrift],
        },
        RecoveryAction {
            action: "Enable vertical alignment (alignment.vertical_lock: true)".into(),
            effort: Effort::Low,
            addresses: vec![ReasonCode::Sf03BaselineDrift],
        },
        RecoveryAction {
            action: "Add explicit per-frame poses to the manifest".into(),
            effort: Effort::Medium,
            addresses: vec![ReasonCode::Sf04TemporalIncoherence],
        },
        RecoveryAction {
            action: "Raise max_attempts_per_frame and relax stop thresholds, then resume"
                .into(),
            effort: Effort::Low,
            addresses: vec![
                ReasonCode::HfMaxAttempts,
                ReasonCode::LadderExhausted,
                ReasonCode::RetryRateExceeded,
                ReasonCode::RejectRateExceeded,
                ReasonCode::ConsecutiveFails,
            ],
        },
        RecoveryAction {
            action: "Review rejected/ frames in Director mode and approve or patch manually"
                .into(),
            effort: Effort::High,
            addresses: vec![
                ReasonCode::HfIdentityCollapse,
                ReasonCode::OscillationDetected,
            ],
        },
    ];
    catalog
        .into_iter()
        .filter(|a| a.addresses.iter().any(|c| observed.contains(c)))
        .collect()
}

/// Single-line, color-free status text for the CLI.
pub fn status_line(status: &LiveStatus) -> String {
    let mut line = format!(
        "{} [{}] frames {}/{} retry_rate {:.2} reject_rate {:.2}",
        status.status,
        status.reason.as_str(),
        status.frames_approved,
        status.total_frames,
        status.retry_rate,
        status.reject_rate,
    );
    if let Some(cmd) = &status.resume_command {
        line.push_str(&format!(" (resume: {cmd})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AttemptRecord, AttemptResult};

    fn attempt(codes: Vec<ReasonCode>, strategy: Option<RetryAction>) -> AttemptRecord {
        AttemptRecord {
            attempt_index: 1,
            timestamp: String::new(),
            prompt_hash: "00000000".into(),
            seed: 0,
            result: if codes.is_empty() {
                AttemptResult::Passed
            } else {
                AttemptResult::SoftFail
            },
            reason_codes: codes,
            composite_score: 0.5,
            duration_ms: 100,
            strategy,
        }
    }

    fn failing_state() -> RunState {
        let mut st = RunState::new("runx", "hash", 5);
        st.status = RunStatus::Stopped;
        st.stop_reason = Some(ReasonCode::RejectRateExceeded);
        for i in 0..3 {
            st.frame_states[i].status = FrameStatus::Approved;
            st.frame_states[i].attempts.push(attempt(vec![], None));
        }
        for i in 3..5 {
            st.frame_states[i].status = FrameStatus::Rejected;
            st.frame_states[i].final_reason = Some(ReasonCode::HfIdentityCollapse);
            st.frame_states[i]
                .attempts
                .push(attempt(vec![ReasonCode::Sf01IdentityDrift], None));
            st.frame_states[i].attempts.push(attempt(
                vec![ReasonCode::Sf01IdentityDrift],
                Some(RetryAction::RerollSeed),
            ));
        }
        st
    }

    #[test]
    fn test_overall_reason_full_vs_partial() {
        let mut st = RunState::new("r", "h", 2);
        st.status = RunStatus::Completed;
        st.frame_states[0].status = FrameStatus::Approved;
        st.frame_states[1].status = FrameStatus::Approved;
        assert_eq!(overall_reason(&st), ReasonCode::AllFramesApproved);
        st.frame_states[1].status = FrameStatus::Rejected;
        assert_eq!(overall_reason(&st), ReasonCode::PartialSuccess);
    }

    #[test]
    fn test_resume_command_only_for_recoverable_stops() {
        let mut st = failing_state();
        let s = live_status(&st, None);
        assert_eq!(
            s.resume_command.as_deref(),
            Some("pipeline run --resume runx")
        );
        st.stop_reason = Some(ReasonCode::SysManifestInvalid);
        let s = live_status(&st, None);
        assert!(s.resume_command.is_none());
    }

    #[test]
    fn test_diagnostic_top_reason_and_root_cause() {
        let st = failing_state();
        let d = diagnose(&st, &StopThresholds::default());
        assert_eq!(d.stop_reason, Some(ReasonCode::RejectRateExceeded));
        let cmp = d.stop_comparison.expect("comparison");
        assert_eq!(cmp.metric, "reject_rate");
        assert!((cmp.actual - 0.4).abs() < 1e-9);
        assert!((cmp.threshold - 0.3).abs() < 1e-9);

        assert_eq!(d.top_reasons[0].code, ReasonCode::Sf01IdentityDrift);
        assert_eq!(d.top_reasons[0].frame_count, 2);
        let rc = d.root_cause.expect("root cause");
        assert!(rc.summary.contains("identity"));
        assert_eq!(rc.confidence, Confidence::High);
        assert!(d
            .recovery_actions
            .iter()
            .any(|a| a.addresses.contains(&ReasonCode::Sf01IdentityDrift)));
        assert_eq!(
            d.resume_command.as_deref(),
            Some("pipeline run --resume runx")
        );
    }

    #[test]
    fn test_frame_breakdown_dedupes_codes() {
        let st = failing_state();
        let d = diagnose(&st, &StopThresholds::default());
        let f3 = &d.frames[3];
        assert_eq!(f3.attempt_count, 2);
        assert_eq!(
            f3.reason_codes,
            vec![
                ReasonCode::Sf01IdentityDrift,
                ReasonCode::HfIdentityCollapse
            ]
        );
        assert_eq!(f3.actions_tried, vec![RetryAction::RerollSeed]);
    }

    #[test]
    fn test_status_line_shape() {
        let st = failing_state();
        let line = status_line(&live_status(&st, None));
        assert!(line.starts_with("stopped [REJECT_RATE_EXCEEDED]"), "{line}");
        assert!(line.contains("frames 3/5"), "{line}");
        assert!(line.contains("resume:"), "{line}");
    }
}
