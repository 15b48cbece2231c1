//! Run state: the persisted record the orchestrator mutates and the stop
//! evaluator, resumption detector and reporters read. Persisted atomically to
//! `state.json` after every state change.

use serde::{Deserialize, Serialize};

use crate::codes::ReasonCode;
use crate::retry::RetryAction;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed
        )
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            RunStatus::InProgress | RunStatus::Paused | RunStatus::Pending | RunStatus::Stopped
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Failed,
}

impl FrameStatus {
    /// A frame that reached a terminal per-frame transition.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            FrameStatus::Approved | FrameStatus::Rejected | FrameStatus::Failed
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Passed,
    SoftFail,
    HardFail,
}

/// One generate -> audit cycle for a frame.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt_index: u32,
    pub timestamp: String,
    /// First 8 hex chars of SHA-256 over the resolved text parts.
    pub prompt_hash: String,
    pub seed: u32,
    pub result: AttemptResult,
    pub reason_codes: Vec<ReasonCode>,
    pub composite_score: f64,
    pub duration_ms: u64,
    /// Corrective action that produced this attempt; None for attempt 1.
    pub strategy: Option<RetryAction>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FrameState {
    pub index: u32,
    pub status: FrameStatus,
    pub attempts: Vec<AttemptRecord>,
    pub approved_path: Option<String>,
    pub last_error: Option<String>,
    pub final_reason: Option<ReasonCode>,
}

impl FrameState {
    pub fn new(index: u32) -> FrameState {
        FrameState {
            index,
            status: FrameStatus::Pending,
            attempts: Vec::new(),
            approved_path: None,
            last_error: None,
            final_reason: None,
        }
    }
}

/// One FSM transition, kept for the diagnostic timeline.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub timestamp: String,
    pub duration_ms: u64,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub manifest_hash: String,
    pub status: RunStatus,
    pub total_frames: u32,
    pub current_frame: u32,
    pub current_attempt: u32,
    pub frame_states: Vec<FrameState>,
    pub transition_history: Vec<TransitionRecord>,
    pub stop_reason: Option<ReasonCode>,
    pub started_at: String,
    pub updated_at: String,
}

impl RunState {
    pub fn new(run_id: &str, manifest_hash: &str, total_frames: u32) -> RunState {
        RunState {
            run_id: run_id.to_string(),
            manifest_hash: manifest_hash.to_string(),
            status: RunStatus::Pending,
            total_frames,
            current_frame: 0,
            current_attempt: 1,
            frame_states: (0..total_frames).map(FrameState::new).collect(),
            transition_history: Vec::new(),
            stop_reason: None,
            started_at: crate::util::id::now_rfc3339(),
            updated_at: crate::util::id::now_rfc3339(),
        }
    }

    pub fn frame(&self, index: u32) -> &FrameState {
        &self.frame_states[index as usize]
    }

    pub fn frame_mut(&mut self, index: u32) -> &mut FrameState {
        &mut self.frame_states[index as usize]
    }

    pub fn total_attempts(&self) -> u32 {
        self.frame_states
            .iter()
            .map(|f| f.attempts.len() as u32)
            .sum()
    }

    pub fn approved_count(&self) -> u32 {
        self.frame_states
            .iter()
            .filter(|f| f.status == FrameStatus::Approved)
            .count() as u32
    }

    /// Frames with at least one attempt recorded.
    pub fn frames_attempted(&self) -> u32 {
        self.frame_states
            .iter()
            .filter(|f| !f.attempts.is_empty())
            .count() as u32
    }

    /// Frames that reached a terminal per-frame status.
    pub fn frames_complete(&self) -> u32 {
        self.frame_states
            .iter()
            .filter(|f| f.status.is_complete())
            .count() as u32
    }

    pub fn rejected_or_failed_count(&self) -> u32 {
        self.frame_states
            .iter()
            .filter(|f| matches!(f.status, FrameStatus::Rejected | FrameStatus::Failed))
            .count() as u32
    }

    /// Fraction of attempted frames that needed more than one attempt.
    pub fn retry_rate(&self) -> f64 {
        let attempted = self.frames_attempted();
        if attempted == 0 {
            return 0.0;
        }
        let retried = self
            .frame_states
            .iter()
            .filter(|f| f.attempts.len() >= 2)
            .count() as f64;
        retried / attempted as f64
    }

    /// Fraction of completed frames that ended rejected or failed.
    pub fn reject_rate(&self) -> f64 {
        let complete = self.frames_complete();
        if complete == 0 {
            return 0.0;
        }
        self.rejected_or_failed_count() as f64 / complete as f64
    }

    /// Trailing run of completed frames that did not end approved.
    pub fn consecutive_fails(&self) -> u32 {
        let mut count = 0;
        for f in self.frame_states.iter().rev() {
            match f.status {
                FrameStatus::Rejected | FrameStatus::Failed => count += 1,
                FrameStatus::Approved => break,
                // Frames not yet complete sit after the interesting suffix.
                FrameStatus::Pending | FrameStatus::InProgress => continue,
            }
        }
        count
    }

    /// Smallest frame index not yet approved.
    pub fn first_pending_frame(&self) -> Option<u32> {
        self.frame_states
            .iter()
            .find(|f| f.status != FrameStatus::Approved)
            .map(|f| f.index)
    }

    pub fn touch(&mut self) {
        self.updated_at = crate::util::id::now_rfc3339();
    }
}
