//! Orchestrator: the sequential state machine driving
//! INIT -> GENERATING -> AUDITING -> RETRY_DECIDING -> APPROVING ->
//! NEXT_FRAME -> {COMPLETED, STOPPED}. One frame at a time, strictly in
//! ascending index order; the Generator call is the only slow suspension
//! point. Generator, auditor and store are injected capabilities.

use std::io;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{ImageFormat, RgbaImage};

use crate::anchor::{analyze_anchor, AnchorAnalysis};
use crate::audit::{AuditReport, Auditor};
use crate::codes::ReasonCode;
use crate::generator::{
    generate_with_backoff, BackoffPolicy, GenerateRequest, Generator,
};
use crate::manifest::Manifest;
use crate::pose::PoseLibrary;
use crate::postprocess::PostProcessor;
use crate::prompt::{compose, ComposeInput};
use crate::retry::{AttemptEvidence, LadderState, RetryAction, RetryDecision};
use crate::state::{
    AttemptRecord, AttemptResult, FrameStatus, RunState, RunStatus, TransitionRecord,
};
use crate::stop::StopEvaluator;
use crate::store::{LockInputs, ManifestLock, RunStore};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FsmState {
    Init,
    Generating,
    Auditing,
    RetryDeciding,
    Approving,
    NextFrame,
    Completed,
    Stopped,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Init => "INIT",
            FsmState::Generating => "GENERATING",
            FsmState::Auditing => "AUDITING",
            FsmState::RetryDeciding => "RETRY_DECIDING",
            FsmState::Approving => "APPROVING",
            FsmState::NextFrame => "NEXT_FRAME",
            FsmState::Completed => "COMPLETED",
            FsmState::Stopped => "STOPPED",
        }
    }
}

/// The exhaustive transition table; anything else is a programming error.
pub fn transition_allowed(from: FsmState, to: FsmState) -> bool {
    use FsmState::*;
    matches!(
        (from, to),
        (Init, Generating)
            | (Generating, Auditing)
            | (Generating, Stopped)
            | (Auditing, Approving)
            | (Auditing, RetryDeciding)
            | (RetryDeciding, Generating)
            | (RetryDeciding, NextFrame)
            | (Approving, NextFrame)
            | (Approving, Stopped)
            | (NextFrame, Generating)
            | (NextFrame, Completed)
            | (NextFrame, Stopped)
    )
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stop_reason: Option<ReasonCode>,
    pub state: RunState,
}

/// Everything needed to start (or resume) a run.
pub struct Orchestrator<'a> {
    manifest: &'a Manifest,
    generator: &'a mut dyn Generator,
    store: RunStore,
    state: RunState,
    anchor: AnchorAnalysis,
    anchor_png: Vec<u8>,
    auditor: Auditor,
    poses: PoseLibrary,
    evaluator: StopEvaluator,
    backoff: BackoffPolicy,
    abort: Arc<AtomicBool>,

    fsm: FsmState,
    state_entered_ms: u64,

    // Per-frame working set, reset on frame advance.
    ladder: LadderState,
    pending_action: Option<RetryAction>,
    last_raw: Option<Vec<u8>>,
    last_seed: u32,
    last_prompt_hash: String,
    last_candidate_path: Option<PathBuf>,
    last_report: Option<AuditReport>,
    attempt_started_ms: u64,
    previous_png: Option<Vec<u8>>,
    previous_image: Option<RgbaImage>,
}

impl<'a> Orchestrator<'a> {
    /// INIT: analyze the anchor (or reuse the cached analysis when resuming),
    /// write/verify the manifest lock, and seed the run state.
    pub fn new(
        manifest: &'a Manifest,
        generator: &'a mut dyn Generator,
        store: RunStore,
        resumed_state: Option<RunState>,
        abort: Arc<AtomicBool>,
        backoff: BackoffPolicy,
    ) -> io::Result<Orchestrator<'a>> {
        let manifest_hash = manifest.manifest_hash();
        let anchor_png = std::fs::read(&manifest.anchor)?;

        let (anchor, is_resume) = match (&resumed_state, store.load_manifest_lock()) {
            (Some(_), Ok(lock)) => {
                if lock.manifest_hash != manifest_hash {
                    return Err(io::Error::other(format!(
                        "SYS_MANIFEST_INVALID: lock file hash {} does not match manifest {}",
                        lock.manifest_hash, manifest_hash
                    )));
                }
                (lock.anchor_analysis, true)
            }
            _ => {
                let analysis = analyze_anchor(
                    &manifest.anchor,
                    manifest.target_size,
                    manifest.alignment.root_zone_ratio,
                )
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                (analysis, false)
            }
        };

        if !is_resume {
            let lock = ManifestLock {
                run_id: store.run_id(),
                run_start: crate::util::id::now_rfc3339(),
                manifest_hash: manifest_hash.clone(),
                model_id: generator.model_id().to_string(),
                adapter_version: generator.adapter_version().to_string(),
                runtime: crate::store::runtime_fingerprint(),
                os: std::env::consts::OS.to_string(),
                inputs: LockInputs {
                    anchor: crate::util::fs::normalized_abs_path(&manifest.anchor),
                    manifest: None,
                },
                anchor_analysis: anchor.clone(),
            };
            store.write_manifest_lock(&lock)?;
        }

        let anchor_image = image::load_from_memory(&anchor_png)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            .to_rgba8();
        let poses = PoseLibrary::new(&manifest.move_id, manifest.total_frames, manifest.poses.clone());
        let auditor = Auditor::new(
            manifest.audit.clone(),
            anchor.clone(),
            anchor_image,
            poses.category(),
            manifest.alignment.root_zone_ratio,
        );

        let mut state = match resumed_state {
            Some(s) => s,
            None => RunState::new(&store.run_id(), &manifest_hash, manifest.total_frames),
        };
        if state.frame_states.len() != manifest.total_frames as usize {
            return Err(io::Error::other(
                "SYS_MANIFEST_INVALID: frame count in state does not match manifest",
            ));
        }
        let first = state.first_pending_frame().unwrap_or(0);
        state.current_frame = first;
        state.current_attempt = state.frame(first).attempts.len() as u32 + 1;
        state.status = RunStatus::InProgress;
        state.stop_reason = None;
        store.save_state(&state)?;

        let mut orch = Orchestrator {
            manifest,
            generator,
            store,
            state,
            anchor,
            anchor_png,
            auditor,
            poses,
            evaluator: StopEvaluator::new(manifest.stop.clone()),
            backoff,
            abort,
            fsm: FsmState::Init,
            state_entered_ms: crate::util::id::now_millis(),
            ladder: LadderState::new(),
            pending_action: None,
            last_raw: None,
            last_seed: 0,
            last_prompt_hash: String::new(),
            last_candidate_path: None,
            last_report: None,
            attempt_started_ms: 0,
            previous_png: None,
            previous_image: None,
        };
        // A resumed frame keeps its attempt budget but starts a fresh ladder.
        orch.load_previous_approved();
        Ok(orch)
    }

    pub fn fsm_state(&self) -> FsmState {
        self.fsm
    }

    /// Drive the state machine to a terminal state.
    pub fn run(&mut self) -> io::Result<RunOutcome> {
        tracing::info!(
            target: "orchestrator",
            run_id = %self.state.run_id,
            frames = self.state.total_frames,
            start_frame = self.state.current_frame,
            "run starting"
        );
        self.transition(FsmState::Generating);
        loop {
            match self.fsm {
                FsmState::Generating => self.step_generate(),
                FsmState::Auditing => self.step_audit(),
                FsmState::RetryDeciding => self.step_retry_decide(),
                FsmState::Approving => self.step_approve(),
                FsmState::NextFrame => self.step_next_frame(),
                FsmState::Completed | FsmState::Stopped => break,
                FsmState::Init => unreachable!("run() starts past INIT"),
            }
        }
        self.finalize()
    }

    // -- FSM steps ---------------------------------------------------------

    fn step_generate(&mut self) {
        let frame = self.state.current_frame;
        let attempt = self.state.current_attempt;
        self.state.frame_mut(frame).status = FrameStatus::InProgress;
        self.attempt_started_ms = crate::util::id::now_millis();

        let action = self.pending_action;
        let reuse_raw = action == Some(RetryAction::PostProcessOnly) && self.last_raw.is_some();
        if reuse_raw {
            tracing::info!(target: "orchestrator", frame, attempt, "post-process-only retry");
            self.transition(FsmState::Auditing);
            return;
        }

        let pose = self.poses.pose_for(frame);
        let prompt = compose(&ComposeInput {
            manifest: self.manifest,
            run_id: &self.state.run_id,
            frame_index: frame,
            attempt_index: attempt,
            anchor_png: &self.anchor_png,
            previous_png: self.previous_png.as_deref(),
            retry_action: action,
            pose: pose.as_ref(),
        });
        self.last_seed = prompt.seed;
        self.last_prompt_hash = prompt.prompt_hash.clone();

        tracing::info!(
            target: "orchestrator",
            frame,
            attempt,
            seed = prompt.seed,
            template = ?prompt.template,
            strategy = action.map(|a| a.as_str()).unwrap_or("initial"),
            "generating"
        );

        let request = GenerateRequest {
            parts: prompt.parts,
            seed: prompt.seed,
            temperature: self.manifest.generation.temperature,
        };
        match generate_with_backoff(&mut *self.generator, &request, &self.backoff) {
            Ok(img) => {
                if self.abort.load(Ordering::Relaxed) {
                    // In-flight output is discarded on abort.
                    self.state.stop_reason = Some(ReasonCode::UserInterrupt);
                    self.transition(FsmState::Stopped);
                    return;
                }
                self.last_raw = Some(img.image_bytes);
                self.transition(FsmState::Auditing);
            }
            Err(e) => {
                tracing::error!(target: "orchestrator", frame, attempt, error = %e, "generator error");
                self.last_raw = None;
                self.state.frame_mut(frame).last_error = Some(e.to_string());
                // Permanent (or retry-exhausted) generator errors count as a
                // hard-failed attempt and go through the ladder.
                self.transition(FsmState::Auditing);
            }
        }
    }

    fn step_audit(&mut self) {
        let frame = self.state.current_frame;
        let attempt = self.state.current_attempt;
        let force_align = self.pending_action == Some(RetryAction::PostProcessOnly);

        // Stale candidate paths from a previous attempt must not survive into
        // this attempt's reject bookkeeping.
        self.last_candidate_path = None;
        let report = match &self.last_raw {
            None => AuditReport::hard_fail(ReasonCode::HfGeneratorError, None),
            Some(raw) => {
                let processor = PostProcessor::new(self.manifest, &self.anchor);
                match processor.process(raw, force_align) {
                    Err(e) => {
                        self.state.frame_mut(frame).last_error = Some(e.to_string());
                        AuditReport::hard_fail(e.reason_code(), None)
                    }
                    Ok(candidate) => {
                        let report =
                            self.auditor
                                .audit(raw.len(), &candidate, self.previous_image.as_ref());
                        // Persist the processed candidate for promotion/reject.
                        match encode_png(&candidate.image) {
                            Ok(png) => {
                                match self.store.write_candidate(frame, attempt, None, &png) {
                                    Ok(path) => self.last_candidate_path = Some(path),
                                    Err(e) => {
                                        self.stop_with_system_error(ReasonCode::SysWriteError, &e);
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                self.stop_with_system_error(ReasonCode::SysWriteError, &e);
                                return;
                            }
                        }
                        report
                    }
                }
            }
        };

        let result = if report.passed {
            AttemptResult::Passed
        } else if report.flags.iter().any(|f| f.is_hard()) {
            AttemptResult::HardFail
        } else {
            AttemptResult::SoftFail
        };
        let record = AttemptRecord {
            attempt_index: attempt,
            timestamp: crate::util::id::now_rfc3339(),
            prompt_hash: self.last_prompt_hash.clone(),
            seed: self.last_seed,
            result,
            reason_codes: report.flags.clone(),
            composite_score: report.composite_score,
            duration_ms: crate::util::id::now_millis().saturating_sub(self.attempt_started_ms),
            strategy: self.pending_action,
        };
        if let Err(e) = self.store.write_audit(frame, attempt, &report) {
            self.stop_with_system_error(ReasonCode::SysWriteError, &e);
            return;
        }
        self.state.frame_mut(frame).attempts.push(record);

        self.ladder.record(&AttemptEvidence {
            passed: report.passed,
            primary_reason: report.primary_reason(),
            identity_score: Some(report.scores.identity),
        });

        tracing::info!(
            target: "orchestrator",
            frame,
            attempt,
            passed = report.passed,
            composite = report.composite_score,
            flags = ?report.flags,
            drift = report.drift_pixels,
            auto_aligned = report.auto_aligned,
            "audited"
        );

        let passed = report.passed;
        self.last_report = Some(report);
        if passed {
            self.transition(FsmState::Approving);
        } else {
            self.transition(FsmState::RetryDeciding);
        }
    }

    fn step_retry_decide(&mut self) {
        let frame = self.state.current_frame;
        let report = self.last_report.clone();
        let evidence = AttemptEvidence {
            passed: false,
            primary_reason: report.as_ref().and_then(|r| r.primary_reason()),
            identity_score: report.as_ref().map(|r| r.scores.identity),
        };
        let attempts_made = self.state.frame(frame).attempts.len() as u32;
        let max = self.manifest.retry.max_attempts_per_frame;

        // The ladder's SF03 mapping already leads with the aligner-only
        // retry, so the auditor's ALIGN recommendation needs no special case.
        let decision = self.ladder.decide(&evidence, attempts_made, max);
        match decision {
            RetryDecision::Retry(action) => {
                tracing::info!(
                    target: "orchestrator",
                    frame,
                    next_strategy = action.as_str(),
                    "retrying"
                );
                self.pending_action = Some(action);
                self.state.current_attempt += 1;
                self.transition(FsmState::Generating);
            }
            RetryDecision::Terminate { code, status } => {
                tracing::warn!(
                    target: "orchestrator",
                    frame,
                    code = code.as_str(),
                    "frame terminated"
                );
                let attempts = self.state.frame(frame).attempts.clone();
                let fs = self.state.frame_mut(frame);
                fs.status = status;
                fs.final_reason = Some(code);
                let metadata = serde_json::json!({
                    "frame": frame,
                    "final_reason": code.as_str(),
                    "attempts": attempts,
                });
                // With no candidate on disk (generator error) this still
                // writes the reason-coded metadata sibling.
                let from = self
                    .last_candidate_path
                    .clone()
                    .unwrap_or_else(|| self.store.candidate_path(frame, 0, None));
                if let Err(e) = self.store.reject_candidate(frame, &from, code, &metadata) {
                    self.stop_with_system_error(ReasonCode::SysWriteError, &e);
                    return;
                }
                self.transition(FsmState::NextFrame);
            }
        }
    }

    fn step_approve(&mut self) {
        let frame = self.state.current_frame;
        let Some(path) = self.last_candidate_path.clone() else {
            self.stop_with_system_error(
                ReasonCode::SysUnknownError,
                &io::Error::other("approving without a candidate on disk"),
            );
            return;
        };
        match self.store.promote_candidate(frame, &path) {
            Ok(approved) => {
                let rel = format!("approved/frame_{frame:04}.png");
                let fs = self.state.frame_mut(frame);
                fs.status = FrameStatus::Approved;
                fs.approved_path = Some(rel);
                fs.last_error = None;
                tracing::info!(target: "orchestrator", frame, path = %approved.display(), "approved");

                // The approved frame becomes the temporal/pose reference.
                match std::fs::read(&approved) {
                    Ok(bytes) => {
                        self.previous_image = image::load_from_memory(&bytes)
                            .ok()
                            .map(|d| d.to_rgba8());
                        self.previous_png = Some(bytes);
                    }
                    Err(e) => {
                        self.stop_with_system_error(ReasonCode::SysWriteError, &e);
                        return;
                    }
                }
                self.transition(FsmState::NextFrame);
            }
            Err(e) => {
                self.stop_with_system_error(ReasonCode::SysWriteError, &e);
            }
        }
    }

    fn step_next_frame(&mut self) {
        // Stop evaluation runs after every terminal per-frame transition,
        // before any advance.
        if self.state.frame(self.state.current_frame).status.is_complete() {
            if let Some(reason) = self
                .evaluator
                .evaluate(&self.state, self.abort.load(Ordering::Relaxed))
            {
                self.state.stop_reason = Some(reason);
                self.transition(FsmState::Stopped);
                return;
            }
        }

        // Paranoia check for mid-run manifest swaps.
        if let Ok(lock) = self.store.load_manifest_lock() {
            if lock.manifest_hash != self.state.manifest_hash {
                self.state.stop_reason = Some(ReasonCode::SysManifestInvalid);
                self.transition(FsmState::Stopped);
                return;
            }
        }

        let next = self
            .state
            .frame_states
            .iter()
            .find(|f| f.status == FrameStatus::Pending)
            .map(|f| f.index);
        match next {
            None => self.transition(FsmState::Completed),
            Some(next_frame) => {
                self.state.current_frame = next_frame;
                self.state.current_attempt =
                    self.state.frame(next_frame).attempts.len() as u32 + 1;
                self.ladder = LadderState::new();
                self.pending_action = None;
                self.last_raw = None;
                self.last_report = None;
                self.last_candidate_path = None;
                self.load_previous_approved();
                self.transition(FsmState::Generating);
            }
        }
    }

    fn finalize(&mut self) -> io::Result<RunOutcome> {
        match self.fsm {
            FsmState::Completed => {
                self.state.status = RunStatus::Completed;
                self.state.stop_reason = None;
            }
            _ => {
                self.state.status = RunStatus::Stopped;
                if self.state.stop_reason.is_none() {
                    self.state.stop_reason = Some(ReasonCode::SysUnknownError);
                }
            }
        }
        self.state.touch();
        let save = self.store.save_state(&self.state);
        if let Err(e) = save {
            // An unwritable state file is the one non-resumable outcome.
            self.state.status = RunStatus::Failed;
            tracing::error!(target: "orchestrator", error = %e, "state file unwritable");
        }

        let summary = crate::report::summarize(&self.state);
        let _ = self.store.write_summary(&summary);
        if self.state.status != RunStatus::Completed
            || self.state.approved_count() < self.state.total_frames
        {
            let diagnostic =
                crate::report::diagnose(&self.state, self.evaluator.thresholds());
            let _ = self.store.write_diagnostic(&diagnostic);
        }

        tracing::info!(
            target: "orchestrator",
            run_id = %self.state.run_id,
            status = self.state.status.as_str(),
            reason = self.state.stop_reason.map(|r| r.as_str()).unwrap_or("-"),
            approved = self.state.approved_count(),
            total = self.state.total_frames,
            "run finished"
        );
        Ok(RunOutcome {
            run_id: self.state.run_id.clone(),
            status: self.state.status,
            stop_reason: self.state.stop_reason,
            state: self.state.clone(),
        })
    }

    // -- helpers -----------------------------------------------------------

    /// Record a transition, persist state, honor the abort flag.
    fn transition(&mut self, to: FsmState) {
        let mut to = to;
        if self.abort.load(Ordering::Relaxed)
            && !matches!(to, FsmState::Completed | FsmState::Stopped)
        {
            self.state.stop_reason = Some(ReasonCode::UserInterrupt);
            to = FsmState::Stopped;
        }
        if !transition_allowed(self.fsm, to) && to != FsmState::Stopped {
            tracing::error!(
                target: "orchestrator",
                from = self.fsm.as_str(),
                to = to.as_str(),
                "invalid FSM transition"
            );
            self.state.stop_reason = Some(ReasonCode::SysUnknownError);
            to = FsmState::Stopped;
        }
        let now = crate::util::id::now_millis();
        self.state.transition_history.push(TransitionRecord {
            from: self.fsm.as_str().to_string(),
            to: to.as_str().to_string(),
            timestamp: crate::util::id::now_rfc3339(),
            duration_ms: now.saturating_sub(self.state_entered_ms),
        });
        self.fsm = to;
        self.state_entered_ms = now;
        self.state.touch();
        if let Err(e) = self.store.save_state(&self.state) {
            tracing::error!(target: "orchestrator", error = %e, "state persistence failed");
            if self.fsm != FsmState::Stopped {
                self.state.stop_reason = Some(ReasonCode::SysWriteError);
                self.fsm = FsmState::Stopped;
            }
        }
    }

    fn stop_with_system_error(&mut self, code: ReasonCode, err: &io::Error) {
        tracing::error!(target: "orchestrator", code = code.as_str(), error = %err, "system error");
        let frame = self.state.current_frame;
        self.state.frame_mut(frame).last_error = Some(err.to_string());
        self.state.stop_reason = Some(code);
        self.transition(FsmState::Stopped);
    }

    /// The nearest approved frame below the current one is the pose /
    /// temporal reference; on resume it is reloaded from disk.
    fn load_previous_approved(&mut self) {
        self.previous_png = None;
        self.previous_image = None;
        let current = self.state.current_frame;
        let prev = self
            .state
            .frame_states
            .iter()
            .filter(|f| f.index < current && f.status == FrameStatus::Approved)
            .last();
        if let Some(p) = prev {
            let path = self.store.approved_path(p.index);
            if let Ok(bytes) = std::fs::read(&path) {
                self.previous_image = image::load_from_memory(&bytes)
                    .ok()
                    .map(|d| d.to_rgba8());
                self.previous_png = Some(bytes);
            }
        }
    }
}

pub fn encode_png(img: &RgbaImage) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| io::Error::other(format!("png encode: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_accepts_spec_edges() {
        use FsmState::*;
        let valid = [
            (Init, Generating),
            (Generating, Auditing),
            (Generating, Stopped),
            (Auditing, Approving),
            (Auditing, RetryDeciding),
            (RetryDeciding, Generating),
            (RetryDeciding, NextFrame),
            (Approving, NextFrame),
            (Approving, Stopped),
            (NextFrame, Generating),
            (NextFrame, Completed),
            (NextFrame, Stopped),
        ];
        for (f, t) in valid {
            assert!(transition_allowed(f, t), "{f:?} -> {t:?} should be valid");
        }
    }

    #[test]
    fn test_transition_table_rejects_everything_else() {
        use FsmState::*;
        let states = [
            Init,
            Generating,
            Auditing,
            RetryDeciding,
            Approving,
            NextFrame,
            Completed,
            Stopped,
        ];
        // Terminal states have no outgoing transitions.
        for to in states {
            assert!(!transition_allowed(Completed, to));
            assert!(!transition_allowed(Stopped, to));
        }
        assert!(!transition_allowed(Init, Auditing));
        assert!(!transition_allowed(Generating, Approving));
        assert!(!transition_allowed(Auditing, NextFrame));
        assert!(!transition_allowed(Approving, Generating));
        assert!(!transition_allowed(NextFrame, Auditing));
    }
}
