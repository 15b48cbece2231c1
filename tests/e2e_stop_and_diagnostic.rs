//! Run-level halting: reject-rate stop with a resume-able status line and a
//! diagnostic that names the dominant failure code.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sprite_pipeline::report::DiagnosticReport;
use sprite_pipeline::{
    BackoffPolicy, FrameStatus, Orchestrator, ReasonCode, RunStatus, RunStore, ScriptedGenerator,
};

mod common;

#[test]
fn test_reject_rate_stop_after_two_collapsed_frames() {
    let td = tempfile::tempdir().expect("tmpdir");
    let anchor = common::write_anchor(td.path());
    let manifest = common::test_manifest(anchor, "idle", 10, false);

    let good = common::upscaled_png(&common::anchor_sprite());
    let bad = common::upscaled_png(&common::impostor_sprite());
    // Frames 0-2 pass; frames 3 and 4 burn four identity attempts each and
    // collapse. 2 rejections out of 5 complete frames = 0.4 > 0.3.
    let mut responses: Vec<_> = (0..3).map(|_| common::ok_response(good.clone())).collect();
    for _ in 0..8 {
        responses.push(common::ok_response(bad.clone()));
    }
    let mut generator = ScriptedGenerator::new(responses);

    let store = RunStore::create(&td.path().join("runs"), "20260801_090000_abab_testchar_idle")
        .expect("store");
    let run_dir = store.dir().to_path_buf();
    let abort = Arc::new(AtomicBool::new(false));
    let mut orch = Orchestrator::new(
        &manifest,
        &mut generator,
        store,
        None,
        abort,
        BackoffPolicy::default(),
    )
    .expect("init");
    let outcome = orch.run().expect("run");
    drop(orch);

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(outcome.stop_reason, Some(ReasonCode::RejectRateExceeded));
    assert_eq!(outcome.state.approved_count(), 3);
    assert_eq!(outcome.state.frame(3).status, FrameStatus::Rejected);
    assert_eq!(outcome.state.frame(4).status, FrameStatus::Rejected);
    assert_eq!(outcome.state.frame(5).status, FrameStatus::Pending, "run halted before frame 5");
    assert_eq!(generator.calls(), 3 + 4 + 4);

    // Status advertises the resume command.
    let status = sprite_pipeline::live_status(&outcome.state, None);
    assert_eq!(status.status, "stopped");
    assert_eq!(
        status.resume_command.as_deref(),
        Some("pipeline run --resume 20260801_090000_abab_testchar_idle")
    );

    // Diagnostic: threshold comparison + SF01 dominance.
    let diagnostic: DiagnosticReport =
        sprite_pipeline::util::fs::read_json(&run_dir.join("diagnostic.json"))
            .expect("diagnostic.json");
    assert_eq!(diagnostic.stop_reason, Some(ReasonCode::RejectRateExceeded));
    let cmp = diagnostic.stop_comparison.expect("comparison");
    assert_eq!(cmp.metric, "reject_rate");
    assert!((cmp.actual - 0.4).abs() < 1e-9);
    assert!((cmp.threshold - 0.3).abs() < 1e-9);
    assert_eq!(diagnostic.top_reasons[0].code, ReasonCode::Sf01IdentityDrift);
    assert_eq!(diagnostic.top_reasons[0].frame_count, 2);
    let root = diagnostic.root_cause.expect("root cause");
    assert!(root.summary.to_lowercase().contains("anchor"));
    assert!(!diagnostic.recovery_actions.is_empty());
}

#[test]
fn test_circuit_breaker_caps_total_attempts() {
    let td = tempfile::tempdir().expect("tmpdir");
    let anchor = common::write_anchor(td.path());
    let mut manifest = common::test_manifest(anchor, "idle", 10, false);
    // Tight breaker: two frames' worth of failed attempts trips it before
    // the reject-rate rule can see a meaningful denominator.
    manifest.stop.circuit_breaker_limit = 8;
    manifest.stop.max_retry_rate = 1.0;
    manifest.stop.max_reject_rate = 1.0;
    manifest.stop.max_consecutive_fails = 99;

    let bad = common::upscaled_png(&common::impostor_sprite());
    let mut generator = ScriptedGenerator::new(
        (0..16).map(|_| common::ok_response(bad.clone())).collect(),
    );
    let store = RunStore::create(&td.path().join("runs"), "20260801_090000_cbcb_testchar_idle")
        .expect("store");
    let abort = Arc::new(AtomicBool::new(false));
    let mut orch = Orchestrator::new(
        &manifest,
        &mut generator,
        store,
        None,
        abort,
        BackoffPolicy::default(),
    )
    .expect("init");
    let outcome = orch.run().expect("run");
    drop(orch);

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(outcome.stop_reason, Some(ReasonCode::CircuitBreaker));
    assert!(outcome.state.total_attempts() >= 8);
    // Invariant: total attempts equals the per-frame sum.
    let summed: u32 = outcome
        .state
        .frame_states
        .iter()
        .map(|f| f.attempts.len() as u32)
        .sum();
    assert_eq!(outcome.state.total_attempts(), summed);
}

#[test]
fn test_user_interrupt_routes_to_stopped() {
    let td = tempfile::tempdir().expect("tmpdir");
    let anchor = common::write_anchor(td.path());
    let manifest = common::test_manifest(anchor, "idle", 4, false);

    let mut generator =
        ScriptedGenerator::repeating(common::upscaled_png(&common::anchor_sprite()));
    let store = RunStore::create(&td.path().join("runs"), "20260801_090000_dcdc_testchar_idle")
        .expect("store");
    let abort = Arc::new(AtomicBool::new(true)); // aborted before the first frame
    let mut orch = Orchestrator::new(
        &manifest,
        &mut generator,
        store,
        None,
        Arc::clone(&abort),
        BackoffPolicy::default(),
    )
    .expect("init");
    let outcome = orch.run().expect("run");
    drop(orch);

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(outcome.stop_reason, Some(ReasonCode::UserInterrupt));
    assert_eq!(outcome.state.approved_count(), 0);
    let status = sprite_pipeline::live_status(&outcome.state, None);
    assert!(status.resume_command.is_some(), "interrupt is recoverable");
}
