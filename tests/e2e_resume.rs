//! Crash resumption: a run killed mid-flight is detected, verified on disk
//! and continued from the first pending frame without regenerating approved
//! frames.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sprite_pipeline::{
    detect, BackoffPolicy, FrameStatus, Orchestrator, ResumeOutcome, RunState, RunStatus,
    RunStore, ScriptedGenerator,
};

mod common;

/// Fake the aftermath of a SIGKILL: frames 0..approved_count approved with
/// real PNGs on disk, state.json says in_progress, no process holds the lock.
fn crashed_run(
    runs_root: &Path,
    run_id: &str,
    manifest: &sprite_pipeline::Manifest,
    approved_count: u32,
) -> std::path::PathBuf {
    let dir = runs_root.join(run_id);
    std::fs::create_dir_all(dir.join("approved")).expect("mkdir");
    let mut state = RunState::new(run_id, &manifest.manifest_hash(), manifest.total_frames);
    state.status = RunStatus::InProgress;
    let png = common::png_bytes(&common::anchor_sprite());
    for i in 0..approved_count {
        let rel = format!("approved/frame_{i:04}.png");
        std::fs::write(dir.join(&rel), &png).expect("frame png");
        state.frame_states[i as usize].status = FrameStatus::Approved;
        state.frame_states[i as usize].approved_path = Some(rel);
        state.frame_states[i as usize]
            .attempts
            .push(sprite_pipeline::AttemptRecord {
                attempt_index: 1,
                timestamp: String::new(),
                prompt_hash: "00000000".into(),
                seed: i,
                result: sprite_pipeline::state::AttemptResult::Passed,
                reason_codes: vec![],
                composite_score: 1.0,
                duration_ms: 10,
                strategy: None,
            });
    }
    state.current_frame = approved_count;
    sprite_pipeline::util::fs::atomic_write_json(&dir.join("state.json"), &state).expect("state");
    dir
}

#[test]
fn test_resume_continues_at_first_pending_frame() {
    let td = tempfile::tempdir().expect("tmpdir");
    let anchor = common::write_anchor(td.path());
    let manifest = common::test_manifest(anchor, "idle", 4, false);
    let runs_root = td.path().join("runs");
    let run_id = "20260801_080000_baba_testchar_idle";
    let run_dir = crashed_run(&runs_root, run_id, &manifest, 3);

    let before: Vec<Vec<u8>> = (0..3u32)
        .map(|i| std::fs::read(run_dir.join(format!("approved/frame_{i:04}.png"))).unwrap())
        .collect();

    let outcome = detect(&runs_root, &manifest, false).expect("detect");
    let ResumeOutcome::Resume(decision) = outcome else {
        panic!("expected resume, got {outcome:?}");
    };
    assert_eq!(decision.first_pending_frame, 3);
    assert!(decision.demoted.is_empty());

    let store = RunStore::open(&decision.run_dir).expect("open");
    let mut generator =
        ScriptedGenerator::repeating(common::upscaled_png(&common::anchor_sprite()));
    let abort = Arc::new(AtomicBool::new(false));
    let mut orch = Orchestrator::new(
        &manifest,
        &mut generator,
        store,
        Some(decision.state),
        abort,
        BackoffPolicy::default(),
    )
    .expect("init");
    let outcome = orch.run().expect("run");
    drop(orch);

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.approved_count(), 4);
    assert_eq!(generator.calls(), 1, "only frame 3 regenerates");

    // Pre-existing approved frames are untouched bytes.
    for (i, bytes) in before.iter().enumerate() {
        let now = std::fs::read(run_dir.join(format!("approved/frame_{i:04}.png"))).unwrap();
        assert_eq!(&now, bytes, "frame {i} must not be regenerated");
    }
    assert!(run_dir.join("approved/frame_0003.png").is_file());
}

#[test]
fn test_resume_demotes_missing_frame_and_regenerates_it() {
    let td = tempfile::tempdir().expect("tmpdir");
    let anchor = common::write_anchor(td.path());
    let manifest = common::test_manifest(anchor, "idle", 4, false);
    let runs_root = td.path().join("runs");
    let run_id = "20260801_080000_cdcd_testchar_idle";
    let run_dir = crashed_run(&runs_root, run_id, &manifest, 3);
    std::fs::remove_file(run_dir.join("approved/frame_0001.png")).expect("delete frame 1");

    let outcome = detect(&runs_root, &manifest, false).expect("detect");
    let ResumeOutcome::Resume(decision) = outcome else {
        panic!("expected resume, got {outcome:?}");
    };
    assert_eq!(decision.demoted, vec![1]);
    assert_eq!(decision.first_pending_frame, 1);

    let store = RunStore::open(&decision.run_dir).expect("open");
    let mut generator =
        ScriptedGenerator::repeating(common::upscaled_png(&common::anchor_sprite()));
    let abort = Arc::new(AtomicBool::new(false));
    let mut orch = Orchestrator::new(
        &manifest,
        &mut generator,
        store,
        Some(decision.state),
        abort,
        BackoffPolicy::default(),
    )
    .expect("init");
    let outcome = orch.run().expect("run");
    drop(orch);

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.approved_count(), 4);
    // Frames 1 and 3 regenerate; 0 and 2 stay on disk.
    assert_eq!(generator.calls(), 2);
}

#[test]
fn test_resume_refuses_changed_manifest_without_force() {
    let td = tempfile::tempdir().expect("tmpdir");
    let anchor = common::write_anchor(td.path());
    let manifest = common::test_manifest(anchor.clone(), "idle", 4, false);
    let runs_root = td.path().join("runs");
    crashed_run(&runs_root, "20260801_080000_fefe_testchar_idle", &manifest, 2);

    let mut changed = common::test_manifest(anchor, "idle", 4, false);
    changed.is_loop = true;
    let outcome = detect(&runs_root, &changed, false).expect("detect");
    assert!(
        matches!(outcome, ResumeOutcome::HashMismatch { .. }),
        "got {outcome:?}"
    );
}

#[test]
fn test_fully_approved_run_reports_already_completed() {
    let td = tempfile::tempdir().expect("tmpdir");
    let anchor = common::write_anchor(td.path());
    let manifest = common::test_manifest(anchor, "idle", 3, false);
    let runs_root = td.path().join("runs");
    crashed_run(&runs_root, "20260801_080000_baba_testchar_idle", &manifest, 3);

    let outcome = detect(&runs_root, &manifest, false).expect("detect");
    assert!(
        matches!(outcome, ResumeOutcome::AlreadyCompleted { .. }),
        "got {outcome:?}"
    );
}
