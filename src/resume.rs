//! Resumption detector: scans prior runs for one that matches the manifest,
//! verifies it is actually continuable (hash + on-disk frames) and reports
//! where to pick up.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::manifest::Manifest;
use crate::state::{FrameStatus, RunState, RunStatus};
use crate::store::STATE_FILE;
use crate::util::id::sanitize_component;

#[derive(Debug)]
pub struct ResumeDecision {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub state: RunState,
    pub first_pending_frame: u32,
    /// Frames whose approved PNG was missing or empty on disk; demoted back
    /// to pending in the returned state.
    pub demoted: Vec<u32>,
}

#[derive(Debug)]
pub enum ResumeOutcome {
    /// No prior run to continue; start fresh.
    Fresh,
    Resume(Box<ResumeDecision>),
    AlreadyCompleted { run_id: String },
    HashMismatch {
        run_id: String,
        stored: String,
        current: String,
    },
}

/// Scan `runs_root` for the most recent resumable run of this manifest.
pub fn detect(runs_root: &Path, manifest: &Manifest, force: bool) -> io::Result<ResumeOutcome> {
    let suffix = format!(
        "_{}_{}",
        sanitize_component(&manifest.character),
        sanitize_component(&manifest.move_id)
    );
    let mut best: Option<(SystemTime, PathBuf, RunState)> = None;

    for entry in WalkDir::new(runs_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if !name.ends_with(&suffix.to_ascii_lowercase()) {
            continue;
        }
        let state_path = entry.path().join(STATE_FILE);
        let Ok(state) = crate::util::fs::read_json::<RunState>(&state_path) else {
            // Missing or corrupt state: not a resume candidate.
            continue;
        };
        if !matches!(
            state.status,
            RunStatus::InProgress | RunStatus::Paused | RunStatus::Pending
        ) {
            continue;
        }
        let mtime = state_path
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().map(|(t, _, _)| mtime > *t).unwrap_or(true) {
            best = Some((mtime, entry.path().to_path_buf(), state));
        }
    }

    match best {
        Some((_, dir, state)) => decide(dir, state, manifest, force),
        None => Ok(ResumeOutcome::Fresh),
    }
}

/// Resume an explicitly named run (`pipeline run --resume RUN_ID`). Unlike
/// the scan, a stopped run is accepted here: recoverable stop reasons
/// advertise exactly this command.
pub fn detect_by_id(
    runs_root: &Path,
    run_id: &str,
    manifest: &Manifest,
    force: bool,
) -> io::Result<ResumeOutcome> {
    let dir = runs_root.join(run_id);
    let state: RunState = crate::util::fs::read_json(&dir.join(STATE_FILE))?;
    if !state.status.is_resumable() && !force {
        return Err(io::Error::other(format!(
            "run {run_id} has status {} and cannot be resumed",
            state.status.as_str()
        )));
    }
    decide(dir, state, manifest, force)
}

fn decide(
    run_dir: PathBuf,
    mut state: RunState,
    manifest: &Manifest,
    force: bool,
) -> io::Result<ResumeOutcome> {
    let run_id = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let current = manifest.manifest_hash();
    if state.manifest_hash != current && !force {
        return Ok(ResumeOutcome::HashMismatch {
            run_id,
            stored: state.manifest_hash.clone(),
            current,
        });
    }

    // Verify every approved frame still exists and is non-empty; demote the
    // rest so they regenerate.
    let mut demoted = Vec::new();
    for frame in state.frame_states.iter_mut() {
        if frame.status != FrameStatus::Approved {
            continue;
        }
        let ok = frame
            .approved_path
            .as_ref()
            .map(|p| {
                let path = resolve_artifact(&run_dir, p);
                path.metadata().map(|m| m.len() > 0).unwrap_or(false)
            })
            .unwrap_or(false);
        if !ok {
            demoted.push(frame.index);
            frame.status = FrameStatus::Pending;
            frame.approved_path = None;
            frame.final_reason = None;
        }
    }

    match state.first_pending_frame() {
        None => Ok(ResumeOutcome::AlreadyCompleted { run_id }),
        Some(first_pending_frame) => Ok(ResumeOutcome::Resume(Box::new(ResumeDecision {
            run_dir,
            run_id,
            state,
            first_pending_frame,
            demoted,
        }))),
    }
}

/// Approved paths are stored relative to the run folder; tolerate absolute
/// paths from older runs.
fn resolve_artifact(run_dir: &Path, stored: &str) -> PathBuf {
    let p = PathBuf::from(stored);
    if p.is_absolute() {
        p
    } else {
        run_dir.join(p)
    }
}
