//! Run store: the bit-stable run folder layout, artifact naming, atomic
//! state persistence and the advisory single-writer lock.
//!
//! Layout:
//! ```text
//! runs/{YYYYMMDD}_{HHMMSS}_{4-hex}_{character}_{move}/
//!   state.json  manifest.lock.json  summary.json  diagnostic.json  README.md
//!   candidates/  approved/  rejected/  audit/  logs/  export/
//! ```
//! Frame-index padding is exactly 4 digits; attempt padding exactly 2.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::anchor::AnchorAnalysis;
use crate::codes::ReasonCode;
use crate::state::RunState;
use crate::util::fs::{atomic_write, atomic_write_json, read_json};

pub const STATE_FILE: &str = "state.json";
pub const MANIFEST_LOCK_FILE: &str = "manifest.lock.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const DIAGNOSTIC_FILE: &str = "diagnostic.json";
const WRITER_LOCK_FILE: &str = ".writer.lock";

/// Immutable run snapshot written once at INIT. The manifest hash recorded
/// here may never change for the life of the run.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ManifestLock {
    pub run_id: String,
    /// ISO-8601.
    pub run_start: String,
    pub manifest_hash: String,
    pub model_id: String,
    pub adapter_version: String,
    /// Crate version + host triple fingerprint.
    pub runtime: String,
    pub os: String,
    /// Forward-slash-normalized absolute input paths.
    pub inputs: LockInputs,
    /// Anchor analysis is computed once and cached here for resumption.
    pub anchor_analysis: AnchorAnalysis,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct LockInputs {
    pub anchor: String,
    pub manifest: Option<String>,
}

pub fn runtime_fingerprint() -> String {
    format!(
        "sprite-pipeline/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH
    )
}

/// Advisory writer lock on a run folder; unlocks and removes the lock file on
/// drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let path = self.path.clone();
        for _ in 0..10 {
            if !path.exists() || fs::remove_file(&path).is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }
}

/// Acquire the single-writer lock for a run folder (non-blocking).
pub fn acquire_run_lock(run_dir: &Path) -> io::Result<RunLock> {
    let p = run_dir.join(WRITER_LOCK_FILE);
    if let Some(parent) = p.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&p)?;
    match f.try_lock_exclusive() {
        Ok(_) => Ok(RunLock { file: f, path: p }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::other(format!(
            "run folder {} already has an active writer",
            run_dir.display()
        ))),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
pub struct RunStore {
    dir: PathBuf,
    _lock: RunLock,
}

impl RunStore {
    /// Create a fresh run folder (all subdirectories plus README) and take
    /// the writer lock.
    pub fn create(runs_root: &Path, run_id: &str) -> io::Result<RunStore> {
        let dir = runs_root.join(run_id);
        for sub in ["candidates", "approved", "rejected", "audit", "logs", "export"] {
            fs::create_dir_all(dir.join(sub))?;
        }
        let lock = acquire_run_lock(&dir)?;
        let store = RunStore { dir, _lock: lock };
        store.write_readme()?;
        Ok(store)
    }

    /// Open an existing run folder for resumption; takes the writer lock and
    /// repairs any missing subdirectory.
    pub fn open(dir: &Path) -> io::Result<RunStore> {
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("run folder {} does not exist", dir.display()),
            ));
        }
        let lock = acquire_run_lock(dir)?;
        for sub in ["candidates", "approved", "rejected", "audit", "logs", "export"] {
            fs::create_dir_all(dir.join(sub))?;
        }
        Ok(RunStore {
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.dir.join("export")
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn candidate_path(&self, frame: u32, attempt: u32, suffix: Option<&str>) -> PathBuf {
        let name = match suffix {
            Some(s) => format!("frame_{frame:04}_attempt_{attempt:02}.{s}.png"),
            None => format!("frame_{frame:04}_attempt_{attempt:02}.png"),
        };
        self.dir.join("candidates").join(name)
    }

    pub fn approved_path(&self, frame: u32) -> PathBuf {
        self.dir.join("approved").join(format!("frame_{frame:04}.png"))
    }

    pub fn rejected_path(&self, frame: u32, code: ReasonCode) -> PathBuf {
        self.dir
            .join("rejected")
            .join(format!("frame_{frame:04}_{}.png", code.as_str()))
    }

    pub fn audit_path(&self, frame: u32, attempt: u32) -> PathBuf {
        self.dir
            .join("audit")
            .join(format!("frame_{frame:04}_attempt_{attempt:02}.json"))
    }

    pub fn save_state(&self, state: &RunState) -> io::Result<()> {
        atomic_write_json(&self.state_path(), state)
    }

    pub fn load_state(&self) -> io::Result<RunState> {
        read_json(&self.state_path())
    }

    pub fn write_manifest_lock(&self, lock: &ManifestLock) -> io::Result<()> {
        atomic_write_json(&self.dir.join(MANIFEST_LOCK_FILE), lock)
    }

    pub fn load_manifest_lock(&self) -> io::Result<ManifestLock> {
        read_json(&self.dir.join(MANIFEST_LOCK_FILE))
    }

    pub fn write_summary<T: Serialize>(&self, summary: &T) -> io::Result<()> {
        atomic_write_json(&self.dir.join(SUMMARY_FILE), summary)
    }

    pub fn write_diagnostic<T: Serialize>(&self, diagnostic: &T) -> io::Result<()> {
        atomic_write_json(&self.dir.join(DIAGNOSTIC_FILE), diagnostic)
    }

    /// Persist raw candidate bytes for one attempt.
    pub fn write_candidate(
        &self,
        frame: u32,
        attempt: u32,
        suffix: Option<&str>,
        bytes: &[u8],
    ) -> io::Result<PathBuf> {
        let path = self.candidate_path(frame, attempt, suffix);
        atomic_write(&path, bytes)?;
        Ok(path)
    }

    pub fn write_audit<T: Serialize>(
        &self,
        frame: u32,
        attempt: u32,
        report: &T,
    ) -> io::Result<PathBuf> {
        let path = self.audit_path(frame, attempt);
        atomic_write_json(&path, report)?;
        Ok(path)
    }

    /// Promote an approved candidate: rename into `approved/`.
    pub fn promote_candidate(&self, frame: u32, from: &Path) -> io::Result<PathBuf> {
        let to = self.approved_path(frame);
        fs::rename(from, &to)?;
        Ok(to)
    }

    /// Move a terminally rejected frame's last candidate into `rejected/`
    /// with a reason-coded name and a metadata sibling.
    pub fn reject_candidate<T: Serialize>(
        &self,
        frame: u32,
        from: &Path,
        code: ReasonCode,
        metadata: &T,
    ) -> io::Result<PathBuf> {
        let to = self.rejected_path(frame, code);
        if from.exists() {
            fs::rename(from, &to)?;
        }
        let meta_path = self
            .dir
            .join("rejected")
            .join(format!("frame_{frame:04}_{}_metadata.json", code.as_str()));
        atomic_write_json(&meta_path, metadata)?;
        Ok(to)
    }

    fn write_readme(&self) -> io::Result<()> {
        let readme = self.dir.join("README.md");
        if readme.exists() {
            return Ok(());
        }
        atomic_write(&readme, README_TEXT.as_bytes())
    }
}

const README_TEXT: &str = "\
# Run folder

Produced by sprite-pipeline. Layout is stable; tools may rely on it.

- `state.json` - resumable run state, written atomically after every change
- `manifest.lock.json` - immutable snapshot of the manifest identity, model,
  runtime fingerprint and cached anchor analysis
- `summary.json` - written on completion
- `diagnostic.json` - written when the run stops early or completes partially
- `candidates/frame_XXXX_attempt_YY[.suffix].png` - raw post-processed attempts
- `approved/frame_XXXX.png` - frames that passed the audit
- `rejected/frame_XXXX_REASON.png` (+ `_metadata.json`) - terminally rejected frames
- `audit/frame_XXXX_attempt_YY.json` - per-attempt audit reports
- `logs/pipeline.log` - JSONL pipeline log
- `export/` - packed atlas outputs
";
