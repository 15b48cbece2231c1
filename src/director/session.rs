//! Director session store: persists per-frame human overrides (nudges,
//! inpaint patches, manual approvals) separately from the orchestrator's run
//! state. All writes are schema-validated and atomic; a malformed session
//! file surfaces SESSION_CORRUPTED and is never auto-recovered.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::util::fs::{atomic_write_json, read_json};

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Committed,
    Discarded,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectorFrameStatus {
    Pending,
    Generated,
    AuditWarn,
    AuditFail,
    Approved,
}

/// Director frame lattice: PENDING -> GENERATED -> {APPROVED, AUDIT_WARN,
/// AUDIT_FAIL}; warn/fail -> APPROVED by human override; APPROVED terminal.
pub fn frame_transition_allowed(from: DirectorFrameStatus, to: DirectorFrameStatus) -> bool {
    use DirectorFrameStatus::*;
    matches!(
        (from, to),
        (Pending, Generated)
            | (Generated, Approved)
            | (Generated, AuditWarn)
            | (Generated, AuditFail)
            | (AuditWarn, Approved)
            | (AuditFail, Approved)
    )
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Nudge {
    pub dx: i32,
    pub dy: i32,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PatchRecord {
    pub mask_path: String,
    pub prompt: String,
    pub timestamp: String,
}

#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct DirectorOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<Nudge>,
    #[serde(default)]
    pub patch_history: Vec<PatchRecord>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct DirectorFrame {
    #[serde(rename = "frameIndex")]
    pub frame_index: u32,
    pub status: DirectorFrameStatus,
    #[serde(default)]
    pub director_overrides: DirectorOverrides,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct DirectorSession {
    pub session_id: String,
    pub run_id: String,
    pub move_id: String,
    pub anchor_frame_id: u32,
    pub status: SessionStatus,
    pub created_at: String,
    pub last_modified: String,
    pub frames: Vec<DirectorFrame>,
}

impl DirectorSession {
    pub fn new(run_id: &str, move_id: &str, total_frames: u32) -> DirectorSession {
        let now = crate::util::id::now_rfc3339();
        DirectorSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            move_id: move_id.to_string(),
            anchor_frame_id: 0,
            status: SessionStatus::Active,
            created_at: now.clone(),
            last_modified: now,
            frames: (0..total_frames)
                .map(|i| DirectorFrame {
                    frame_index: i,
                    status: DirectorFrameStatus::Pending,
                    director_overrides: DirectorOverrides::default(),
                })
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.session_id.trim().is_empty() {
            return Err(SessionError::Corrupted("empty session_id".into()));
        }
        if uuid::Uuid::parse_str(&self.session_id).is_err() {
            return Err(SessionError::Corrupted(format!(
                "session_id {} is not a UUID",
                self.session_id
            )));
        }
        for (i, f) in self.frames.iter().enumerate() {
            if f.frame_index != i as u32 {
                return Err(SessionError::Corrupted(format!(
                    "frame index {} at position {i}",
                    f.frame_index
                )));
            }
        }
        Ok(())
    }
}

/// Load/save wrapper binding a session to its JSON file.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    session: DirectorSession,
}

impl SessionStore {
    pub fn create(path: &Path, session: DirectorSession) -> Result<SessionStore, SessionError> {
        let store = SessionStore {
            path: path.to_path_buf(),
            session,
        };
        store.save()?;
        Ok(store)
    }

    pub fn load(path: &Path) -> Result<SessionStore, SessionError> {
        let session: DirectorSession = read_json(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                SessionError::Corrupted(e.to_string())
            } else {
                SessionError::Io(e)
            }
        })?;
        session.validate()?;
        Ok(SessionStore {
            path: path.to_path_buf(),
            session,
        })
    }

    pub fn session(&self) -> &DirectorSession {
        &self.session
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), SessionError> {
        atomic_write_json(&self.path, &self.session).map_err(SessionError::Io)
    }

    fn touch_and_save(&mut self) -> Result<(), SessionError> {
        self.session.last_modified = crate::util::id::now_rfc3339();
        self.save()
    }

    fn frame_mut(&mut self, index: u32) -> Result<&mut DirectorFrame, SessionError> {
        self.session
            .frames
            .iter_mut()
            .find(|f| f.frame_index == index)
            .ok_or(SessionError::UnknownFrame(index))
    }

    pub fn set_frame_status(
        &mut self,
        index: u32,
        to: DirectorFrameStatus,
    ) -> Result<(), SessionError> {
        let frame = self.frame_mut(index)?;
        if !frame_transition_allowed(frame.status, to) {
            return Err(SessionError::InvalidTransition {
                from: format!("{:?}", frame.status),
                to: format!("{to:?}"),
            });
        }
        frame.status = to;
        self.touch_and_save()
    }

    /// Merge an alignment nudge; repeated nudges accumulate.
    pub fn apply_nudge(&mut self, index: u32, dx: i32, dy: i32) -> Result<Nudge, SessionError> {
        let frame = self.frame_mut(index)?;
        let merged = match frame.director_overrides.alignment {
            Some(n) => Nudge {
                dx: n.dx + dx,
                dy: n.dy + dy,
            },
            None => Nudge { dx, dy },
        };
        frame.director_overrides.alignment = Some(merged);
        self.touch_and_save()?;
        Ok(merged)
    }

    pub fn apply_patch(
        &mut self,
        index: u32,
        mask_path: &str,
        prompt: &str,
    ) -> Result<(), SessionError> {
        let record = PatchRecord {
            mask_path: mask_path.to_string(),
            prompt: prompt.to_string(),
            timestamp: crate::util::id::now_rfc3339(),
        };
        let frame = self.frame_mut(index)?;
        frame.director_overrides.patch_history.push(record);
        self.touch_and_save()
    }

    pub fn commit(&mut self) -> Result<(), SessionError> {
        self.session.status = SessionStatus::Committed;
        self.touch_and_save()
    }

    pub fn discard(&mut self) -> Result<(), SessionError> {
        self.session.status = SessionStatus::Discarded;
        self.touch_and_save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, SessionStore) {
        let td = tempfile::tempdir().expect("tmpdir");
        let path = td.path().join("session.json");
        let store = SessionStore::create(&path, DirectorSession::new("run1", "idle", 4))
            .expect("create");
        (td, store)
    }

    #[test]
    fn test_create_and_reload_round_trip() {
        let (_td, store) = scratch_store();
        let back = SessionStore::load(store.path()).expect("load");
        assert_eq!(back.session(), store.session());
        assert_eq!(back.session().frames.len(), 4);
        assert_eq!(back.session().status, SessionStatus::Active);
    }

    #[test]
    fn test_malformed_session_is_corrupted() {
        let td = tempfile::tempdir().expect("tmpdir");
        let path = td.path().join("session.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = SessionStore::load(&path).expect_err("must fail");
        assert!(matches!(err, SessionError::Corrupted(_)), "{err:?}");
    }

    #[test]
    fn test_bad_uuid_is_corrupted() {
        let td = tempfile::tempdir().expect("tmpdir");
        let path = td.path().join("session.json");
        let mut session = DirectorSession::new("run1", "idle", 1);
        session.session_id = "not-a-uuid".into();
        atomic_write_json(&path, &session).unwrap();
        let err = SessionStore::load(&path).expect_err("must fail");
        assert!(matches!(err, SessionError::Corrupted(_)));
    }

    #[test]
    fn test_frame_status_lattice() {
        use DirectorFrameStatus::*;
        assert!(frame_transition_allowed(Pending, Generated));
        assert!(frame_transition_allowed(Generated, AuditFail));
        assert!(frame_transition_allowed(AuditFail, Approved));
        assert!(frame_transition_allowed(AuditWarn, Approved));
        assert!(!frame_transition_allowed(Pending, Approved));
        assert!(!frame_transition_allowed(Approved, Generated));
        assert!(!frame_transition_allowed(AuditFail, Generated));
    }

    #[test]
    fn test_set_frame_status_enforces_lattice() {
        let (_td, mut store) = scratch_store();
        store
            .set_frame_status(1, DirectorFrameStatus::Generated)
            .expect("pending -> generated");
        store
            .set_frame_status(1, DirectorFrameStatus::AuditFail)
            .expect("generated -> audit_fail");
        store
            .set_frame_status(1, DirectorFrameStatus::Approved)
            .expect("human override");
        let err = store
            .set_frame_status(1, DirectorFrameStatus::Generated)
            .expect_err("approved is terminal");
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[test]
    fn test_nudges_accumulate_and_persist() {
        let (_td, mut store) = scratch_store();
        store.apply_nudge(2, 3, -1).expect("nudge");
        let merged = store.apply_nudge(2, -1, 2).expect("nudge");
        assert_eq!(merged, Nudge { dx: 2, dy: 1 });
        let back = SessionStore::load(store.path()).expect("reload");
        assert_eq!(
            back.session().frames[2].director_overrides.alignment,
            Some(Nudge { dx: 2, dy: 1 })
        );
    }

    #[test]
    fn test_patch_history_appends() {
        let (_td, mut store) = scratch_store();
        store.apply_patch(0, "masks/m1.png", "fix the hand").unwrap();
        store.apply_patch(0, "masks/m2.png", "fix the foot").unwrap();
        let back = SessionStore::load(store.path()).expect("reload");
        let history = &back.session().frames[0].director_overrides.patch_history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].prompt, "fix the hand");
        assert_eq!(history[1].mask_path, "masks/m2.png");
    }

    #[test]
    fn test_unknown_frame() {
        let (_td, mut store) = scratch_store();
        let err = store.apply_nudge(99, 1, 1).expect_err("no frame 99");
        assert!(matches!(err, SessionError::UnknownFrame(99)));
    }
}
