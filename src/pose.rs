//! Pose library: per-frame motion descriptions fed to the prompt composer,
//! plus the move taxonomy the auditor uses for temporal-coherence thresholds.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tension {
    Relaxed,
    Tense,
    Explosive,
}

/// A manifest-supplied pose override for one frame of the move.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PoseEntry {
    pub frame: u32,
    pub description: String,
    #[serde(default = "default_tension")]
    pub tension: Tension,
}

fn default_tension() -> Tension {
    Tension::Relaxed
}

/// Resolved pose for `(move_id, frame_index)`.
#[derive(Clone, PartialEq, Debug)]
pub struct FramePose {
    pub description: String,
    pub tension: Tension,
}

/// Coarse move classification; drives temporal thresholds and fallback poses.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MoveCategory {
    Idle,
    Walk,
    Block,
    Attack,
    Jump,
    Hit,
    Special,
    Other,
}

impl MoveCategory {
    pub fn from_move_id(move_id: &str) -> MoveCategory {
        let m = move_id.to_ascii_lowercase();
        if m.contains("idle") || m.contains("stance") {
            MoveCategory::Idle
        } else if m.contains("walk") || m.contains("run") || m.contains("dash") {
            MoveCategory::Walk
        } else if m.contains("block") || m.contains("guard") {
            MoveCategory::Block
        } else if m.contains("punch")
            || m.contains("kick")
            || m.contains("attack")
            || m.contains("slash")
            || m.contains("strike")
        {
            MoveCategory::Attack
        } else if m.contains("jump") {
            MoveCategory::Jump
        } else if m.contains("hit") || m.contains("hurt") || m.contains("damage") {
            MoveCategory::Hit
        } else if m.contains("special") || m.contains("super") {
            MoveCategory::Special
        } else {
            MoveCategory::Other
        }
    }

    /// Max masked MAPD against the previous approved frame, or None when the
    /// metric is bypassed. Fast moves legitimately change most of the sprite
    /// between frames, so only slow cycles are held to a threshold.
    pub fn temporal_threshold(&self) -> Option<f64> {
        match self {
            MoveCategory::Idle => Some(0.02),
            MoveCategory::Walk => Some(0.10),
            MoveCategory::Block => Some(0.05),
            MoveCategory::Attack
            | MoveCategory::Jump
            | MoveCategory::Hit
            | MoveCategory::Special
            | MoveCategory::Other => None,
        }
    }

    fn default_tension(&self) -> Tension {
        match self {
            MoveCategory::Idle | MoveCategory::Walk => Tension::Relaxed,
            MoveCategory::Block | MoveCategory::Hit => Tension::Tense,
            MoveCategory::Attack | MoveCategory::Jump | MoveCategory::Special => {
                Tension::Explosive
            }
            MoveCategory::Other => Tension::Relaxed,
        }
    }
}

/// Per-move pose lookup. Manifest entries win; unspecified frames fall back
/// to a phase description derived from the move category.
pub struct PoseLibrary {
    move_id: String,
    total_frames: u32,
    category: MoveCategory,
    entries: Vec<PoseEntry>,
}

impl PoseLibrary {
    pub fn new(move_id: &str, total_frames: u32, entries: Vec<PoseEntry>) -> PoseLibrary {
        PoseLibrary {
            move_id: move_id.to_string(),
            total_frames,
            category: MoveCategory::from_move_id(move_id),
            entries,
        }
    }

    pub fn category(&self) -> MoveCategory {
        self.category
    }

    /// Frame 0 has no pose: the anchor IS frame 0.
    pub fn pose_for(&self, frame_index: u32) -> Option<FramePose> {
        if frame_index == 0 {
            return None;
        }
        if let Some(e) = self.entries.iter().find(|e| e.frame == frame_index) {
            return Some(FramePose {
                description: e.description.clone(),
                tension: e.tension,
            });
        }
        Some(self.fallback_pose(frame_index))
    }

    fn fallback_pose(&self, frame_index: u32) -> FramePose {
        let phase = if self.total_frames > 1 {
            frame_index as f64 / self.total_frames as f64
        } else {
            0.0
        };
        let stage = match self.category {
            MoveCategory::Idle => {
                if phase < 0.5 {
                    "breathing in, chest slightly raised"
                } else {
                    "breathing out, settling back to the rest pose"
                }
            }
            MoveCategory::Walk => {
                if phase < 0.25 {
                    "left foot planted, right foot lifting"
                } else if phase < 0.5 {
                    "right foot passing, weight centered"
                } else if phase < 0.75 {
                    "right foot planted, left foot lifting"
                } else {
                    "left foot passing, weight centered"
                }
            }
            MoveCategory::Block => "arms raised in guard, knees bent, weight low",
            MoveCategory::Attack => {
                if phase < 0.4 {
                    "wind-up, body coiled"
                } else if phase < 0.7 {
                    "full extension at the moment of impact"
                } else {
                    "follow-through, recovering balance"
                }
            }
            MoveCategory::Jump => {
                if phase < 0.4 {
                    "crouched, loading the jump"
                } else if phase < 0.7 {
                    "airborne at the apex, legs tucked"
                } else {
                    "descending, legs extending for the landing"
                }
            }
            MoveCategory::Hit => "recoiling from a hit, torso twisted back",
            MoveCategory::Special => "charging energy, stance wide and dramatic",
            MoveCategory::Other => "mid-motion of the move, weight balanced",
        };
        FramePose {
            description: format!(
                "{} (frame {} of {} of the {} cycle)",
                stage, frame_index, self.total_frames, self.move_id
            ),
            tension: self.category.default_tension(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_classification() {
        assert_eq!(MoveCategory::from_move_id("idle"), MoveCategory::Idle);
        assert_eq!(MoveCategory::from_move_id("walk_fwd"), MoveCategory::Walk);
        assert_eq!(MoveCategory::from_move_id("HighBlock"), MoveCategory::Block);
        assert_eq!(MoveCategory::from_move_id("punch_heavy"), MoveCategory::Attack);
        assert_eq!(MoveCategory::from_move_id("jump"), MoveCategory::Jump);
        assert_eq!(MoveCategory::from_move_id("hit_light"), MoveCategory::Hit);
        assert_eq!(MoveCategory::from_move_id("special1"), MoveCategory::Special);
        assert_eq!(MoveCategory::from_move_id("taunt"), MoveCategory::Other);
    }

    #[test]
    fn test_temporal_thresholds() {
        assert_eq!(MoveCategory::Idle.temporal_threshold(), Some(0.02));
        assert_eq!(MoveCategory::Walk.temporal_threshold(), Some(0.10));
        assert_eq!(MoveCategory::Block.temporal_threshold(), Some(0.05));
        assert_eq!(MoveCategory::Attack.temporal_threshold(), None);
        assert_eq!(MoveCategory::Jump.temporal_threshold(), None);
    }

    #[test]
    fn test_frame_zero_has_no_pose() {
        let lib = PoseLibrary::new("idle", 4, Vec::new());
        assert!(lib.pose_for(0).is_none());
        assert!(lib.pose_for(1).is_some());
    }

    #[test]
    fn test_manifest_entry_wins_over_fallback() {
        let lib = PoseLibrary::new(
            "idle",
            4,
            vec![PoseEntry {
                frame: 2,
                description: "custom pose".into(),
                tension: Tension::Tense,
            }],
        );
        let p = lib.pose_for(2).unwrap();
        assert_eq!(p.description, "custom pose");
        assert_eq!(p.tension, Tension::Tense);
        let q = lib.pose_for(1).unwrap();
        assert!(q.description.contains("frame 1 of 4"));
    }
}
