//! Manifest: the immutable input describing one `(character, move)` animation
//! job. Identified by `manifest_hash`, the first 16 hex chars of SHA-256 over
//! a canonicalized (recursively key-sorted) JSON serialization, so the hash is
//! independent of source key order and of the YAML/JSON surface syntax.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::pose::PoseEntry;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignMethod {
    ContactPatch,
    None,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentPolicy {
    pub method: AlignMethod,
    pub vertical_lock: bool,
    pub max_shift_x: u32,
    pub root_zone_ratio: f64,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        AlignmentPolicy {
            method: AlignMethod::ContactPatch,
            vertical_lock: true,
            max_shift_x: 32,
            root_zone_ratio: 0.15,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransparencyMode {
    TrueAlpha,
    ChromaKey,
}

impl Default for TransparencyMode {
    fn default() -> Self {
        TransparencyMode::TrueAlpha
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryTuning {
    pub max_attempts_per_frame: u32,
}

impl Default for RetryTuning {
    fn default() -> Self {
        RetryTuning {
            max_attempts_per_frame: 5,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StopThresholds {
    pub max_retry_rate: f64,
    pub max_reject_rate: f64,
    pub max_consecutive_fails: u32,
    pub circuit_breaker_limit: u32,
}

impl Default for StopThresholds {
    fn default() -> Self {
        StopThresholds {
            max_retry_rate: 0.5,
            max_reject_rate: 0.3,
            max_consecutive_fails: 3,
            circuit_breaker_limit: 50,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    pub identity: f64,
    pub palette: f64,
    pub baseline: f64,
    pub line_weight: f64,
    pub temporal: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        MetricWeights {
            identity: 0.40,
            palette: 0.20,
            baseline: 0.20,
            line_weight: 0.10,
            temporal: 0.10,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub pass_threshold: f64,
    pub weights: MetricWeights,
    pub identity_min: f64,
    pub palette_min: f64,
    /// SSIM window edge length in pixels (odd; clamped to the canvas).
    pub ssim_window: u32,
    pub delta_e_limit: f64,
    pub baseline_pass_px: u32,
    pub baseline_max_px: u32,
    pub orphan_pixel_limit: u32,
    pub halo_fraction_limit: f64,
    pub min_file_size_bytes: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            pass_threshold: 0.85,
            weights: MetricWeights::default(),
            identity_min: 0.85,
            palette_min: 0.90,
            ssim_window: 7,
            delta_e_limit: 2.3,
            baseline_pass_px: 1,
            baseline_max_px: 8,
            orphan_pixel_limit: 15,
            halo_fraction_limit: 0.02,
            min_file_size_bytes: 10 * 1024,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    /// Frame 0, attempt 1: establish the animation from the anchor alone.
    pub master: String,
    /// Identity rescue: re-assert the anchor after drift.
    pub lock: String,
    /// Frames > 0, attempt 1: advance the motion from the previous frame.
    pub variation: String,
    /// Appended to every resolved command.
    pub negative: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        PromptTemplates {
            master: "Render {character} performing the first frame of the {move} animation. \
                     Reproduce the pixel-art style, palette and proportions of IMAGE 1 exactly. \
                     Keep the character standing on the same ground line as IMAGE 1."
                .to_string(),
            lock: "Redraw {character} for frame {frame} of {total} of the {move} animation. \
                   IMAGE 1 is the identity truth: copy its face, palette and proportions \
                   pixel-faithfully. Pose: {pose}."
                .to_string(),
            variation: "Draw frame {frame} of {total} of the {move} animation for {character}. \
                        Pose: {pose}. Keep identity, palette and ground line identical to IMAGE 1."
                .to_string(),
            negative: "No outlines thicker than one pixel, no anti-aliasing, no gradients, \
                       no background, no text, no watermarks, no drop shadows."
                .to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationTuning {
    pub model_id: String,
    /// Must stay unset: the oracle runs at its default temperature. Lower
    /// values empirically cause mode collapse, so validation rejects any
    /// override.
    pub temperature: Option<f32>,
}

impl Default for GenerationTuning {
    fn default() -> Self {
        GenerationTuning {
            model_id: "gemini-2.0-flash-exp-image".to_string(),
            temperature: None,
        }
    }
}

/// Immutable job description. Read once per run; never mutated afterwards.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub character: String,
    #[serde(rename = "move")]
    pub move_id: String,
    pub total_frames: u32,
    #[serde(default)]
    pub is_loop: bool,
    pub anchor: PathBuf,
    pub generation_size: u32,
    pub target_size: u32,
    #[serde(default)]
    pub alignment: AlignmentPolicy,
    #[serde(default)]
    pub transparency: TransparencyMode,
    #[serde(default)]
    pub retry: RetryTuning,
    #[serde(default)]
    pub stop: StopThresholds,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub prompts: PromptTemplates,
    #[serde(default)]
    pub generation: GenerationTuning,
    #[serde(default)]
    pub poses: Vec<PoseEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> io::Result<Manifest> {
        let text = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_yaml::from_str(&text).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {e}", path.display()),
            )
        })?;
        Ok(manifest)
    }

    /// Validate tunables against the contract. Collects every violation so a
    /// user can fix the manifest in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errs = Vec::new();
        if self.character.trim().is_empty() {
            errs.push("character must not be empty".to_string());
        }
        if self.move_id.trim().is_empty() {
            errs.push("move must not be empty".to_string());
        }
        if self.total_frames == 0 {
            errs.push("total_frames must be >= 1".to_string());
        }
        if self.target_size == 0 {
            errs.push("target_size must be >= 1".to_string());
        } else {
            if self.generation_size % self.target_size != 0 {
                errs.push(format!(
                    "generation_size {} must be an integer multiple of target_size {}",
                    self.generation_size, self.target_size
                ));
            }
            if self.generation_size < self.target_size * 4 {
                errs.push(format!(
                    "generation_size {} must be at least 4x target_size {}",
                    self.generation_size, self.target_size
                ));
            }
        }
        if self.generation.temperature.is_some() {
            errs.push(
                "generation.temperature is locked to the model default; remove the override"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.audit.pass_threshold) {
            errs.push("audit.pass_threshold must be within [0, 1]".to_string());
        }
        if self.alignment.root_zone_ratio <= 0.0 || self.alignment.root_zone_ratio > 1.0 {
            errs.push("alignment.root_zone_ratio must be within (0, 1]".to_string());
        }
        if self.retry.max_attempts_per_frame == 0 {
            errs.push("retry.max_attempts_per_frame must be >= 1".to_string());
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(errs)
        }
    }

    /// Stable identity of this manifest: 16 hex chars of SHA-256 over the
    /// canonical serialization.
    pub fn manifest_hash(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let canonical = canonical_json(&value);
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }
}

/// Compact JSON with recursively sorted object keys. Key order of the source
/// document must not influence the hash.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Canonical in-crate test fixture; kept here so imaging tests share one
/// known-good manifest shape.
#[cfg(test)]
pub(crate) fn test_manifest() -> Manifest {
    Manifest {
        character: "testchar".into(),
        move_id: "idle".into(),
        total_frames: 4,
        is_loop: true,
        anchor: PathBuf::from("anchor.png"),
        generation_size: 512,
        target_size: 128,
        alignment: AlignmentPolicy::default(),
        transparency: TransparencyMode::TrueAlpha,
        retry: RetryTuning::default(),
        stop: StopThresholds::default(),
        audit: AuditConfig::default(),
        prompts: PromptTemplates::default(),
        generation: GenerationTuning::default(),
        poses: Vec::new(),
    }
}
