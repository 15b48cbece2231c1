//! Auditor: hard gates, then weighted soft metrics, producing an
//! [`AuditReport`] with reason codes and a recommended correction. The
//! auditor is handed to the orchestrator as a capability and holds no
//! reference back to it.

pub mod gates;
pub mod metrics;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::anchor::{analyze_geometry, AnchorAnalysis};
use crate::codes::ReasonCode;
use crate::manifest::AuditConfig;
use crate::pose::MoveCategory;
use crate::postprocess::ProcessedCandidate;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    /// Re-run post-processing (alignment) only; no regeneration needed.
    Align,
    Regenerate,
    None,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct MetricScores {
    pub identity: f64,
    pub palette: f64,
    pub baseline: f64,
    pub line_weight: f64,
    pub temporal: f64,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AuditReport {
    pub composite_score: f64,
    pub flags: Vec<ReasonCode>,
    pub passed: bool,
    pub auto_aligned: bool,
    /// Residual baseline drift after alignment, in pixels.
    pub drift_pixels: u32,
    pub shift_x: i32,
    pub shift_y: i32,
    pub scores: MetricScores,
    pub correction: Correction,
}

impl AuditReport {
    pub fn hard_fail(code: ReasonCode, candidate: Option<&ProcessedCandidate>) -> AuditReport {
        AuditReport {
            composite_score: 0.0,
            flags: vec![code],
            passed: false,
            auto_aligned: candidate.map(|c| c.auto_aligned).unwrap_or(false),
            drift_pixels: 0,
            shift_x: candidate.map(|c| c.shift_x).unwrap_or(0),
            shift_y: candidate.map(|c| c.shift_y).unwrap_or(0),
            scores: MetricScores {
                identity: 0.0,
                palette: 0.0,
                baseline: 0.0,
                line_weight: 0.0,
                temporal: 0.0,
            },
            correction: Correction::Regenerate,
        }
    }

    /// The flag the retry ladder escalates on, in metric priority order.
    pub fn primary_reason(&self) -> Option<ReasonCode> {
        const PRIORITY: [ReasonCode; 6] = [
            ReasonCode::Sf01IdentityDrift,
            ReasonCode::Sf02PaletteDrift,
            ReasonCode::Sf03BaselineDrift,
            ReasonCode::Sf04TemporalIncoherence,
            ReasonCode::SfPixelNoise,
            ReasonCode::SfAlphaHalo,
        ];
        for p in PRIORITY {
            if self.flags.contains(&p) {
                return Some(p);
            }
        }
        self.flags.first().copied()
    }
}

pub struct Auditor {
    config: AuditConfig,
    anchor: AnchorAnalysis,
    category: MoveCategory,
    anchor_image: RgbaImage,
    root_zone_ratio: f64,
}

impl Auditor {
    pub fn new(
        config: AuditConfig,
        anchor: AnchorAnalysis,
        anchor_image: RgbaImage,
        category: MoveCategory,
        root_zone_ratio: f64,
    ) -> Auditor {
        Auditor {
            config,
            anchor,
            category,
            anchor_image,
            root_zone_ratio,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Full audit of a post-processed candidate. `previous` is the previous
    /// approved frame on the target canvas, when one exists.
    pub fn audit(
        &self,
        raw_len: usize,
        candidate: &ProcessedCandidate,
        previous: Option<&RgbaImage>,
    ) -> AuditReport {
        let gate_input = gates::GateInput {
            raw_len,
            image: &candidate.image,
            has_alpha: true,
            target_size: self.anchor.width,
            min_file_size: self.config.min_file_size_bytes,
        };
        if let Some(code) = gates::check(&gate_input) {
            return AuditReport::hard_fail(code, Some(candidate));
        }

        let cfg = &self.config;
        let mut flags: Vec<ReasonCode> = Vec::new();

        // SF01: structural identity vs the anchor, post-alignment.
        let identity = metrics::ssim(&candidate.image, &self.anchor_image, cfg.ssim_window);
        if identity < cfg.identity_min {
            flags.push(ReasonCode::Sf01IdentityDrift);
        }

        // SF02: palette conformance in Lab space.
        let palette =
            metrics::palette_conformance(&candidate.image, &self.anchor.palette, cfg.delta_e_limit);
        if palette < cfg.palette_min {
            flags.push(ReasonCode::Sf02PaletteDrift);
        }

        // SF03: residual baseline drift after alignment.
        let drift = analyze_geometry(&candidate.image, self.root_zone_ratio)
            .map(|g| (g.baseline_y as i64 - self.anchor.baseline_y as i64).unsigned_abs() as u32)
            .unwrap_or(0);
        let baseline = baseline_score(drift, cfg.baseline_pass_px, cfg.baseline_max_px);
        if drift > cfg.baseline_pass_px {
            flags.push(ReasonCode::Sf03BaselineDrift);
        }

        // SF04: temporal coherence against the previous approved frame.
        let temporal = match (self.category.temporal_threshold(), previous) {
            (Some(threshold), Some(prev)) => {
                match metrics::masked_mapd(&candidate.image, prev) {
                    Some(mapd) if mapd > threshold => {
                        flags.push(ReasonCode::Sf04TemporalIncoherence);
                        (threshold / mapd).clamp(0.0, 1.0)
                    }
                    Some(_) => 1.0,
                    // No overlapping silhouette at all is maximal incoherence.
                    None => {
                        flags.push(ReasonCode::Sf04TemporalIncoherence);
                        0.0
                    }
                }
            }
            _ => 1.0,
        };

        // Line weight: orphan specks and soft edges.
        let orphans = metrics::orphan_pixels(&candidate.image);
        let noise_score = if orphans == 0 {
            1.0
        } else {
            (cfg.orphan_pixel_limit as f64 / orphans as f64).min(1.0)
        };
        if orphans > cfg.orphan_pixel_limit {
            flags.push(ReasonCode::SfPixelNoise);
        }
        let halo = metrics::alpha_halo_fraction(&candidate.image);
        let halo_score = if halo <= cfg.halo_fraction_limit {
            1.0
        } else {
            (cfg.halo_fraction_limit / halo).clamp(0.0, 1.0)
        };
        if halo > cfg.halo_fraction_limit {
            flags.push(ReasonCode::SfAlphaHalo);
        }
        let line_weight = noise_score.min(halo_score);

        let scores = MetricScores {
            identity,
            palette,
            baseline,
            line_weight,
            temporal,
        };
        let composite = composite_score(&scores, cfg);
        let passed = flags.is_empty() && composite >= cfg.pass_threshold;

        let correction = if passed {
            Correction::None
        } else if flags == [ReasonCode::Sf03BaselineDrift] && drift <= cfg.baseline_max_px {
            Correction::Align
        } else {
            Correction::Regenerate
        };

        AuditReport {
            composite_score: composite,
            flags,
            passed,
            auto_aligned: candidate.auto_aligned,
            drift_pixels: drift,
            shift_x: candidate.shift_x,
            shift_y: candidate.shift_y,
            scores,
            correction,
        }
    }
}

/// Drift ≤ pass is a clean 1.0; up to max it degrades inside (0, 1); past max
/// it is a hard zero.
fn baseline_score(drift: u32, pass_px: u32, max_px: u32) -> f64 {
    if drift <= pass_px {
        1.0
    } else if drift <= max_px {
        let span = (max_px - pass_px + 1) as f64;
        1.0 - (drift - pass_px) as f64 / span
    } else {
        0.0
    }
}

fn composite_score(scores: &MetricScores, cfg: &AuditConfig) -> f64 {
    let w = &cfg.weights;
    let total = w.identity + w.palette + w.baseline + w.line_weight + w.temporal;
    if total <= 0.0 {
        return 0.0;
    }
    let sum = scores.identity * w.identity
        + scores.palette * w.palette
        + scores.baseline * w.baseline
        + scores.line_weight * w.line_weight
        + scores.temporal * w.temporal;
    (sum / total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::analyze_anchor_image;
    use image::Rgba;

    fn sprite(size: u32, color: [u8; 4]) -> RgbaImage {
        let mut img = RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 0]));
        for y in 8..size - 4 {
            for x in 8..size - 8 {
                img.put_pixel(x, y, Rgba(color));
            }
        }
        img
    }

    fn auditor_for(img: &RgbaImage, category: MoveCategory) -> Auditor {
        let analysis = analyze_anchor_image(img, img.width(), 0.15).expect("anchor");
        Auditor::new(
            AuditConfig {
                min_file_size_bytes: 1,
                ..AuditConfig::default()
            },
            analysis,
            img.clone(),
            category,
            0.15,
        )
    }

    fn candidate(img: &RgbaImage) -> ProcessedCandidate {
        ProcessedCandidate {
            image: img.clone(),
            auto_aligned: false,
            shift_x: 0,
            shift_y: 0,
            chroma_key: None,
        }
    }

    #[test]
    fn test_identical_candidate_scores_perfect() {
        let img = sprite(64, [180, 140, 100, 255]);
        let auditor = auditor_for(&img, MoveCategory::Idle);
        let report = auditor.audit(5_000, &candidate(&img), Some(&img));
        assert!(report.passed, "flags: {:?}", report.flags);
        // Invariant: composite 1.0 implies zero soft-fail flags.
        assert_eq!(report.composite_score, 1.0);
        assert!(report.flags.is_empty());
        assert_eq!(report.correction, Correction::None);
        assert_eq!(report.drift_pixels, 0);
    }

    #[test]
    fn test_impostor_flags_identity_first() {
        let img = sprite(64, [180, 140, 100, 255]);
        let auditor = auditor_for(&img, MoveCategory::Idle);
        let mut other = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 0]));
        for y in 2..62 {
            for x in 2..62 {
                other.put_pixel(x, y, Rgba([30, 30, 180, 255]));
            }
        }
        let report = auditor.audit(5_000, &candidate(&other), None);
        assert!(!report.passed);
        assert_eq!(report.primary_reason(), Some(ReasonCode::Sf01IdentityDrift));
        assert!(report.scores.identity < 0.85, "got {}", report.scores.identity);
        assert_eq!(report.correction, Correction::Regenerate);
    }

    #[test]
    fn test_temporal_bypassed_for_attack_moves() {
        let img = sprite(64, [180, 140, 100, 255]);
        let auditor = auditor_for(&img, MoveCategory::Attack);
        // Same identity, but a wildly different previous frame: the attack
        // category never fails on temporal incoherence.
        let mut prev = img.clone();
        for p in prev.pixels_mut() {
            if p.0[3] > 0 {
                *p = Rgba([10, 200, 10, 255]);
            }
        }
        let report = auditor.audit(5_000, &candidate(&img), Some(&prev));
        assert!(report.passed, "flags: {:?}", report.flags);
        assert_eq!(report.scores.temporal, 1.0);
    }

    #[test]
    fn test_temporal_flags_idle_divergence() {
        let img = sprite(64, [180, 140, 100, 255]);
        let auditor = auditor_for(&img, MoveCategory::Idle);
        let mut prev = img.clone();
        for p in prev.pixels_mut() {
            if p.0[3] > 0 {
                *p = Rgba([100, 60, 180, 255]);
            }
        }
        let report = auditor.audit(5_000, &candidate(&img), Some(&prev));
        assert!(report
            .flags
            .contains(&ReasonCode::Sf04TemporalIncoherence));
        assert!(report.scores.temporal < 1.0);
    }

    #[test]
    fn test_hard_gate_short_circuits_soft_metrics() {
        let img = sprite(64, [180, 140, 100, 255]);
        let auditor = auditor_for(&img, MoveCategory::Idle);
        let empty = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 0]));
        let report = auditor.audit(5_000, &candidate(&empty), None);
        assert!(!report.passed);
        assert_eq!(report.flags, vec![ReasonCode::Hf02FullyTransparent]);
        assert_eq!(report.composite_score, 0.0);
    }

    #[test]
    fn test_baseline_score_bands() {
        assert_eq!(baseline_score(0, 1, 8), 1.0);
        assert_eq!(baseline_score(1, 1, 8), 1.0);
        let mid = baseline_score(4, 1, 8);
        assert!(mid > 0.0 && mid < 1.0, "got {mid}");
        let edge = baseline_score(8, 1, 8);
        assert!(edge > 0.0 && edge < 1.0, "got {edge}");
        assert_eq!(baseline_score(9, 1, 8), 0.0);
    }

    #[test]
    fn test_composite_weighted_sum() {
        let cfg = AuditConfig::default();
        let perfect = MetricScores {
            identity: 1.0,
            palette: 1.0,
            baseline: 1.0,
            line_weight: 1.0,
            temporal: 1.0,
        };
        assert!((composite_score(&perfect, &cfg) - 1.0).abs() < 1e-12);

        let half = MetricScores {
            identity: 0.5,
            palette: 1.0,
            baseline: 1.0,
            line_weight: 1.0,
            temporal: 1.0,
        };
        // identity weight 0.4 -> composite 0.8
        assert!((composite_score(&half, &cfg) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_primary_reason_priority() {
        let mut report = AuditReport::hard_fail(ReasonCode::Hf05FileSizeInvalid, None);
        report.flags = vec![
            ReasonCode::SfAlphaHalo,
            ReasonCode::Sf01IdentityDrift,
            ReasonCode::Sf03BaselineDrift,
        ];
        assert_eq!(report.primary_reason(), Some(ReasonCode::Sf01IdentityDrift));
    }
}
