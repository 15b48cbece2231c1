//! Post-processing pipeline, in order: downsample (nearest-neighbor) ->
//! transparency enforcement -> contact-patch alignment. The residual drift
//! left after alignment is what the auditor's baseline metric measures.

use image::imageops::FilterType;
use image::{Rgba, RgbaImage};

use crate::anchor::{analyze_geometry, AnchorAnalysis};
use crate::codes::ReasonCode;
use crate::manifest::{AlignMethod, Manifest};
use crate::manifest::TransparencyMode;

#[derive(Debug)]
pub enum PostProcessError {
    Decode(String),
    ResolutionRatio { width: u32, height: u32, target: u32 },
    NoAlpha,
}

impl PostProcessError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            PostProcessError::Decode(_) => ReasonCode::Hf03ImageCorrupted,
            PostProcessError::ResolutionRatio { .. } => ReasonCode::HfResolutionRatio,
            PostProcessError::NoAlpha => ReasonCode::HfNoAlpha,
        }
    }
}

impl std::fmt::Display for PostProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostProcessError::Decode(e) => write!(f, "candidate failed to decode: {e}"),
            PostProcessError::ResolutionRatio {
                width,
                height,
                target,
            } => write!(
                f,
                "candidate {width}x{height} is not an exact integer multiple (>= 2) of target {target}"
            ),
            PostProcessError::NoAlpha => {
                write!(f, "candidate carries no alpha channel in true_alpha mode")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessedCandidate {
    pub image: RgbaImage,
    pub auto_aligned: bool,
    pub shift_x: i32,
    pub shift_y: i32,
    pub chroma_key: Option<[u8; 3]>,
}

pub struct PostProcessor<'a> {
    manifest: &'a Manifest,
    anchor: &'a AnchorAnalysis,
}

impl<'a> PostProcessor<'a> {
    pub fn new(manifest: &'a Manifest, anchor: &'a AnchorAnalysis) -> PostProcessor<'a> {
        PostProcessor { manifest, anchor }
    }

    /// Run the full pipeline on raw generator output. `force_align` is set on
    /// post-process-only retries: it applies full contact-patch alignment even
    /// when the manifest's policy would normally suppress part of it.
    pub fn process(
        &self,
        raw_bytes: &[u8],
        force_align: bool,
    ) -> Result<ProcessedCandidate, PostProcessError> {
        let decoded = image::load_from_memory(raw_bytes)
            .map_err(|e| PostProcessError::Decode(e.to_string()))?;
        let had_alpha = decoded.color().has_alpha();
        let rgba = decoded.to_rgba8();

        let target = self.manifest.target_size;
        let (w, h) = rgba.dimensions();
        let ratio_ok = w == h
            && target > 0
            && w % target == 0
            && w / target >= 2;
        if !ratio_ok {
            return Err(PostProcessError::ResolutionRatio {
                width: w,
                height: h,
                target,
            });
        }

        let mut img = image::imageops::resize(&rgba, target, target, FilterType::Nearest);

        let chroma_key = match self.manifest.transparency {
            TransparencyMode::TrueAlpha => {
                if !had_alpha {
                    return Err(PostProcessError::NoAlpha);
                }
                None
            }
            TransparencyMode::ChromaKey => {
                let (chroma, tolerance) = select_chroma(&self.anchor.palette);
                apply_chroma_key(&mut img, chroma, tolerance);
                Some(chroma)
            }
        };

        let (shift_x, shift_y, auto_aligned) = self.alignment_shift(&img, force_align);
        if shift_x != 0 || shift_y != 0 {
            img = translate(&img, shift_x, shift_y);
        }

        Ok(ProcessedCandidate {
            image: img,
            auto_aligned,
            shift_x,
            shift_y,
            chroma_key,
        })
    }

    fn alignment_shift(&self, img: &RgbaImage, force_align: bool) -> (i32, i32, bool) {
        let policy = &self.manifest.alignment;
        let method_enabled = policy.method != AlignMethod::None || force_align;
        if !method_enabled {
            return (0, 0, false);
        }
        let Some(geom) = analyze_geometry(img, policy.root_zone_ratio) else {
            // Nothing opaque to align; HF02 will reject this candidate.
            return (0, 0, false);
        };

        let mut shift_y = self.anchor.baseline_y as i32 - geom.baseline_y as i32;
        if !policy.vertical_lock && !force_align {
            shift_y = 0;
        }
        let raw_shift_x = (self.anchor.centroid_x - geom.centroid_x).round() as i32;
        // Safety valve: a huge horizontal correction means the candidate's
        // silhouette is wrong, not merely offset.
        let max_x = policy.max_shift_x as i32;
        let shift_x = raw_shift_x.clamp(-max_x, max_x);

        let applied = shift_x != 0 || shift_y != 0;
        (shift_x, shift_y, applied)
    }
}

/// Furthest-neighbor chroma selection: among the usual chroma candidates pick
/// the one maximizing the minimum RGB distance to any anchor color, then key
/// with a tolerance strictly below that minimum so legitimate sprite pixels
/// survive.
pub fn select_chroma(palette: &[[u8; 3]]) -> ([u8; 3], f64) {
    const CANDIDATES: [[u8; 3]; 4] = [
        [255, 0, 255], // magenta
        [0, 255, 0],   // green
        [0, 255, 255], // cyan
        [0, 0, 255],   // blue
    ];
    let mut best = CANDIDATES[0];
    let mut best_min = -1.0f64;
    for c in CANDIDATES {
        let min_d = palette
            .iter()
            .map(|p| rgb_distance(c, *p))
            .fold(f64::INFINITY, f64::min);
        let min_d = if min_d.is_finite() { min_d } else { 441.7 };
        if min_d > best_min {
            best_min = min_d;
            best = c;
        }
    }
    let tolerance = (best_min / 2.0).min(64.0).max(1.0);
    (best, tolerance)
}

fn apply_chroma_key(img: &mut RgbaImage, chroma: [u8; 3], tolerance: f64) {
    for p in img.pixels_mut() {
        let [r, g, b, _] = p.0;
        if rgb_distance([r, g, b], chroma) <= tolerance {
            *p = Rgba([0, 0, 0, 0]);
        }
    }
}

pub fn rgb_distance(a: [u8; 3], b: [u8; 3]) -> f64 {
    let dr = a[0] as f64 - b[0] as f64;
    let dg = a[1] as f64 - b[1] as f64;
    let db = a[2] as f64 - b[2] as f64;
    (dr * dr + dg * dg + db * db).sqrt()
}

/// Translate by (dx, dy), filling exposed pixels with transparent.
pub fn translate(img: &RgbaImage, dx: i32, dy: i32) -> RgbaImage {
    let (w, h) = img.dimensions();
    let mut out = RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 0]));
    for (x, y, p) in img.enumerate_pixels() {
        let nx = x as i32 + dx;
        let ny = y as i32 + dy;
        if nx >= 0 && ny >= 0 && (nx as u32) < w && (ny as u32) < h {
            out.put_pixel(nx as u32, ny as u32, *p);
        }
    }
    out
}
