//! Anchor analysis: extract the invariants every candidate is measured
//! against. The same geometry pass runs on candidates during alignment, so
//! anchor and candidate are always measured with identical rules.

use std::io;
use std::path::Path;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::codes::ReasonCode;

/// Alpha at or above this value counts as opaque for geometry and palette.
pub const OPAQUE_ALPHA: u8 = 128;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }
}

/// Geometry shared by anchor and candidates: floor line plus contact patch.
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SpriteGeometry {
    pub bbox: BoundingBox,
    /// y of the lowest row containing at least one opaque pixel.
    pub baseline_y: u32,
    /// Alpha-weighted x-centroid of the root zone (bottom slice of the bbox).
    pub centroid_x: f64,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AnchorAnalysis {
    pub width: u32,
    pub height: u32,
    /// Unique RGB tuples of opaque pixels, sorted for stable serialization.
    pub palette: Vec<[u8; 3]>,
    pub has_transparency: bool,
    pub bbox: BoundingBox,
    pub baseline_y: u32,
    pub centroid_x: f64,
}

impl AnchorAnalysis {
    pub fn geometry(&self) -> SpriteGeometry {
        SpriteGeometry {
            bbox: self.bbox,
            baseline_y: self.baseline_y,
            centroid_x: self.centroid_x,
        }
    }
}

#[derive(Debug)]
pub enum AnchorError {
    Io(io::Error),
    Invalid(String),
}

impl From<io::Error> for AnchorError {
    fn from(e: io::Error) -> Self {
        AnchorError::Io(e)
    }
}

impl AnchorError {
    pub fn reason_code(&self) -> ReasonCode {
        ReasonCode::HfInvalidAnchor
    }
}

impl std::fmt::Display for AnchorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnchorError::Io(e) => write!(f, "HF_INVALID_ANCHOR: {e}"),
            AnchorError::Invalid(s) => write!(f, "HF_INVALID_ANCHOR: {s}"),
        }
    }
}

/// Decode and analyze the anchor PNG. Rejects a missing alpha channel and
/// dimensions other than `target_size x target_size`.
pub fn analyze_anchor(
    path: &Path,
    target_size: u32,
    root_zone_ratio: f64,
) -> Result<AnchorAnalysis, AnchorError> {
    let decoded = image::open(path)
        .map_err(|e| AnchorError::Invalid(format!("{}: {e}", path.display())))?;
    if !decoded.color().has_alpha() {
        return Err(AnchorError::Invalid(format!(
            "{}: anchor must carry an alpha channel",
            path.display()
        )));
    }
    let img = decoded.to_rgba8();
    analyze_anchor_image(&img, target_size, root_zone_ratio)
}

pub fn analyze_anchor_image(
    img: &RgbaImage,
    target_size: u32,
    root_zone_ratio: f64,
) -> Result<AnchorAnalysis, AnchorError> {
    let (w, h) = img.dimensions();
    if w != target_size || h != target_size {
        return Err(AnchorError::Invalid(format!(
            "anchor is {w}x{h}, expected {target_size}x{target_size}"
        )));
    }
    let geometry = analyze_geometry(img, root_zone_ratio).ok_or_else(|| {
        AnchorError::Invalid("anchor contains no opaque pixels".to_string())
    })?;

    let mut palette: Vec<[u8; 3]> = Vec::new();
    let mut has_transparency = false;
    let mut seen = std::collections::BTreeSet::new();
    for p in img.pixels() {
        let [r, g, b, a] = p.0;
        if a < 255 {
            has_transparency = true;
        }
        if a >= OPAQUE_ALPHA && seen.insert([r, g, b]) {
            palette.push([r, g, b]);
        }
    }
    palette.sort();

    Ok(AnchorAnalysis {
        width: w,
        height: h,
        palette,
        has_transparency,
        bbox: geometry.bbox,
        baseline_y: geometry.baseline_y,
        centroid_x: geometry.centroid_x,
    })
}

/// Baseline, bounding box and root-zone centroid of any RGBA sprite.
/// Returns None when the image has no opaque pixels.
pub fn analyze_geometry(img: &RgbaImage, root_zone_ratio: f64) -> Option<SpriteGeometry> {
    let (w, h) = img.dimensions();
    let mut min_x = w;
    let mut min_y = h;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    let mut any = false;
    for (x, y, p) in img.enumerate_pixels() {
        if p.0[3] >= OPAQUE_ALPHA {
            any = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if !any {
        return None;
    }
    let bbox = BoundingBox {
        min_x,
        min_y,
        max_x,
        max_y,
    };

    // Root zone: bottom `root_zone_ratio` slice of the visible bbox, at least
    // one row deep.
    let visible_h = bbox.height();
    let zone_rows = ((visible_h as f64 * root_zone_ratio).ceil() as u32).max(1);
    let zone_top = max_y.saturating_sub(zone_rows - 1);

    let mut weight = 0.0f64;
    let mut weighted_x = 0.0f64;
    for y in zone_top..=max_y {
        for x in min_x..=max_x {
            let a = img.get_pixel(x, y).0[3];
            if a > 0 {
                weight += a as f64;
                weighted_x += a as f64 * x as f64;
            }
        }
    }
    let centroid_x = if weight > 0.0 {
        weighted_x / weight
    } else {
        (min_x + max_x) as f64 / 2.0
    };

    Some(SpriteGeometry {
        bbox,
        baseline_y: max_y,
        centroid_x,
    })
}
