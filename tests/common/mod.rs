//! Shared fixtures for the end-to-end orchestrator tests: synthetic sprites,
//! manifests tuned for tiny test canvases, and canned generator responses.

use std::path::{Path, PathBuf};

use image::{Rgba, RgbaImage};
use sprite_pipeline::generator::{GeneratedImage, GeneratorError};
use sprite_pipeline::Manifest;

pub const TARGET: u32 = 64;
pub const GENERATION: u32 = 256;
pub const RATIO: u32 = GENERATION / TARGET;

/// The reference character: a large two-tone body with an accent stripe,
/// feet on row 59, transparent margin. Covers most of the canvas so SSIM
/// reacts strongly to shape/luma changes.
pub fn anchor_sprite() -> RgbaImage {
    let mut img = RgbaImage::from_pixel(TARGET, TARGET, Rgba([0, 0, 0, 0]));
    for y in 8..60 {
        for x in 8..56 {
            let color = if y < 20 {
                [220, 200, 160, 255] // head
            } else if (30..34).contains(&x) {
                [90, 60, 40, 255] // accent stripe
            } else {
                [180, 140, 100, 255] // body
            };
            img.put_pixel(x, y, Rgba(color));
        }
    }
    img
}

/// A visibly different character: different silhouette and much darker luma.
/// Scores far below the identity minimum against the anchor.
pub fn impostor_sprite() -> RgbaImage {
    let mut img = RgbaImage::from_pixel(TARGET, TARGET, Rgba([0, 0, 0, 0]));
    for y in 4..62 {
        for x in 2..62 {
            img.put_pixel(x, y, Rgba([40, 40, 200, 255]));
        }
    }
    img
}

pub fn png_bytes(img: &RgbaImage) -> Vec<u8> {
    sprite_pipeline::orchestrator::encode_png(img).expect("png encode")
}

/// What the oracle would return: the sprite rendered at generation size.
pub fn upscaled_png(img: &RgbaImage) -> Vec<u8> {
    let up = image::imageops::resize(
        img,
        GENERATION,
        GENERATION,
        image::imageops::FilterType::Nearest,
    );
    png_bytes(&up)
}

/// Generation-size render translated up by `dy` target pixels (feet float).
pub fn upscaled_shifted_png(img: &RgbaImage, dy_target: u32) -> Vec<u8> {
    let up = image::imageops::resize(
        img,
        GENERATION,
        GENERATION,
        image::imageops::FilterType::Nearest,
    );
    let shifted = sprite_pipeline::postprocess::translate(&up, 0, -((dy_target * RATIO) as i32));
    png_bytes(&shifted)
}

pub fn ok_response(bytes: Vec<u8>) -> Result<GeneratedImage, GeneratorError> {
    Ok(GeneratedImage {
        image_bytes: bytes,
        mime: "image/png".to_string(),
        model_id: "scripted".to_string(),
        reasoning_token: None,
    })
}

pub fn write_anchor(dir: &Path) -> PathBuf {
    let path = dir.join("anchor.png");
    std::fs::write(&path, png_bytes(&anchor_sprite())).expect("write anchor");
    path
}

/// Manifest tuned for the tiny test canvas: the HF05 wire-size gate is
/// lowered because synthetic flat-color PNGs compress to a few hundred bytes.
pub fn test_manifest(anchor: PathBuf, move_id: &str, total_frames: u32, is_loop: bool) -> Manifest {
    let yaml = format!(
        "character: testchar\nmove: {move_id}\ntotal_frames: {total_frames}\nis_loop: {is_loop}\n\
         anchor: {}\ngeneration_size: {GENERATION}\ntarget_size: {TARGET}\n\
         audit:\n  min_file_size_bytes: 1\n",
        anchor.display()
    );
    let manifest: Manifest = serde_yaml::from_str(&yaml).expect("manifest yaml");
    manifest.validate().expect("valid test manifest");
    manifest
}
