//! Hard gates, checked in a fixed order; the first failure short-circuits and
//! rejects the candidate before any soft metric runs.

use image::RgbaImage;

use crate::codes::ReasonCode;

pub struct GateInput<'a> {
    /// Raw generator payload size (HF05 is about wire bytes, not canvas).
    pub raw_len: usize,
    /// Post-processed candidate on the target canvas.
    pub image: &'a RgbaImage,
    /// Whether an alpha channel exists (native or synthesized by chroma key).
    pub has_alpha: bool,
    pub target_size: u32,
    pub min_file_size: u64,
}

/// Ordered gate walk: HF01 dimension, HF02 fully transparent, HF04 color
/// depth, HF05 file size. HF03 (decode failure) fires upstream in the
/// post-processor, before a canvas exists to gate.
pub fn check(input: &GateInput<'_>) -> Option<ReasonCode> {
    let (w, h) = input.image.dimensions();
    if w != input.target_size || h != input.target_size {
        return Some(ReasonCode::Hf01DimensionMismatch);
    }
    if !input.image.pixels().any(|p| p.0[3] >= 1) {
        return Some(ReasonCode::Hf02FullyTransparent);
    }
    if !input.has_alpha {
        return Some(ReasonCode::Hf04WrongColorDepth);
    }
    if (input.raw_len as u64) < input.min_file_size {
        return Some(ReasonCode::Hf05FileSizeInvalid);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn opaque_canvas(size: u32) -> RgbaImage {
        RgbaImage::from_pixel(size, size, Rgba([10, 10, 10, 255]))
    }

    fn input(image: &RgbaImage) -> GateInput<'_> {
        GateInput {
            raw_len: 20_000,
            image,
            has_alpha: true,
            target_size: 16,
            min_file_size: 10 * 1024,
        }
    }

    #[test]
    fn test_clean_candidate_passes() {
        let img = opaque_canvas(16);
        assert_eq!(check(&input(&img)), None);
    }

    #[test]
    fn test_hf01_wrong_dimensions() {
        let img = opaque_canvas(8);
        assert_eq!(
            check(&input(&img)),
            Some(ReasonCode::Hf01DimensionMismatch)
        );
    }

    #[test]
    fn test_hf02_fires_before_later_gates() {
        let img = RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 0]));
        let mut i = input(&img);
        i.raw_len = 0; // HF05 would also fail; HF02 must win
        i.has_alpha = false; // HF04 would also fail
        assert_eq!(check(&i), Some(ReasonCode::Hf02FullyTransparent));
    }

    #[test]
    fn test_hf04_wrong_color_depth() {
        let img = opaque_canvas(16);
        let mut i = input(&img);
        i.has_alpha = false;
        assert_eq!(check(&i), Some(ReasonCode::Hf04WrongColorDepth));
    }

    #[test]
    fn test_hf05_small_file() {
        let img = opaque_canvas(16);
        let mut i = input(&img);
        i.raw_len = 512;
        assert_eq!(check(&i), Some(ReasonCode::Hf05FileSizeInvalid));
    }
}
