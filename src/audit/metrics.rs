//! Soft-metric math: SSIM identity scoring, CIE L*a*b* palette conformance,
//! masked temporal difference, orphan-pixel and alpha-halo counts. All inputs
//! are post-alignment RGBA canvases of identical dimensions.

use image::RgbaImage;

use crate::anchor::OPAQUE_ALPHA;

/// Block-mean SSIM over the luma channel. Transparent pixels contribute zero
/// luma, which makes silhouette changes count against identity as intended.
pub fn ssim(a: &RgbaImage, b: &RgbaImage, window: u32) -> f64 {
    let (w, h) = a.dimensions();
    if b.dimensions() != (w, h) || w == 0 || h == 0 {
        return 0.0;
    }
    let win = window.clamp(1, w.min(h)) as usize;
    let la = luma_plane(a);
    let lb = luma_plane(b);

    const K1: f64 = 0.01;
    const K2: f64 = 0.03;
    const L: f64 = 255.0;
    let c1 = (K1 * L) * (K1 * L);
    let c2 = (K2 * L) * (K2 * L);

    let mut total = 0.0f64;
    let mut blocks = 0u32;
    let (w, h) = (w as usize, h as usize);
    let mut by = 0;
    while by < h {
        let mut bx = 0;
        while bx < w {
            let x_end = (bx + win).min(w);
            let y_end = (by + win).min(h);
            let n = ((x_end - bx) * (y_end - by)) as f64;

            let mut sum_a = 0.0;
            let mut sum_b = 0.0;
            for y in by..y_end {
                for x in bx..x_end {
                    sum_a += la[y * w + x];
                    sum_b += lb[y * w + x];
                }
            }
            let mu_a = sum_a / n;
            let mu_b = sum_b / n;

            let mut var_a = 0.0;
            let mut var_b = 0.0;
            let mut cov = 0.0;
            for y in by..y_end {
                for x in bx..x_end {
                    let da = la[y * w + x] - mu_a;
                    let db = lb[y * w + x] - mu_b;
                    var_a += da * da;
                    var_b += db * db;
                    cov += da * db;
                }
            }
            var_a /= n;
            var_b /= n;
            cov /= n;

            let s = ((2.0 * mu_a * mu_b + c1) * (2.0 * cov + c2))
                / ((mu_a * mu_a + mu_b * mu_b + c1) * (var_a + var_b + c2));
            total += s;
            blocks += 1;
            bx += win;
        }
        by += win;
    }
    if blocks == 0 {
        return 0.0;
    }
    (total / blocks as f64).clamp(0.0, 1.0)
}

fn luma_plane(img: &RgbaImage) -> Vec<f64> {
    img.pixels()
        .map(|p| {
            let [r, g, b, a] = p.0;
            if a < OPAQUE_ALPHA {
                0.0
            } else {
                0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64
            }
        })
        .collect()
}

/// Fraction of opaque pixels whose nearest anchor-palette color sits within
/// `delta_e_limit` (CIE76). 1.0 when the image has no opaque pixels: an empty
/// canvas has no palette violations, HF02 owns that case.
pub fn palette_conformance(img: &RgbaImage, palette: &[[u8; 3]], delta_e_limit: f64) -> f64 {
    if palette.is_empty() {
        return 0.0;
    }
    let lab_palette: Vec<[f64; 3]> = palette.iter().map(|c| rgb_to_lab(*c)).collect();
    let mut opaque = 0u64;
    let mut conforming = 0u64;
    for p in img.pixels() {
        let [r, g, b, a] = p.0;
        if a < OPAQUE_ALPHA {
            continue;
        }
        opaque += 1;
        let lab = rgb_to_lab([r, g, b]);
        let best = lab_palette
            .iter()
            .map(|pl| delta_e76(lab, *pl))
            .fold(f64::INFINITY, f64::min);
        if best <= delta_e_limit {
            conforming += 1;
        }
    }
    if opaque == 0 {
        1.0
    } else {
        conforming as f64 / opaque as f64
    }
}

/// Masked mean absolute pixel difference against the previous approved frame.
/// The mask is the intersection of opaque pixels; None when the mask is empty.
pub fn masked_mapd(a: &RgbaImage, b: &RgbaImage) -> Option<f64> {
    if a.dimensions() != b.dimensions() {
        return None;
    }
    let mut n = 0u64;
    let mut sum = 0.0f64;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        if pa.0[3] >= OPAQUE_ALPHA && pb.0[3] >= OPAQUE_ALPHA {
            n += 1;
            let d = (pa.0[0] as f64 - pb.0[0] as f64).abs()
                + (pa.0[1] as f64 - pb.0[1] as f64).abs()
                + (pa.0[2] as f64 - pb.0[2] as f64).abs();
            sum += d / 3.0 / 255.0;
        }
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Opaque pixels whose four orthogonal neighbors all differ (different RGB or
/// not opaque). Isolated specks read as generator noise in pixel art.
pub fn orphan_pixels(img: &RgbaImage) -> u32 {
    let (w, h) = img.dimensions();
    let mut count = 0;
    for (x, y, p) in img.enumerate_pixels() {
        if p.0[3] < OPAQUE_ALPHA {
            continue;
        }
        let me = [p.0[0], p.0[1], p.0[2]];
        let neighbors = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        let all_differ = neighbors.iter().all(|&(nx, ny)| {
            if nx >= w || ny >= h {
                return true; // off-canvas counts as differing
            }
            let q = img.get_pixel(nx, ny);
            q.0[3] < OPAQUE_ALPHA || [q.0[0], q.0[1], q.0[2]] != me
        });
        if all_differ {
            count += 1;
        }
    }
    count
}

/// Fraction of edge pixels (visible pixel adjacent to a fully transparent
/// one) carrying a fractional alpha. Clean pixel art has hard edges.
pub fn alpha_halo_fraction(img: &RgbaImage) -> f64 {
    let (w, h) = img.dimensions();
    let mut edge = 0u64;
    let mut halo = 0u64;
    for (x, y, p) in img.enumerate_pixels() {
        let a = p.0[3];
        if a == 0 {
            continue;
        }
        let neighbors = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        let touches_transparent = neighbors.iter().any(|&(nx, ny)| {
            nx < w && ny < h && img.get_pixel(nx, ny).0[3] == 0
        });
        if touches_transparent {
            edge += 1;
            if a < 255 {
                halo += 1;
            }
        }
    }
    if edge == 0 {
        0.0
    } else {
        halo as f64 / edge as f64
    }
}

/// sRGB (8-bit) to CIE L*a*b* under D65.
pub fn rgb_to_lab(rgb: [u8; 3]) -> [f64; 3] {
    fn inv_gamma(c: f64) -> f64 {
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    }
    let r = inv_gamma(rgb[0] as f64 / 255.0);
    let g = inv_gamma(rgb[1] as f64 / 255.0);
    let b = inv_gamma(rgb[2] as f64 / 255.0);

    // sRGB D65 reference white.
    let x = (0.4124 * r + 0.3576 * g + 0.1805 * b) / 0.95047;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = (0.0193 * r + 0.1192 * g + 0.9505 * b) / 1.08883;

    fn f(t: f64) -> f64 {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    }
    let fx = f(x);
    let fy = f(y);
    let fz = f(z);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

pub fn delta_e76(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dl = a[0] - b[0];
    let da = a[1] - b[1];
    let db = a[2] - b[2];
    (dl * dl + da * da + db * db).sqrt()
}
