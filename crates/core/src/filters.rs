//! Whole-image pixel filters.
//!
//! Every filter blends the source with a "degenerate" version of itself:
//! `out = degenerate + strength * (source - degenerate)`, clipped to `[0, 1]`.
//! A strength of 1 returns the source, 0 returns the degenerate image, and
//! values above 1 push away from it.

use std::fmt;

use ndarray::{Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::buffer::NormalizedImage;

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// 3x3 smoothing kernel `[[1,1,1],[1,5,1],[1,1,1]]`, normalized by 13.
const SMOOTH_CENTER: f32 = 5.0;
const SMOOTH_SCALE: f32 = 13.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Sharpness,
    Color,
    Brightness,
    Contrast,
}

impl FilterKind {
    pub const ALL: [FilterKind; 4] = [
        FilterKind::Sharpness,
        FilterKind::Color,
        FilterKind::Brightness,
        FilterKind::Contrast,
    ];

    /// Case-insensitive lookup by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sharpness" => Some(Self::Sharpness),
            "color" => Some(Self::Color),
            "brightness" => Some(Self::Brightness),
            "contrast" => Some(Self::Contrast),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sharpness => "sharpness",
            Self::Color => "color",
            Self::Brightness => "brightness",
            Self::Contrast => "contrast",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn apply_filter(kind: FilterKind, image: &NormalizedImage, strength: f32) -> NormalizedImage {
    let source = image.view();
    let degenerate = match kind {
        FilterKind::Brightness => Array3::zeros(source.raw_dim()),
        FilterKind::Contrast => Array3::from_elem(source.raw_dim(), mean_luma_level(source)),
        FilterKind::Color => grayscale(source),
        FilterKind::Sharpness => smooth(source),
    };

    let mut out = degenerate;
    Zip::from(&mut out).and(&source).for_each(|d, &s| {
        *d = (*d + strength * (s - *d)).clamp(0.0, 1.0);
    });

    NormalizedImage::new(out).unwrap_or_else(|_| image.clone())
}

fn luma(r: f32, g: f32, b: f32) -> f32 {
    LUMA_R * r + LUMA_G * g + LUMA_B * b
}

fn grayscale(source: ArrayView3<'_, f32>) -> Array3<f32> {
    let (h, w, c) = source.dim();
    Array3::from_shape_fn((h, w, c), |(y, x, _)| {
        luma(source[[y, x, 0]], source[[y, x, 1]], source[[y, x, 2]])
    })
}

/// Mean luminance snapped to the nearest 8-bit level.
fn mean_luma_level(source: ArrayView3<'_, f32>) -> f32 {
    let (h, w, _) = source.dim();
    let pixels = (h * w).max(1) as f64;
    let total: f64 = source
        .lanes(Axis(2))
        .into_iter()
        .map(|px| f64::from(luma(px[0], px[1], px[2])))
        .sum();
    ((total / pixels * 255.0 + 0.5).floor() / 255.0) as f32
}

/// 3x3 smoothing; the one-pixel border is copied unchanged.
fn smooth(source: ArrayView3<'_, f32>) -> Array3<f32> {
    let (h, w, channels) = source.dim();
    let mut out = source.to_owned();
    if h < 3 || w < 3 {
        return out;
    }

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            for c in 0..channels {
                let mut sum = 0.0;
                for dy in 0..3 {
                    for dx in 0..3 {
                        let weight = if dy == 1 && dx == 1 { SMOOTH_CENTER } else { 1.0 };
                        sum += weight * source[[y + dy - 1, x + dx - 1, c]];
                    }
                }
                out[[y, x, c]] = sum / SMOOTH_SCALE;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_from_fn(h: usize, w: usize, f: impl Fn(usize, usize, usize) -> f32) -> NormalizedImage {
        NormalizedImage::new(Array3::from_shape_fn((h, w, 3), |(y, x, c)| f(y, x, c))).unwrap()
    }

    fn checker() -> NormalizedImage {
        image_from_fn(6, 6, |y, x, c| {
            if (y + x) % 2 == 0 {
                0.8 - c as f32 * 0.1
            } else {
                0.2 + c as f32 * 0.1
            }
        })
    }

    fn max_diff(a: &NormalizedImage, b: &NormalizedImage) -> f32 {
        a.view()
            .iter()
            .zip(b.view().iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!(FilterKind::from_name("Sharpness"), Some(FilterKind::Sharpness));
        assert_eq!(FilterKind::from_name(" CONTRAST "), Some(FilterKind::Contrast));
        assert_eq!(FilterKind::from_name("blur"), None);
        for kind in FilterKind::ALL {
            assert_eq!(FilterKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn unit_strength_is_identity() {
        let img = checker();
        for kind in FilterKind::ALL {
            let out = apply_filter(kind, &img, 1.0);
            assert!(max_diff(&out, &img) < 1e-6, "{kind} changed the image");
        }
    }

    #[test]
    fn zero_brightness_is_black() {
        let out = apply_filter(FilterKind::Brightness, &checker(), 0.0);
        assert!(out.view().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn brightness_scales_and_clips() {
        let img = image_from_fn(4, 4, |_, _, _| 0.6);
        let out = apply_filter(FilterKind::Brightness, &img, 1.5);
        assert!(out.view().iter().all(|&v| (v - 0.9).abs() < 1e-6));
        let out = apply_filter(FilterKind::Brightness, &img, 2.0);
        assert!(out.view().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn zero_color_is_grayscale() {
        let out = apply_filter(FilterKind::Color, &checker(), 0.0);
        let view = out.view();
        for y in 0..6 {
            for x in 0..6 {
                assert!((view[[y, x, 0]] - view[[y, x, 1]]).abs() < 1e-6);
                assert!((view[[y, x, 1]] - view[[y, x, 2]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn zero_contrast_is_flat_mean() {
        let img = image_from_fn(2, 2, |y, _, _| if y == 0 { 0.2 } else { 0.6 });
        let out = apply_filter(FilterKind::Contrast, &img, 0.0);
        let expected = 102.0 / 255.0;
        assert!(out.view().iter().all(|&v| (v - expected).abs() < 1e-6));
    }

    #[test]
    fn contrast_above_one_spreads_values() {
        let img = image_from_fn(2, 2, |y, _, _| if y == 0 { 0.4 } else { 0.6 });
        let out = apply_filter(FilterKind::Contrast, &img, 2.0);
        let view = out.view();
        assert!(view[[0, 0, 0]] < 0.4);
        assert!(view[[1, 0, 0]] > 0.6);
    }

    #[test]
    fn smoothing_keeps_border_and_averages_interior() {
        let img = image_from_fn(3, 3, |y, x, _| if y == 1 && x == 1 { 1.0 } else { 0.0 });
        let smoothed = smooth(img.view());
        assert_eq!(smoothed[[0, 0, 0]], 0.0);
        assert!((smoothed[[1, 1, 0]] - 5.0 / 13.0).abs() < 1e-6);
    }

    #[test]
    fn sharpening_amplifies_local_contrast() {
        let img = image_from_fn(3, 3, |y, x, _| if y == 1 && x == 1 { 0.6 } else { 0.4 });
        let out = apply_filter(FilterKind::Sharpness, &img, 2.0);
        assert!(out.view()[[1, 1, 0]] > 0.6);
        assert_eq!(out.view()[[0, 0, 0]], 0.4);
    }
}
