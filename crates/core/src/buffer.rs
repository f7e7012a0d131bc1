//! Canonical in-memory image buffers.
//!
//! Two representations flow through the pipeline:
//! - [`NormalizedImage`]: `f32` HWC samples in `[0, 1]`, used for processing.
//! - [`DisplayImage`]: `u8` HWC samples in `[0, 255]`, used for storage/display.
//!
//! Both are fixed to three (RGB) channels.

use ndarray::{Array3, ArrayView3};

use crate::error::{EnhanceError, Result};

pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pixels: Array3<f32>,
}

impl NormalizedImage {
    pub fn new(pixels: Array3<f32>) -> Result<Self> {
        check_channels(pixels.shape()[2])?;
        Ok(Self { pixels })
    }

    /// Build from interleaved RGB8 bytes, scaling each sample by 1/255.
    pub fn from_rgb8(data: &[u8], width: usize, height: usize) -> Result<Self> {
        let expected = width * height * CHANNELS;
        if data.len() != expected {
            return Err(EnhanceError::BufferShape(format!(
                "rgb buffer length mismatch: expected {expected} ({height}x{width}x3), got {}",
                data.len()
            )));
        }
        let samples: Vec<f32> = data.iter().map(|&v| f32::from(v) / 255.0).collect();
        let pixels = Array3::from_shape_vec((height, width, CHANNELS), samples)
            .map_err(|e| EnhanceError::BufferShape(e.to_string()))?;
        Ok(Self { pixels })
    }

    pub fn from_display(image: &DisplayImage) -> Self {
        Self {
            pixels: image.pixels.mapv(|v| f32::from(v) / 255.0),
        }
    }

    pub fn height(&self) -> usize {
        self.pixels.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.pixels.shape()[1]
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.pixels.view()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pixels: Array3<u8>,
}

impl DisplayImage {
    pub fn new(pixels: Array3<u8>) -> Result<Self> {
        check_channels(pixels.shape()[2])?;
        Ok(Self { pixels })
    }

    pub fn height(&self) -> usize {
        self.pixels.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.pixels.shape()[1]
    }

    pub fn view(&self) -> ArrayView3<'_, u8> {
        self.pixels.view()
    }

    /// Interleaved RGB8 bytes in row-major order.
    pub fn to_rgb8(&self) -> Vec<u8> {
        self.pixels.iter().copied().collect()
    }
}

fn check_channels(actual: usize) -> Result<()> {
    if actual != CHANNELS {
        return Err(EnhanceError::UnsupportedChannels {
            expected: CHANNELS,
            actual,
        });
    }
    Ok(())
}

/// Stretch `values` to the full display range using the observed minimum and
/// maximum of the whole image: `round(255 * (x - min) / (max - min))`.
///
/// The input range is never assumed to be `[0, 1]`; contrast is always
/// stretched to what the image actually spans. A flat image (`max == min`)
/// maps to all zeros. Any NaN or infinite sample is a processing error.
pub fn normalize_to_display(values: ArrayView3<'_, f32>) -> Result<DisplayImage> {
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(EnhanceError::Processing(format!(
            "output contains a non-finite sample ({bad})"
        )));
    }

    let (min, max) = values
        .iter()
        .copied()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });

    let range = max - min;
    let pixels = if range > 0.0 {
        values.mapv(|v| (255.0 * (v - min) / range).round().clamp(0.0, 255.0) as u8)
    } else {
        Array3::zeros(values.raw_dim())
    };

    Ok(DisplayImage { pixels })
}
