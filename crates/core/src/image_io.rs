//! Decode uploaded or on-disk images into [`NormalizedImage`] and encode
//! [`DisplayImage`] results.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, RgbImage};
use tracing::debug;

use crate::buffer::{DisplayImage, NormalizedImage};
use crate::error::{EnhanceError, Result};
use crate::tiling::TileConfig;

/// Upload extensions accepted by the server, lowercase.
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "tif", "tiff"];

pub fn has_allowed_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Decode any supported raster format, convert to RGB, and reject images
/// smaller than one tile.
pub fn decode_image(bytes: &[u8], config: &TileConfig) -> Result<NormalizedImage> {
    let decoded = image::load_from_memory(bytes).map_err(EnhanceError::Decode)?;
    to_normalized(decoded, config)
}

pub fn load_image(path: &Path, config: &TileConfig) -> Result<NormalizedImage> {
    let bytes = std::fs::read(path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "Read image file");
    decode_image(&bytes, config)
}

fn to_normalized(decoded: DynamicImage, config: &TileConfig) -> Result<NormalizedImage> {
    let rgb = decoded.into_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    config.check_fits(height, width)?;
    NormalizedImage::from_rgb8(rgb.as_raw(), width, height)
}

fn to_rgb_image(image: &DisplayImage) -> Result<RgbImage> {
    RgbImage::from_raw(image.width() as u32, image.height() as u32, image.to_rgb8()).ok_or_else(
        || EnhanceError::Processing("display buffer does not match its dimensions".into()),
    )
}

/// Write `image` in the format implied by the path extension.
pub fn save_image(image: &DisplayImage, path: &Path) -> Result<()> {
    let rgb = to_rgb_image(image)?;
    rgb.save(path).map_err(EnhanceError::Encode)?;
    debug!(path = %path.display(), "Saved image");
    Ok(())
}

pub fn encode_png(image: &DisplayImage) -> Result<Vec<u8>> {
    let rgb = to_rgb_image(image)?;
    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageFormat::Png)
        .map_err(EnhanceError::Encode)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn config(tile: usize) -> TileConfig {
        TileConfig {
            tile_height: tile,
            tile_width: tile,
            overlap: 0,
        }
    }

    fn sample(h: usize, w: usize) -> DisplayImage {
        DisplayImage::new(Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            (y * 7 + x * 3 + c * 50) as u8
        }))
        .unwrap()
    }

    #[test]
    fn extension_allow_list() {
        for name in ["a.png", "b.JPG", "c.jpeg", "d.gif", "e.webp", "f.tif", "g.TIFF"] {
            assert!(has_allowed_extension(name), "{name}");
        }
        for name in ["a.bmp", "noext", "archive.png.zip", ""] {
            assert!(!has_allowed_extension(name), "{name}");
        }
    }

    #[test]
    fn png_bytes_decode_to_same_pixels() {
        let original = sample(12, 9);
        let bytes = encode_png(&original).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");

        let decoded = decode_image(&bytes, &config(4)).unwrap();
        assert_eq!((decoded.height(), decoded.width()), (12, 9));
        let back = decoded.view().mapv(|v| (v * 255.0).round() as u8);
        assert_eq!(back, original.view());
    }

    #[test]
    fn rgba_input_is_converted_to_rgb() {
        let rgba = image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 128]));
        let mut bytes = Cursor::new(Vec::new());
        rgba.write_to(&mut bytes, ImageFormat::Png).unwrap();

        let decoded = decode_image(bytes.get_ref(), &config(8)).unwrap();
        assert!((decoded.view()[[0, 0, 2]] - 30.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn image_smaller_than_tile_is_rejected() {
        let bytes = encode_png(&sample(6, 20)).unwrap();
        let err = decode_image(&bytes, &config(8)).unwrap_err();
        assert!(matches!(err, EnhanceError::ImageTooSmall { height: 6, width: 20, .. }));
        assert!(err.is_client_error());
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let err = decode_image(b"definitely not an image", &config(8)).unwrap_err();
        assert!(matches!(err, EnhanceError::Decode(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn save_and_load_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let original = sample(10, 10);

        save_image(&original, &path).unwrap();
        let loaded = load_image(&path, &config(10)).unwrap();
        let back = loaded.view().mapv(|v| (v * 255.0).round() as u8);
        assert_eq!(back, original.view());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image(&dir.path().join("absent.png"), &config(4)).unwrap_err();
        assert!(matches!(err, EnhanceError::Io(_)));
    }
}
