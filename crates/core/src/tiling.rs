//! Tiling engine: split an image into overlapping fixed-size tiles and stitch
//! processed tiles back together.
//!
//! Every tile has exactly `tile_height x tile_width x 3` samples. Tiles are
//! never padded or truncated; when the stride does not divide the image, the
//! last tile on an axis is pulled inward so its end lands on the border, which
//! increases its overlap with the previous tile.
//!
//! The source dimensions and tile offsets travel with the tiles in a
//! [`TileLayout`], so [`Tiler`] and [`Stitcher`] hold nothing but their
//! configuration and can be shared between concurrent requests.

use ndarray::{s, Array3, Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::{normalize_to_display, DisplayImage, NormalizedImage, CHANNELS};
use crate::error::{EnhanceError, Result};

pub const DEFAULT_TILE_SIZE: usize = 128;
pub const DEFAULT_TILE_OVERLAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    pub tile_height: usize,
    pub tile_width: usize,
    /// Pixels shared by neighbouring tiles on both axes.
    pub overlap: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            tile_height: DEFAULT_TILE_SIZE,
            tile_width: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_TILE_OVERLAP,
        }
    }
}

impl TileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tile_height == 0 || self.tile_width == 0 {
            return Err(EnhanceError::InvalidTileConfig(format!(
                "tile size must be non-zero, got {}x{}",
                self.tile_height, self.tile_width
            )));
        }
        if self.overlap >= self.tile_height || self.overlap >= self.tile_width {
            return Err(EnhanceError::InvalidTileConfig(format!(
                "overlap ({}) must be smaller than the tile size ({}x{})",
                self.overlap, self.tile_height, self.tile_width
            )));
        }
        Ok(())
    }

    pub fn tile_shape(&self) -> [usize; 3] {
        [self.tile_height, self.tile_width, CHANNELS]
    }

    /// Fails when an image of this size cannot hold a single full tile.
    pub fn check_fits(&self, height: usize, width: usize) -> Result<()> {
        if height < self.tile_height || width < self.tile_width {
            return Err(EnhanceError::ImageTooSmall {
                height,
                width,
                tile_height: self.tile_height,
                tile_width: self.tile_width,
            });
        }
        Ok(())
    }
}

/// Placement record for one tiled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    height: usize,
    width: usize,
    tile_height: usize,
    tile_width: usize,
    offsets: Vec<(usize, usize)>,
}

impl TileLayout {
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// `(row_start, col_start)` of every tile, row-major.
    pub fn offsets(&self) -> &[(usize, usize)] {
        &self.offsets
    }

    pub fn tile_count(&self) -> usize {
        self.offsets.len()
    }
}

/// Tiles of one image as a single `(n, tile_height, tile_width, 3)` batch.
#[derive(Debug, Clone)]
pub struct TileGrid {
    pub tiles: Array4<f32>,
    pub layout: TileLayout,
}

impl TileGrid {
    pub fn into_parts(self) -> (Array4<f32>, TileLayout) {
        (self.tiles, self.layout)
    }
}

/// Start offsets along one axis.
///
/// Walks `0, stride, 2*stride, ..` while the candidate is inside the extent and
/// clamps each start so the tile ends on the border at most. Starts that clamp
/// onto the previous one are dropped, so an extent equal to the tile size
/// yields exactly one start.
fn axis_starts(extent: usize, tile: usize, stride: usize) -> Vec<usize> {
    let mut starts: Vec<usize> = Vec::new();
    let mut candidate = 0;
    while candidate < extent {
        let end = (candidate + tile).min(extent);
        let start = end - tile;
        if starts.last() != Some(&start) {
            starts.push(start);
        }
        candidate += stride;
    }
    starts
}

/// Row-major tile offsets for an image of `height x width`.
///
/// Shared by [`Tiler`] and [`Stitcher`]; tiles misalign if the two walks ever
/// diverge. Fails on an invalid config or an image smaller than one tile.
pub fn tile_offsets(
    config: &TileConfig,
    height: usize,
    width: usize,
) -> Result<Vec<(usize, usize)>> {
    config.validate()?;
    config.check_fits(height, width)?;

    let rows = axis_starts(height, config.tile_height, config.tile_height - config.overlap);
    let cols = axis_starts(width, config.tile_width, config.tile_width - config.overlap);

    Ok(rows
        .iter()
        .flat_map(|&row| cols.iter().map(move |&col| (row, col)))
        .collect())
}

#[derive(Debug, Clone)]
pub struct Tiler {
    config: TileConfig,
}

impl Tiler {
    pub fn new(config: TileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    pub fn pre_process(&self, image: &NormalizedImage) -> Result<TileGrid> {
        let (height, width) = (image.height(), image.width());
        let offsets = tile_offsets(&self.config, height, width)?;
        let (th, tw) = (self.config.tile_height, self.config.tile_width);
        let source = image.view();

        let mut tiles = Array4::<f32>::zeros((offsets.len(), th, tw, CHANNELS));
        for (index, &(row, col)) in offsets.iter().enumerate() {
            tiles
                .slice_mut(s![index, .., .., ..])
                .assign(&source.slice(s![row..row + th, col..col + tw, ..]));
        }

        debug!(
            height,
            width,
            tile_height = th,
            tile_width = tw,
            overlap = self.config.overlap,
            tiles = offsets.len(),
            "Tiled image"
        );

        Ok(TileGrid {
            tiles,
            layout: TileLayout {
                height,
                width,
                tile_height: th,
                tile_width: tw,
                offsets,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct Stitcher {
    config: TileConfig,
}

impl Stitcher {
    pub fn new(config: TileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Stitch `tiles` back into a display image of the layout's size.
    pub fn post_process(
        &self,
        layout: &TileLayout,
        tiles: ArrayView4<'_, f32>,
    ) -> Result<DisplayImage> {
        let averaged = self.blend(layout, tiles)?;
        normalize_to_display(averaged.view())
    }

    /// Place every tile at its offset and average overlapping contributions.
    ///
    /// Values stay in the processing range; no display conversion happens here.
    pub fn blend(
        &self,
        layout: &TileLayout,
        tiles: ArrayView4<'_, f32>,
    ) -> Result<Array3<f32>> {
        let (th, tw) = (self.config.tile_height, self.config.tile_width);
        if (layout.tile_height, layout.tile_width) != (th, tw) {
            return Err(EnhanceError::InvalidTileConfig(format!(
                "layout was tiled at {}x{} but stitcher is configured for {th}x{tw}",
                layout.tile_height, layout.tile_width
            )));
        }

        let offsets = tile_offsets(&self.config, layout.height, layout.width)?;
        if offsets != layout.offsets {
            return Err(EnhanceError::InvalidTileConfig(
                "tile offsets do not match the stitcher configuration".to_string(),
            ));
        }

        let count = tiles.shape()[0];
        if count != offsets.len() {
            return Err(EnhanceError::TileCountMismatch {
                expected: offsets.len(),
                actual: count,
            });
        }
        let expected = self.config.tile_shape();
        if tiles.shape()[1..] != expected {
            return Err(EnhanceError::TileShapeMismatch {
                expected,
                actual: tiles.shape()[1..].to_vec(),
            });
        }

        let shape = (layout.height, layout.width, CHANNELS);
        let mut accumulator = Array3::<f32>::zeros(shape);
        let mut weights = Array3::<f32>::zeros(shape);

        for (index, &(row, col)) in offsets.iter().enumerate() {
            let tile = tiles.slice(s![index, .., .., ..]);
            let mut target = accumulator.slice_mut(s![row..row + th, col..col + tw, ..]);
            target += &tile;
            let mut weight = weights.slice_mut(s![row..row + th, col..col + tw, ..]);
            weight += 1.0;
        }

        // Full coverage means no zero weight; guard the division anyway.
        weights.mapv_inplace(|w| if w == 0.0 { 1.0 } else { w });
        accumulator /= &weights;

        debug!(
            height = layout.height,
            width = layout.width,
            tiles = count,
            "Stitched tiles"
        );

        Ok(accumulator)
    }
}
