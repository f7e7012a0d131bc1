//! Enhancement pipeline: either a one-shot pixel filter over the whole image,
//! or tile → process (repeated) → stitch through a [`TileProcessor`].

use std::sync::Arc;
use std::time::Instant;

use ndarray::Array4;
use tracing::{debug, info};

use crate::buffer::{normalize_to_display, DisplayImage, NormalizedImage};
use crate::error::{EnhanceError, Result};
use crate::filters::{apply_filter, FilterKind};
use crate::processor::TileProcessor;
use crate::strategy::{filter_strength, EnhancementStrategy};
use crate::tiling::{Stitcher, TileConfig, Tiler};

pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Resolves a model name to a ready tile processor.
pub trait ModelProvider: Send + Sync {
    /// Fails with [`EnhanceError::UnknownModel`] when no such model exists.
    fn acquire(&self, name: &str) -> Result<Arc<dyn TileProcessor>>;
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    tiler: Tiler,
    stitcher: Stitcher,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(config: TileConfig, batch_size: usize) -> Result<Self> {
        Ok(Self {
            tiler: Tiler::new(config)?,
            stitcher: Stitcher::new(config)?,
            batch_size: batch_size.max(1),
        })
    }

    pub fn tile_config(&self) -> &TileConfig {
        self.tiler.config()
    }

    pub fn enhance(
        &self,
        image: &NormalizedImage,
        strategy: &EnhancementStrategy,
        models: &dyn ModelProvider,
    ) -> Result<DisplayImage> {
        match strategy {
            EnhancementStrategy::Filter { kind, factor } => {
                self.run_filter(image, *kind, *factor)
            }
            EnhancementStrategy::TiledModel { name, iterations } => {
                let processor = models.acquire(name)?;
                self.run_tiled(image, processor.as_ref(), *iterations)
            }
        }
    }

    pub fn run_filter(
        &self,
        image: &NormalizedImage,
        kind: FilterKind,
        factor: i64,
    ) -> Result<DisplayImage> {
        let strength = filter_strength(factor);
        let filtered = apply_filter(kind, image, strength);
        debug!(filter = %kind, factor, strength, "Applied pixel filter");
        normalize_to_display(filtered.view())
    }

    /// Tile `image`, run the whole batch through `processor` `iterations`
    /// times, and stitch the result. Zero iterations stitches the untouched
    /// tiles.
    pub fn run_tiled(
        &self,
        image: &NormalizedImage,
        processor: &dyn TileProcessor,
        iterations: usize,
    ) -> Result<DisplayImage> {
        let started = Instant::now();
        let (mut tiles, layout) = self.tiler.pre_process(image)?.into_parts();
        let expected_dim = tiles.dim();

        for iteration in 1..=iterations {
            let output = processor
                .process(tiles.view(), self.batch_size)
                .map_err(EnhanceError::processing)?;
            check_batch(&output, expected_dim)?;
            tiles = output;
            debug!(iteration, iterations, "Processed tile batch");
        }

        let display = self.stitcher.post_process(&layout, tiles.view())?;

        info!(
            height = layout.height(),
            width = layout.width(),
            tiles = layout.tile_count(),
            iterations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tiled enhancement finished"
        );

        Ok(display)
    }
}

fn check_batch(output: &Array4<f32>, expected: (usize, usize, usize, usize)) -> Result<()> {
    let (count, th, tw, c) = expected;
    let (actual_count, ..) = output.dim();
    if actual_count != count {
        return Err(EnhanceError::TileCountMismatch {
            expected: count,
            actual: actual_count,
        });
    }
    if output.shape()[1..] != [th, tw, c] {
        return Err(EnhanceError::TileShapeMismatch {
            expected: [th, tw, c],
            actual: output.shape()[1..].to_vec(),
        });
    }
    Ok(())
}
