//! Tile processors: a batch of tiles in, a batch of the same shape out.
//!
//! Batches are NHWC `(num_tiles, tile_height, tile_width, 3)` with values in
//! `[0, 1]`. The pipeline checks that a processor preserves the batch shape.

use std::ops::Range;
use std::sync::Mutex;

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{concatenate, s, Array4, ArrayD, ArrayView4, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{build_session, SessionConfig};

pub trait TileProcessor: Send + Sync {
    fn process(&self, tiles: ArrayView4<'_, f32>, batch_size: usize) -> Result<Array4<f32>>;
}

/// Returns the batch unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityProcessor;

impl TileProcessor for IdentityProcessor {
    fn process(&self, tiles: ArrayView4<'_, f32>, _batch_size: usize) -> Result<Array4<f32>> {
        Ok(tiles.to_owned())
    }
}

/// Tensor layout the model expects on its input and produces on its output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Nhwc,
    Nchw,
}

impl TensorLayout {
    fn to_model(self, batch: ArrayView4<'_, f32>) -> Array4<f32> {
        match self {
            Self::Nhwc => batch.as_standard_layout().into_owned(),
            Self::Nchw => batch
                .permuted_axes([0, 3, 1, 2])
                .as_standard_layout()
                .into_owned(),
        }
    }

    fn from_model(self, batch: Array4<f32>) -> Array4<f32> {
        match self {
            Self::Nhwc => batch,
            Self::Nchw => batch
                .permuted_axes([0, 2, 3, 1])
                .as_standard_layout()
                .into_owned(),
        }
    }
}

/// Consecutive index ranges of at most `batch_size` tiles.
fn batch_ranges(total: usize, batch_size: usize) -> Vec<Range<usize>> {
    let step = batch_size.max(1);
    (0..total)
        .step_by(step)
        .map(|start| start..(start + step).min(total))
        .collect()
}

/// Runs an ONNX model over tile batches.
///
/// The session is shared behind a mutex because `Session::run` needs `&mut`.
/// FP16 models are detected from the input element type; batches are converted
/// to and from `f16` around each run.
pub struct OnnxTileProcessor {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    layout: TensorLayout,
}

impl OnnxTileProcessor {
    pub fn new(session: Session, layout: TensorLayout) -> Self {
        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(
            input = %input_name,
            output = %output_name,
            is_fp16,
            ?layout,
            "Wrapped ONNX session as tile processor"
        );

        Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
            layout,
        }
    }

    pub fn load(config: &SessionConfig<'_>, layout: TensorLayout) -> Result<Self> {
        let session = build_session(config)?;
        Ok(Self::new(session, layout))
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    fn run(&self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let mut session = self.session.lock().unwrap_or_else(|p| p.into_inner());

        if self.is_fp16 {
            let f32_slice = input
                .as_slice()
                .context("model input batch is not contiguous")?;
            let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
            fp16_data.convert_from_f32_slice(f32_slice);

            let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
            let input_tensor = Tensor::from_array(fp16_array)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

            let standard = output_view.as_standard_layout();
            let fp16_slice = standard
                .as_slice()
                .context("model output is not contiguous")?;
            let mut f32_data = vec![0.0f32; fp16_slice.len()];
            fp16_slice.convert_to_f32_slice(&mut f32_data);

            let output = ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?;
            Ok(output)
        } else {
            let input_tensor = Tensor::from_array(input)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output = outputs[self.output_name.as_str()]
                .try_extract_array::<f32>()?
                .to_owned();
            Ok(output)
        }
    }
}

impl TileProcessor for OnnxTileProcessor {
    fn process(&self, tiles: ArrayView4<'_, f32>, batch_size: usize) -> Result<Array4<f32>> {
        let total = tiles.len_of(Axis(0));
        let ranges = batch_ranges(total, batch_size);
        if ranges.is_empty() {
            return Ok(tiles.to_owned());
        }

        let mut chunks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let chunk = tiles.slice(s![range.clone(), .., .., ..]);
            let output = self
                .run(self.layout.to_model(chunk))
                .with_context(|| format!("inference failed for tiles {range:?}"))?;
            let output = output
                .into_dimensionality::<Ix4>()
                .context("model output is not a 4-D tensor")?;
            chunks.push(self.layout.from_model(output));
        }

        let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}
