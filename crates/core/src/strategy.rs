//! Enhancement strategy selection from a request selector.
//!
//! Selectors have the form `"<library>_<name>"`. The library picks the
//! family (`pillow`/`filter` for pixel filters, `keras`/`model`/`onnx` for
//! tiled models) and the rest names the filter or model. Model names may
//! themselves contain underscores.

use crate::error::{EnhanceError, Result};
use crate::filters::FilterKind;

pub const MAX_ITERATIONS: usize = 10;

/// Selector prefix used when listing filters.
pub const FILTER_LIBRARY: &str = "pillow";
/// Selector prefix used when listing models.
pub const MODEL_LIBRARY: &str = "keras";

#[derive(Debug, Clone, PartialEq)]
pub enum EnhancementStrategy {
    Filter { kind: FilterKind, factor: i64 },
    TiledModel { name: String, iterations: usize },
}

impl EnhancementStrategy {
    pub fn parse(selector: &str, factor: i64) -> Result<Self> {
        let unknown = || EnhanceError::UnknownEnhancement(selector.to_string());
        let (library, name) = selector.trim().split_once('_').ok_or_else(unknown)?;
        if name.is_empty() {
            return Err(unknown());
        }

        match library.to_ascii_lowercase().as_str() {
            "pillow" | "filter" => {
                let kind = FilterKind::from_name(name).ok_or_else(unknown)?;
                Ok(Self::Filter { kind, factor })
            }
            "keras" | "model" | "onnx" => Ok(Self::TiledModel {
                name: name.to_string(),
                iterations: clamp_iterations(factor),
            }),
            _ => Err(unknown()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Filter { kind, .. } => format!("{FILTER_LIBRARY}_{kind}"),
            Self::TiledModel { name, .. } => format!("{MODEL_LIBRARY}_{name}"),
        }
    }
}

/// Intensity factor to model pass count, clamped to `[0, MAX_ITERATIONS]`.
pub fn clamp_iterations(factor: i64) -> usize {
    factor.clamp(0, MAX_ITERATIONS as i64) as usize
}

/// Intensity factor to filter blend strength: `1 + factor / 100`.
pub fn filter_strength(factor: i64) -> f32 {
    1.0 + factor as f32 / 100.0
}

pub fn filter_selectors() -> Vec<String> {
    FilterKind::ALL
        .iter()
        .map(|kind| format!("{FILTER_LIBRARY}_{kind}"))
        .collect()
}

pub fn model_selector(name: &str) -> String {
    format!("{MODEL_LIBRARY}_{name}")
}
