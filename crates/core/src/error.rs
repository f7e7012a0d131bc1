//! Error type shared by the tiling engine, filters and pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error(
        "image {height}x{width} is smaller than the {tile_height}x{tile_width} tile size"
    )]
    ImageTooSmall {
        height: usize,
        width: usize,
        tile_height: usize,
        tile_width: usize,
    },

    #[error("invalid tile configuration: {0}")]
    InvalidTileConfig(String),

    #[error("expected {expected} channels, got {actual}")]
    UnsupportedChannels { expected: usize, actual: usize },

    #[error("tile batch has per-tile shape {actual:?}, expected {expected:?}")]
    TileShapeMismatch {
        expected: [usize; 3],
        actual: Vec<usize>,
    },

    #[error("expected {expected} tiles, got {actual}")]
    TileCountMismatch { expected: usize, actual: usize },

    #[error("pixel buffer does not match its shape: {0}")]
    BufferShape(String),

    #[error("unknown enhancement: {0}")]
    UnknownEnhancement(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("enhancement failed: {0}")]
    Processing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EnhanceError {
    /// True when the request itself was at fault (bad upload, bad selector),
    /// false for failures inside processing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::ImageTooSmall { .. }
                | Self::UnsupportedChannels { .. }
                | Self::UnknownEnhancement(_)
                | Self::UnknownModel(_)
                | Self::Decode(_)
        )
    }

    pub(crate) fn processing(err: anyhow::Error) -> Self {
        Self::Processing(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, EnhanceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_and_selector_errors_are_client_errors() {
        let too_small = EnhanceError::ImageTooSmall {
            height: 64,
            width: 64,
            tile_height: 128,
            tile_width: 128,
        };
        assert!(too_small.is_client_error());
        assert!(EnhanceError::UnknownEnhancement("pillow_blur".into()).is_client_error());
        assert!(EnhanceError::UnknownModel("missing".into()).is_client_error());
    }

    #[test]
    fn processing_failures_are_server_errors() {
        let shape = EnhanceError::TileShapeMismatch {
            expected: [128, 128, 3],
            actual: vec![256, 256, 3],
        };
        assert!(!shape.is_client_error());
        assert!(!EnhanceError::processing(anyhow::anyhow!("session crashed")).is_client_error());
    }

    #[test]
    fn processing_keeps_context_chain() {
        let err = anyhow::anyhow!("inner").context("outer");
        let msg = EnhanceError::processing(err).to_string();
        assert_eq!(msg, "enhancement failed: outer: inner");
    }

    #[test]
    fn too_small_message_names_both_sizes() {
        let err = EnhanceError::ImageTooSmall {
            height: 100,
            width: 90,
            tile_height: 128,
            tile_width: 128,
        };
        assert_eq!(
            err.to_string(),
            "image 100x90 is smaller than the 128x128 tile size"
        );
    }
}
