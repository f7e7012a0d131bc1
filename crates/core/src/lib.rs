//! Core crate for VisionNova: tiling, filters, tile processors and the HTTP surface.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod filters;
pub mod image_io;
pub mod logging;
pub mod model_registry;
pub mod pipeline;
pub mod processor;
pub mod runtime;
pub mod server;
pub mod strategy;
pub mod tiling;

pub use error::{EnhanceError, Result};
