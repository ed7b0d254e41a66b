//! Tiled inference pipeline for image restoration models.
//!
//! Large images are split into overlapping tiles, each tile is run through an
//! ONNX model, and the results are feathered back into one seamless image.
//! [`processor::ImageProcessor`] is the entry point.

pub mod codec;
pub mod composite;
pub mod config;
pub mod engine;
pub mod error;
pub mod introspect;
pub mod logging;
pub mod processor;
pub mod runner;
pub mod runtime;
pub mod storage;
pub mod tiling;
pub mod types;

pub use engine::{InferenceEngine, OrtEngine, TensorSpec};
pub use error::{EngineError, ProcessError, Stage};
pub use processor::{ImageProcessor, ProcessorConfig};
pub use types::{ModelInfo, ProcessingState, RasterImage, TileRect};
