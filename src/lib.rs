//! Core library for the inpaint post-processing nodes.
//!
//! The crate exposes the image and mask data model shared by every stage,
//! configuration loading utilities, and the node operations: masked fill,
//! masked blur, model inpainting, patch application and mask conversion.

pub mod config;
pub mod pipeline;
pub mod telemetry;

use ndarray::{Array3, Array4, ArrayView4, Axis};
use thiserror::Error;
use tracing::instrument;

/// Batch of RGB images in `[batch, height, width, 3]` order, values in `[0, 1]`.
pub type ImageBatch = Array4<f32>;

/// Batch of single channel masks in `[batch, height, width]` order, values in `[0, 1]`.
pub type MaskBatch = Array3<f32>;

/// Errors returned by node operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InpaintError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("shape mismatch for {key}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("value out of range: {0}")]
    Range(String),
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("format failure: {0}")]
    Format(String),
    #[error("model failure: {0}")]
    Model(String),
    #[error("task join failure: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for InpaintError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

impl From<std::io::Error> for InpaintError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for InpaintError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias for node operations.
pub type InpaintResult<T> = Result<T, InpaintError>;

/// Reorders a `[b, h, w, c]` image batch into the `[b, c, h, w]` layout models consume.
pub fn to_nchw(image: ArrayView4<'_, f32>) -> Array4<f32> {
    image.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned()
}

/// Reorders a `[b, c, h, w]` tensor back into the `[b, h, w, c]` host layout.
pub fn to_nhwc(tensor: ArrayView4<'_, f32>) -> Array4<f32> {
    tensor.permuted_axes([0, 2, 3, 1]).as_standard_layout().into_owned()
}

/// Lifts a mask batch into a `[b, 1, h, w]` tensor.
pub fn mask_to_nchw(mask: &MaskBatch) -> Array4<f32> {
    mask.clone().insert_axis(Axis(1))
}

/// Checks that image and mask agree spatially and carry three colour channels.
pub fn ensure_aligned(image: &ImageBatch, mask: &MaskBatch) -> InpaintResult<()> {
    let (b, h, w, c) = image.dim();
    if b == 0 {
        return Err(InpaintError::InvalidSize("image batch is empty".to_string()));
    }
    if c != 3 {
        return Err(InpaintError::InvalidSize(format!(
            "image must have 3 channels, got {c}"
        )));
    }
    let (mb, mh, mw) = mask.dim();
    if mb == 0 {
        return Err(InpaintError::InvalidSize("mask batch is empty".to_string()));
    }
    if (mh, mw) != (h, w) {
        return Err(InpaintError::InvalidSize(format!(
            "mask {mw}x{mh} does not match image {w}x{h}"
        )));
    }
    Ok(())
}

/// Executes a CLI request once configuration has been resolved.
#[instrument(skip_all)]
pub async fn run(config: config::AppConfig) -> InpaintResult<()> {
    let telemetry = telemetry::TelemetrySink::default();
    pipeline::execute_command(config, telemetry.clone()).await?;
    let snapshot = telemetry.snapshot();
    tracing::debug!(?snapshot, "command finished");
    Ok(())
}
