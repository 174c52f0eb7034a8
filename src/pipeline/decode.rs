//! Decode stage reading images and masks from disk into normalised batches.

use std::path::Path;

use image::{GrayImage, RgbImage};
use tokio::fs;
use tracing::instrument;

use crate::{ImageBatch, InpaintError, InpaintResult, MaskBatch};

/// Reads an image file as a single-item RGB batch.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn load_image(path: &Path) -> InpaintResult<ImageBatch> {
    let bytes = read(path).await?;
    let decoded = image::load_from_memory(&bytes).map_err(|err| decode_error(path, err))?;
    Ok(image_from_rgb(&decoded.to_rgb8()))
}

/// Reads a mask file; luminance is the fraction to replace.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn load_mask(path: &Path) -> InpaintResult<MaskBatch> {
    let bytes = read(path).await?;
    let decoded = image::load_from_memory(&bytes).map_err(|err| decode_error(path, err))?;
    Ok(mask_from_luma(&decoded.to_luma8()))
}

/// Converts 8-bit RGB pixels to a `[1, h, w, 3]` batch in `[0, 1]`.
pub fn image_from_rgb(pixels: &RgbImage) -> ImageBatch {
    let (w, h) = pixels.dimensions();
    ImageBatch::from_shape_fn((1, h as usize, w as usize, 3), |(_, y, x, c)| {
        f32::from(pixels.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

/// Converts 8-bit luminance to a `[1, h, w]` mask in `[0, 1]`.
pub fn mask_from_luma(pixels: &GrayImage) -> MaskBatch {
    let (w, h) = pixels.dimensions();
    MaskBatch::from_shape_fn((1, h as usize, w as usize), |(_, y, x)| {
        f32::from(pixels.get_pixel(x as u32, y as u32)[0]) / 255.0
    })
}

async fn read(path: &Path) -> InpaintResult<Vec<u8>> {
    fs::read(path)
        .await
        .map_err(|err| InpaintError::Io(format!("{}: {err}", path.display())))
}

fn decode_error(path: &Path, err: image::ImageError) -> InpaintError {
    InpaintError::Format(format!("{}: {err}", path.display()))
}
