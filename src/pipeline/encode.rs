//! Encode stage persisting image and mask batches.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use image::{GrayImage, ImageFormat, RgbImage};
use ndarray::{ArrayView2, ArrayView3};
use tokio::fs;
use tracing::{info, instrument};

use crate::{ImageBatch, InpaintError, InpaintResult, MaskBatch};

/// Writes every batch item; items after the first get an index suffix.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn save_image(batch: &ImageBatch, path: &Path) -> InpaintResult<Vec<PathBuf>> {
    let format = output_format(path)?;
    let mut written = Vec::new();
    for (index, item) in batch.outer_iter().enumerate() {
        let target = item_path(path, index);
        let encoded = encode_rgb(item, format)?;
        write(&target, encoded).await?;
        written.push(target);
    }
    info!(items = written.len(), "images written");
    Ok(written)
}

/// Writes every mask of the batch as a greyscale image.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn save_mask(batch: &MaskBatch, path: &Path) -> InpaintResult<Vec<PathBuf>> {
    let format = output_format(path)?;
    let mut written = Vec::new();
    for (index, item) in batch.outer_iter().enumerate() {
        let target = item_path(path, index);
        let encoded = encode_luma(item, format)?;
        write(&target, encoded).await?;
        written.push(target);
    }
    info!(items = written.len(), "masks written");
    Ok(written)
}

/// Converts a normalised `[h, w, 3]` item into 8-bit RGB.
pub fn rgb_from_item(item: ArrayView3<'_, f32>) -> RgbImage {
    let (h, w, _) = item.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([
            to_byte(item[[y, x, 0]]),
            to_byte(item[[y, x, 1]]),
            to_byte(item[[y, x, 2]]),
        ])
    })
}

fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn encode_rgb(item: ArrayView3<'_, f32>, format: ImageFormat) -> InpaintResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    rgb_from_item(item)
        .write_to(&mut buffer, format)
        .map_err(|err| InpaintError::Format(format!("encode image: {err}")))?;
    Ok(buffer.into_inner())
}

fn encode_luma(item: ArrayView2<'_, f32>, format: ImageFormat) -> InpaintResult<Vec<u8>> {
    let (h, w) = item.dim();
    let pixels = GrayImage::from_fn(w as u32, h as u32, |x, y| {
        image::Luma([to_byte(item[[y as usize, x as usize]])])
    });
    let mut buffer = Cursor::new(Vec::new());
    pixels
        .write_to(&mut buffer, format)
        .map_err(|err| InpaintError::Format(format!("encode mask: {err}")))?;
    Ok(buffer.into_inner())
}

fn output_format(path: &Path) -> InpaintResult<ImageFormat> {
    ImageFormat::from_path(path)
        .map_err(|err| InpaintError::Configuration(format!("{}: {err}", path.display())))
}

fn item_path(path: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    path.with_file_name(name)
}

async fn write(path: &Path, bytes: Vec<u8>) -> InpaintResult<()> {
    fs::write(path, bytes)
        .await
        .map_err(|err| InpaintError::Io(format!("{}: {err}", path.display())))
}
