//! Model inpainting: per-item square normalisation, forward pass, optional
//! upscaling and hard-mask compositing.

use ndarray::{Array4, Axis, s};
use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, instrument};

use crate::{
    ImageBatch, InpaintError, InpaintResult, MaskBatch, ensure_aligned, mask_to_nchw,
    telemetry::TelemetrySink, to_nchw, to_nhwc,
};

use super::{
    geometry::{resize_to_square, undo_resize_square},
    model::{InpaintModel, Upscaler},
};

/// Fills the masked region of every image with model output.
///
/// Items are processed one after another; the generator is re-seeded with
/// `seed` before each forward pass so an item's output does not depend on
/// its batch position. Only pixels inside the floored mask are replaced.
#[instrument(skip_all, fields(arch = %model.arch, seed = seed, batch = image.len_of(Axis(0))))]
pub fn inpaint_with_model(
    model: &InpaintModel,
    image: &ImageBatch,
    mask: &MaskBatch,
    seed: u64,
    upscaler: Option<&dyn Upscaler>,
    telemetry: &TelemetrySink,
) -> InpaintResult<ImageBatch> {
    let required_size = model.arch.required_size()?;
    ensure_aligned(image, mask)?;
    debug!(required_size, device = "cpu", "inpaint model ready");

    let batch = image.len_of(Axis(0));
    let images = to_nchw(image.view());
    let masks = mask_to_nchw(&broadcast_mask(mask, batch));

    let mut results = Vec::with_capacity(batch);
    for index in 0..batch {
        let original = images.slice(s![index..=index, .., .., ..]).to_owned();
        let item_mask = masks.slice(s![index..=index, .., .., ..]).to_owned();

        let bundle = resize_to_square(&original, &item_mask, required_size)?;
        let work_mask = bundle.mask.mapv(f32::floor);
        telemetry.record_stage("normalize");

        let mut rng = StdRng::seed_from_u64(seed);
        let mut work = model.network.forward(&bundle.image, &work_mask, &mut rng)?;
        check_square(&work, "inpaint model")?;
        telemetry.record_stage("model_forward");

        if let Some(upscaler) = upscaler {
            let upscaled = upscaler.upscale(&to_nhwc(work.view()))?;
            work = to_nchw(upscaled.view());
            check_square(&work, "upscaler")?;
            telemetry.record_stage("upscale");
        }

        let restored = undo_resize_square(&work, &bundle.layout)?;
        telemetry.record_stage("denormalize");

        let hard = item_mask.mapv(f32::floor);
        let composited = &original + &((&restored - &original) * &hard);
        telemetry.record_stage("composite");
        telemetry.record_completed();
        results.push(composited);
    }

    let views: Vec<_> = results.iter().map(|r| r.view()).collect();
    let stacked = ndarray::concatenate(Axis(0), &views)
        .map_err(|err| InpaintError::InvalidSize(format!("stack results: {err}")))?;
    Ok(to_nhwc(stacked.view()))
}

/// Repeats the first mask across the batch when the batch sizes differ.
pub fn broadcast_mask(mask: &MaskBatch, batch: usize) -> MaskBatch {
    if mask.len_of(Axis(0)) == batch {
        return mask.clone();
    }
    let first = mask.index_axis(Axis(0), 0);
    let mut out = MaskBatch::zeros((batch, first.nrows(), first.ncols()));
    for mut plane in out.outer_iter_mut() {
        plane.assign(&first);
    }
    out
}

fn check_square(tensor: &Array4<f32>, source: &str) -> InpaintResult<()> {
    let (b, c, h, w) = tensor.dim();
    if b != 1 || c != 3 || h != w {
        return Err(InpaintError::Model(format!(
            "{source} returned tensor of shape {:?}, expected [1, 3, s, s]",
            tensor.shape()
        )));
    }
    Ok(())
}
