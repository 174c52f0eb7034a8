//! Masked blur: global gaussian blur composited back through the soft mask.

use ndarray::{Axis, Zip};
use tracing::{debug, instrument};

use crate::{ImageBatch, InpaintError, InpaintResult, MaskBatch, ensure_aligned};

use super::{
    alpha::{build_alpha, make_odd},
    filters::gaussian_blur,
};

/// Smallest blur radius accepted by [`masked_blur`].
pub const MIN_BLUR: usize = 3;

/// Clamps the falloff so its kernel never exceeds the main blur kernel.
pub fn clamp_falloff(blur: usize, falloff: usize) -> usize {
    make_odd(falloff).min(blur.saturating_sub(2))
}

/// Blurs the whole image by `blur_radius` and keeps the blurred pixels only
/// where the soft mask is set.
#[instrument(skip(image, mask), fields(batch = image.len_of(Axis(0))))]
pub fn masked_blur(
    image: &ImageBatch,
    mask: &MaskBatch,
    blur_radius: usize,
    falloff: usize,
) -> InpaintResult<ImageBatch> {
    ensure_aligned(image, mask)?;
    if blur_radius < MIN_BLUR {
        return Err(InpaintError::Range(format!(
            "blur radius {blur_radius} is below the minimum of {MIN_BLUR}"
        )));
    }
    let batch = image.len_of(Axis(0));
    let mask_batch = mask.len_of(Axis(0));
    if mask_batch != 1 && mask_batch != batch {
        return Err(InpaintError::InvalidSize(format!(
            "mask batch {mask_batch} cannot be applied to image batch {batch}"
        )));
    }

    let blur = make_odd(blur_radius);
    let falloff = clamp_falloff(blur, falloff);
    debug!(blur, falloff, "masked blur radii");
    let alpha = build_alpha(mask, falloff);

    let mut output = image.clone();
    for (index, mut item) in output.outer_iter_mut().enumerate() {
        let weight = alpha.index_axis(Axis(0), if mask_batch == 1 { 0 } else { index });
        for mut channel in item.axis_iter_mut(Axis(2)) {
            let blurred = gaussian_blur(channel.view(), blur);
            Zip::from(&mut channel)
                .and(&blurred)
                .and(&weight)
                .for_each(|p, &b, &a| *p += (b - *p) * a);
        }
    }
    Ok(output)
}
