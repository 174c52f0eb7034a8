//! Conversion of denoise strength maps into compositing masks.

use tracing::instrument;

use crate::{InpaintError, InpaintResult, MaskBatch};

/// Linearly remaps `[offset, threshold]` onto `[0, 1]`, clamping outside it.
///
/// Requires `0 <= offset < threshold <= 1`.
#[instrument(skip(mask))]
pub fn denoise_to_compositing_mask(
    mask: &MaskBatch,
    offset: f32,
    threshold: f32,
) -> InpaintResult<MaskBatch> {
    if !(0.0 <= offset && offset < threshold && threshold <= 1.0) {
        return Err(InpaintError::Range(format!(
            "threshold must be higher than offset within [0, 1], got offset {offset} and threshold {threshold}"
        )));
    }
    let span = threshold - offset;
    Ok(mask.mapv(|m| ((m - offset) / span).clamp(0.0, 1.0)))
}
