//! Soft compositing weights derived from hard masks.

use ndarray::{Array2, Axis, Zip};
use tracing::instrument;

use crate::MaskBatch;

use super::filters::{binary_erosion, gaussian_blur};

/// Rounds an even positive radius up to the next odd value; zero stays zero.
pub fn make_odd(value: usize) -> usize {
    if value > 0 && value % 2 == 0 {
        value + 1
    } else {
        value
    }
}

/// Builds the replacement weight for each mask in the batch.
///
/// With `falloff == 0` the result is the floored mask. Otherwise the floored
/// mask is eroded by `falloff`, the erosion is blurred by the same radius, and
/// the floored mask is multiplied by that blurred erosion, so the weight is
/// zero wherever the hard mask is zero.
#[instrument(skip(mask), fields(batch = mask.len_of(Axis(0))))]
pub fn build_alpha(mask: &MaskBatch, falloff: usize) -> MaskBatch {
    let hard = mask.mapv(f32::floor);
    if falloff == 0 {
        return hard;
    }

    let mut alpha = hard.clone();
    for (mut out, plane) in alpha.outer_iter_mut().zip(hard.outer_iter()) {
        let soft = soft_plane(plane.to_owned(), falloff);
        out.assign(&soft);
    }
    alpha
}

fn soft_plane(hard: Array2<f32>, falloff: usize) -> Array2<f32> {
    let erosion = binary_erosion(hard.view(), falloff);
    let blurred = gaussian_blur(erosion.view(), falloff);
    let mut out = hard;
    Zip::from(&mut out)
        .and(&blurred)
        .for_each(|a, &b| *a = (*a * b).clamp(0.0, 1.0));
    out
}
