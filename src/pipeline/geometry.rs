//! Square-resize normalisation used around fixed-resolution inpaint models.
//!
//! The forward transform reflect-pads the shorter side until the image is
//! square, then resamples the square to the model resolution. The inverse
//! resamples back to the padded square and crops the padding away.

use ndarray::{Array2, Array4, ArrayView2, s};
use tracing::instrument;

use crate::{InpaintError, InpaintResult};

use super::{
    filters::{pad_reflect, resize_bilinear, resize_nearest_exact},
    model::ModelArch,
};

/// Bookkeeping needed to invert [`resize_to_square`] exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquareLayout {
    pub height: usize,
    pub width: usize,
    /// Side of the padded square before resampling.
    pub side: usize,
    pub pad_top: usize,
    pub pad_left: usize,
}

impl SquareLayout {
    /// Computes a symmetric padding layout for a `height x width` plane.
    pub fn for_size(height: usize, width: usize) -> Self {
        let side = height.max(width);
        Self {
            height,
            width,
            side,
            pad_top: (side - height) / 2,
            pad_left: (side - width) / 2,
        }
    }

    pub fn pad_bottom(&self) -> usize {
        self.side - self.height - self.pad_top
    }

    pub fn pad_right(&self) -> usize {
        self.side - self.width - self.pad_left
    }
}

/// Image and mask resampled to the model resolution plus their layout.
#[derive(Debug, Clone)]
pub struct SquareBundle {
    /// `[batch, channels, target, target]`
    pub image: Array4<f32>,
    /// `[batch, 1, target, target]`
    pub mask: Array4<f32>,
    pub layout: SquareLayout,
}

/// Normalises an NCHW image and its mask to a `target x target` square.
///
/// `target` must be the input size of a known architecture.
#[instrument(skip(image, mask), fields(shape = ?image.dim()))]
pub fn resize_to_square(
    image: &Array4<f32>,
    mask: &Array4<f32>,
    target: usize,
) -> InpaintResult<SquareBundle> {
    if !ModelArch::is_supported_size(target) {
        return Err(InpaintError::InvalidSize(format!(
            "no inpaint model runs at {target}x{target}"
        )));
    }
    let (_, _, h, w) = image.dim();
    let (_, _, mh, mw) = mask.dim();
    if h == 0 || w == 0 {
        return Err(InpaintError::InvalidSize(format!(
            "cannot normalise an empty {w}x{h} image"
        )));
    }
    if (mh, mw) != (h, w) {
        return Err(InpaintError::InvalidSize(format!(
            "mask {mw}x{mh} does not match image {w}x{h}"
        )));
    }

    let layout = SquareLayout::for_size(h, w);
    let square = |plane: ArrayView2<'_, f32>| {
        let padded = pad_reflect(
            plane,
            layout.pad_top,
            layout.pad_bottom(),
            layout.pad_left,
            layout.pad_right(),
        );
        resize_nearest_exact(padded.view(), target, target)
    };
    Ok(SquareBundle {
        image: map_planes(image, target, square),
        mask: map_planes(mask, target, square),
        layout,
    })
}

/// Inverts [`resize_to_square`] for an NCHW square tensor of any side.
pub fn undo_resize_square(image: &Array4<f32>, layout: &SquareLayout) -> InpaintResult<Array4<f32>> {
    let (b, c, h, w) = image.dim();
    if h != w || h == 0 {
        return Err(InpaintError::InvalidSize(format!(
            "expected a square tensor, got {w}x{h}"
        )));
    }
    let mut out = Array4::<f32>::zeros((b, c, layout.height, layout.width));
    for (mut dst, src) in out.outer_iter_mut().zip(image.outer_iter()) {
        for (mut dst_plane, src_plane) in dst.outer_iter_mut().zip(src.outer_iter()) {
            let square = resize_bilinear(src_plane, layout.side, layout.side);
            dst_plane.assign(&square.slice(s![
                layout.pad_top..layout.pad_top + layout.height,
                layout.pad_left..layout.pad_left + layout.width
            ]));
        }
    }
    Ok(out)
}

fn map_planes<F>(tensor: &Array4<f32>, target: usize, f: F) -> Array4<f32>
where
    F: Fn(ArrayView2<'_, f32>) -> Array2<f32>,
{
    let (b, c, _, _) = tensor.dim();
    let mut out = Array4::<f32>::zeros((b, c, target, target));
    for (mut dst, src) in out.outer_iter_mut().zip(tensor.outer_iter()) {
        for (mut dst_plane, src_plane) in dst.outer_iter_mut().zip(src.outer_iter()) {
            dst_plane.assign(&f(src_plane));
        }
    }
    out
}
