//! Numeric primitives shared by the mask, fill and geometry stages.
//!
//! Every function works on a single `[height, width]` plane; batched callers
//! iterate planes themselves. Planes cross into `imageproc` and `image` as
//! `Luma<f32>` buffers.

use image::{
    GrayImage, Luma,
    imageops::{self, FilterType},
};
use imageproc::{
    definitions::Image,
    distance_transform::Norm,
    filter::separable_filter_equal,
    morphology,
};
use ndarray::{Array2, ArrayView2};

/// Maps a possibly out-of-range coordinate onto `0..len` by mirror reflection
/// without repeating the edge sample.
pub fn reflect_index(index: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let folded = index.rem_euclid(period);
    if folded >= len as isize {
        (period - folded) as usize
    } else {
        folded as usize
    }
}

/// Normalised gaussian kernel of size `2 * radius + 1`.
///
/// Sigma follows the usual kernel-size heuristic `0.3 * ((r - 1) * 0.5 - 1) + 0.8`.
pub fn gaussian_kernel(radius: usize) -> Vec<f32> {
    let r = radius as f32;
    let sigma = (0.3 * ((r - 1.0) * 0.5 - 1.0) + 0.8).max(f32::EPSILON);
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - r;
            (-0.5 * (x / sigma).powi(2)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Separable gaussian blur with reflect padding.
///
/// The plane is reflect-padded by `radius` first so the filter's own edge
/// clamping never reaches an output pixel.
pub fn gaussian_blur(plane: ArrayView2<'_, f32>, radius: usize) -> Array2<f32> {
    if radius == 0 {
        return plane.to_owned();
    }
    let (h, w) = plane.dim();
    let padded = pad_reflect(plane, radius, radius, radius, radius);
    let blurred = separable_filter_equal(&to_luma(padded.view()), &gaussian_kernel(radius));
    Array2::from_shape_fn((h, w), |(y, x)| {
        blurred.get_pixel((x + radius) as u32, (y + radius) as u32)[0]
    })
}

/// Erodes a binary plane with a `(2r + 1)²` square structuring element.
///
/// A pixel survives only if every in-image pixel of its window is set; samples
/// outside the image count as set.
pub fn binary_erosion(plane: ArrayView2<'_, f32>, radius: usize) -> Array2<f32> {
    let (h, w) = plane.dim();
    match u8::try_from(radius) {
        // distances saturate at u8::MAX, so that radius cannot be told apart from "no hole"
        Ok(r) if r < u8::MAX => {
            let binary = GrayImage::from_fn(w as u32, h as u32, |x, y| {
                Luma([if plane[[y as usize, x as usize]] >= 1.0 { 255 } else { 0 }])
            });
            let eroded = morphology::erode(&binary, Norm::LInf, r);
            Array2::from_shape_fn((h, w), |(y, x)| {
                if eroded.get_pixel(x as u32, y as u32)[0] > 0 { 1.0 } else { 0.0 }
            })
        }
        _ => windowed_erosion(plane, radius),
    }
}

/// Prefix-sum erosion for radii beyond what the distance transform can hold.
fn windowed_erosion(plane: ArrayView2<'_, f32>, radius: usize) -> Array2<f32> {
    let set = plane.mapv(|v| v >= 1.0);
    let (h, w) = set.dim();

    let mut rows = Array2::from_elem((h, w), false);
    let mut holes = vec![0usize; w.max(h) + 1];
    for y in 0..h {
        for x in 0..w {
            holes[x + 1] = holes[x] + usize::from(!set[[y, x]]);
        }
        for x in 0..w {
            let lo = x.saturating_sub(radius);
            let hi = (x + radius).min(w - 1);
            rows[[y, x]] = holes[hi + 1] == holes[lo];
        }
    }

    let mut out = Array2::<f32>::zeros((h, w));
    for x in 0..w {
        for y in 0..h {
            holes[y + 1] = holes[y] + usize::from(!rows[[y, x]]);
        }
        for y in 0..h {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius).min(h - 1);
            if holes[hi + 1] == holes[lo] {
                out[[y, x]] = 1.0;
            }
        }
    }
    out
}

/// Reflect-pads a plane on each side.
pub fn pad_reflect(
    plane: ArrayView2<'_, f32>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
) -> Array2<f32> {
    let (h, w) = plane.dim();
    Array2::from_shape_fn((h + top + bottom, w + left + right), |(y, x)| {
        let sy = reflect_index(y as isize - top as isize, h);
        let sx = reflect_index(x as isize - left as isize, w);
        plane[[sy, sx]]
    })
}

/// Nearest-neighbour resampling sampling each output pixel at its centre.
///
/// Values are clamped to `[0, 1]`.
pub fn resize_nearest_exact(plane: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    resample(plane, out_h, out_w, FilterType::Nearest)
}

/// Linear (triangle) resampling, antialiased when shrinking.
///
/// Values are clamped to `[0, 1]`.
pub fn resize_bilinear(plane: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    resample(plane, out_h, out_w, FilterType::Triangle)
}

fn resample(plane: ArrayView2<'_, f32>, out_h: usize, out_w: usize, filter: FilterType) -> Array2<f32> {
    let resized = imageops::resize(&to_luma(plane), out_w as u32, out_h as u32, filter);
    from_luma(&resized)
}

/// Non-overlapping max pooling; trailing rows/columns that do not fill a window are dropped.
pub fn max_pool(plane: ArrayView2<'_, f32>, window: usize) -> Array2<f32> {
    let (h, w) = plane.dim();
    let (out_h, out_w) = (h / window, w / window);
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let mut best = f32::NEG_INFINITY;
        for dy in 0..window {
            for dx in 0..window {
                best = best.max(plane[[y * window + dy, x * window + dx]]);
            }
        }
        best
    })
}

fn to_luma(plane: ArrayView2<'_, f32>) -> Image<Luma<f32>> {
    let (h, w) = plane.dim();
    Image::from_fn(w as u32, h as u32, |x, y| Luma([plane[[y as usize, x as usize]]]))
}

fn from_luma(image: &Image<Luma<f32>>) -> Array2<f32> {
    let (w, h) = image.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32)[0]
    })
}
