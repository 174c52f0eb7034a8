//! Classical fill for masked regions: neutral grey or PDE based inpainting.

use std::{cmp::Ordering, collections::BinaryHeap, fmt, str::FromStr};

use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{ImageBatch, InpaintError, InpaintResult, MaskBatch, ensure_aligned};

use super::alpha::{build_alpha, make_odd};

/// Neighbourhood radius handed to the PDE primitive.
pub const PDE_RADIUS: usize = 3;

/// Fill strategy selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillMode {
    Neutral,
    Telea,
    NavierStokes,
}

impl FromStr for FillMode {
    type Err = InpaintError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "neutral" => Ok(Self::Neutral),
            "telea" => Ok(Self::Telea),
            "navier-stokes" | "ns" => Ok(Self::NavierStokes),
            other => Err(InpaintError::Configuration(format!(
                "unknown fill mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for FillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Neutral => "neutral",
            Self::Telea => "telea",
            Self::NavierStokes => "navier-stokes",
        })
    }
}

/// PDE flavour requested from an [`InpaintPrimitive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdeMethod {
    Telea,
    NavierStokes,
}

/// Two-dimensional inpainting over 8-bit RGB pixels.
///
/// `mask` marks pixels to reconstruct with any non-zero value. Implementations
/// must return an image of the same shape.
pub trait InpaintPrimitive: Send + Sync {
    fn inpaint(
        &self,
        pixels: &Array3<u8>,
        mask: &Array2<u8>,
        radius: usize,
        method: PdeMethod,
    ) -> InpaintResult<Array3<u8>>;
}

/// Fills masked pixels in order of their distance to known pixels, each as a
/// distance weighted average of known neighbours within the radius.
///
/// Navier-Stokes mode runs diffusion sweeps over the masked area afterwards.
#[derive(Debug, Clone)]
pub struct FastMarchInpainter {
    pub diffusion_sweeps: usize,
}

impl Default for FastMarchInpainter {
    fn default() -> Self {
        Self {
            diffusion_sweeps: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Front {
    distance: f32,
    index: usize,
}

impl Eq for Front {}

impl Ord for Front {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on distance
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for Front {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const NEIGHBOURS: [(isize, isize, f32); 8] = [
    (-1, 0, 1.0),
    (1, 0, 1.0),
    (0, -1, 1.0),
    (0, 1, 1.0),
    (-1, -1, std::f32::consts::SQRT_2),
    (-1, 1, std::f32::consts::SQRT_2),
    (1, -1, std::f32::consts::SQRT_2),
    (1, 1, std::f32::consts::SQRT_2),
];

impl FastMarchInpainter {
    fn march(&self, pixels: &mut Array3<f32>, unknown: &mut Array2<bool>, radius: usize) {
        let (h, w) = unknown.dim();
        let mut distance = Array2::<f32>::from_elem((h, w), f32::INFINITY);
        let mut heap = BinaryHeap::new();
        for ((y, x), flag) in unknown.indexed_iter() {
            if !*flag {
                distance[[y, x]] = 0.0;
                heap.push(Front {
                    distance: 0.0,
                    index: y * w + x,
                });
            }
        }

        let r = radius.max(1) as isize;
        while let Some(Front { distance: d, index }) = heap.pop() {
            let (y, x) = (index / w, index % w);
            if d > distance[[y, x]] {
                continue;
            }
            if unknown[[y, x]] {
                let mut acc = [0.0f32; 3];
                let mut total = 0.0f32;
                for dy in -r..=r {
                    for dx in -r..=r {
                        let (ny, nx) = (y as isize + dy, x as isize + dx);
                        if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                            continue;
                        }
                        let (ny, nx) = (ny as usize, nx as usize);
                        let dist2 = (dy * dy + dx * dx) as f32;
                        if unknown[[ny, nx]] || dist2 == 0.0 || dist2 > (r * r) as f32 {
                            continue;
                        }
                        let level = 1.0 / (1.0 + (distance[[ny, nx]] - d).abs());
                        let weight = level / dist2;
                        for c in 0..3 {
                            acc[c] += weight * pixels[[ny, nx, c]];
                        }
                        total += weight;
                    }
                }
                if total > 0.0 {
                    for c in 0..3 {
                        pixels[[y, x, c]] = acc[c] / total;
                    }
                }
                unknown[[y, x]] = false;
            }
            for &(dy, dx, step) in &NEIGHBOURS {
                let (ny, nx) = (y as isize + dy, x as isize + dx);
                if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                    continue;
                }
                let (ny, nx) = (ny as usize, nx as usize);
                let candidate = d + step;
                if candidate < distance[[ny, nx]] {
                    distance[[ny, nx]] = candidate;
                    heap.push(Front {
                        distance: candidate,
                        index: ny * w + nx,
                    });
                }
            }
        }
    }

    fn diffuse(&self, pixels: &mut Array3<f32>, region: &Array2<bool>) {
        let (h, w) = region.dim();
        for _ in 0..self.diffusion_sweeps {
            let previous = pixels.clone();
            for ((y, x), inside) in region.indexed_iter() {
                if !*inside {
                    continue;
                }
                let mut acc = [0.0f32; 3];
                let mut count = 0.0f32;
                for &(dy, dx, _) in &NEIGHBOURS[..4] {
                    let (ny, nx) = (y as isize + dy, x as isize + dx);
                    if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                        continue;
                    }
                    for c in 0..3 {
                        acc[c] += previous[[ny as usize, nx as usize, c]];
                    }
                    count += 1.0;
                }
                for c in 0..3 {
                    pixels[[y, x, c]] = acc[c] / count;
                }
            }
        }
    }
}

impl InpaintPrimitive for FastMarchInpainter {
    fn inpaint(
        &self,
        pixels: &Array3<u8>,
        mask: &Array2<u8>,
        radius: usize,
        method: PdeMethod,
    ) -> InpaintResult<Array3<u8>> {
        let (h, w, c) = pixels.dim();
        if c != 3 || mask.dim() != (h, w) {
            return Err(InpaintError::InvalidSize(format!(
                "inpaint primitive expects {w}x{h}x3 pixels with a matching mask"
            )));
        }
        let region = mask.mapv(|m| m != 0);
        if region.iter().all(|inside| *inside) {
            debug!("mask covers the whole image, nothing to propagate from");
            return Ok(pixels.clone());
        }

        let mut work = pixels.mapv(f32::from);
        let mut unknown = region.clone();
        self.march(&mut work, &mut unknown, radius);
        if method == PdeMethod::NavierStokes {
            self.diffuse(&mut work, &region);
        }
        Ok(work.mapv(|v| v.round().clamp(0.0, 255.0) as u8))
    }
}

/// Replaces masked content with grey or PDE output, blended through the
/// soft alpha derived from `falloff`.
///
/// The caller's image is left untouched; a new batch is returned. A single
/// mask is shared across the whole image batch. Pixels with zero alpha are
/// copied unchanged.
#[instrument(skip(image, mask, primitive), fields(batch = image.len_of(Axis(0))))]
pub fn masked_fill(
    image: &ImageBatch,
    mask: &MaskBatch,
    mode: FillMode,
    falloff: usize,
    primitive: &dyn InpaintPrimitive,
) -> InpaintResult<ImageBatch> {
    ensure_aligned(image, mask)?;
    let batch = image.len_of(Axis(0));
    let mask_batch = mask.len_of(Axis(0));
    if mask_batch != 1 && mask_batch != batch {
        return Err(InpaintError::InvalidSize(format!(
            "mask batch {mask_batch} cannot be applied to image batch {batch}"
        )));
    }

    let falloff = make_odd(falloff);
    let alpha = build_alpha(mask, falloff);
    let mut output = image.clone();

    for (index, mut item) in output.outer_iter_mut().enumerate() {
        let weight = alpha.index_axis(Axis(0), if mask_batch == 1 { 0 } else { index });
        match mode {
            FillMode::Neutral => {
                for mut channel in item.axis_iter_mut(Axis(2)) {
                    Zip::from(&mut channel)
                        .and(&weight)
                        .for_each(|p, &a| {
                            if a > 0.0 {
                                *p = (*p - 0.5) * (1.0 - a) + 0.5;
                            }
                        });
                }
            }
            FillMode::Telea | FillMode::NavierStokes => {
                let method = if mode == FillMode::Telea {
                    PdeMethod::Telea
                } else {
                    PdeMethod::NavierStokes
                };
                let pixels = item.mapv(quantize);
                let mask8 = weight.mapv(quantize);
                let filled = primitive.inpaint(&pixels, &mask8, PDE_RADIUS, method)?;
                blend_filled(&mut item, &filled, weight);
            }
        }
    }
    Ok(output)
}

fn quantize(value: f32) -> u8 {
    (255.0 * value).clamp(0.0, 255.0) as u8
}

fn blend_filled(item: &mut ndarray::ArrayViewMut3<'_, f32>, filled: &Array3<u8>, alpha: ArrayView2<'_, f32>) {
    for ((y, x, c), p) in item.indexed_iter_mut() {
        let a = alpha[[y, x]];
        if a <= 0.0 {
            continue;
        }
        let f = f32::from(filled[[y, x, c]]) / 255.0;
        *p = *p * (1.0 - a) + f * a;
    }
}
