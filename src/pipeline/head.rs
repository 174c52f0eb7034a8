//! Dense inpaint head and patch application onto a diffusion model.
//!
//! The head turns `[latent_mask, latent_pixels]` into a feature map that is
//! added to the first input block's hidden state; the accompanying diff dict
//! is layered over the model weights as dense diffs.

use std::sync::Arc;

use ndarray::{Array4, Axis, concatenate};
use tracing::{info, instrument, warn};

use crate::{InpaintError, InpaintResult, telemetry::TelemetrySink};

use super::{
    filters::max_pool,
    patch::{DiffDict, KeyMap, PatchTable, PatchedWeights, WeightSource, build_patch_table},
};

/// Latent pixels are one eighth of image resolution.
pub const LATENT_SCALE: usize = 8;

/// Convolutional head mapping mask + latent channels to block-0 features.
#[derive(Debug, Clone, PartialEq)]
pub struct InpaintHead {
    weight: Array4<f32>,
}

impl InpaintHead {
    pub const OUT_CHANNELS: usize = 320;
    pub const IN_CHANNELS: usize = 5;
    pub const KERNEL: usize = 3;

    /// Wraps a `[320, 5, 3, 3]` convolution weight.
    pub fn new(weight: Array4<f32>) -> InpaintResult<Self> {
        let expected = (
            Self::OUT_CHANNELS,
            Self::IN_CHANNELS,
            Self::KERNEL,
            Self::KERNEL,
        );
        if weight.dim() != expected {
            return Err(InpaintError::ShapeMismatch {
                key: "head".to_string(),
                expected: vec![expected.0, expected.1, expected.2, expected.3],
                actual: weight.shape().to_vec(),
            });
        }
        Ok(Self { weight })
    }

    pub fn weight(&self) -> &Array4<f32> {
        &self.weight
    }

    /// Replicate-pads by one pixel and applies the 3x3 convolution.
    pub fn forward(&self, input: &Array4<f32>) -> InpaintResult<Array4<f32>> {
        let (b, c, h, w) = input.dim();
        if c != Self::IN_CHANNELS {
            return Err(InpaintError::InvalidSize(format!(
                "inpaint head expects {} channels, got {c}",
                Self::IN_CHANNELS
            )));
        }
        let mut out = Array4::<f32>::zeros((b, Self::OUT_CHANNELS, h, w));
        for n in 0..b {
            for oc in 0..Self::OUT_CHANNELS {
                let kernel = self.weight.index_axis(Axis(0), oc);
                for y in 0..h {
                    for x in 0..w {
                        let mut acc = 0.0;
                        for ic in 0..c {
                            for ky in 0..Self::KERNEL {
                                let sy = (y + ky).saturating_sub(1).min(h - 1);
                                for kx in 0..Self::KERNEL {
                                    let sx = (x + kx).saturating_sub(1).min(w - 1);
                                    acc += kernel[[ic, ky, kx]] * input[[n, ic, sy, sx]];
                                }
                            }
                        }
                        out[[n, oc, y, x]] = acc;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Latent batch with its image-resolution noise mask.
#[derive(Debug, Clone)]
pub struct Latent {
    /// `[batch, channels, h / 8, w / 8]`
    pub samples: Array4<f32>,
    /// `[batch, 1, h, w]`
    pub noise_mask: Array4<f32>,
}

/// Downsamples a noise mask onto the latent grid as a hard mask.
pub fn latent_mask(noise_mask: &Array4<f32>) -> Array4<f32> {
    let (b, c, h, w) = noise_mask.dim();
    let rounded = noise_mask.mapv(f32::round);
    let mut out = Array4::<f32>::zeros((b, c, h / LATENT_SCALE, w / LATENT_SCALE));
    for (mut dst, src) in out.outer_iter_mut().zip(rounded.outer_iter()) {
        for (mut dst_plane, src_plane) in dst.outer_iter_mut().zip(src.outer_iter()) {
            dst_plane.assign(&max_pool(src_plane, LATENT_SCALE).mapv(f32::round));
        }
    }
    out
}

/// Diffusion model that can be cloned with weight patches and block hooks.
pub trait PatchableModel: Send + Sync {
    fn weights(&self) -> Arc<dyn WeightSource>;

    /// Maps model weight keys onto the names used by differential patches.
    fn lora_key_map(&self) -> KeyMap;

    /// Scales raw latents into the model's working space.
    fn process_latent_in(&self, samples: &Array4<f32>) -> Array4<f32>;
}

/// Adds the head feature to the hidden state of input block 0.
#[derive(Debug, Clone)]
pub struct InputBlockPatch {
    feature: Arc<Array4<f32>>,
}

impl InputBlockPatch {
    pub fn new(feature: Array4<f32>) -> Self {
        Self {
            feature: Arc::new(feature),
        }
    }

    pub fn feature(&self) -> &Array4<f32> {
        &self.feature
    }

    pub fn apply(&self, block_index: usize, hidden: Array4<f32>) -> InpaintResult<Array4<f32>> {
        if block_index != 0 {
            return Ok(hidden);
        }
        if hidden.dim() != self.feature.dim() {
            return Err(InpaintError::ShapeMismatch {
                key: "input_block.0".to_string(),
                expected: hidden.shape().to_vec(),
                actual: self.feature.shape().to_vec(),
            });
        }
        Ok(hidden + &*self.feature)
    }
}

/// Model clone carrying the inpaint patches.
#[derive(Debug, Clone)]
pub struct PatchedModel {
    pub weights: PatchedWeights,
    pub input_block_patch: Option<InputBlockPatch>,
}

impl PatchedModel {
    /// Runs the input block hook; identity when no hook is installed.
    pub fn input_block(&self, block_index: usize, hidden: Array4<f32>) -> InpaintResult<Array4<f32>> {
        match &self.input_block_patch {
            Some(patch) => patch.apply(block_index, hidden),
            None => Ok(hidden),
        }
    }
}

/// Head weights and diff dict loaded as one patch.
#[derive(Debug, Clone)]
pub struct InpaintPatch {
    pub head: InpaintHead,
    pub diffs: DiffDict,
}

/// Computes the head feature for `latent` and layers the diffs over `model`.
#[instrument(skip_all, fields(diffs = patch.diffs.len()))]
pub fn apply_inpaint_patch(
    model: &dyn PatchableModel,
    patch: &InpaintPatch,
    latent: &Latent,
    telemetry: TelemetrySink,
) -> InpaintResult<PatchedModel> {
    let latent_pixels = model.process_latent_in(&latent.samples);
    let mask = latent_mask(&latent.noise_mask);
    let (lb, _, lh, lw) = latent_pixels.dim();
    let (mb, _, mh, mw) = mask.dim();
    if (mh, mw) != (lh, lw) {
        return Err(InpaintError::InvalidSize(format!(
            "latent mask {mw}x{mh} does not match latent {lw}x{lh}"
        )));
    }
    let mask = if mb == lb {
        mask
    } else if mb == 1 {
        mask.broadcast((lb, 1, mh, mw))
            .map(|view| view.to_owned())
            .ok_or_else(|| InpaintError::InvalidSize("latent mask broadcast failed".to_string()))?
    } else {
        return Err(InpaintError::InvalidSize(format!(
            "noise mask batch {mb} does not match latent batch {lb}"
        )));
    };

    let feed = concatenate(Axis(1), &[mask.view(), latent_pixels.view()])
        .map_err(|err| InpaintError::InvalidSize(format!("head input: {err}")))?;
    let feature = patch.head.forward(&feed)?;

    let table: PatchTable = build_patch_table(&patch.diffs, &model.lora_key_map());
    let mut weights = PatchedWeights::new(model.weights(), telemetry);
    let accepted = weights.add_patch_table(&table, 1.0);
    let not_patched = table.len() - accepted.len();
    if not_patched > 0 {
        warn!(not_patched, "failed to patch keys");
    }
    info!(patched = accepted.len(), "inpaint patch applied");

    Ok(PatchedModel {
        weights,
        input_block_patch: Some(InputBlockPatch::new(feature)),
    })
}
