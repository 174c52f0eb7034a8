//! Inpaint model variants and checkpoint loading.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use half::{bf16, f16};
use ndarray::{Array4, ArrayD, IxDyn};
use rand::rngs::StdRng;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info, instrument};

use crate::{InpaintError, InpaintResult};

use super::{
    head::{InpaintHead, InpaintPatch},
    patch::{DiffDict, QuantizedDiff},
};

/// State-dict key only present in MAT checkpoints.
pub const MAT_SENTINEL_KEY: &str = "synthesis.first_stage.conv_first.conv.resample_filter";

/// Extension of script-compiled checkpoints.
pub const SCRIPT_CHECKPOINT_EXTENSION: &str = "pt";

/// Architecture of a loaded inpaint network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelArch {
    Mat,
    Lama,
    /// Any other architecture reported by the generic loader.
    Other(String),
}

impl ModelArch {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "MAT" => Self::Mat,
            "LaMa" => Self::Lama,
            other => Self::Other(other.to_string()),
        }
    }

    /// Fixed square input resolution of the architecture.
    pub fn required_size(&self) -> InpaintResult<usize> {
        match self {
            Self::Mat => Ok(512),
            Self::Lama => Ok(256),
            Self::Other(tag) => Err(InpaintError::Configuration(format!(
                "unknown model architecture {tag}"
            ))),
        }
    }

    /// Whether `size` is the input resolution of a known architecture.
    pub fn is_supported_size(size: usize) -> bool {
        [Self::Mat, Self::Lama]
            .iter()
            .any(|arch| arch.required_size() == Ok(size))
    }
}

impl fmt::Display for ModelArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mat => f.write_str("MAT"),
            Self::Lama => f.write_str("LaMa"),
            Self::Other(tag) => f.write_str(tag),
        }
    }
}

/// Forward pass of an inpainting network over NCHW tensors.
///
/// `image` is `[1, 3, s, s]`, `mask` is `[1, 1, s, s]` with values in `{0, 1}`.
/// Stochastic networks draw from `rng`, which is seeded per batch item.
pub trait InpaintNetwork: Send + Sync {
    fn forward(
        &self,
        image: &Array4<f32>,
        mask: &Array4<f32>,
        rng: &mut StdRng,
    ) -> InpaintResult<Array4<f32>>;
}

/// Super-resolution network applied to model output in `[b, h, w, c]` layout.
pub trait Upscaler: Send + Sync {
    fn upscale(&self, image: &Array4<f32>) -> InpaintResult<Array4<f32>>;
}

/// Inference-only inpaint model tagged with its architecture.
#[derive(Clone)]
pub struct InpaintModel {
    pub arch: ModelArch,
    pub network: Arc<dyn InpaintNetwork>,
}

impl fmt::Debug for InpaintModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InpaintModel")
            .field("arch", &self.arch)
            .finish_non_exhaustive()
    }
}

impl InpaintModel {
    pub fn new(arch: ModelArch, network: Arc<dyn InpaintNetwork>) -> Self {
        Self { arch, network }
    }
}

/// Tensor read from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(ArrayD<f32>),
    Byte(ArrayD<u8>),
}

impl TensorData {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float(t) => t.shape(),
            Self::Byte(t) => t.shape(),
        }
    }

    fn scalar(&self) -> Option<f32> {
        match self {
            Self::Float(t) if t.len() == 1 => t.iter().next().copied(),
            Self::Byte(t) if t.len() == 1 => t.iter().next().map(|v| f32::from(*v)),
            _ => None,
        }
    }
}

/// Plain weight mapping read from a checkpoint file.
pub type StateDict = BTreeMap<String, TensorData>;

/// Reads checkpoints in formats this crate cannot parse itself.
pub trait CheckpointReader: Send + Sync {
    fn read(&self, path: &Path) -> InpaintResult<StateDict>;
}

/// Builds networks out of state dicts.
pub trait NetworkLoader: Send + Sync {
    fn load_mat(&self, state: StateDict) -> InpaintResult<Arc<dyn InpaintNetwork>>;

    /// Detects the architecture of any other checkpoint.
    fn load_detected(&self, state: StateDict) -> InpaintResult<InpaintModel>;
}

/// Resolves `name` inside the model folder.
pub fn resolve_model_path(dir: &Path, name: &str) -> InpaintResult<PathBuf> {
    let path = dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(InpaintError::Configuration(format!(
            "model file not found: {name}"
        )))
    }
}

/// Parses a safetensors buffer into a state dict.
pub fn parse_safetensors(buffer: &[u8]) -> InpaintResult<StateDict> {
    let tensors = SafeTensors::deserialize(buffer)?;
    let mut state = StateDict::new();
    for (name, view) in tensors.tensors() {
        let shape = IxDyn(view.shape());
        let data = view.data();
        let tensor = match view.dtype() {
            Dtype::U8 => TensorData::Byte(
                ArrayD::from_shape_vec(shape, data.to_vec()).map_err(|err| shape_error(&name, err))?,
            ),
            Dtype::F32 => TensorData::Float(
                ArrayD::from_shape_vec(
                    shape,
                    data.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect(),
                )
                .map_err(|err| shape_error(&name, err))?,
            ),
            Dtype::F16 => TensorData::Float(
                ArrayD::from_shape_vec(
                    shape,
                    data.chunks_exact(2)
                        .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                        .collect(),
                )
                .map_err(|err| shape_error(&name, err))?,
            ),
            Dtype::BF16 => TensorData::Float(
                ArrayD::from_shape_vec(
                    shape,
                    data.chunks_exact(2)
                        .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
                        .collect(),
                )
                .map_err(|err| shape_error(&name, err))?,
            ),
            other => {
                return Err(InpaintError::Format(format!(
                    "tensor {name} has unsupported dtype {other:?}"
                )));
            }
        };
        state.insert(name, tensor);
    }
    debug!(tensors = state.len(), "state dict parsed");
    Ok(state)
}

fn shape_error(name: &str, err: ndarray::ShapeError) -> InpaintError {
    InpaintError::Format(format!("tensor {name}: {err}"))
}

/// Reads a checkpoint, delegating script checkpoints to `script_reader`.
pub fn read_checkpoint(
    path: &Path,
    script_reader: Option<&dyn CheckpointReader>,
) -> InpaintResult<StateDict> {
    let is_script = path
        .extension()
        .is_some_and(|ext| ext == SCRIPT_CHECKPOINT_EXTENSION);
    if is_script {
        let reader = script_reader.ok_or_else(|| {
            InpaintError::Configuration(format!(
                "{}: script checkpoints need a checkpoint reader",
                path.display()
            ))
        })?;
        return reader.read(path);
    }
    let buffer = std::fs::read(path)
        .map_err(|err| InpaintError::Io(format!("{}: {err}", path.display())))?;
    parse_safetensors(&buffer)
}

/// Loads an inpaint model, routing MAT checkpoints by their sentinel key.
#[instrument(skip(loader, script_reader))]
pub fn load_inpaint_model(
    dir: &Path,
    name: &str,
    loader: &dyn NetworkLoader,
    script_reader: Option<&dyn CheckpointReader>,
) -> InpaintResult<InpaintModel> {
    let path = resolve_model_path(dir, name)?;
    let state = read_checkpoint(&path, script_reader)?;
    let model = if state.contains_key(MAT_SENTINEL_KEY) {
        InpaintModel::new(ModelArch::Mat, loader.load_mat(state)?)
    } else {
        loader.load_detected(state)?
    };
    info!(arch = %model.arch, "inpaint model loaded");
    Ok(model)
}

/// Extracts the dense diffs of a patch file.
///
/// Each `U8` tensor `k` needs float scalars `k.min` and `k.max`.
pub fn diff_dict_from_state(state: &StateDict) -> InpaintResult<DiffDict> {
    let mut diffs = DiffDict::new();
    for (key, tensor) in state {
        let TensorData::Byte(values) = tensor else {
            continue;
        };
        let bound = |suffix: &str| {
            state
                .get(&format!("{key}.{suffix}"))
                .and_then(TensorData::scalar)
                .ok_or_else(|| {
                    InpaintError::Format(format!("patch entry {key} is missing its {suffix} scalar"))
                })
        };
        diffs.insert(
            key.clone(),
            QuantizedDiff {
                values: values.clone(),
                min: bound("min")?,
                max: bound("max")?,
            },
        );
    }
    Ok(diffs)
}

/// Loads the dense head from its state dict.
pub fn head_from_state(state: &StateDict) -> InpaintResult<InpaintHead> {
    match state.get("head") {
        Some(TensorData::Float(weight)) => {
            let weight = weight
                .clone()
                .into_dimensionality()
                .map_err(|err| InpaintError::Format(format!("head tensor: {err}")))?;
            InpaintHead::new(weight)
        }
        Some(TensorData::Byte(_)) => Err(InpaintError::Format(
            "head tensor must be floating point".to_string(),
        )),
        None => Err(InpaintError::Format("head tensor missing".to_string())),
    }
}

/// Loads a head file and a patch file from the model folder.
#[instrument(skip(script_reader))]
pub fn load_inpaint_patch(
    dir: &Path,
    head: &str,
    patch: &str,
    script_reader: Option<&dyn CheckpointReader>,
) -> InpaintResult<InpaintPatch> {
    let head_state = read_checkpoint(&resolve_model_path(dir, head)?, script_reader)?;
    let patch_path = resolve_model_path(dir, patch)?;
    let buffer = std::fs::read(&patch_path)
        .map_err(|err| InpaintError::Io(format!("{}: {err}", patch_path.display())))?;
    let diffs = diff_dict_from_state(&parse_safetensors(&buffer)?)?;
    info!(diffs = diffs.len(), "inpaint patch loaded");
    Ok(InpaintPatch {
        head: head_from_state(&head_state)?,
        diffs,
    })
}
