//! Weight patching for differential (LoRA-style) inpaint patches.
//!
//! A model's weights are resolved through [`PatchedWeights`], which holds the
//! base weight source and, per weight key, an ordered list of patches. Each
//! patch kind is its own [`WeightPatch`] implementation, so patches produced
//! by other mechanisms keep their own behaviour and the quantised dense
//! diffs from this module only touch the keys they were registered for.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use ndarray::{ArrayD, Zip};
use tracing::{info, instrument, warn};

use crate::{InpaintError, InpaintResult, telemetry::TelemetrySink};

/// Kind tag of the quantised dense diff patches built here.
pub const DENSE_DIFF: &str = "dense-diff";

/// Quantised weight delta: `value = values / 255 * (max - min) + min`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedDiff {
    pub values: ArrayD<u8>,
    pub min: f32,
    pub max: f32,
}

impl QuantizedDiff {
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Expands the quantised values back into floats.
    pub fn dequantize(&self) -> ArrayD<f32> {
        let span = self.max - self.min;
        self.values.mapv(|q| f32::from(q) / 255.0 * span + self.min)
    }

    /// Quantises a float tensor over its own value range.
    pub fn quantize(values: &ArrayD<f32>) -> Self {
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let (min, max) = if min.is_finite() { (min, max) } else { (0.0, 0.0) };
        let span = max - min;
        let quantized = values.mapv(|v| {
            if span > 0.0 {
                ((v - min) / span * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        });
        Self {
            values: quantized,
            min,
            max,
        }
    }
}

/// Diff dictionary as loaded from a patch file, keyed by the file's own names.
pub type DiffDict = BTreeMap<String, QuantizedDiff>;

/// Mapping from model weight key to the diff-dict key that patches it.
pub type KeyMap = BTreeMap<String, String>;

/// Read-only table of dense diffs keyed by model weight key.
#[derive(Debug, Clone, Default)]
pub struct PatchTable {
    entries: BTreeMap<String, Arc<QuantizedDiff>>,
    unmapped: usize,
}

impl PatchTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diff-dict entries that no model key mapped onto.
    pub fn unmapped(&self) -> usize {
        self.unmapped
    }

    pub fn get(&self, key: &str) -> Option<&Arc<QuantizedDiff>> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<QuantizedDiff>)> {
        self.entries.iter()
    }
}

/// Pairs every mapped model key with its diff and counts the leftovers.
#[instrument(skip_all, fields(diffs = diff_dict.len(), keys = key_map.len()))]
pub fn build_patch_table(diff_dict: &DiffDict, key_map: &KeyMap) -> PatchTable {
    let mut entries = BTreeMap::new();
    let mut used = BTreeSet::new();
    for (model_key, diff_key) in key_map {
        if let Some(diff) = diff_dict.get(diff_key) {
            entries.insert(model_key.clone(), Arc::new(diff.clone()));
            used.insert(diff_key.as_str());
        }
    }
    let unmapped = diff_dict
        .keys()
        .filter(|key| !used.contains(key.as_str()))
        .count();
    info!(
        loaded = entries.len(),
        unmapped, "patch keys loaded, remaining keys not found in model"
    );
    PatchTable { entries, unmapped }
}

/// A strategy that modifies a resolved weight tensor.
pub trait WeightPatch: Send + Sync + fmt::Debug {
    fn kind(&self) -> &'static str;

    /// Applies the patch scaled by `alpha`.
    ///
    /// Returning [`InpaintError::ShapeMismatch`] skips the patch; the weight
    /// must be left untouched in that case.
    fn apply(&self, key: &str, weight: &mut ArrayD<f32>, alpha: f32) -> InpaintResult<()>;
}

/// Patch that leaves the weight as resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPatch;

impl WeightPatch for IdentityPatch {
    fn kind(&self) -> &'static str {
        "identity"
    }

    fn apply(&self, _key: &str, _weight: &mut ArrayD<f32>, _alpha: f32) -> InpaintResult<()> {
        Ok(())
    }
}

/// Additive quantised dense diff.
#[derive(Debug, Clone)]
pub struct DenseDiffPatch {
    diff: Arc<QuantizedDiff>,
}

impl DenseDiffPatch {
    pub fn new(diff: Arc<QuantizedDiff>) -> Self {
        Self { diff }
    }
}

impl WeightPatch for DenseDiffPatch {
    fn kind(&self) -> &'static str {
        DENSE_DIFF
    }

    fn apply(&self, key: &str, weight: &mut ArrayD<f32>, alpha: f32) -> InpaintResult<()> {
        if self.diff.shape() != weight.shape() {
            return Err(InpaintError::ShapeMismatch {
                key: key.to_string(),
                expected: weight.shape().to_vec(),
                actual: self.diff.shape().to_vec(),
            });
        }
        let span = self.diff.max - self.diff.min;
        let min = self.diff.min;
        Zip::from(weight)
            .and(&self.diff.values)
            .for_each(|w, &q| *w += alpha * (f32::from(q) / 255.0 * span + min));
        Ok(())
    }
}

/// A patch registered against one weight key.
#[derive(Debug, Clone)]
pub struct PatchEntry {
    pub alpha: f32,
    pub patch: Arc<dyn WeightPatch>,
}

/// Source of unpatched model weights.
pub trait WeightSource: Send + Sync {
    fn weight(&self, key: &str) -> Option<ArrayD<f32>>;

    fn contains(&self, key: &str) -> bool;
}

/// In-memory weight store.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    weights: BTreeMap<String, ArrayD<f32>>,
}

impl WeightStore {
    pub fn new(weights: BTreeMap<String, ArrayD<f32>>) -> Self {
        Self { weights }
    }

    pub fn insert(&mut self, key: impl Into<String>, weight: ArrayD<f32>) {
        self.weights.insert(key.into(), weight);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.weights.keys()
    }
}

impl WeightSource for WeightStore {
    fn weight(&self, key: &str) -> Option<ArrayD<f32>> {
        self.weights.get(key).cloned()
    }

    fn contains(&self, key: &str) -> bool {
        self.weights.contains_key(key)
    }
}

/// Base weights plus the patches layered over them.
///
/// Cloning shares the base weights and patch payloads; patch lists are
/// copied so a clone can be patched further without touching the original.
#[derive(Clone)]
pub struct PatchedWeights {
    base: Arc<dyn WeightSource>,
    patches: BTreeMap<String, Vec<PatchEntry>>,
    telemetry: TelemetrySink,
}

impl fmt::Debug for PatchedWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchedWeights")
            .field("patched_keys", &self.patches.len())
            .finish()
    }
}

impl PatchedWeights {
    pub fn new(base: Arc<dyn WeightSource>, telemetry: TelemetrySink) -> Self {
        Self {
            base,
            patches: BTreeMap::new(),
            telemetry,
        }
    }

    /// Registers a patch for `key`; returns false when the base has no such weight.
    pub fn add_patch(&mut self, key: &str, entry: PatchEntry) -> bool {
        if !self.base.contains(key) {
            return false;
        }
        self.patches.entry(key.to_string()).or_default().push(entry);
        true
    }

    /// Registers every table entry as a dense diff with the given strength.
    ///
    /// Returns the keys that were accepted.
    pub fn add_patch_table(&mut self, table: &PatchTable, strength: f32) -> Vec<String> {
        table
            .iter()
            .filter_map(|(key, diff)| {
                let entry = PatchEntry {
                    alpha: strength,
                    patch: Arc::new(DenseDiffPatch::new(diff.clone())),
                };
                self.add_patch(key, entry).then(|| key.clone())
            })
            .collect()
    }

    pub fn is_patched(&self, key: &str) -> bool {
        self.patches.contains_key(key)
    }

    pub fn patched_keys(&self) -> impl Iterator<Item = &String> {
        self.patches.keys()
    }

    /// Resolves a weight with all registered patches applied in order.
    ///
    /// Patches whose shape disagrees with the weight are skipped and logged.
    pub fn resolve(&self, key: &str) -> InpaintResult<ArrayD<f32>> {
        let mut weight = self
            .base
            .weight(key)
            .ok_or_else(|| InpaintError::Model(format!("unknown weight key '{key}'")))?;
        let Some(entries) = self.patches.get(key) else {
            return Ok(weight);
        };
        for entry in entries {
            match entry.patch.apply(key, &mut weight, entry.alpha) {
                Ok(()) => self.telemetry.record_patch(true),
                Err(InpaintError::ShapeMismatch {
                    key,
                    expected,
                    actual,
                }) => {
                    warn!(
                        %key,
                        kind = entry.patch.kind(),
                        ?expected,
                        ?actual,
                        "shape mismatch, weight not merged"
                    );
                    self.telemetry.record_patch(false);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(weight)
    }
}
