use std::sync::Arc;

use inpaint_nodes::{
    InpaintError, InpaintResult,
    pipeline::{
        head::{InpaintHead, InpaintPatch, Latent, PatchableModel, apply_inpaint_patch, latent_mask},
        patch::{
            DenseDiffPatch, DiffDict, IdentityPatch, KeyMap, PatchEntry, PatchedWeights,
            QuantizedDiff, WeightPatch, WeightSource, WeightStore, build_patch_table,
        },
    },
    telemetry::TelemetrySink,
};
use ndarray::{Array, Array4, ArrayD, IxDyn, s};

fn tensor(shape: &[usize], f: impl Fn(usize) -> f32) -> ArrayD<f32> {
    let len: usize = shape.iter().product();
    Array::from_shape_vec(IxDyn(shape), (0..len).map(f).collect()).expect("shape")
}

fn store_with(key: &str, weight: ArrayD<f32>) -> Arc<dyn WeightSource> {
    let mut store = WeightStore::default();
    store.insert(key, weight);
    Arc::new(store)
}

#[derive(Debug)]
struct Scale;

impl WeightPatch for Scale {
    fn kind(&self) -> &'static str {
        "scale"
    }

    fn apply(&self, _key: &str, weight: &mut ArrayD<f32>, alpha: f32) -> InpaintResult<()> {
        weight.mapv_inplace(|w| w * alpha);
        Ok(())
    }
}

struct TinyModel {
    store: Arc<WeightStore>,
}

impl TinyModel {
    fn new() -> Self {
        let mut store = WeightStore::default();
        store.insert("diffusion_model.w", ArrayD::zeros(IxDyn(&[2])));
        Self {
            store: Arc::new(store),
        }
    }
}

impl PatchableModel for TinyModel {
    fn weights(&self) -> Arc<dyn WeightSource> {
        self.store.clone()
    }

    fn lora_key_map(&self) -> KeyMap {
        let mut map = KeyMap::new();
        map.insert("diffusion_model.w".into(), "w".into());
        map.insert("diffusion_model.ghost".into(), "ghost".into());
        map
    }

    fn process_latent_in(&self, samples: &Array4<f32>) -> Array4<f32> {
        samples * 2.0
    }
}

fn head_with_centre_tap(in_channel: usize) -> InpaintHead {
    let mut weight = Array4::<f32>::zeros((320, 5, 3, 3));
    weight[[0, in_channel, 1, 1]] = 1.0;
    InpaintHead::new(weight).expect("head")
}

#[test]
fn table_counts_unmapped_diff_keys() {
    let diff = QuantizedDiff::quantize(&tensor(&[2], |i| i as f32));
    let mut diffs = DiffDict::new();
    diffs.insert("lora.a".into(), diff.clone());
    diffs.insert("lora.b".into(), diff.clone());
    diffs.insert("lora.orphan".into(), diff);
    let mut key_map = KeyMap::new();
    key_map.insert("model.a.weight".into(), "lora.a".into());
    key_map.insert("model.b.weight".into(), "lora.b".into());
    key_map.insert("model.c.weight".into(), "lora.missing".into());

    let table = build_patch_table(&diffs, &key_map);
    assert_eq!(table.len(), 2);
    assert_eq!(table.unmapped(), 1);
    assert!(table.get("model.a.weight").is_some());
    assert!(table.get("model.c.weight").is_none());
}

#[test]
fn dequantize_follows_min_max_recipe() {
    let diff = QuantizedDiff {
        values: Array::from_shape_vec(IxDyn(&[3]), vec![0u8, 51, 255]).expect("shape"),
        min: -1.0,
        max: 1.0,
    };
    let values = diff.dequantize();
    assert_eq!(values[[0]], -1.0);
    assert!((values[[1]] - (-0.6)).abs() < 1e-6);
    assert_eq!(values[[2]], 1.0);
}

#[test]
fn identity_quantisation_reproduces_weight() {
    let weight = tensor(&[4, 3], |i| (i as f32 * 0.37).sin());
    let patch = DenseDiffPatch::new(Arc::new(QuantizedDiff {
        values: weight.mapv(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8),
        min: 0.0,
        max: 1.0,
    }));
    let mut zero = ArrayD::<f32>::zeros(IxDyn(&[4, 3]));
    patch.apply("w", &mut zero, 1.0).expect("apply");
    for (got, want) in zero.iter().zip(weight.iter()) {
        assert!((got - want.clamp(0.0, 1.0)).abs() <= 1.0 / 255.0);
    }
}

#[test]
fn resolve_applies_patch_additively() {
    let weight = tensor(&[2, 2], |i| i as f32);
    let telemetry = TelemetrySink::default();
    let mut patched = PatchedWeights::new(store_with("w", weight.clone()), telemetry.clone());
    let diff = QuantizedDiff {
        values: ArrayD::from_elem(IxDyn(&[2, 2]), 255u8),
        min: 0.0,
        max: 2.0,
    };
    assert!(patched.add_patch(
        "w",
        PatchEntry {
            alpha: 0.5,
            patch: Arc::new(DenseDiffPatch::new(Arc::new(diff))),
        }
    ));
    let resolved = patched.resolve("w").expect("resolve");
    assert_eq!(resolved, weight.mapv(|v| v + 1.0));
    assert_eq!(telemetry.snapshot().patches_applied, 1);
}

#[test]
fn shape_mismatch_is_skipped_not_raised() {
    let weight = tensor(&[2, 2], |i| i as f32);
    let telemetry = TelemetrySink::default();
    let mut patched = PatchedWeights::new(store_with("w", weight.clone()), telemetry.clone());
    let wrong = QuantizedDiff::quantize(&tensor(&[3], |i| i as f32));
    patched.add_patch(
        "w",
        PatchEntry {
            alpha: 1.0,
            patch: Arc::new(DenseDiffPatch::new(Arc::new(wrong))),
        },
    );
    assert_eq!(patched.resolve("w").expect("resolve"), weight);
    assert_eq!(telemetry.snapshot().patches_skipped, 1);
}

#[test]
fn other_patch_kinds_keep_their_behaviour() {
    let weight = tensor(&[2], |i| i as f32 + 1.0);
    let mut patched = PatchedWeights::new(store_with("w", weight.clone()), TelemetrySink::default());
    patched.add_patch("w", PatchEntry { alpha: 3.0, patch: Arc::new(Scale) });
    patched.add_patch("w", PatchEntry { alpha: 1.0, patch: Arc::new(IdentityPatch) });
    assert_eq!(patched.resolve("w").expect("resolve"), weight.mapv(|v| v * 3.0));
}

#[test]
fn table_keys_missing_from_model_are_rejected() {
    let mut diffs = DiffDict::new();
    diffs.insert("d".into(), QuantizedDiff::quantize(&tensor(&[2], |i| i as f32)));
    let mut key_map = KeyMap::new();
    key_map.insert("absent".into(), "d".into());
    let table = build_patch_table(&diffs, &key_map);
    let mut patched = PatchedWeights::new(store_with("w", tensor(&[2], |_| 0.0)), TelemetrySink::default());
    assert!(patched.add_patch_table(&table, 1.0).is_empty());
    assert!(!patched.is_patched("absent"));
    assert!(patched.resolve("absent").is_err());
}

#[test]
fn head_rejects_wrong_shape() {
    let err = InpaintHead::new(Array4::zeros((320, 4, 3, 3))).expect_err("bad head");
    assert!(matches!(err, InpaintError::ShapeMismatch { .. }));
}

#[test]
fn centre_tap_copies_channel() {
    let head = head_with_centre_tap(2);
    let input = Array4::from_shape_fn((1, 5, 3, 4), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32);
    let out = head.forward(&input).expect("forward");
    assert_eq!(out.dim(), (1, 320, 3, 4));
    assert_eq!(out.slice(s![0, 0, .., ..]), input.slice(s![0, 2, .., ..]));
    assert!(out.slice(s![0, 1.., .., ..]).iter().all(|v| *v == 0.0));
}

#[test]
fn replicate_padding_extends_edges() {
    let mut weight = Array4::<f32>::zeros((320, 5, 3, 3));
    weight[[0, 0, 0, 1]] = 1.0;
    let head = InpaintHead::new(weight).expect("head");
    let input = Array4::from_shape_fn((1, 5, 2, 2), |(_, _, y, x)| (y * 2 + x + 1) as f32);
    let out = head.forward(&input).expect("forward");
    assert_eq!(out[[0, 0, 0, 0]], 1.0);
    assert_eq!(out[[0, 0, 0, 1]], 2.0);
    assert_eq!(out[[0, 0, 1, 0]], 1.0);
    assert_eq!(out[[0, 0, 1, 1]], 2.0);
}

#[test]
fn latent_mask_is_max_pooled_and_hard() {
    let mut noise = Array4::<f32>::zeros((1, 1, 16, 16));
    noise[[0, 0, 3, 12]] = 0.6;
    noise[[0, 0, 9, 1]] = 0.4;
    let mask = latent_mask(&noise);
    assert_eq!(mask.dim(), (1, 1, 2, 2));
    assert_eq!(mask[[0, 0, 0, 1]], 1.0);
    assert_eq!(mask[[0, 0, 1, 0]], 0.0);
}

#[test]
fn patch_application_hooks_block_zero_and_patches_weights() {
    let model = TinyModel::new();
    let mut diffs = DiffDict::new();
    diffs.insert(
        "w".into(),
        QuantizedDiff {
            values: ArrayD::from_elem(IxDyn(&[2]), 255u8),
            min: 0.0,
            max: 1.0,
        },
    );
    let patch = InpaintPatch {
        head: head_with_centre_tap(1),
        diffs,
    };
    let latent = Latent {
        samples: Array4::from_elem((1, 4, 2, 2), 0.25),
        noise_mask: Array4::ones((1, 1, 16, 16)),
    };
    let patched = apply_inpaint_patch(&model, &patch, &latent, TelemetrySink::default())
        .expect("apply");

    assert!(patched.weights.is_patched("diffusion_model.w"));
    let resolved = patched.weights.resolve("diffusion_model.w").expect("resolve");
    assert!(resolved.iter().all(|v| *v == 1.0));

    let hidden = Array4::<f32>::zeros((1, 320, 2, 2));
    let block0 = patched.input_block(0, hidden.clone()).expect("block 0");
    assert!(block0.slice(s![0, 0, .., ..]).iter().all(|v| *v == 0.5));
    assert_eq!(patched.input_block(1, hidden.clone()).expect("block 1"), hidden);
}
