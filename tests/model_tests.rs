mod common;

use std::sync::Arc;

use inpaint_nodes::{
    ImageBatch, InpaintError, InpaintResult, MaskBatch, mask_to_nchw,
    pipeline::{
        geometry::{resize_to_square, undo_resize_square},
        inpaint::{broadcast_mask, inpaint_with_model},
        model::{
            InpaintModel, InpaintNetwork, ModelArch, TensorData, diff_dict_from_state,
            parse_safetensors, read_checkpoint, resolve_model_path,
        },
    },
    telemetry::TelemetrySink,
    to_nchw, to_nhwc,
};
use ndarray::{Array, Array4, Axis};
use rand::{Rng, rngs::StdRng};

use common::{RawTensor, to_safetensors};

struct Identity;

impl InpaintNetwork for Identity {
    fn forward(
        &self,
        image: &Array4<f32>,
        _mask: &Array4<f32>,
        _rng: &mut StdRng,
    ) -> InpaintResult<Array4<f32>> {
        Ok(image.clone())
    }
}

struct Noise;

impl InpaintNetwork for Noise {
    fn forward(
        &self,
        image: &Array4<f32>,
        _mask: &Array4<f32>,
        rng: &mut StdRng,
    ) -> InpaintResult<Array4<f32>> {
        Ok(image.mapv(|_| rng.r#gen::<f32>()))
    }
}

fn picture(batch: usize, h: usize, w: usize) -> ImageBatch {
    Array::from_shape_fn((batch, h, w, 3), |(b, y, x, c)| {
        ((b * 7 + y * 3 + x * 5 + c) % 13) as f32 / 13.0
    })
}

#[test]
fn architecture_sizes() {
    assert_eq!(ModelArch::from_tag("MAT").required_size(), Ok(512));
    assert_eq!(ModelArch::from_tag("LaMa").required_size(), Ok(256));
    let err = ModelArch::from_tag("SwinIR").required_size().expect_err("unknown");
    assert!(matches!(err, InpaintError::Configuration(_)));
    assert!(ModelArch::is_supported_size(512));
    assert!(!ModelArch::is_supported_size(300));
}

#[test]
fn parses_float_and_byte_tensors() {
    let buffer = to_safetensors(&[
        RawTensor::f32("w", &[2, 2], &[1.0, 2.0, 3.0, 4.0]),
        RawTensor::u8("q", &[3], &[0, 128, 255]),
    ])
    .expect("serialize");
    let state = parse_safetensors(&buffer).expect("parse");
    assert_eq!(state["w"].shape(), &[2, 2]);
    assert!(matches!(&state["q"], TensorData::Byte(q) if q[[2]] == 255));
}

#[test]
fn diff_dict_requires_bounds() {
    let buffer = to_safetensors(&[
        RawTensor::u8("layer", &[2], &[0, 255]),
        RawTensor::f32("layer.min", &[], &[-0.5]),
        RawTensor::f32("layer.max", &[1], &[0.5]),
    ])
    .expect("serialize");
    let diffs = diff_dict_from_state(&parse_safetensors(&buffer).expect("parse")).expect("diffs");
    let layer = &diffs["layer"];
    assert_eq!((layer.min, layer.max), (-0.5, 0.5));
    assert_eq!(layer.dequantize().as_slice(), Some(&[-0.5f32, 0.5][..]));

    let missing = to_safetensors(&[RawTensor::u8("lonely", &[1], &[7])]).expect("serialize");
    let err = diff_dict_from_state(&parse_safetensors(&missing).expect("parse")).expect_err("bounds");
    assert!(matches!(err, InpaintError::Format(_)));
}

#[test]
fn missing_model_file_is_a_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = resolve_model_path(dir.path(), "absent.safetensors").expect_err("missing");
    assert!(matches!(err, InpaintError::Configuration(_)));
}

#[test]
fn script_checkpoint_without_reader_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("big-lama.pt");
    std::fs::write(&path, b"not a zip").expect("write");
    let err = read_checkpoint(&path, None).expect_err("no reader");
    assert!(matches!(err, InpaintError::Configuration(_)));
}

#[test]
fn identity_network_changes_only_masked_pixels() {
    let model = InpaintModel::new(ModelArch::Lama, Arc::new(Identity));
    let image = picture(1, 30, 47);
    let mask = MaskBatch::from_shape_fn((1, 30, 47), |(_, y, _)| if y < 15 { 1.0 } else { 0.0 });

    let out = inpaint_with_model(&model, &image, &mask, 0, None, &TelemetrySink::default())
        .expect("inpaint");

    let bundle = resize_to_square(&to_nchw(image.view()), &mask_to_nchw(&mask), 256)
        .expect("normalise");
    let resampled = to_nhwc(
        undo_resize_square(&bundle.image, &bundle.layout)
            .expect("restore")
            .view(),
    );

    assert_eq!(out.dim(), image.dim());
    for ((b, y, x, c), value) in out.indexed_iter() {
        if y < 15 {
            let want = resampled[[b, y, x, c]];
            assert!((value - want).abs() < 1e-5, "masked pixel {y},{x},{c}: {value} vs {want}");
        } else {
            assert_eq!(*value, image[[b, y, x, c]], "kept pixel {y},{x},{c}");
        }
    }
}

#[test]
fn unknown_architecture_fails_before_work() {
    let model = InpaintModel::new(ModelArch::Other("ESRGAN".into()), Arc::new(Identity));
    let telemetry = TelemetrySink::default();
    let err = inpaint_with_model(
        &model,
        &picture(1, 4, 4),
        &MaskBatch::ones((1, 4, 4)),
        0,
        None,
        &telemetry,
    )
    .expect_err("unknown arch");
    assert!(matches!(err, InpaintError::Configuration(_)));
    assert_eq!(telemetry.snapshot().stage("normalize"), 0);
}

#[test]
fn single_mask_is_broadcast() {
    let mut mask = MaskBatch::zeros((1, 2, 3));
    mask[[0, 1, 2]] = 1.0;
    let out = broadcast_mask(&mask, 3);
    assert_eq!(out.dim(), (3, 2, 3));
    assert!(out.outer_iter().all(|plane| plane == mask.index_axis(Axis(0), 0)));
}

#[test]
fn seed_reproduces_item_independent_of_batch_position() {
    let model = InpaintModel::new(ModelArch::Lama, Arc::new(Noise));
    let telemetry = TelemetrySink::default();
    let image = ImageBatch::from_elem((2, 20, 30, 3), 0.25);
    let mask = MaskBatch::ones((1, 20, 30));
    let out = inpaint_with_model(&model, &image, &mask, 42, None, &telemetry).expect("inpaint");
    assert_eq!(
        out.index_axis(Axis(0), 0),
        out.index_axis(Axis(0), 1),
        "same seed, same noise"
    );
    let again = inpaint_with_model(&model, &image, &mask, 42, None, &telemetry).expect("inpaint");
    assert_eq!(out, again);
    let other = inpaint_with_model(&model, &image, &mask, 7, None, &telemetry).expect("inpaint");
    assert_ne!(out, other);
}
