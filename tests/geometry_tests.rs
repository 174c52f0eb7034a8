use inpaint_nodes::{
    InpaintError,
    pipeline::geometry::{SquareLayout, resize_to_square, undo_resize_square},
};
use ndarray::{Array4, s};

fn gradient(h: usize, w: usize) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        ((y * 7 + x * 3 + c) % 97) as f32 / 97.0
    })
}

#[test]
fn layout_pads_symmetrically_with_odd_pixel_last() {
    let layout = SquareLayout::for_size(10, 15);
    assert_eq!(layout.side, 15);
    assert_eq!(layout.pad_top, 2);
    assert_eq!(layout.pad_bottom(), 3);
    assert_eq!(layout.pad_left, 0);
    assert_eq!(layout.pad_right(), 0);
}

#[test]
fn round_trip_restores_original_shape() {
    for (h, w) in [(37, 61), (64, 20), (256, 256), (1, 9), (300, 299)] {
        let image = gradient(h, w);
        let mask = Array4::<f32>::ones((1, 1, h, w));
        let bundle = resize_to_square(&image, &mask, 256).expect("normalise");
        assert_eq!(bundle.image.dim(), (1, 3, 256, 256));
        assert_eq!(bundle.mask.dim(), (1, 1, 256, 256));

        let restored = undo_resize_square(&bundle.image, &bundle.layout).expect("restore");
        assert_eq!(restored.dim(), (1, 3, h, w));
    }
}

#[test]
fn model_sized_square_round_trips_losslessly() {
    let image = gradient(256, 256);
    let mask = Array4::<f32>::zeros((1, 1, 256, 256));
    let bundle = resize_to_square(&image, &mask, 256).expect("normalise");
    assert_eq!(bundle.image, image);
    let restored = undo_resize_square(&bundle.image, &bundle.layout).expect("restore");
    assert_eq!(restored, image);
}

#[test]
fn mask_is_resampled_without_blending() {
    let image = gradient(40, 30);
    let mut mask = Array4::<f32>::zeros((1, 1, 40, 30));
    mask.slice_mut(s![.., .., 10..30, 5..25]).fill(1.0);
    let bundle = resize_to_square(&image, &mask, 512).expect("normalise");
    assert!(bundle.mask.iter().all(|&m| m == 0.0 || m == 1.0));
}

#[test]
fn unsupported_targets_are_rejected() {
    let image = gradient(8, 8);
    let mask = Array4::<f32>::zeros((1, 1, 8, 8));
    for target in [0, 16, 300] {
        let err = resize_to_square(&image, &mask, target).expect_err("unsupported target");
        assert!(matches!(err, InpaintError::InvalidSize(_)));
    }
}

#[test]
fn mismatched_mask_is_rejected() {
    let image = gradient(8, 8);
    let mask = Array4::<f32>::zeros((1, 1, 8, 9));
    let err = resize_to_square(&image, &mask, 256).expect_err("mask mismatch");
    assert!(matches!(err, InpaintError::InvalidSize(_)));
}

#[test]
fn restoring_requires_a_square_tensor() {
    let layout = SquareLayout::for_size(4, 6);
    let err = undo_resize_square(&Array4::zeros((1, 3, 4, 6)), &layout).expect_err("not square");
    assert!(matches!(err, InpaintError::InvalidSize(_)));
}
