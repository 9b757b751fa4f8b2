// Integration tests for the detector: the end-to-end bright-patch
// scenario, resolution clamping, and coordinate mapping through the
// resolution pyramid.

use marten_core::Tensor;
use marten_detect::{Detector, ResolutionPolicy};
use marten_nn::{Identity, Module, Parameter, State, Table};

/// 10x10 single-channel image, all zeros except a 2x2 patch of 1.0 with
/// its top-left corner at (patch_h, patch_w).
fn bright_patch_image(patch_h: usize, patch_w: usize) -> Tensor<f64> {
    let mut data = vec![0.0f64; 100];
    for di in 0..2 {
        for dj in 0..2 {
            data[(patch_h + di) * 10 + (patch_w + dj)] = 1.0;
        }
    }
    Tensor::from_slice(&data, (1, 10, 10)).unwrap()
}

#[test]
fn test_identity_net_finds_single_bright_patch() {
    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(1),
    );
    let image = bright_patch_image(3, 4);
    let boxes = det.fprop(&image, 0.5).unwrap();

    assert_eq!(boxes.len(), 1, "expected exactly one detection: {:?}", boxes);
    let b = &boxes[0];
    assert_eq!(b.class_id, 0);
    assert!(b.confidence > 0.5);
    assert_eq!(b.scale_index, 0);
    // The box must overlap the 2x2 patch at rows 3..5, cols 4..6 in
    // original-image coordinates.
    assert!(b.h0 + b.height > 3.0 && b.h0 < 5.0, "bad rows: {:?}", b);
    assert!(b.w0 + b.width > 4.0 && b.w0 < 6.0, "bad cols: {:?}", b);
    // Output-map coordinates point at the top-left of the plateau.
    assert_eq!((b.oh0, b.ow0), (3, 4));
    assert_eq!((b.oheight, b.owidth), (10, 10));
}

#[test]
fn test_threshold_filters_everything() {
    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(1),
    );
    let image = bright_patch_image(3, 4);
    let boxes = det.fprop(&image, 1.5).unwrap();
    assert!(boxes.is_empty());
}

#[test]
fn test_resolution_count_clamped_without_crash() {
    // Conv 3x3 over a 6x6 image: feasible inputs span 3..6 pixels, so 100
    // requested resolutions must clamp to 2 (and must not crash).
    let mut p = Parameter::<f64>::new();
    let mut conv = marten_nn::Convolution::new(&mut p, 3, 3, 1, 1, Table::one2one(1)).unwrap();
    conv.kernel_mut().x.fill(1.0 / 9.0);

    let mut det = Detector::<f64>::new(
        Box::new(conv),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(100),
    );
    let image = Tensor::<f64>::from_slice(&vec![1.0; 36], (1, 6, 6)).unwrap();
    let boxes = det.fprop(&image, 0.5).unwrap();
    assert_eq!(det.resolutions().len(), 2);
    assert_eq!(det.resolutions()[0], (6, 6));
    assert_eq!(det.resolutions()[1], (3, 3));
    // A uniform bright image produces at least one above-threshold max
    // per resolution.
    assert!(!boxes.is_empty());
}

#[test]
fn test_min_equals_max_uses_single_resolution() {
    // Conv 3x3 over a 3x3 image: min == max, a single resolution.
    let mut p = Parameter::<f64>::new();
    let mut conv = marten_nn::Convolution::new(&mut p, 3, 3, 1, 1, Table::one2one(1)).unwrap();
    conv.kernel_mut().x.fill(1.0);

    let mut det = Detector::<f64>::new(
        Box::new(conv),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(5),
    );
    let image = Tensor::<f64>::from_slice(&vec![1.0; 9], (1, 3, 3)).unwrap();
    det.fprop(&image, 100.0).unwrap();
    assert_eq!(det.resolutions().len(), 1);
    assert_eq!(det.resolutions()[0], (3, 3));
}

#[test]
fn test_background_class_excluded() {
    // Two-channel identity: channel 1 is the background and must never
    // appear in results even where it fires.
    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["object".to_string(), "background".to_string()],
        ResolutionPolicy::NScales(1),
    );
    det.set_background_class("background");

    let mut data = vec![0.0f64; 2 * 16];
    data[5] = 1.0; // channel 0, row 1, col 1
    data[16 + 10] = 1.0; // channel 1, row 2, col 2
    let image = Tensor::from_slice(&data, (2, 4, 4)).unwrap();
    let boxes = det.fprop(&image, 0.5).unwrap();
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].class_id, 0);
}

#[test]
fn test_unknown_background_name_keeps_all_classes() {
    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["object".to_string()],
        ResolutionPolicy::NScales(1),
    );
    det.set_background_class("no-such-class");

    let image = bright_patch_image(2, 2);
    let boxes = det.fprop(&image, 0.5).unwrap();
    assert_eq!(boxes.len(), 1);
}

#[test]
fn test_reinit_on_dimension_change() {
    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(1),
    );
    let image = bright_patch_image(3, 4);
    det.fprop(&image, 0.5).unwrap();
    assert_eq!(det.resolutions(), &[(10, 10)]);

    // A different image size must retrigger init.
    let small = Tensor::<f64>::from_slice(&vec![0.0; 25], (1, 5, 5)).unwrap();
    det.fprop(&small, 0.5).unwrap();
    assert_eq!(det.resolutions(), &[(5, 5)]);
}

#[test]
fn test_detections_sorted_by_confidence() {
    // Two separated peaks of different heights; the stronger comes first.
    let mut data = vec![0.0f64; 100];
    data[10 + 1] = 0.7;
    data[7 * 10 + 7] = 0.9;
    let image = Tensor::from_slice(&data, (1, 10, 10)).unwrap();

    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(1),
    );
    let boxes = det.fprop(&image, 0.5).unwrap();
    assert_eq!(boxes.len(), 2);
    assert!(boxes[0].confidence > boxes[1].confidence);
    assert_eq!((boxes[0].oh0, boxes[0].ow0), (7, 7));
}

#[test]
fn test_cast_entry_point() {
    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(1),
    );
    let image32: Tensor<f32> = bright_patch_image(3, 4).cast().unwrap();
    let boxes = det.fprop_cast(&image32, 0.5).unwrap();
    assert_eq!(boxes.len(), 1);
}

#[test]
fn test_corner_maximum_with_clamped_window() {
    // A maximum in the very corner: the neighborhood window must shrink
    // at the border instead of wrapping or erroring.
    let mut data = vec![0.0f64; 100];
    data[0] = 1.0;
    let image = Tensor::from_slice(&data, (1, 10, 10)).unwrap();
    let mut det = Detector::<f64>::new(
        Box::new(Identity),
        vec!["blob".to_string()],
        ResolutionPolicy::NScales(1),
    );
    let boxes = det.fprop(&image, 0.5).unwrap();
    assert_eq!(boxes.len(), 1);
    assert_eq!((boxes[0].oh0, boxes[0].ow0), (0, 0));
    assert_eq!(boxes[0].h0, 0.0);
    assert_eq!(boxes[0].w0, 0.0);
}

#[test]
fn test_identity_state_passthrough_sanity() {
    // The detector relies on Module::fprop resizing the output state; a
    // bare Identity must do that for a forward-only state.
    let mut m = Identity;
    let mut input = State::<f64>::forward((1, 4, 4)).unwrap();
    input.x.fill(2.0);
    let mut output = State::forward((1, 1, 1)).unwrap();
    m.fprop(&input, &mut output).unwrap();
    assert_eq!(output.dims(), &[1, 4, 4]);
    assert_eq!(output.x.sum(), 32.0);
}
