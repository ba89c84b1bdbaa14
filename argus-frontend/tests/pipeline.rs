//! End-to-end scenarios for the tracker runtime: detection and tracking on
//! synthetic sequences, stereo matching, epipolar filtering, skip-frames
//! and shutdown behaviour.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use argus_core::camera::{CameraCalib, PinholeCamera};
use argus_core::config::FlowConfig;
use argus_core::image::Gray16Image;
use argus_frontend::pattern::Pattern;
use argus_frontend::runtime::FlowRuntime;
use argus_frontend::types::{FrameInput, FrameResult, ImuSample, KeypointId};

const W: u32 = 640;
const H: u32 = 480;

/// Dark background with a grid of bright squares. Corners land well inside
/// the image so reference patches are valid on every pyramid level.
fn square_grid_image(shift_x: i64) -> Gray16Image {
    let mut img = Gray16Image::from_pixel(W, H, image::Luma([12 << 8]));
    for j in 0..5i64 {
        for i in 0..6i64 {
            let x0 = 96 + 64 * i + shift_x;
            let y0 = 96 + 64 * j;
            for y in y0..y0 + 28 {
                for x in x0..x0 + 28 {
                    if x >= 0 && y >= 0 && (x as u32) < W && (y as u32) < H {
                        img.put_pixel(x as u32, y as u32, image::Luma([210 << 8]));
                    }
                }
            }
        }
    }
    img
}

fn test_config() -> FlowConfig {
    FlowConfig {
        levels: 3,
        max_iterations: 8,
        max_recovered_dist2: 0.04,
        detection_grid_size: 32,
        detection_num_points_cell: 2,
        detection_min_threshold: 10,
        detection_max_threshold: 40,
        ..FlowConfig::default()
    }
}

fn pinhole() -> PinholeCamera<f32> {
    PinholeCamera::new(300.0, 300.0, W as f32 / 2.0, H as f32 / 2.0)
}

fn mono_calib() -> CameraCalib<f32> {
    CameraCalib::new(vec![pinhole()], vec![Isometry3::identity()]).unwrap()
}

fn stereo_calib() -> CameraCalib<f32> {
    CameraCalib::new(
        vec![pinhole(), pinhole()],
        vec![
            Isometry3::identity(),
            Isometry3::from_parts(
                Translation3::new(0.11, 0.0, 0.0),
                UnitQuaternion::identity(),
            ),
        ],
    )
    .unwrap()
}

/// Stereo rig whose right camera is twisted so that every same-pixel match
/// violates the epipolar constraint.
fn twisted_stereo_calib() -> CameraCalib<f32> {
    CameraCalib::new(
        vec![pinhole(), pinhole()],
        vec![
            Isometry3::identity(),
            Isometry3::from_parts(
                Translation3::new(0.11, 0.0, 0.0),
                UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.5),
            ),
        ],
    )
    .unwrap()
}

fn spawn(config: FlowConfig, calib: CameraCalib<f32>) -> FlowRuntime<f32, 52> {
    FlowRuntime::spawn(config, calib, Pattern::rosette52()).unwrap()
}

fn mono_frame(t_ns: i64, img: Gray16Image) -> FrameInput {
    FrameInput::new(t_ns, vec![Some(img)])
}

fn stereo_frame(t_ns: i64, left: Gray16Image, right: Gray16Image) -> FrameInput {
    FrameInput::new(t_ns, vec![Some(left), Some(right)])
}

fn translation(result: &FrameResult<f32>, cam: usize, id: KeypointId) -> Option<(f32, f32)> {
    result.keypoints[cam]
        .get(&id)
        .map(|kp| (kp.pose.translation[0], kp.pose.translation[1]))
}

#[test]
fn mono_zero_motion_preserves_points() {
    let runtime = spawn(test_config(), mono_calib());
    let output = runtime.output();

    for k in 0..10 {
        runtime.push_frame(mono_frame(k as i64 * 1_000_000, square_grid_image(0)));
    }
    runtime.push_null_frame();

    let mut results = Vec::new();
    while let Ok(Some(result)) = output.recv() {
        results.push(result);
    }
    assert_eq!(results.len(), 10);

    let first = &results[0];
    assert!(
        first.num_tracked(0) >= 20,
        "expected a populated first frame, got {}",
        first.num_tracked(0)
    );
    assert!(first.keypoints[0]
        .values()
        .all(|kp| !kp.detected_by_optical_flow));

    let initial: HashMap<KeypointId, (f32, f32)> = first.keypoints[0]
        .iter()
        .map(|(id, kp)| (*id, (kp.pose.translation[0], kp.pose.translation[1])))
        .collect();

    for result in &results[1..] {
        let survivors = initial
            .keys()
            .filter(|id| result.keypoints[0].contains_key(id))
            .count();
        assert!(
            survivors as f64 >= 0.95 * initial.len() as f64,
            "only {}/{} initial points survive at t={}",
            survivors,
            initial.len(),
            result.t_ns
        );

        for (id, &(x0, y0)) in &initial {
            if let Some((x, y)) = translation(result, 0, *id) {
                assert!(
                    (x - x0).abs() < 0.1 && (y - y0).abs() < 0.1,
                    "point {} drifted from ({}, {}) to ({}, {})",
                    id,
                    x0,
                    y0,
                    x,
                    y
                );
                // Survivors of the first frame were produced by tracking.
                assert!(result.keypoints[0][id].detected_by_optical_flow);
            }
        }
    }
}

#[test]
fn mono_pure_translation_tracks_motion() {
    let runtime = spawn(test_config(), mono_calib());
    let output = runtime.output();

    for k in 0..10i64 {
        runtime.push_frame(mono_frame(k * 1_000_000, square_grid_image(3 * k)));
    }
    runtime.push_null_frame();

    let mut results = Vec::new();
    while let Ok(Some(result)) = output.recv() {
        results.push(result);
    }
    assert_eq!(results.len(), 10);

    let mut checked = 0;
    for pair in results.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        for (id, kp) in &prev.keypoints[0] {
            let (x_prev, _) = (kp.pose.translation[0], kp.pose.translation[1]);
            if let Some((x_next, _)) = translation(next, 0, *id) {
                let delta = x_next - x_prev;
                assert!(
                    (2.8..=3.2).contains(&delta),
                    "frame-to-frame delta {} out of range for point {}",
                    delta,
                    id
                );
                assert!(x_next > x_prev, "x must increase monotonically");
                checked += 1;
            }
        }
    }
    assert!(checked > 50, "too few surviving tracks checked: {}", checked);

    // Keypoint ids never reset: ids of later detections keep increasing.
    let mut max_seen: KeypointId = 0;
    for result in &results {
        for (id, kp) in &result.keypoints[0] {
            if !kp.detected_by_optical_flow {
                assert!(*id >= max_seen, "fresh id {} below prior maximum", id);
            }
        }
        let frame_max = result.keypoints[0].keys().copied().max().unwrap_or(0);
        assert!(frame_max >= max_seen);
        max_seen = frame_max;
    }
}

#[test]
fn stereo_same_pixel_matches_identically() {
    let runtime = spawn(test_config(), stereo_calib());
    let output = runtime.output();

    for k in 0..2i64 {
        let img = square_grid_image(0);
        runtime.push_frame(stereo_frame(k * 1_000_000, img.clone(), img));
    }
    runtime.push_null_frame();

    let mut results = Vec::new();
    while let Ok(Some(result)) = output.recv() {
        results.push(result);
    }
    assert_eq!(results.len(), 2);

    for result in &results {
        assert!(result.num_tracked(0) >= 20);
        // Identical images with a same-pixel guess: every camera-0 point has
        // a camera-1 twin at the same coordinates, and the epipolar filter
        // keeps all of them.
        assert_eq!(result.num_tracked(1), result.num_tracked(0));
        for (id, kp0) in &result.keypoints[0] {
            let (x1, y1) = translation(result, 1, *id).expect("missing stereo match");
            assert!((kp0.pose.translation[0] - x1).abs() < 1e-3);
            assert!((kp0.pose.translation[1] - y1).abs() < 1e-3);
        }
    }
}

#[test]
fn stereo_epipolar_violation_empties_second_camera() {
    let runtime = spawn(test_config(), twisted_stereo_calib());
    let output = runtime.output();

    let img = square_grid_image(0);
    runtime.push_frame(stereo_frame(0, img.clone(), img));
    runtime.push_null_frame();

    let result = output.recv().unwrap().expect("one result expected");
    assert!(result.num_tracked(0) >= 20, "camera 0 must keep its points");
    assert_eq!(
        result.num_tracked(1),
        0,
        "every stereo match violates the twisted epipolar geometry"
    );
    assert!(output.recv().unwrap().is_none());
}

#[test]
fn missing_image_slot_is_a_no_op() {
    let runtime = spawn(test_config(), stereo_calib());
    let output = runtime.output();

    let img = square_grid_image(0);
    runtime.push_frame(stereo_frame(0, img.clone(), img.clone()));
    // Broken frame: right image missing. Must not disturb state or output.
    runtime.push_frame(FrameInput::new(1_000_000, vec![Some(img.clone()), None]));
    runtime.push_frame(stereo_frame(2_000_000, img.clone(), img));
    runtime.push_null_frame();

    let mut results = Vec::new();
    while let Ok(Some(result)) = output.recv() {
        results.push(result);
    }
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].t_ns, 0);
    assert_eq!(results[1].t_ns, 2_000_000);

    // Tracking carried straight over the dropped frame.
    let survivors = results[0]
        .keypoints[0]
        .keys()
        .filter(|id| results[1].keypoints[0].contains_key(id))
        .count();
    assert!(survivors as f64 >= 0.95 * results[0].num_tracked(0) as f64);
}

#[test]
fn outputs_preserve_input_order() {
    let runtime = spawn(test_config(), mono_calib());
    let output = runtime.output();

    for k in 0..6i64 {
        runtime.push_frame(mono_frame(k * 500_000, square_grid_image(0)));
    }
    runtime.push_null_frame();

    let mut prev = i64::MIN;
    let mut count = 0;
    while let Ok(Some(result)) = output.recv() {
        assert!(result.t_ns > prev, "outputs out of order");
        prev = result.t_ns;
        count += 1;
    }
    assert_eq!(count, 6);
}

#[test]
fn shutdown_propagates_single_null() {
    let runtime = spawn(test_config(), mono_calib());
    let output = runtime.output();

    for k in 0..5i64 {
        runtime.push_frame(mono_frame(k, square_grid_image(0)));
    }
    runtime.push_null_frame();

    for _ in 0..5 {
        assert!(output.recv().unwrap().is_some());
    }
    assert!(output.recv().unwrap().is_none());
    // The worker exits after the sentinel; dropping the runtime joins it and
    // the output channel disconnects without another null.
    drop(runtime);
    assert!(output.recv().is_err());
}

#[test]
fn skip_frames_publishes_every_third() {
    let mut config = test_config();
    config.skip_frames = 3;
    let runtime = spawn(config, mono_calib());
    let output = runtime.output();

    for k in 0..10i64 {
        runtime.push_frame(mono_frame(k, square_grid_image(0)));
    }
    runtime.push_null_frame();

    let mut timestamps = Vec::new();
    while let Ok(Some(result)) = output.recv() {
        timestamps.push(result.t_ns);
    }
    assert_eq!(timestamps, vec![0, 3, 6, 9]);
}

#[test]
fn imu_samples_pass_through_untouched() {
    let runtime = spawn(test_config(), mono_calib());
    let imu = runtime.imu_output();

    for k in 0..4i64 {
        runtime.push_imu_sample(ImuSample {
            t_ns: k,
            accel: Vector3::new(0.0, 0.0, 9.81),
            gyro: Vector3::new(0.01, 0.0, 0.0),
        });
    }

    for k in 0..4i64 {
        let sample = imu.recv().unwrap().unwrap();
        assert_eq!(sample.t_ns, k);
        assert_eq!(sample.accel[2], 9.81);
    }
    runtime.push_null_frame();
}

#[test]
fn depth_updates_do_not_disturb_same_pixel_matching() {
    let runtime = spawn(test_config(), stereo_calib());
    let output = runtime.output();

    let img = square_grid_image(0);
    runtime.push_depth(4.5);
    runtime.push_frame(stereo_frame(0, img.clone(), img.clone()));
    // The drained prior is guaranteed to be in effect from the next frame on.
    runtime.push_frame(stereo_frame(1_000_000, img.clone(), img));
    runtime.push_null_frame();

    let first = output.recv().unwrap().expect("first result expected");
    let second = output.recv().unwrap().expect("second result expected");
    // The prior is recorded on the result even when the guess type ignores it.
    assert_eq!(second.depth_guess, 4.5);
    assert_eq!(first.num_tracked(1), first.num_tracked(0));
    assert_eq!(second.num_tracked(1), second.num_tracked(0));
}

/// Squares confined to the left border band: their corners are detected on
/// the finest level but the coarse reference patches violate the sampling
/// margin, so every track dies on the next frame and fresh ids take over.
fn border_band_image() -> Gray16Image {
    let mut img = Gray16Image::from_pixel(W, H, image::Luma([12 << 8]));
    for j in 0..4u32 {
        let y0 = 96 + 64 * j;
        for y in y0..y0 + 28 {
            for x in 24..52u32 {
                img.put_pixel(x, y, image::Luma([210 << 8]));
            }
        }
    }
    img
}

fn churn_patch_entries(gc: Option<u64>) -> (usize, u64) {
    use argus_frontend::flow::PatchFlow;

    let mut config = test_config();
    config.patch_gc_frames = gc;
    let mut flow: PatchFlow<f32, 52> =
        PatchFlow::new(config, mono_calib(), Pattern::rosette52()).unwrap();

    let mut ids_issued = 0;
    for k in 0..8i64 {
        let input = Arc::new(mono_frame(k, border_band_image()));
        let result = flow.process_frame(&input).expect("published every frame");
        let frame_max = result.keypoints[0].keys().copied().max();
        if let Some(m) = frame_max {
            ids_issued = ids_issued.max(m + 1);
        }
        // Nothing survives tracking; every frame starts from scratch.
        assert!(result.keypoints[0]
            .values()
            .all(|kp| !kp.detected_by_optical_flow));
    }
    (flow.num_patch_entries(), ids_issued)
}

#[test]
fn patch_store_grows_without_gc_and_shrinks_with_it() {
    let (entries_unbounded, issued) = churn_patch_entries(None);
    assert!(issued > 8, "test scene must keep issuing fresh ids");
    assert_eq!(
        entries_unbounded, issued as usize,
        "reference behaviour keeps every patch ever created"
    );

    let (entries_gc, issued_gc) = churn_patch_entries(Some(1));
    assert_eq!(issued, issued_gc, "gc must not change tracking behaviour");
    assert!(
        entries_gc < entries_unbounded,
        "gc horizon must erase patches of long-gone keypoints"
    );
}

/// Arc to the originating input is carried on every result.
#[test]
fn result_references_input_frame() {
    let runtime = spawn(test_config(), mono_calib());
    let output = runtime.output();

    runtime.push_frame(mono_frame(77, square_grid_image(0)));
    runtime.push_null_frame();

    let result = output.recv().unwrap().unwrap();
    assert_eq!(result.input.t_ns, 77);
    assert!(Arc::strong_count(&result.input) >= 1);
}
