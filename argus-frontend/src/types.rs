//! Data carried across the tracker's external boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{Vector2, Vector3};

use argus_core::image::Gray16Image;
use argus_core::scalar::FlowScalar;
use argus_core::se2::Affine2;

use crate::descriptor::Descriptor;

/// Identifier of a tracked keypoint, strictly increasing over the lifetime
/// of a tracker instance.
pub type KeypointId = u64;

/// One tracked keypoint observation in a camera.
#[derive(Debug, Clone)]
pub struct Keypoint<S> {
    /// Pose on the finest pyramid level: rotation-like linear part plus
    /// sub-pixel translation.
    pub pose: Affine2<S>,
    pub descriptor: Descriptor,
    /// `true` once the observation was produced by temporal tracking rather
    /// than first detection.
    pub detected_by_optical_flow: bool,
}

/// Axis-aligned rectangle masking out a region from detection.
#[derive(Debug, Clone, Copy)]
pub struct MaskRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl MaskRect {
    /// Whether this rectangle overlaps the half-open cell
    /// `[cx, cx + cw) x [cy, cy + ch)`.
    pub fn overlaps_cell(&self, cx: f32, cy: f32, cw: f32, ch: f32) -> bool {
        self.x < cx + cw && cx < self.x + self.width && self.y < cy + ch && cy < self.y + self.height
    }
}

/// One synchronized multi-camera frame entering the tracker.
///
/// A missing image slot causes the whole frame to be dropped silently.
#[derive(Debug)]
pub struct FrameInput {
    pub t_ns: i64,
    /// One slot per camera.
    pub images: Vec<Option<Gray16Image>>,
    /// Detection masks per camera; may be shorter than `images`.
    pub masks: Vec<Vec<MaskRect>>,
}

impl FrameInput {
    pub fn new(t_ns: i64, images: Vec<Option<Gray16Image>>) -> Self {
        let n = images.len();
        Self {
            t_ns,
            images,
            masks: vec![Vec::new(); n],
        }
    }
}

/// Inertial sample forwarded to the estimator unchanged.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub t_ns: i64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

/// Per-frame tracker output.
#[derive(Debug)]
pub struct FrameResult<S> {
    pub t_ns: i64,
    /// Tracked keypoints, one map per camera.
    pub keypoints: Vec<HashMap<KeypointId, Keypoint<S>>>,
    /// The frames this result was computed from.
    pub input: Arc<FrameInput>,
    /// Scene-depth prior in effect while this frame was processed.
    pub depth_guess: f64,
    /// Initial temporal-tracking guesses per camera, when enabled.
    pub tracking_guesses: Option<Vec<HashMap<KeypointId, Vector2<S>>>>,
    /// Initial cross-camera matching guesses per camera, when enabled.
    pub matching_guesses: Option<Vec<HashMap<KeypointId, Vector2<S>>>>,
}

impl<S: FlowScalar> FrameResult<S> {
    /// Number of keypoints currently tracked in camera `cam`.
    pub fn num_tracked(&self, cam: usize) -> usize {
        self.keypoints.get(cam).map_or(0, HashMap::len)
    }
}
