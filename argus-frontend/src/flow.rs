//! Per-frame optical-flow pipeline.
//!
//! One [`PatchFlow`] owns the live keypoint set, the reference patches and
//! the current pyramids. Each frame it tracks existing keypoints into the
//! new pyramids (in parallel over keypoints), detects new candidates on
//! camera 0, matches them into the secondary cameras with the same solver,
//! filters stereo pairs on the epipolar constraint and assembles the
//! published result.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{Matrix3, SMatrix, Vector2, Vector3};
use rayon::prelude::*;
use tracing::{debug, trace};

use argus_core::camera::CameraCalib;
use argus_core::config::{ConfigError, FlowConfig, FlowFeature, MatchingGuessType};
use argus_core::image::{in_bounds, Gray16Image, FILTER_MARGIN};
use argus_core::pyramid::ImagePyramid;
use argus_core::scalar::FlowScalar;
use argus_core::se2::{Affine2, SE2};

use crate::descriptor::DescriptorExtractor;
use crate::detector::{detect_grid, DetectionParams};
use crate::patch::Patch;
use crate::pattern::Pattern;
use crate::types::{FrameInput, FrameResult, Keypoint, KeypointId, MaskRect};

/// Increments at or above this magnitude abort the solve.
const MAX_INCREMENT: f64 = 1e6;

/// Patch-based optical-flow tracker over `N`-point patches with scalar `S`.
pub struct PatchFlow<S, const N: usize> {
    config: FlowConfig,
    calib: CameraCalib<S>,
    pattern: Pattern<S, N>,
    extractor: DescriptorExtractor,

    /// Reference patches per keypoint, one per pyramid level, created at
    /// first detection and immutable afterwards.
    patches: HashMap<KeypointId, Vec<Patch<S, N>>>,
    /// Frame index each keypoint id was last present in the camera-0 map;
    /// only maintained when garbage collection is enabled.
    last_seen: HashMap<KeypointId, u64>,

    /// Currently tracked keypoints, one map per camera.
    keypoints: Vec<HashMap<KeypointId, Keypoint<S>>>,
    /// Pyramids of the current frame, one per camera; empty before the
    /// first frame.
    pyramids: Vec<ImagePyramid>,
    /// Essential matrix between camera 0 and camera i (index 0 unused).
    essentials: Vec<Matrix3<S>>,

    next_keypoint_id: KeypointId,
    frame_counter: u64,
    t_ns: i64,
    depth_guess: f64,
}

impl<S: FlowScalar, const N: usize> PatchFlow<S, N> {
    pub fn new(
        config: FlowConfig,
        calib: CameraCalib<S>,
        pattern: Pattern<S, N>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let n = calib.num_cams();
        let essentials = (0..n)
            .map(|i| {
                if i == 0 {
                    Matrix3::zeros()
                } else {
                    calib.essential(0, i)
                }
            })
            .collect();
        Ok(Self {
            depth_guess: config.matching_default_depth,
            config,
            calib,
            pattern,
            extractor: DescriptorExtractor::new(),
            patches: HashMap::new(),
            last_seen: HashMap::new(),
            keypoints: vec![HashMap::new(); n],
            pyramids: Vec::new(),
            essentials,
            next_keypoint_id: 0,
            frame_counter: 0,
            t_ns: 0,
        })
    }

    /// Latest scene-depth prior, fed from the depth input queue.
    pub fn set_depth_guess(&mut self, depth: f64) {
        self.depth_guess = depth;
    }

    /// Run the per-frame pipeline.
    ///
    /// Returns the assembled result when this frame is published under the
    /// skip-frames policy; the internal state advances either way. Frames
    /// with a missing image slot are ignored entirely.
    pub fn process_frame(&mut self, input: &Arc<FrameInput>) -> Option<Arc<FrameResult<S>>> {
        let n = self.calib.num_cams();
        if input.images.len() != n || input.images.iter().any(Option::is_none) {
            return None;
        }
        self.t_ns = input.t_ns;

        let new_pyramids: Vec<ImagePyramid> = input
            .images
            .iter()
            .flatten()
            .map(|img| ImagePyramid::new(img, self.config.levels))
            .collect();

        let mut tracking_guesses = self
            .config
            .feature_enabled(FlowFeature::TrackingGuesses)
            .then(|| vec![HashMap::new(); n]);
        let mut matching_guesses = self
            .config
            .feature_enabled(FlowFeature::MatchingGuesses)
            .then(|| vec![HashMap::new(); n]);

        if self.pyramids.is_empty() {
            self.pyramids = new_pyramids;
        } else {
            // Temporal tracking from the previous pyramids.
            let mut new_kps = Vec::with_capacity(n);
            for cam in 0..n {
                let (tracked, guesses) = self.track_points(
                    &self.pyramids[cam],
                    &new_pyramids[cam],
                    &self.keypoints[cam],
                    cam,
                    cam,
                    tracking_guesses.is_some(),
                );
                trace!(
                    cam,
                    tracked = tracked.len(),
                    previous = self.keypoints[cam].len(),
                    "temporal tracking"
                );
                if let (Some(out), Some(g)) = (tracking_guesses.as_mut(), guesses) {
                    out[cam] = g;
                }
                new_kps.push(tracked);
            }
            self.keypoints = new_kps;
            // The previous pyramids die exactly here.
            self.pyramids = new_pyramids;
        }

        self.add_points(&input.masks, matching_guesses.as_mut());
        self.filter_points();
        self.collect_garbage();

        debug!(
            t_ns = self.t_ns,
            frame = self.frame_counter,
            tracked_cam0 = self.keypoints[0].len(),
            "frame processed"
        );

        let published = if self.frame_counter % self.config.skip_frames == 0 {
            Some(Arc::new(FrameResult {
                t_ns: self.t_ns,
                keypoints: self.keypoints.clone(),
                input: input.clone(),
                depth_guess: self.depth_guess,
                tracking_guesses,
                matching_guesses,
            }))
        } else {
            None
        };
        self.frame_counter += 1;
        published
    }

    /// Track every keypoint of `map_src` from `pyr_src` into `pyr_dst`,
    /// in parallel. Used both for temporal tracking (`cam_src == cam_dst`)
    /// and cross-camera matching.
    fn track_points(
        &self,
        pyr_src: &ImagePyramid,
        pyr_dst: &ImagePyramid,
        map_src: &HashMap<KeypointId, Keypoint<S>>,
        cam_src: usize,
        cam_dst: usize,
        record_guesses: bool,
    ) -> (
        HashMap<KeypointId, Keypoint<S>>,
        Option<HashMap<KeypointId, Vector2<S>>>,
    ) {
        let matching = cam_src != cam_dst;
        let use_depth =
            matching && self.config.matching_guess_type != MatchingGuessType::SamePixel;
        let depth = <S as FlowScalar>::from_f64(match self.config.matching_guess_type {
            MatchingGuessType::ReprojAvgDepth => self.depth_guess,
            _ => self.config.matching_default_depth,
        });

        // Snapshot for stable parallel iteration over a live map.
        let ids: Vec<KeypointId> = map_src.keys().copied().collect();
        let init: Vec<Keypoint<S>> = ids.iter().map(|id| map_src[id].clone()).collect();

        let offset = |pose: &Affine2<S>| -> Option<Vector2<S>> {
            if use_depth {
                self.calib
                    .view_offset(&pose.translation, depth, cam_src, cam_dst)
            } else {
                Some(Vector2::zeros())
            }
        };

        let guesses = record_guesses.then(|| {
            ids.iter()
                .zip(init.iter())
                .filter_map(|(&id, kp)| {
                    offset(&kp.pose).map(|off| (id, kp.pose.translation - off))
                })
                .collect()
        });

        let (w, h) = pyr_dst.lvl(0).dimensions();
        let result: HashMap<KeypointId, Keypoint<S>> = ids
            .par_iter()
            .zip(init.par_iter())
            .filter_map(|(&id, kp)| {
                let off = offset(&kp.pose)?;

                let mut transform = kp.pose;
                transform.translation -= off;

                let t = &transform.translation;
                let inside = t[0] >= <S as FlowScalar>::from_f64(0.0)
                    && t[1] >= <S as FlowScalar>::from_f64(0.0)
                    && t[0] < <S as FlowScalar>::from_f64(w as f64)
                    && t[1] < <S as FlowScalar>::from_f64(h as f64);
                if !inside {
                    return None;
                }

                let patch_vec = self.patches.get(&id)?;
                if !track_point(pyr_dst, patch_vec, &self.pattern, &self.config, &mut transform)
                {
                    return None;
                }

                // Forward-backward check: re-add the offset and track back
                // into the source pyramid.
                let mut recovered = transform;
                recovered.translation += off;
                if !track_point(pyr_src, patch_vec, &self.pattern, &self.config, &mut recovered)
                {
                    return None;
                }

                let dist2 = (kp.pose.translation - recovered.translation).norm_squared();
                if dist2.to_f64() >= self.config.max_recovered_dist2 {
                    return None;
                }

                Some((
                    id,
                    Keypoint {
                        pose: transform,
                        descriptor: kp.descriptor,
                        detected_by_optical_flow: true,
                    },
                ))
            })
            .collect();

        (result, guesses)
    }

    /// Detect new corners on camera 0, create their reference patches and
    /// match them into the secondary cameras.
    fn add_points(
        &mut self,
        masks: &[Vec<MaskRect>],
        mut matching_guesses: Option<&mut Vec<HashMap<KeypointId, Vector2<S>>>>,
    ) {
        let existing: Vec<Vector2<f32>> = self.keypoints[0]
            .values()
            .map(|kp| {
                Vector2::new(
                    kp.pose.translation[0].to_f64() as f32,
                    kp.pose.translation[1].to_f64() as f32,
                )
            })
            .collect();

        let params = DetectionParams {
            grid_size: self.config.detection_grid_size,
            num_points_cell: self.config.detection_num_points_cell,
            min_threshold: self.config.detection_min_threshold,
            max_threshold: self.config.detection_max_threshold,
        };
        static NO_MASKS: &[MaskRect] = &[];
        let cam0_masks = masks.first().map_or(NO_MASKS, Vec::as_slice);
        let corners = detect_grid(self.pyramids[0].lvl(0), &params, cam0_masks, &existing);
        let descriptors = self
            .extractor
            .compute_all(self.pyramids[0].lvl(0), &corners);

        let mut new_kps0: HashMap<KeypointId, Keypoint<S>> = HashMap::new();
        for (corner, descriptor) in corners.iter().zip(descriptors) {
            let Some(descriptor) = descriptor else {
                continue;
            };
            let pos = Vector2::new(
                <S as FlowScalar>::from_f64(corner.pos[0] as f64),
                <S as FlowScalar>::from_f64(corner.pos[1] as f64),
            );

            let mut patch_vec = Vec::with_capacity(self.config.levels + 1);
            for level in 0..=self.config.levels {
                let scale = <S as FlowScalar>::from_f64((1u32 << level) as f64);
                let center = pos / scale;
                patch_vec.push(Patch::new(self.pyramids[0].lvl(level), &self.pattern, &center));
            }

            let id = self.next_keypoint_id;
            self.next_keypoint_id += 1;
            self.patches.insert(id, patch_vec);

            let kp = Keypoint {
                pose: Affine2::from_translation(pos),
                descriptor,
                detected_by_optical_flow: false,
            };
            self.keypoints[0].insert(id, kp.clone());
            new_kps0.insert(id, kp);
        }
        trace!(detected = new_kps0.len(), "new keypoints");

        // The same kernel handles cross-camera matching of the new points.
        for cam in 1..self.calib.num_cams() {
            let (matches, guesses) = self.track_points(
                &self.pyramids[0],
                &self.pyramids[cam],
                &new_kps0,
                0,
                cam,
                matching_guesses.is_some(),
            );
            if let (Some(out), Some(g)) = (matching_guesses.as_deref_mut(), guesses) {
                out[cam] = g;
            }
            self.keypoints[cam].extend(matches);
        }
    }

    /// Drop stereo observations that violate the epipolar constraint (or
    /// lost their camera-0 counterpart). Camera 0 keeps its keypoints for
    /// potential future matches.
    fn filter_points(&mut self) {
        for cam in 1..self.calib.num_cams() {
            let essential = &self.essentials[cam];
            let mut to_remove: Vec<KeypointId> = Vec::new();

            for (id, kp) in &self.keypoints[cam] {
                let Some(kp0) = self.keypoints[0].get(id) else {
                    to_remove.push(*id);
                    continue;
                };
                let r0 = self.calib.intrinsics[0].unproject(&kp0.pose.translation);
                let r1 = self.calib.intrinsics[cam].unproject(&kp.pose.translation);
                match (r0, r1) {
                    (Some(r0), Some(r1)) => {
                        let residual = r0.dot(&(essential * r1)).abs_val();
                        if residual.to_f64() > self.config.epipolar_error {
                            to_remove.push(*id);
                        }
                    }
                    _ => to_remove.push(*id),
                }
            }

            if !to_remove.is_empty() {
                trace!(cam, removed = to_remove.len(), "epipolar filter");
            }
            for id in to_remove {
                self.keypoints[cam].remove(&id);
            }
        }
    }

    /// Erase reference patches of keypoints that have been gone from the
    /// camera-0 map for longer than the configured horizon.
    fn collect_garbage(&mut self) {
        let Some(horizon) = self.config.patch_gc_frames else {
            return;
        };
        let frame = self.frame_counter;
        for id in self.keypoints[0].keys() {
            self.last_seen.insert(*id, frame);
        }
        let last_seen = &self.last_seen;
        self.patches
            .retain(|id, _| frame.saturating_sub(last_seen.get(id).copied().unwrap_or(0)) <= horizon);
        self.last_seen
            .retain(|_, seen| frame.saturating_sub(*seen) <= horizon);
    }

    /// Number of reference patch entries currently stored.
    pub fn num_patch_entries(&self) -> usize {
        self.patches.len()
    }
}

/// Coarse-to-fine inverse-compositional alignment of one keypoint against a
/// target pyramid. `transform` is updated in place; `false` means the track
/// was lost.
pub fn track_point<S: FlowScalar, const N: usize>(
    pyr: &ImagePyramid,
    patch_vec: &[Patch<S, N>],
    pattern: &Pattern<S, N>,
    config: &FlowConfig,
    transform: &mut Affine2<S>,
) -> bool {
    let mut valid = true;
    for level in (0..patch_vec.len()).rev() {
        let scale = <S as FlowScalar>::from_f64((1u64 << level) as f64);
        transform.translation /= scale;

        let patch = &patch_vec[level];
        valid &= patch.valid;
        if valid {
            valid &= track_point_at_level(
                pyr.lvl(level),
                patch,
                pattern,
                config.max_iterations,
                transform,
            );
        }

        transform.translation *= scale;
        if !valid {
            break;
        }
    }
    valid
}

/// Inverse-compositional iterations of one patch on one pyramid level.
fn track_point_at_level<S: FlowScalar, const N: usize>(
    img: &Gray16Image,
    patch: &Patch<S, N>,
    pattern: &Pattern<S, N>,
    max_iterations: usize,
    transform: &mut Affine2<S>,
) -> bool {
    for _ in 0..max_iterations {
        let l = &transform.linear;
        let t = &transform.translation;
        let sites = SMatrix::<S, 2, N>::from_fn(|r, c| {
            l[(r, 0)] * pattern.offsets[(0, c)] + l[(r, 1)] * pattern.offsets[(1, c)] + t[r]
        });

        let Some(residual) = patch.residual(img, &sites) else {
            return false;
        };

        let inc: Vector3<S> = -(patch.h_inv_j_t * residual);
        let mut max_abs = <S as FlowScalar>::from_f64(0.0);
        for k in 0..3 {
            if !inc[k].is_finite_val() {
                return false;
            }
            let a = inc[k].abs_val();
            if a > max_abs {
                max_abs = a;
            }
        }
        if max_abs >= <S as FlowScalar>::from_f64(MAX_INCREMENT) {
            return false;
        }

        *transform = *transform * SE2::exp(&inc);

        if !in_bounds(
            img,
            transform.translation[0],
            transform.translation[1],
            FILTER_MARGIN,
        ) {
            return false;
        }
    }
    true
}
