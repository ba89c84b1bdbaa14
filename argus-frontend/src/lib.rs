//! Patch-based optical-flow tracker for a visual-inertial front end.
//!
//! Maintains a sparse population of keypoints with sub-pixel 2D affine
//! poses, tracks them frame to frame and across cameras with an
//! inverse-compositional SE(2) solver on an image pyramid, and publishes a
//! per-frame result to the estimator that consumes it.
//!
//! The runtime in [`runtime`] owns a single worker thread fed by bounded
//! input queues; the per-frame pipeline lives in [`flow`].

pub mod descriptor;
pub mod detector;
pub mod flow;
pub mod pattern;
pub mod patch;
pub mod runtime;
pub mod types;

pub use descriptor::{Descriptor, DescriptorExtractor};
pub use detector::{detect_grid, Corner, DetectionParams};
pub use flow::PatchFlow;
pub use pattern::Pattern;
pub use patch::Patch;
pub use runtime::FlowRuntime;
pub use types::{FrameInput, FrameResult, ImuSample, Keypoint, KeypointId, MaskRect};

/// Tracker instantiated for the usual scalar and sampling pattern.
pub type DefaultPatchFlow = flow::PatchFlow<f32, 52>;
/// Runtime instantiated for the usual scalar and sampling pattern.
pub type DefaultFlowRuntime = runtime::FlowRuntime<f32, 52>;
