//! Core foundations for the argus visual-inertial front end.
//!
//! This crate provides the pieces the tracker is built from: a scalar
//! abstraction so kernels can be instantiated for `f32` or `f64`, sub-pixel
//! access to 16-bit grayscale images, Gaussian image pyramids, the SE(2)
//! Lie group with a compact 2D affine transform, camera models with
//! multi-camera calibration, and the tracker configuration.

pub mod camera;
pub mod config;
pub mod image;
pub mod pyramid;
pub mod scalar;
pub mod se2;

pub use camera::{CameraCalib, PinholeCamera};
pub use config::{ConfigError, FlowConfig, FlowFeature, MatchingGuessType};
pub use image::Gray16Image;
pub use pyramid::ImagePyramid;
pub use scalar::FlowScalar;
pub use se2::{Affine2, SE2};
