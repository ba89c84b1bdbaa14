//! Camera models and multi-camera calibration.
//!
//! The tracker only needs pinhole intrinsics (project / unproject to a unit
//! ray) and the rigid extrinsics of each camera with respect to the IMU
//! frame, from which it derives essential matrices for epipolar filtering
//! and the cross-camera reprojection offset used as a matching prior.

use nalgebra::{Isometry3, Matrix3, Point3, Vector2, Vector3};

use crate::config::ConfigError;
use crate::scalar::FlowScalar;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy)]
pub struct PinholeCamera<S> {
    pub fx: S,
    pub fy: S,
    pub cx: S,
    pub cy: S,
}

impl<S: FlowScalar> PinholeCamera<S> {
    pub fn new(fx: S, fy: S, cx: S, cy: S) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Project a 3D point in the camera frame to pixel coordinates.
    ///
    /// Fails for points at or behind the image plane.
    pub fn project(&self, p: &Vector3<S>) -> Option<Vector2<S>> {
        if p[2] <= <S as FlowScalar>::from_f64(1e-9) {
            return None;
        }
        let inv_z = <S as FlowScalar>::from_f64(1.0) / p[2];
        Some(Vector2::new(
            self.fx * p[0] * inv_z + self.cx,
            self.fy * p[1] * inv_z + self.cy,
        ))
    }

    /// Unproject a pixel to a unit-norm bearing ray in the camera frame.
    pub fn unproject(&self, px: &Vector2<S>) -> Option<Vector3<S>> {
        let x = (px[0] - self.cx) / self.fx;
        let y = (px[1] - self.cy) / self.fy;
        let norm = (x * x + y * y + <S as FlowScalar>::from_f64(1.0)).sqrt_val();
        if !norm.is_finite_val() {
            return None;
        }
        Some(Vector3::new(x / norm, y / norm, <S as FlowScalar>::from_f64(1.0) / norm))
    }
}

/// Calibration of a synchronized multi-camera rig.
///
/// `t_imu_cam[i]` maps points in camera `i` coordinates into the IMU frame.
#[derive(Debug, Clone)]
pub struct CameraCalib<S> {
    pub intrinsics: Vec<PinholeCamera<S>>,
    pub t_imu_cam: Vec<Isometry3<S>>,
}

impl<S: FlowScalar> CameraCalib<S> {
    pub fn new(
        intrinsics: Vec<PinholeCamera<S>>,
        t_imu_cam: Vec<Isometry3<S>>,
    ) -> Result<Self, ConfigError> {
        if intrinsics.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        if intrinsics.len() != t_imu_cam.len() {
            return Err(ConfigError::CalibrationMismatch {
                intrinsics: intrinsics.len(),
                extrinsics: t_imu_cam.len(),
            });
        }
        Ok(Self {
            intrinsics,
            t_imu_cam,
        })
    }

    pub fn num_cams(&self) -> usize {
        self.intrinsics.len()
    }

    /// Transform mapping points in camera `j` coordinates into camera `i`.
    fn t_cam_cam(&self, i: usize, j: usize) -> Isometry3<S> {
        self.t_imu_cam[i].inverse() * self.t_imu_cam[j]
    }

    /// Essential matrix between cameras `i` and `j`: for corresponding unit
    /// rays, `r_i^T * E * r_j == 0`.
    pub fn essential(&self, i: usize, j: usize) -> Matrix3<S> {
        let t = self.t_cam_cam(i, j);
        let tv = t.translation.vector;
        let norm = (tv[0] * tv[0] + tv[1] * tv[1] + tv[2] * tv[2]).sqrt_val();
        let tn = tv / norm;
        let r = t.rotation.to_rotation_matrix().into_inner();
        skew(&tn) * r
    }

    /// Predicted pixel offset `t - proj_to(T_to_from * depth * ray_from(t))`
    /// of a point seen at `t` in camera `from` when re-observed by camera
    /// `to` under a scene-depth prior.
    pub fn view_offset(
        &self,
        t: &Vector2<S>,
        depth: S,
        from: usize,
        to: usize,
    ) -> Option<Vector2<S>> {
        let ray = self.intrinsics[from].unproject(t)?;
        let p_from = Point3::from(ray * depth);
        let p_to = self.t_cam_cam(to, from) * p_from;
        let reprojected = self.intrinsics[to].project(&p_to.coords)?;
        Some(t - reprojected)
    }
}

fn skew<S: FlowScalar>(v: &Vector3<S>) -> Matrix3<S> {
    let z = <S as FlowScalar>::from_f64(0.0);
    Matrix3::new(z, -v[2], v[1], v[2], z, -v[0], -v[1], v[0], z)
}
