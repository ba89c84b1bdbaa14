//! Reference patch of a keypoint on one pyramid level.
//!
//! A patch stores the mean-normalised intensities sampled at the pattern
//! around the keypoint, together with the pseudo-inverse `(J^T J)^-1 J^T`
//! of the Jacobian of those intensities with respect to an SE(2) increment.
//! Patches are built once, when the keypoint is first detected, and never
//! modified afterwards.

use nalgebra::{Matrix3, SMatrix, SVector, Vector2};

use argus_core::image::{in_bounds, interp, interp_grad, Gray16Image, FILTER_MARGIN};
use argus_core::scalar::FlowScalar;

use crate::pattern::Pattern;

/// Immutable reference patch: normalised values plus the precomputed solver
/// matrices for one pyramid level.
#[derive(Debug, Clone)]
pub struct Patch<S, const N: usize> {
    /// Whether construction succeeded; invalid patches are skipped by the
    /// tracker.
    pub valid: bool,
    /// Mean raw intensity at the sample sites.
    pub mean: S,
    /// Intensities at the pattern sites, divided by `mean`.
    pub values: SVector<S, N>,
    /// `(J^T J)^-1 J^T` for the SE(2) increment `(vx, vy, omega)`.
    pub h_inv_j_t: SMatrix<S, 3, N>,
}

impl<S: FlowScalar, const N: usize> Patch<S, N> {
    fn invalid() -> Self {
        Self {
            valid: false,
            mean: <S as FlowScalar>::from_f64(0.0),
            values: SVector::zeros(),
            h_inv_j_t: SMatrix::zeros(),
        }
    }

    /// Build the reference patch at sub-pixel `center` on one pyramid level.
    ///
    /// Construction fails (yielding `valid == false`) when any sample site
    /// violates the sampling margin, when the mean intensity is degenerate,
    /// or when the Gauss-Newton Hessian is singular.
    pub fn new(img: &Gray16Image, pattern: &Pattern<S, N>, center: &Vector2<S>) -> Self {
        let mut raw = SVector::<S, N>::zeros();
        let mut grad = SMatrix::<S, 2, N>::zeros();
        let mut sum = <S as FlowScalar>::from_f64(0.0);

        for i in 0..N {
            let x = center[0] + pattern.offsets[(0, i)];
            let y = center[1] + pattern.offsets[(1, i)];
            if !in_bounds(img, x, y, FILTER_MARGIN) {
                return Self::invalid();
            }
            let (v, gx, gy) = interp_grad(img, x, y);
            raw[i] = v;
            grad[(0, i)] = gx;
            grad[(1, i)] = gy;
            sum += v;
        }

        let mean = sum / <S as FlowScalar>::from_f64(N as f64);
        if !mean.is_finite_val() || mean < <S as FlowScalar>::from_f64(1e-9) {
            return Self::invalid();
        }

        let mean_inv = <S as FlowScalar>::from_f64(1.0) / mean;
        let mut values = SVector::<S, N>::zeros();
        let mut j = SMatrix::<S, N, 3>::zeros();
        for i in 0..N {
            values[i] = raw[i] * mean_inv;
            let gx = grad[(0, i)] * mean_inv;
            let gy = grad[(1, i)] * mean_inv;
            // Jacobian row through the SE(2) generator at this offset.
            j[(i, 0)] = gx;
            j[(i, 1)] = gy;
            j[(i, 2)] = -gx * pattern.offsets[(1, i)] + gy * pattern.offsets[(0, i)];
        }

        let h: Matrix3<S> = j.tr_mul(&j);
        let Some(h_inv) = h.try_inverse() else {
            return Self::invalid();
        };

        Self {
            valid: true,
            mean,
            values,
            h_inv_j_t: h_inv * j.transpose(),
        }
    }

    /// Residual of the target image at `sites` (one column per pattern
    /// point) against the stored reference values.
    ///
    /// `None` when any site violates the sampling margin of the target.
    pub fn residual(
        &self,
        img: &Gray16Image,
        sites: &SMatrix<S, 2, N>,
    ) -> Option<SVector<S, N>> {
        let mut res = SVector::<S, N>::zeros();
        for i in 0..N {
            let x = sites[(0, i)];
            let y = sites[(1, i)];
            if !in_bounds(img, x, y, FILTER_MARGIN) {
                return None;
            }
            res[i] = interp(img, x, y) / self.mean - self.values[i];
        }
        Some(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured_image(w: u32, h: u32) -> Gray16Image {
        let mut img = Gray16Image::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let v = 2000.0
                    + 1200.0 * (x as f64 * 0.35).sin() * (y as f64 * 0.28).cos()
                    + 5.0 * x as f64;
                img.put_pixel(x, y, image::Luma([v as u16]));
            }
        }
        img
    }

    #[test]
    fn test_patch_valid_on_textured_image() {
        let img = textured_image(64, 64);
        let pattern = Pattern::<f32, 52>::rosette52();
        let patch = Patch::new(&img, &pattern, &Vector2::new(32.0, 32.0));
        assert!(patch.valid);
        assert!(patch.mean > 0.0);
    }

    #[test]
    fn test_patch_rejected_near_border() {
        let img = textured_image(64, 64);
        let pattern = Pattern::<f32, 52>::rosette52();
        // Pattern radius 7 plus sampling margin 2: a centre 8 px from the
        // border cannot host the full pattern.
        let patch = Patch::new(&img, &pattern, &Vector2::new(8.0, 32.0));
        assert!(!patch.valid);
    }

    #[test]
    fn test_patch_rejected_on_black_image() {
        let img = Gray16Image::new(64, 64);
        let pattern = Pattern::<f32, 52>::rosette52();
        let patch = Patch::new(&img, &pattern, &Vector2::new(32.0, 32.0));
        assert!(!patch.valid);
    }

    #[test]
    fn test_residual_zero_against_source() {
        let img = textured_image(64, 64);
        let pattern = Pattern::<f64, 52>::rosette52();
        let center = Vector2::new(30.5, 33.25);
        let patch = Patch::new(&img, &pattern, &center);
        assert!(patch.valid);

        let mut sites = SMatrix::<f64, 2, 52>::zeros();
        for i in 0..52 {
            sites[(0, i)] = center[0] + pattern.offsets[(0, i)];
            sites[(1, i)] = center[1] + pattern.offsets[(1, i)];
        }
        let res = patch.residual(&img, &sites).unwrap();
        for i in 0..52 {
            assert!(res[i].abs() < 1e-12, "residual {} = {}", i, res[i]);
        }
    }

    #[test]
    fn test_residual_out_of_bounds_fails() {
        let img = textured_image(64, 64);
        let pattern = Pattern::<f32, 52>::rosette52();
        let patch = Patch::new(&img, &pattern, &Vector2::new(32.0, 32.0));
        let mut sites = SMatrix::<f32, 2, 52>::zeros();
        for i in 0..52 {
            sites[(0, i)] = 60.0 + pattern.offsets[(0, i)];
            sites[(1, i)] = 32.0 + pattern.offsets[(1, i)];
        }
        assert!(patch.residual(&img, &sites).is_none());
    }
}
