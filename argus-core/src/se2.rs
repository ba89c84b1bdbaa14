//! SE(2) — planar rigid motions.
//!
//! Provides the exponential map used by the inverse-compositional solver
//! and a compact 2D affine transform (rotation-like linear part plus
//! translation) that represents a keypoint pose on the finest image level.

use nalgebra::{Matrix2, Vector2, Vector3};
use std::ops::Mul;

use crate::scalar::FlowScalar;

/// SE(2) group element: 2D rotation plus translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE2<S> {
    pub rotation: Matrix2<S>,
    pub translation: Vector2<S>,
}

impl<S: FlowScalar> SE2<S> {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix2::identity(),
            translation: Vector2::zeros(),
        }
    }

    /// Exponential map: tangent `(vx, vy, omega)` to a group element.
    pub fn exp(xi: &Vector3<S>) -> Self {
        let theta = xi[2];
        let s = theta.sin_val();
        let c = theta.cos_val();
        let rotation = Matrix2::new(c, -s, s, c);

        let one = <S as FlowScalar>::from_f64(1.0);
        // V = (1/theta) [sin, -(1-cos); 1-cos, sin], Taylor-expanded near 0.
        let (a, b) = if theta.abs_val() < <S as FlowScalar>::from_f64(1e-10) {
            let t2 = theta * theta;
            (
                one - t2 / <S as FlowScalar>::from_f64(6.0),
                theta * <S as FlowScalar>::from_f64(0.5) - t2 * theta / <S as FlowScalar>::from_f64(24.0),
            )
        } else {
            ((s / theta), (one - c) / theta)
        };
        let v = Matrix2::new(a, -b, b, a);

        Self {
            rotation,
            translation: v * Vector2::new(xi[0], xi[1]),
        }
    }

    /// Logarithm map, the inverse of [`SE2::exp`].
    pub fn log(&self) -> Vector3<S> {
        let theta = self.rotation[(1, 0)].atan2_val(self.rotation[(0, 0)]);

        let one = <S as FlowScalar>::from_f64(1.0);
        let (a, b) = if theta.abs_val() < <S as FlowScalar>::from_f64(1e-10) {
            let t2 = theta * theta;
            (
                one - t2 / <S as FlowScalar>::from_f64(6.0),
                theta * <S as FlowScalar>::from_f64(0.5) - t2 * theta / <S as FlowScalar>::from_f64(24.0),
            )
        } else {
            (theta.sin_val() / theta, (one - theta.cos_val()) / theta)
        };
        let v = Matrix2::new(a, -b, b, a);
        let v_inv = v
            .try_inverse()
            .unwrap_or_else(Matrix2::identity);
        let t = v_inv * self.translation;
        Vector3::new(t[0], t[1], theta)
    }
}

/// Compact 2D affine transform: a linear part plus a translation.
///
/// Keypoint poses carry an identity (or rotation) linear part; the solver
/// right-composes SE(2) increments into it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2<S> {
    pub linear: Matrix2<S>,
    pub translation: Vector2<S>,
}

impl<S: FlowScalar> Affine2<S> {
    pub fn identity() -> Self {
        Self {
            linear: Matrix2::identity(),
            translation: Vector2::zeros(),
        }
    }

    pub fn from_translation(translation: Vector2<S>) -> Self {
        Self {
            linear: Matrix2::identity(),
            translation,
        }
    }
}

/// Right-composition with a group element: `(a * g)(x) = a(g(x))`.
impl<S: FlowScalar> Mul<SE2<S>> for Affine2<S> {
    type Output = Affine2<S>;

    fn mul(self, rhs: SE2<S>) -> Affine2<S> {
        Affine2 {
            linear: self.linear * rhs.rotation,
            translation: self.linear * rhs.translation + self.translation,
        }
    }
}
