//! Scalar abstraction for the tracking kernels.
//!
//! The patch solver and the camera geometry are generic over the floating
//! type so the whole pipeline can be instantiated for `f32` (the usual
//! choice) or `f64`. Everything monomorphises; there is no dispatch on the
//! hot path.

use nalgebra::RealField;

/// Floating scalar used by the tracking kernels.
///
/// Extends `nalgebra::RealField` with the pixel and literal conversions the
/// image code needs. The transcendental helpers are provided here so generic
/// code resolves them on the concrete float type.
pub trait FlowScalar: RealField + Copy + Send + Sync {
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    /// Convert a raw 16-bit pixel intensity.
    fn from_u16(v: u16) -> Self {
        <Self as FlowScalar>::from_f64(v as f64)
    }

    fn is_finite_val(self) -> bool;
    fn floor_val(self) -> Self;
    fn abs_val(self) -> Self;
    fn sqrt_val(self) -> Self;
    fn sin_val(self) -> Self;
    fn cos_val(self) -> Self;
    fn atan2_val(self, other: Self) -> Self;
}

impl FlowScalar for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn is_finite_val(self) -> bool {
        self.is_finite()
    }
    fn floor_val(self) -> Self {
        self.floor()
    }
    fn abs_val(self) -> Self {
        self.abs()
    }
    fn sqrt_val(self) -> Self {
        self.sqrt()
    }
    fn sin_val(self) -> Self {
        self.sin()
    }
    fn cos_val(self) -> Self {
        self.cos()
    }
    fn atan2_val(self, other: Self) -> Self {
        self.atan2(other)
    }
}

impl FlowScalar for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
    fn to_f64(self) -> f64 {
        self
    }
    fn is_finite_val(self) -> bool {
        self.is_finite()
    }
    fn floor_val(self) -> Self {
        self.floor()
    }
    fn abs_val(self) -> Self {
        self.abs()
    }
    fn sqrt_val(self) -> Self {
        self.sqrt()
    }
    fn sin_val(self) -> Self {
        self.sin()
    }
    fn cos_val(self) -> Self {
        self.cos()
    }
    fn atan2_val(self, other: Self) -> Self {
        self.atan2(other)
    }
}
