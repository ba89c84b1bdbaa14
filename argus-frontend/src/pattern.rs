//! Sampling pattern of a patch.
//!
//! A pattern is a fixed set of 2D offsets around the patch centre at which
//! intensities are sampled. It is built once per tracker instance and
//! shared read-only by every patch and by the solver's warp evaluation.

use nalgebra::SMatrix;

use argus_core::scalar::FlowScalar;

/// `N` sample offsets, one per column, in level pixel units.
#[derive(Debug, Clone)]
pub struct Pattern<S, const N: usize> {
    pub offsets: SMatrix<S, 2, N>,
}

impl<S: FlowScalar, const N: usize> Pattern<S, N> {
    pub fn from_offsets(offsets: SMatrix<S, 2, N>) -> Self {
        Self { offsets }
    }

    /// Largest offset radius; patches need this much clearance plus the
    /// sampling margin from the image border.
    pub fn radius(&self) -> S {
        let mut max2 = <S as FlowScalar>::from_f64(0.0);
        for i in 0..N {
            let x = self.offsets[(0, i)];
            let y = self.offsets[(1, i)];
            let r2 = x * x + y * y;
            if r2 > max2 {
                max2 = r2;
            }
        }
        max2.sqrt_val()
    }
}

impl<S: FlowScalar> Pattern<S, 52> {
    /// 52-point rosette: concentric rings of 1, 6, 10, 15 and 20 samples up
    /// to radius 7, with a small angular stagger between rings.
    pub fn rosette52() -> Self {
        const RINGS: [(usize, f64); 5] = [
            (1, 0.0),
            (6, 1.75),
            (10, 3.5),
            (15, 5.25),
            (20, 7.0),
        ];

        let mut offsets = SMatrix::<S, 2, 52>::zeros();
        let mut col = 0;
        for (ring, &(count, radius)) in RINGS.iter().enumerate() {
            let stagger = 0.5 * ring as f64;
            for k in 0..count {
                let angle = stagger + 2.0 * std::f64::consts::PI * k as f64 / count as f64;
                offsets[(0, col)] = <S as FlowScalar>::from_f64(radius * angle.cos());
                offsets[(1, col)] = <S as FlowScalar>::from_f64(radius * angle.sin());
                col += 1;
            }
        }
        debug_assert_eq!(col, 52);
        Self { offsets }
    }
}
