//! Rotated binary descriptors.
//!
//! Each keypoint carries a 256-bit descriptor built from pairwise intensity
//! comparisons on a sampling pattern rotated by the keypoint orientation.
//! The pattern is drawn once from a fixed-seed ChaCha stream, so descriptors
//! are deterministic across runs and builds.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use argus_core::image::Gray16Image;

use crate::detector::Corner;

/// Radius the rotated test pattern must fit into.
const PATCH_RADIUS: f32 = 15.0;
/// Largest test-point offset; leaves rounding slack inside `PATCH_RADIUS`.
const SAMPLE_RADIUS: i32 = 13;

/// A 256-bit binary descriptor stored as 4 x u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0; 4])
    }

    /// Number of differing bits (0-256).
    pub fn hamming_distance(&self, other: &Self) -> u32 {
        (self.0[0] ^ other.0[0]).count_ones()
            + (self.0[1] ^ other.0[1]).count_ones()
            + (self.0[2] ^ other.0[2]).count_ones()
            + (self.0[3] ^ other.0[3]).count_ones()
    }
}

/// Extractor holding the 256 comparison point pairs.
pub struct DescriptorExtractor {
    pattern: [(i8, i8, i8, i8); 256],
}

impl Default for DescriptorExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorExtractor {
    pub fn new() -> Self {
        Self {
            pattern: generate_pattern(),
        }
    }

    /// Compute the descriptor at a corner, rotating the test pattern by the
    /// corner orientation. `None` when the patch does not fit the image.
    pub fn compute(&self, img: &Gray16Image, corner: &Corner) -> Option<Descriptor> {
        let (w, h) = img.dimensions();
        let cx = corner.pos[0];
        let cy = corner.pos[1];
        if cx < PATCH_RADIUS
            || cy < PATCH_RADIUS
            || cx >= w as f32 - PATCH_RADIUS
            || cy >= h as f32 - PATCH_RADIUS
        {
            return None;
        }

        let cos_a = corner.angle.cos();
        let sin_a = corner.angle.sin();
        let mut bits = [0u64; 4];

        for (i, &(x1, y1, x2, y2)) in self.pattern.iter().enumerate() {
            let (rx1, ry1) = rotate(x1 as f32, y1 as f32, cos_a, sin_a);
            let (rx2, ry2) = rotate(x2 as f32, y2 as f32, cos_a, sin_a);

            let v1 = img.get_pixel((cx + rx1).round() as u32, (cy + ry1).round() as u32).0[0];
            let v2 = img.get_pixel((cx + rx2).round() as u32, (cy + ry2).round() as u32).0[0];
            if v1 > v2 {
                bits[i / 64] |= 1 << (i % 64);
            }
        }

        Some(Descriptor(bits))
    }

    /// Descriptors for all corners that fit; corners too close to the
    /// border are paired with `None`.
    pub fn compute_all(&self, img: &Gray16Image, corners: &[Corner]) -> Vec<Option<Descriptor>> {
        corners.iter().map(|c| self.compute(img, c)).collect()
    }
}

#[inline]
fn rotate(x: f32, y: f32, cos_a: f32, sin_a: f32) -> (f32, f32) {
    (x * cos_a - y * sin_a, x * sin_a + y * cos_a)
}

/// Draw 256 comparison pairs from a fixed-seed stream, rejection-sampled
/// into the disc of radius `SAMPLE_RADIUS`.
fn generate_pattern() -> [(i8, i8, i8, i8); 256] {
    let mut rng = ChaCha8Rng::seed_from_u64(0x415247_5553);

    let mut sample = |rng: &mut ChaCha8Rng| -> (i8, i8) {
        loop {
            let x: i32 = rng.gen_range(-SAMPLE_RADIUS..=SAMPLE_RADIUS);
            let y: i32 = rng.gen_range(-SAMPLE_RADIUS..=SAMPLE_RADIUS);
            if x * x + y * y <= SAMPLE_RADIUS * SAMPLE_RADIUS {
                return (x as i8, y as i8);
            }
        }
    };

    std::array::from_fn(|_| {
        let (x1, y1) = sample(&mut rng);
        let (x2, y2) = sample(&mut rng);
        (x1, y1, x2, y2)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn corner_at(x: f32, y: f32, angle: f32) -> Corner {
        Corner {
            pos: Vector2::new(x, y),
            response: 1.0,
            angle,
        }
    }

    fn textured_image() -> Gray16Image {
        let mut img = Gray16Image::new(100, 100);
        for y in 0..100 {
            for x in 0..100 {
                img.put_pixel(x, y, image::Luma([((x * 523 + y * 311) % 60000) as u16]));
            }
        }
        img
    }

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([u64::MAX; 4]);
        assert_eq!(a.hamming_distance(&b), 256);
        assert_eq!(a.hamming_distance(&a), 0);
        let c = Descriptor([1, 0, 0, 0]);
        assert_eq!(a.hamming_distance(&c), 1);
    }

    #[test]
    fn test_descriptor_deterministic() {
        let img = textured_image();
        let e1 = DescriptorExtractor::new();
        let e2 = DescriptorExtractor::new();
        let c = corner_at(50.0, 50.0, 0.3);
        assert_eq!(e1.compute(&img, &c), e2.compute(&img, &c));
    }

    #[test]
    fn test_descriptor_near_border_is_none() {
        let img = textured_image();
        let e = DescriptorExtractor::new();
        assert!(e.compute(&img, &corner_at(5.0, 50.0, 0.0)).is_none());
        assert!(e.compute(&img, &corner_at(50.0, 95.0, 0.0)).is_none());
    }

    #[test]
    fn test_descriptor_nonzero_on_texture() {
        let img = textured_image();
        let e = DescriptorExtractor::new();
        let d = e.compute(&img, &corner_at(50.0, 50.0, 0.0)).unwrap();
        assert!(d.0.iter().any(|&w| w != 0));
        assert!(d.0.iter().any(|&w| w != u64::MAX));
    }

    #[test]
    fn test_pattern_fits_patch_radius() {
        let e = DescriptorExtractor::new();
        for &(x1, y1, x2, y2) in e.pattern.iter() {
            for (x, y) in [(x1 as f32, y1 as f32), (x2 as f32, y2 as f32)] {
                assert!((x * x + y * y).sqrt() <= SAMPLE_RADIUS as f32 + 0.01);
            }
        }
    }
}
