//! Gaussian image pyramid.
//!
//! Level 0 is the input image; every further level is produced by a 3x3
//! binomial low-pass followed by 2x decimation. The tracker scales keypoint
//! translations between levels by powers of two.

use crate::image::Gray16Image;

/// Fixed-depth Gaussian pyramid over a 16-bit grayscale image.
pub struct ImagePyramid {
    levels: Vec<Gray16Image>,
}

impl ImagePyramid {
    /// Build a pyramid with `extra_levels` additional levels on top of the
    /// input image.
    pub fn new(img: &Gray16Image, extra_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(extra_levels + 1);
        levels.push(img.clone());
        for l in 1..=extra_levels {
            let down = downsample(&levels[l - 1]);
            levels.push(down);
        }
        Self { levels }
    }

    /// Image at pyramid level `l` (0 = finest).
    #[inline]
    pub fn lvl(&self, l: usize) -> &Gray16Image {
        &self.levels[l]
    }

    /// Total number of levels (`extra_levels + 1`).
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

/// Half-resolution copy: separable [1 2 1]/4 binomial filter evaluated at
/// even pixel centres, borders clamped.
fn downsample(img: &Gray16Image) -> Gray16Image {
    let (w, h) = img.dimensions();
    let nw = (w / 2).max(1);
    let nh = (h / 2).max(1);

    let px = |x: i64, y: i64| -> u32 {
        let cx = x.clamp(0, w as i64 - 1) as u32;
        let cy = y.clamp(0, h as i64 - 1) as u32;
        img.get_pixel(cx, cy).0[0] as u32
    };

    let mut out = Gray16Image::new(nw, nh);
    for y in 0..nh {
        for x in 0..nw {
            let sx = 2 * x as i64;
            let sy = 2 * y as i64;
            let mut sum = 0u32;
            for (dy, wy) in [(-1i64, 1u32), (0, 2), (1, 1)] {
                for (dx, wx) in [(-1i64, 1u32), (0, 2), (1, 1)] {
                    sum += wx * wy * px(sx + dx, sy + dy);
                }
            }
            out.put_pixel(x, y, image::Luma([((sum + 8) / 16) as u16]));
        }
    }
    out
}
