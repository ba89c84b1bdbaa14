//! Grid FAST corner detection.
//!
//! The finest pyramid level is divided into cells; cells holding an
//! existing keypoint or touching a mask rectangle are skipped, and in the
//! remaining ones FAST-9 runs with an adaptive threshold that halves from
//! the configured maximum until corners appear. The strongest corners per
//! cell (by Harris response) survive, each with an intensity-centroid
//! orientation. Detection is deterministic for identical input.

use nalgebra::Vector2;

use argus_core::image::Gray16Image;

use crate::types::MaskRect;

/// Border kept free of detections so that orientation and descriptor
/// windows always fit.
pub const EDGE_MARGIN: u32 = 16;

/// Offsets of the 16-pixel Bresenham circle of radius 3, ordered around the
/// circle starting from the top.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// A detected corner on the finest pyramid level.
#[derive(Debug, Clone, Copy)]
pub struct Corner {
    pub pos: Vector2<f32>,
    pub response: f32,
    /// Orientation in radians from the intensity centroid.
    pub angle: f32,
}

/// Detection options, a slice of the tracker configuration.
#[derive(Debug, Clone, Copy)]
pub struct DetectionParams {
    pub grid_size: u32,
    pub num_points_cell: usize,
    pub min_threshold: i32,
    pub max_threshold: i32,
}

/// Detect corners over a cell grid, respecting masks and the occupancy of
/// already-tracked keypoints.
pub fn detect_grid(
    img: &Gray16Image,
    params: &DetectionParams,
    masks: &[MaskRect],
    existing: &[Vector2<f32>],
) -> Vec<Corner> {
    let (w, h) = img.dimensions();
    if w <= 2 * EDGE_MARGIN || h <= 2 * EDGE_MARGIN {
        return Vec::new();
    }

    let grid = params.grid_size;
    let mut corners = Vec::new();

    let mut cy = EDGE_MARGIN;
    while cy + grid <= h - EDGE_MARGIN {
        let mut cx = EDGE_MARGIN;
        while cx + grid <= w - EDGE_MARGIN {
            if !cell_occupied(cx, cy, grid, masks, existing) {
                detect_in_cell(img, cx, cy, grid, params, &mut corners);
            }
            cx += grid;
        }
        cy += grid;
    }

    corners
}

fn cell_occupied(
    cx: u32,
    cy: u32,
    grid: u32,
    masks: &[MaskRect],
    existing: &[Vector2<f32>],
) -> bool {
    let (x0, y0) = (cx as f32, cy as f32);
    let g = grid as f32;
    if existing
        .iter()
        .any(|p| p[0] >= x0 && p[0] < x0 + g && p[1] >= y0 && p[1] < y0 + g)
    {
        return true;
    }
    masks.iter().any(|m| m.overlaps_cell(x0, y0, g, g))
}

fn detect_in_cell(
    img: &Gray16Image,
    cx: u32,
    cy: u32,
    grid: u32,
    params: &DetectionParams,
    out: &mut Vec<Corner>,
) {
    let mut found: Vec<(u32, u32)> = Vec::new();

    let mut threshold = params.max_threshold;
    while threshold >= params.min_threshold {
        for y in cy..cy + grid {
            for x in cx..cx + grid {
                if is_fast_corner(img, x, y, threshold) {
                    found.push((x, y));
                }
            }
        }
        if !found.is_empty() {
            break;
        }
        threshold /= 2;
    }

    let mut scored: Vec<Corner> = found
        .into_iter()
        .map(|(x, y)| Corner {
            pos: Vector2::new(x as f32, y as f32),
            response: harris_response(img, x, y),
            angle: 0.0,
        })
        .collect();

    // Strongest first; ties broken by scan order to keep detection
    // deterministic.
    scored.sort_by(|a, b| {
        b.response
            .partial_cmp(&a.response)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(params.num_points_cell);

    for mut corner in scored {
        corner.angle = intensity_centroid_angle(img, corner.pos[0] as u32, corner.pos[1] as u32);
        out.push(corner);
    }
}

/// Intensity of the high byte, the range FAST thresholds are expressed in.
#[inline]
fn px8(img: &Gray16Image, x: u32, y: u32) -> i32 {
    (img.get_pixel(x, y).0[0] >> 8) as i32
}

/// FAST-9 test: nine contiguous circle pixels all brighter or all darker
/// than the centre by `threshold`.
fn is_fast_corner(img: &Gray16Image, x: u32, y: u32, threshold: i32) -> bool {
    let center = px8(img, x, y);
    let hi = center + threshold;
    let lo = center - threshold;

    // Cardinal pre-test: a 9-arc must contain 3 of the 4 compass points.
    let p0 = px8(img, x, y - 3);
    let p4 = px8(img, x + 3, y);
    let p8 = px8(img, x, y + 3);
    let p12 = px8(img, x - 3, y);
    let brighter = (p0 > hi) as u8 + (p4 > hi) as u8 + (p8 > hi) as u8 + (p12 > hi) as u8;
    let darker = (p0 < lo) as u8 + (p4 < lo) as u8 + (p8 < lo) as u8 + (p12 < lo) as u8;
    if brighter < 3 && darker < 3 {
        return false;
    }

    let ring: [i32; 16] = std::array::from_fn(|i| {
        let (dx, dy) = CIRCLE[i];
        px8(img, (x as i32 + dx) as u32, (y as i32 + dy) as u32)
    });

    let mut run_bright = 0;
    let mut run_dark = 0;
    let mut best_bright = 0;
    let mut best_dark = 0;
    for i in 0..32 {
        let v = ring[i % 16];
        if v > hi {
            run_bright += 1;
            best_bright = best_bright.max(run_bright);
        } else {
            run_bright = 0;
        }
        if v < lo {
            run_dark += 1;
            best_dark = best_dark.max(run_dark);
        } else {
            run_dark = 0;
        }
    }
    best_bright >= 9 || best_dark >= 9
}

/// Harris response over a 7x7 window, used to rank corners within a cell.
fn harris_response(img: &Gray16Image, x: u32, y: u32) -> f32 {
    const K: f32 = 0.04;
    let mut sum_xx = 0.0f32;
    let mut sum_yy = 0.0f32;
    let mut sum_xy = 0.0f32;

    for dy in -3i32..=3 {
        for dx in -3i32..=3 {
            let px = (x as i32 + dx) as u32;
            let py = (y as i32 + dy) as u32;
            let ix = (px8(img, px + 1, py) - px8(img, px - 1, py)) as f32 / 2.0;
            let iy = (px8(img, px, py + 1) - px8(img, px, py - 1)) as f32 / 2.0;
            sum_xx += ix * ix;
            sum_yy += iy * iy;
            sum_xy += ix * iy;
        }
    }

    let det = sum_xx * sum_yy - sum_xy * sum_xy;
    let trace = sum_xx + sum_yy;
    det - K * trace * trace
}

/// Orientation from the first image moments over a radius-7 disc.
fn intensity_centroid_angle(img: &Gray16Image, x: u32, y: u32) -> f32 {
    const RADIUS: i32 = 7;
    let mut m10 = 0.0f32;
    let mut m01 = 0.0f32;

    for dy in -RADIUS..=RADIUS {
        for dx in -RADIUS..=RADIUS {
            if dx * dx + dy * dy > RADIUS * RADIUS {
                continue;
            }
            let v = img.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0] as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }

    m01.atan2(m10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DetectionParams {
        DetectionParams {
            grid_size: 32,
            num_points_cell: 2,
            min_threshold: 5,
            max_threshold: 40,
        }
    }

    /// Dark background with one bright square whose corners are FAST-9
    /// corners.
    fn square_image() -> Gray16Image {
        let mut img = Gray16Image::from_pixel(160, 160, image::Luma([10 << 8]));
        for y in 60..90 {
            for x in 60..90 {
                img.put_pixel(x, y, image::Luma([200 << 8]));
            }
        }
        img
    }

    #[test]
    fn test_detects_square_corners() {
        let corners = detect_grid(&square_image(), &params(), &[], &[]);
        assert!(!corners.is_empty());
        let square_corners = [(60.0, 60.0), (89.0, 60.0), (60.0, 89.0), (89.0, 89.0)];
        for c in &corners {
            assert!(
                square_corners
                    .iter()
                    .any(|&(sx, sy)| (c.pos[0] - sx).abs() <= 3.0 && (c.pos[1] - sy).abs() <= 3.0),
                "corner at {:?} not near any square corner",
                c.pos
            );
        }
    }

    #[test]
    fn test_uniform_image_has_no_corners() {
        let img = Gray16Image::from_pixel(160, 160, image::Luma([5000]));
        assert!(detect_grid(&img, &params(), &[], &[]).is_empty());
    }

    #[test]
    fn test_existing_point_suppresses_cell() {
        let img = square_image();
        let free = detect_grid(&img, &params(), &[], &[]);
        assert!(!free.is_empty());
        // Occupy every cell that produced a corner.
        let occupancy: Vec<Vector2<f32>> = free.iter().map(|c| c.pos).collect();
        let suppressed = detect_grid(&img, &params(), &[], &occupancy);
        assert!(suppressed.is_empty());
    }

    #[test]
    fn test_mask_suppresses_cell() {
        let img = square_image();
        let mask = MaskRect {
            x: 0.0,
            y: 0.0,
            width: 160.0,
            height: 160.0,
        };
        assert!(detect_grid(&img, &params(), &[mask], &[]).is_empty());
    }

    #[test]
    fn test_detection_is_deterministic() {
        let img = square_image();
        let a = detect_grid(&img, &params(), &[], &[]);
        let b = detect_grid(&img, &params(), &[], &[]);
        assert_eq!(a.len(), b.len());
        for (ca, cb) in a.iter().zip(b.iter()) {
            assert_eq!(ca.pos, cb.pos);
            assert_eq!(ca.response, cb.response);
        }
    }

    #[test]
    fn test_small_image_yields_nothing() {
        let img = Gray16Image::new(20, 20);
        assert!(detect_grid(&img, &params(), &[], &[]).is_empty());
    }
}
