//! Perspective rectification: map a detected quadrangle onto a flat rectangle.
//!
//! ## Homography
//!
//! Four point correspondences fix the eight degrees of freedom of a planar
//! projective transform. [`Homography::from_quad`] solves the direct linear
//! system in `f64` after Hartley normalisation (centroid to the origin, mean
//! distance √2), which keeps the 8×8 system well conditioned for frames
//! thousands of pixels wide.
//!
//! ## Degenerate input
//!
//! A detector can return corners that do not span a quadrilateral: three on
//! a line, two on top of each other, or a "bow-tie" order. Warping with such
//! a transform produces a smeared or mirrored image that still looks like a
//! valid result. These cases are rejected up front with
//! [`CardflatError::Rectification`]:
//!
//! 1. non-finite coordinates
//! 2. any three corners (nearly) collinear, relative to the quad's extent
//! 3. non-convex corner order
//! 4. a vanishing pivot while solving, or a vanishing determinant
//!
//! ## Resampling
//!
//! `imageproc::geometric_transformations::warp_into` inverts the projection
//! and samples each destination pixel bilinearly. Its bilinear sampler needs
//! both neighbours of a sample inside the image, which the last row and
//! column of a frame never have. The frame is therefore warped from a copy
//! padded by one replicated pixel on every side, with the corners shifted to
//! match. Destination pixels whose pre-image lies beyond that border receive
//! the background colour.

use crate::config::OutputSize;
use crate::error::CardflatError;
use crate::pipeline::detect::{Point, Quadrangle};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use tracing::debug;

/// Minimum doubled triangle area, as a fraction of the squared bbox diagonal.
const COLLINEAR_TOLERANCE: f64 = 1e-3;

/// Pivot / determinant floor in normalised coordinates.
const SINGULAR_EPS: f64 = 1e-9;

/// A 3×3 projective transform, row-major, in homogeneous coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    m: [f64; 9],
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }

    /// Row-major matrix entries.
    pub fn matrix(&self) -> [f64; 9] {
        self.m
    }

    pub fn determinant(&self) -> f64 {
        det3(&self.m)
    }

    /// Compute the transform taking `src[i]` to `dst[i]` for all four corners.
    pub fn from_quad(src: &Quadrangle, dst: &Quadrangle) -> Result<Self, CardflatError> {
        check_quad(src, "source")?;
        check_quad(dst, "target")?;

        let (t_src, src_n) = normalise(src)?;
        let (t_dst, dst_n) = normalise(dst)?;

        let mut a = [[0.0f64; 9]; 8];
        for i in 0..4 {
            let (x, y) = src_n[i];
            let (u, v) = dst_n[i];
            a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
            a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
        }
        let h = solve8(a).ok_or_else(|| {
            CardflatError::rectification("corner correspondences give a singular system")
        })?;

        let hn = [h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0];
        if det3(&hn).abs() < SINGULAR_EPS {
            return Err(CardflatError::rectification(
                "perspective transform is singular",
            ));
        }

        // H = T_dst⁻¹ · Hn · T_src
        let m = mul3(&mul3(&invert_similarity(&t_dst), &hn), &t_src);
        if m[8].abs() < f64::EPSILON {
            return Err(CardflatError::rectification(
                "perspective transform maps the frame to infinity",
            ));
        }
        let m = m.map(|v| v / m[8]);
        debug!("Homography {:?}", m);
        Ok(Self { m })
    }

    /// Map a point; `None` if it lands on the line at infinity.
    pub fn apply(&self, p: Point) -> Option<Point> {
        let (x, y) = (p.x as f64, p.y as f64);
        let m = &self.m;
        let w = m[6] * x + m[7] * y + m[8];
        if w.abs() < f64::EPSILON {
            return None;
        }
        Some(Point::new(
            ((m[0] * x + m[1] * y + m[2]) / w) as f32,
            ((m[3] * x + m[4] * y + m[5]) / w) as f32,
        ))
    }

    fn to_projection(self) -> Option<Projection> {
        Projection::from_matrix(self.m.map(|v| v as f32))
    }
}

/// Corners of a `width × height` raster, in the same order as detector output.
pub fn target_corners(width: u32, height: u32) -> Quadrangle {
    let (r, b) = (width.saturating_sub(1) as f32, height.saturating_sub(1) as f32);
    [
        Point::new(0.0, 0.0),
        Point::new(r, 0.0),
        Point::new(r, b),
        Point::new(0.0, b),
    ]
}

/// Warp the region outlined by `quad` in `frame` onto a flat rectangle.
pub fn rectify(
    frame: &RgbImage,
    quad: &Quadrangle,
    size: OutputSize,
    background: [u8; 3],
) -> Result<RgbImage, CardflatError> {
    let (src_w, src_h) = frame.dimensions();
    let (width, height) = size.resolve(src_w, src_h).ok_or_else(|| {
        CardflatError::rectification(format!("source frame is {src_w}x{src_h}"))
    })?;
    if width < 2 || height < 2 {
        return Err(CardflatError::rectification(format!(
            "target size {width}x{height} is too small"
        )));
    }

    let padded = pad_edges(frame);
    let shifted = quad.map(|p| Point::new(p.x + 1.0, p.y + 1.0));
    let homography = Homography::from_quad(&shifted, &target_corners(width, height))?;
    let projection = homography.to_projection().ok_or_else(|| {
        CardflatError::rectification("perspective transform is not invertible")
    })?;

    let mut out = RgbImage::new(width, height);
    warp_into(
        &padded,
        &projection,
        Interpolation::Bilinear,
        Rgb(background),
        &mut out,
    );
    debug!(
        "Rectified {}x{} frame → {}x{}",
        src_w, src_h, width, height
    );
    Ok(out)
}

/// Copy of `frame` with a one-pixel border replicating its edge pixels.
fn pad_edges(frame: &RgbImage) -> RgbImage {
    let (w, h) = frame.dimensions();
    RgbImage::from_fn(w + 2, h + 2, |x, y| {
        let sx = x.saturating_sub(1).min(w - 1);
        let sy = y.saturating_sub(1).min(h - 1);
        *frame.get_pixel(sx, sy)
    })
}

// ── Validation ───────────────────────────────────────────────────────────

fn check_quad(q: &Quadrangle, which: &str) -> Result<(), CardflatError> {
    if q.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(CardflatError::rectification(format!(
            "{which} corners contain non-finite coordinates"
        )));
    }

    let pts: Vec<(f64, f64)> = q.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    let (min_x, max_x) = min_max(pts.iter().map(|p| p.0));
    let (min_y, max_y) = min_max(pts.iter().map(|p| p.1));
    let diag2 = (max_x - min_x).powi(2) + (max_y - min_y).powi(2);
    if diag2 <= 0.0 {
        return Err(CardflatError::rectification(format!(
            "{which} corners all coincide"
        )));
    }

    let limit = COLLINEAR_TOLERANCE * diag2;
    for (i, j, k) in [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)] {
        if cross(pts[i], pts[j], pts[k]).abs() < limit {
            return Err(CardflatError::rectification(format!(
                "{which} corners {i}, {j}, {k} are collinear or coincident"
            )));
        }
    }

    let turns: Vec<f64> = (0..4)
        .map(|i| cross(pts[i], pts[(i + 1) % 4], pts[(i + 2) % 4]))
        .collect();
    let all_left = turns.iter().all(|&t| t > 0.0);
    let all_right = turns.iter().all(|&t| t < 0.0);
    if !all_left && !all_right {
        return Err(CardflatError::rectification(format!(
            "{which} corners do not form a convex quadrilateral"
        )));
    }
    Ok(())
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Doubled signed area of the triangle `a, b, c`.
fn cross(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

// ── Linear algebra ───────────────────────────────────────────────────────

/// Similarity `T` moving the centroid to the origin with mean distance √2.
fn normalise(q: &Quadrangle) -> Result<([f64; 9], [(f64, f64); 4]), CardflatError> {
    let cx = q.iter().map(|p| p.x as f64).sum::<f64>() / 4.0;
    let cy = q.iter().map(|p| p.y as f64).sum::<f64>() / 4.0;
    let mean = q
        .iter()
        .map(|p| ((p.x as f64 - cx).powi(2) + (p.y as f64 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / 4.0;
    if mean <= 0.0 {
        return Err(CardflatError::rectification("corners all coincide"));
    }
    let s = std::f64::consts::SQRT_2 / mean;
    let t = [s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0];
    let pts = q.map(|p| (s * (p.x as f64 - cx), s * (p.y as f64 - cy)));
    Ok((t, pts))
}

fn invert_similarity(t: &[f64; 9]) -> [f64; 9] {
    let s = t[0];
    [1.0 / s, 0.0, -t[2] / s, 0.0, 1.0 / s, -t[5] / s, 0.0, 0.0, 1.0]
}

/// Gaussian elimination with partial pivoting on an augmented 8×9 system.
fn solve8(mut a: [[f64; 9]; 8]) -> Option<[f64; 8]> {
    for col in 0..8 {
        let pivot = (col..8).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < SINGULAR_EPS {
            return None;
        }
        a.swap(col, pivot);
        for row in col + 1..8 {
            let f = a[row][col] / a[col][col];
            for k in col..9 {
                a[row][k] -= f * a[col][k];
            }
        }
    }

    let mut h = [0.0f64; 8];
    for row in (0..8).rev() {
        let mut s = a[row][8];
        for k in row + 1..8 {
            s -= a[row][k] * h[k];
        }
        h[row] = s / a[row][row];
    }
    Some(h)
}

fn mul3(a: &[f64; 9], b: &[f64; 9]) -> [f64; 9] {
    let mut out = [0.0f64; 9];
    for r in 0..3 {
        for c in 0..3 {
            out[r * 3 + c] = (0..3).map(|k| a[r * 3 + k] * b[k * 3 + c]).sum();
        }
    }
    out
}

fn det3(m: &[f64; 9]) -> f64 {
    m[0] * (m[4] * m[8] - m[5] * m[7]) - m[1] * (m[3] * m[8] - m[5] * m[6])
        + m[2] * (m[3] * m[7] - m[4] * m[6])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(pts: [(f32, f32); 4]) -> Quadrangle {
        pts.map(Point::from)
    }

    fn assert_close(a: Point, b: Point, tol: f32) {
        assert!(
            (a.x - b.x).abs() <= tol && (a.y - b.y).abs() <= tol,
            "{a:?} != {b:?}"
        );
    }

    #[test]
    fn same_quad_gives_identity() {
        let q = quad([(0.0, 0.0), (99.0, 0.0), (99.0, 99.0), (0.0, 99.0)]);
        let h = Homography::from_quad(&q, &q).unwrap();
        for (a, b) in h.matrix().iter().zip(Homography::identity().matrix()) {
            assert!((a - b).abs() < 1e-9, "{:?}", h.matrix());
        }
    }

    #[test]
    fn skewed_quad_maps_onto_target_corners() {
        let src = quad([(112.0, 80.5), (930.0, 140.0), (870.0, 690.0), (60.0, 600.0)]);
        let dst = target_corners(860, 540);
        let h = Homography::from_quad(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            assert_close(h.apply(*s).unwrap(), *d, 1e-3);
        }
        assert!(h.determinant().abs() > 0.0);
    }

    #[test]
    fn collinear_corners_rejected() {
        let q = quad([(0.0, 0.0), (50.0, 50.0), (100.0, 100.0), (0.0, 100.0)]);
        let err = Homography::from_quad(&q, &target_corners(10, 10)).unwrap_err();
        assert!(err.to_string().contains("collinear"), "got: {err}");
    }

    #[test]
    fn nearly_collinear_corners_rejected() {
        let q = quad([(0.0, 0.0), (100.0, 0.02), (200.0, 0.0), (100.0, 0.5)]);
        assert!(Homography::from_quad(&q, &target_corners(10, 10)).is_err());
    }

    #[test]
    fn coincident_corners_rejected() {
        let q = quad([(10.0, 10.0), (10.0, 10.0), (10.0, 10.0), (80.0, 90.0)]);
        assert!(matches!(
            Homography::from_quad(&q, &target_corners(10, 10)),
            Err(CardflatError::Rectification { .. })
        ));
    }

    #[test]
    fn bow_tie_order_rejected() {
        // top-left, top-right, bottom-left, bottom-right
        let q = quad([(0.0, 0.0), (100.0, 0.0), (0.0, 100.0), (100.0, 100.0)]);
        let err = Homography::from_quad(&q, &target_corners(10, 10)).unwrap_err();
        assert!(err.to_string().contains("convex"), "got: {err}");
    }

    #[test]
    fn non_finite_corners_rejected() {
        let q = quad([(0.0, 0.0), (f32::NAN, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        assert!(Homography::from_quad(&q, &target_corners(10, 10)).is_err());
    }

    #[test]
    fn rectify_uses_configured_size() {
        let frame = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        let q = target_corners(100, 100);
        let out = rectify(&frame, &q, OutputSize::default(), [0, 0, 0]).unwrap();
        assert_eq!(out.dimensions(), (860, 540));
        // Every pixel, borders included. Bilinear blending truncates, so
        // white can come back a shade darker but never as background.
        for (x, y, px) in out.enumerate_pixels() {
            assert!(px.0.iter().all(|&c| c >= 250), "pixel ({x},{y}) is {px:?}");
        }

        let out = rectify(
            &RgbImage::from_pixel(200, 100, Rgb([9, 9, 9])),
            &target_corners(200, 100),
            OutputSize::AspectWidth { width: 1600 },
            [0, 0, 0],
        )
        .unwrap();
        assert_eq!(out.dimensions(), (1600, 800));
    }

    #[test]
    fn axis_aligned_rectangle_is_reproduced() {
        let frame = RgbImage::from_fn(64, 48, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, ((x + y) * 2) as u8])
        });
        let out = rectify(
            &frame,
            &target_corners(64, 48),
            OutputSize::Fixed {
                width: 64,
                height: 48,
            },
            [0, 0, 0],
        )
        .unwrap();

        for y in 0..48 {
            for x in 0..64 {
                let (a, b) = (frame.get_pixel(x, y), out.get_pixel(x, y));
                for c in 0..3 {
                    let diff = (a[c] as i32 - b[c] as i32).abs();
                    assert!(diff <= 2, "pixel ({x},{y}) {a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn sub_region_is_cropped_out() {
        // Red square inside a blue frame; corners on the square.
        let frame = RgbImage::from_fn(200, 200, |x, y| {
            if (50..150).contains(&x) && (50..150).contains(&y) {
                Rgb([220, 0, 0])
            } else {
                Rgb([0, 0, 220])
            }
        });
        let q = quad([(55.0, 55.0), (144.0, 55.0), (144.0, 144.0), (55.0, 144.0)]);
        let out = rectify(
            &frame,
            &q,
            OutputSize::Fixed {
                width: 40,
                height: 30,
            },
            [0, 0, 0],
        )
        .unwrap();
        assert!(out.pixels().all(|p| p[0] > 200 && p[2] < 20));
    }

    #[test]
    fn degenerate_quad_never_produces_an_image() {
        let frame = RgbImage::from_pixel(50, 50, Rgb([1, 2, 3]));
        let q = quad([(0.0, 0.0), (10.0, 0.0), (20.0, 0.0), (30.0, 0.0)]);
        assert!(matches!(
            rectify(&frame, &q, OutputSize::default(), [0, 0, 0]),
            Err(CardflatError::Rectification { .. })
        ));
    }
}
