//! RANSAC homography estimation, the hand-rolled equivalent of OpenCV's
//! `findHomography(..., method=RANSAC)`: repeatedly fits a homography to a
//! random 4-point sample via direct linear transform and keeps the model
//! with the most reprojection inliers.

use helmet_risk_angle_tracker::Mat3;
use helmet_risk_common::Point2f;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RansacConfig {
    pub reproj_threshold: f32,
    pub max_iters: u32,
    pub confidence: f32,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self { reproj_threshold: 20.0, max_iters: 100, confidence: 0.8 }
    }
}

/// Solves the 8x8 linear system `a x = b` by Gaussian elimination with
/// partial pivoting. Returns `None` if `a` is singular.
fn solve_8x8(mut a: [[f64; 8]; 8], mut b: [f64; 8]) -> Option<[f64; 8]> {
    for col in 0..8 {
        let pivot_row = (col..8).max_by(|&r1, &r2| a[r1][col].abs().partial_cmp(&a[r2][col].abs()).unwrap())?;
        if a[pivot_row][col].abs() < 1e-10 {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        let pivot = a[col][col];
        for k in col..8 {
            a[col][k] /= pivot;
        }
        b[col] /= pivot;

        for row in 0..8 {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..8 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    Some(b)
}

/// Fits a homography mapping `src[i] -> dst[i]` for exactly 4
/// correspondences via direct linear transform, fixing `h[2][2] = 1`.
#[must_use]
pub fn homography_from_4_points(src: &[Point2f; 4], dst: &[Point2f; 4]) -> Option<Mat3> {
    let mut a = [[0.0f64; 8]; 8];
    let mut b = [0.0f64; 8];
    for i in 0..4 {
        let (x, y) = (src[i].x as f64, src[i].y as f64);
        let (xp, yp) = (dst[i].x as f64, dst[i].y as f64);

        a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -xp * x, -xp * y];
        b[2 * i] = xp;

        a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -yp * x, -yp * y];
        b[2 * i + 1] = yp;
    }
    let h = solve_8x8(a, b)?;
    Some(Mat3([[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], 1.0]]))
}

#[must_use]
pub fn apply_homography(h: &Mat3, p: Point2f) -> Option<Point2f> {
    let x = p.x as f64;
    let y = p.y as f64;
    let w = h.0[2][0] * x + h.0[2][1] * y + h.0[2][2];
    if w.abs() < 1e-9 {
        return None;
    }
    let wx = (h.0[0][0] * x + h.0[0][1] * y + h.0[0][2]) / w;
    let wy = (h.0[1][0] * x + h.0[1][1] * y + h.0[1][2]) / w;
    Some(Point2f::new(wx as f32, wy as f32))
}

/// Samples 4 distinct correspondences up to `max_iters` times, fits a
/// homography to each sample, and keeps the one with the most inliers
/// under `config.reproj_threshold`. Returns the best homography and an
/// inlier mask over the full correspondence set.
#[must_use]
pub fn ransac_homography(old_pts: &[Point2f], new_pts: &[Point2f], config: &RansacConfig) -> Option<(Mat3, Vec<bool>)> {
    let n = old_pts.len();
    if n < 4 || new_pts.len() != n {
        return None;
    }

    let mut best_inliers = 0usize;
    let mut best: Option<(Mat3, Vec<bool>)> = None;

    for _ in 0..config.max_iters {
        let mut idx = [0usize; 4];
        idx[0] = fastrand::usize(..n);
        let mut k = 1;
        while k < 4 {
            let candidate = fastrand::usize(..n);
            if !idx[..k].contains(&candidate) {
                idx[k] = candidate;
                k += 1;
            }
        }

        let src = [old_pts[idx[0]], old_pts[idx[1]], old_pts[idx[2]], old_pts[idx[3]]];
        let dst = [new_pts[idx[0]], new_pts[idx[1]], new_pts[idx[2]], new_pts[idx[3]]];
        let Some(h) = homography_from_4_points(&src, &dst) else { continue };

        let mut mask = vec![false; n];
        let mut inliers = 0usize;
        for i in 0..n {
            if let Some(reproj) = apply_homography(&h, old_pts[i]) {
                if reproj.dist(&new_pts[i]) <= config.reproj_threshold {
                    mask[i] = true;
                    inliers += 1;
                }
            }
        }

        if inliers > best_inliers {
            best_inliers = inliers;
            best = Some((h, mask));
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_correspondences_yield_identity_homography() {
        let src = [Point2f::new(0.0, 0.0), Point2f::new(10.0, 0.0), Point2f::new(10.0, 10.0), Point2f::new(0.0, 10.0)];
        let h = homography_from_4_points(&src, &src).unwrap();
        for i in 0..4 {
            let p = apply_homography(&h, src[i]).unwrap();
            assert!(p.dist(&src[i]) < 1e-3);
        }
    }

    #[test]
    fn translation_correspondences_recover_translation() {
        let src = [Point2f::new(0.0, 0.0), Point2f::new(10.0, 0.0), Point2f::new(10.0, 10.0), Point2f::new(0.0, 10.0)];
        let dst: Vec<Point2f> = src.iter().map(|p| Point2f::new(p.x + 5.0, p.y + 3.0)).collect();
        let dst_arr = [dst[0], dst[1], dst[2], dst[3]];
        let h = homography_from_4_points(&src, &dst_arr).unwrap();
        let p = apply_homography(&h, Point2f::new(20.0, 20.0)).unwrap();
        assert!((p.x - 25.0).abs() < 1e-2);
        assert!((p.y - 23.0).abs() < 1e-2);
    }

    #[test]
    fn ransac_recovers_translation_despite_outliers() {
        let old_pts: Vec<Point2f> = (0..20).map(|i| Point2f::new((i * 7) as f32, (i * 3) as f32)).collect();
        let mut new_pts: Vec<Point2f> = old_pts.iter().map(|p| Point2f::new(p.x + 4.0, p.y - 2.0)).collect();
        // Corrupt a few points as outliers.
        new_pts[0] = Point2f::new(500.0, 500.0);
        new_pts[5] = Point2f::new(-200.0, 300.0);

        let (h, mask) = ransac_homography(&old_pts, &new_pts, &RansacConfig::default()).unwrap();
        let inliers = mask.iter().filter(|&&b| b).count();
        assert!(inliers >= 15, "should find most of the 18 consistent points as inliers");
        let p = apply_homography(&h, Point2f::new(0.0, 0.0)).unwrap();
        assert!((p.x - 4.0).abs() < 1.0);
        assert!((p.y + 2.0).abs() < 1.0);
    }

    #[test]
    fn fewer_than_four_points_returns_none() {
        let pts = [Point2f::new(0.0, 0.0), Point2f::new(1.0, 1.0)];
        assert!(ransac_homography(&pts, &pts, &RansacConfig::default()).is_none());
    }
}
