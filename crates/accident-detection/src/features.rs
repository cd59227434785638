//! Shi-Tomasi ("good features to track") corner detection: the minimum
//! eigenvalue of the local structure tensor, thresholded and spaced out by
//! greedy non-maximum suppression, the hand-rolled equivalent of OpenCV's
//! `goodFeaturesToTrack`.

use helmet_risk_common::Point2f;
use image::GrayImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureParams {
    pub max_corners: usize,
    pub quality_level: f32,
    pub min_distance: f32,
    pub block_size: u32,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self { max_corners: 300, quality_level: 0.1, min_distance: 7.0, block_size: 7 }
    }
}

struct IntegralImage {
    width: usize,
    height: usize,
    sums: Vec<f64>,
}

impl IntegralImage {
    fn build(values: &[f32], width: usize, height: usize) -> Self {
        let mut sums = vec![0.0f64; (width + 1) * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0f64;
            for x in 0..width {
                row_sum += values[y * width + x] as f64;
                sums[(y + 1) * (width + 1) + (x + 1)] = sums[y * (width + 1) + (x + 1)] + row_sum;
            }
        }
        Self { width, height, sums }
    }

    /// Sum of values within `[x0, x1) x [y0, y1)`, clamped to the image.
    fn box_sum(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> f64 {
        let x0 = x0.clamp(0, self.width as i64) as usize;
        let y0 = y0.clamp(0, self.height as i64) as usize;
        let x1 = x1.clamp(0, self.width as i64) as usize;
        let y1 = y1.clamp(0, self.height as i64) as usize;
        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }
        let w = self.width + 1;
        self.sums[y1 * w + x1] - self.sums[y0 * w + x1] - self.sums[y1 * w + x0] + self.sums[y0 * w + x0]
    }
}

fn sobel_gradients(gray: &GrayImage) -> (Vec<f32>, Vec<f32>) {
    let (width, height) = gray.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut ix = vec![0.0f32; w * h];
    let mut iy = vec![0.0f32; w * h];

    let px = |x: i64, y: i64| -> f32 {
        let xc = x.clamp(0, width as i64 - 1) as u32;
        let yc = y.clamp(0, height as i64 - 1) as u32;
        gray.get_pixel(xc, yc).0[0] as f32
    };

    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as i64, y as i64);
            let gx = -px(xi - 1, yi - 1) + px(xi + 1, yi - 1) - 2.0 * px(xi - 1, yi) + 2.0 * px(xi + 1, yi)
                - px(xi - 1, yi + 1)
                + px(xi + 1, yi + 1);
            let gy = -px(xi - 1, yi - 1) - 2.0 * px(xi, yi - 1) - px(xi + 1, yi - 1) + px(xi - 1, yi + 1)
                + 2.0 * px(xi, yi + 1)
                + px(xi + 1, yi + 1);
            ix[y * w + x] = gx;
            iy[y * w + x] = gy;
        }
    }
    (ix, iy)
}

/// Detects up to `params.max_corners` corners, spaced at least
/// `params.min_distance` apart, ranked by Shi-Tomasi response.
#[must_use]
pub fn good_features_to_track(gray: &GrayImage, params: &FeatureParams) -> Vec<Point2f> {
    let (width, height) = gray.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return Vec::new();
    }

    let (ix, iy) = sobel_gradients(gray);
    let ixx: Vec<f32> = ix.iter().map(|v| v * v).collect();
    let iyy: Vec<f32> = iy.iter().map(|v| v * v).collect();
    let ixy: Vec<f32> = ix.iter().zip(iy.iter()).map(|(a, b)| a * b).collect();

    let sxx = IntegralImage::build(&ixx, w, h);
    let syy = IntegralImage::build(&iyy, w, h);
    let sxy = IntegralImage::build(&ixy, w, h);

    let radius = (params.block_size / 2).max(1) as i64;
    let mut scores = vec![0.0f32; w * h];
    let mut max_score = 0.0f32;
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as i64, y as i64);
            let a = sxx.box_sum(xi - radius, yi - radius, xi + radius + 1, yi + radius + 1) as f32;
            let b = syy.box_sum(xi - radius, yi - radius, xi + radius + 1, yi + radius + 1) as f32;
            let c = sxy.box_sum(xi - radius, yi - radius, xi + radius + 1, yi + radius + 1) as f32;
            let trace = a + b;
            let det = a * b - c * c;
            let disc = ((trace * trace) / 4.0 - det).max(0.0).sqrt();
            let lambda_min = trace / 2.0 - disc;
            scores[y * w + x] = lambda_min;
            if lambda_min > max_score {
                max_score = lambda_min;
            }
        }
    }

    let threshold = params.quality_level * max_score;
    if threshold <= 0.0 {
        return Vec::new();
    }

    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let score = scores[y * w + x];
            if score > threshold {
                candidates.push((score, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

    let min_dist_sq = params.min_distance * params.min_distance;
    let mut accepted: Vec<Point2f> = Vec::new();
    for (_, x, y) in candidates {
        let p = Point2f::new(x as f32, y as f32);
        if accepted.iter().all(|&q| p.dist(&q).powi(2) >= min_dist_sq) {
            accepted.push(p);
            if accepted.len() >= params.max_corners {
                break;
            }
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checkerboard(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn checkerboard_corners_are_detected() {
        let img = checkerboard(64);
        let params = FeatureParams { max_corners: 50, min_distance: 3.0, ..Default::default() };
        let corners = good_features_to_track(&img, &params);
        assert!(!corners.is_empty(), "a checkerboard should have detectable corners");
    }

    #[test]
    fn flat_image_has_no_corners() {
        let img = GrayImage::from_pixel(32, 32, Luma([128]));
        let corners = good_features_to_track(&img, &FeatureParams::default());
        assert!(corners.is_empty());
    }

    #[test]
    fn min_distance_spaces_out_accepted_corners() {
        let img = checkerboard(64);
        let params = FeatureParams { max_corners: 300, min_distance: 10.0, ..Default::default() };
        let corners = good_features_to_track(&img, &params);
        for i in 0..corners.len() {
            for j in (i + 1)..corners.len() {
                assert!(corners[i].dist(&corners[j]) >= 9.9);
            }
        }
    }
}
