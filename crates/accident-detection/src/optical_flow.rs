//! Pyramidal Lucas-Kanade sparse optical flow, the hand-rolled equivalent
//! of OpenCV's `calcOpticalFlowPyrLK`: tracks a fixed set of points from
//! one grayscale frame to the next by iteratively refining a per-point
//! displacement estimate coarse-to-fine across a Gaussian-free 2x image
//! pyramid.

use helmet_risk_common::Point2f;
use image::GrayImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LkParams {
    pub win_size: u32,
    pub max_level: u32,
    pub max_iters: u32,
    pub epsilon: f32,
}

impl Default for LkParams {
    fn default() -> Self {
        Self { win_size: 15, max_level: 2, max_iters: 10, epsilon: 0.03 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlowResult {
    pub point: Point2f,
    pub found: bool,
}

/// Builds an image pyramid of `levels + 1` images, each half the size of
/// the previous via 2x2 box-averaged downsampling.
#[must_use]
pub fn build_pyramid(base: &GrayImage, levels: u32) -> Vec<GrayImage> {
    let mut pyramid = vec![base.clone()];
    for _ in 0..levels {
        let prev = pyramid.last().unwrap();
        let (w, h) = prev.dimensions();
        let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
        let mut down = GrayImage::new(nw, nh);
        for y in 0..nh {
            for x in 0..nw {
                let (x0, y0) = ((2 * x).min(w - 1), (2 * y).min(h - 1));
                let (x1, y1) = ((2 * x + 1).min(w - 1), (2 * y + 1).min(h - 1));
                let sum: u32 = prev.get_pixel(x0, y0).0[0] as u32
                    + prev.get_pixel(x1, y0).0[0] as u32
                    + prev.get_pixel(x0, y1).0[0] as u32
                    + prev.get_pixel(x1, y1).0[0] as u32;
                down.put_pixel(x, y, image::Luma([(sum / 4) as u8]));
            }
        }
        pyramid.push(down);
    }
    pyramid
}

fn bilinear_sample(img: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = img.dimensions();
    let x = x.clamp(0.0, w as f32 - 1.001);
    let y = y.clamp(0.0, h as f32 - 1.001);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0).0[0] as f32;
    let p10 = img.get_pixel(x1, y0).0[0] as f32;
    let p01 = img.get_pixel(x0, y1).0[0] as f32;
    let p11 = img.get_pixel(x1, y1).0[0] as f32;

    p00 * (1.0 - fx) * (1.0 - fy) + p10 * fx * (1.0 - fy) + p01 * (1.0 - fx) * fy + p11 * fx * fy
}

/// Refines `guess` by Newton iteration of the Lucas-Kanade brightness
/// constancy equation over a window centered at `pt` in `prev`, matched
/// against `next` at `pt + guess`. Returns `None` if the local structure
/// tensor is singular (a featureless or perfectly aliased window).
fn track_single_level(
    prev: &GrayImage,
    next: &GrayImage,
    pt: Point2f,
    mut guess: Point2f,
    half_win: i64,
    params: &LkParams,
) -> Option<Point2f> {
    let (w, h) = prev.dimensions();
    let cx = pt.x.round() as i64;
    let cy = pt.y.round() as i64;
    if cx < 0 || cy < 0 || cx >= w as i64 || cy >= h as i64 {
        return None;
    }

    let mut gxx = 0.0f32;
    let mut gyy = 0.0f32;
    let mut gxy = 0.0f32;
    let mut window_points = Vec::new();
    for dy in -half_win..=half_win {
        for dx in -half_win..=half_win {
            let x = cx + dx;
            let y = cy + dy;
            if x < 1 || y < 1 || x >= w as i64 - 1 || y >= h as i64 - 1 {
                continue;
            }
            let ix = (prev.get_pixel((x + 1) as u32, y as u32).0[0] as f32
                - prev.get_pixel((x - 1) as u32, y as u32).0[0] as f32)
                / 2.0;
            let iy = (prev.get_pixel(x as u32, (y + 1) as u32).0[0] as f32
                - prev.get_pixel(x as u32, (y - 1) as u32).0[0] as f32)
                / 2.0;
            gxx += ix * ix;
            gyy += iy * iy;
            gxy += ix * iy;
            window_points.push((x as f32, y as f32, ix, iy, prev.get_pixel(x as u32, y as u32).0[0] as f32));
        }
    }

    let det = gxx * gyy - gxy * gxy;
    if det.abs() < 1e-6 || window_points.is_empty() {
        return None;
    }

    for _ in 0..params.max_iters {
        let mut bx = 0.0f32;
        let mut by = 0.0f32;
        for &(x, y, ix, iy, prev_val) in &window_points {
            let next_val = bilinear_sample(next, x + guess.x, y + guess.y);
            let diff = prev_val - next_val;
            bx += diff * ix;
            by += diff * iy;
        }
        let dx = (gyy * bx - gxy * by) / det;
        let dy = (gxx * by - gxy * bx) / det;
        guess.x += dx;
        guess.y += dy;
        if (dx * dx + dy * dy).sqrt() < params.epsilon {
            break;
        }
    }
    Some(guess)
}

/// Tracks every point in `prev_points` from `prev_pyramid`'s base level to
/// `next_pyramid`'s base level, coarse-to-fine. Pyramids must have the
/// same number of levels.
#[must_use]
pub fn calc_optical_flow_pyr_lk(
    prev_pyramid: &[GrayImage],
    next_pyramid: &[GrayImage],
    prev_points: &[Point2f],
    params: &LkParams,
) -> Vec<FlowResult> {
    let half_win = (params.win_size / 2).max(1) as i64;
    let levels = prev_pyramid.len().min(next_pyramid.len());

    prev_points
        .iter()
        .map(|&pt| {
            let mut guess = Point2f::new(0.0, 0.0);
            let mut found = true;
            for level in (0..levels).rev() {
                let scale = 2f32.powi(level as i32);
                let level_pt = Point2f::new(pt.x / scale, pt.y / scale);
                match track_single_level(
                    &prev_pyramid[level],
                    &next_pyramid[level],
                    level_pt,
                    guess,
                    half_win,
                    params,
                ) {
                    Some(refined) => guess = refined,
                    None => {
                        found = false;
                        break;
                    }
                }
                if level > 0 {
                    guess = Point2f::new(guess.x * 2.0, guess.y * 2.0);
                }
            }
            FlowResult { point: Point2f::new(pt.x + guess.x, pt.y + guess.y), found }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn shifted_gradient(size: u32, shift: i32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let xv = x as i32 - shift;
            let v = ((xv.rem_euclid(size as i32)) * 8) as u8;
            let _ = y;
            Luma([v])
        })
    }

    #[test]
    fn static_frame_pair_reports_near_zero_flow() {
        let img = shifted_gradient(64, 0);
        let pyr = build_pyramid(&img, 1);
        let pts = vec![Point2f::new(32.0, 32.0)];
        let flow = calc_optical_flow_pyr_lk(&pyr, &pyr, &pts, &LkParams::default());
        assert!(flow[0].found);
        assert!(flow[0].point.dist(&pts[0]) < 1.0);
    }

    #[test]
    fn pyramid_halves_dimensions_per_level() {
        let img = GrayImage::from_pixel(64, 48, Luma([100]));
        let pyr = build_pyramid(&img, 2);
        assert_eq!(pyr.len(), 3);
        assert_eq!(pyr[1].dimensions(), (32, 24));
        assert_eq!(pyr[2].dimensions(), (16, 12));
    }

    #[test]
    fn featureless_window_is_not_found() {
        let img = GrayImage::from_pixel(64, 64, Luma([50]));
        let pyr = build_pyramid(&img, 1);
        let pts = vec![Point2f::new(32.0, 32.0)];
        let flow = calc_optical_flow_pyr_lk(&pyr, &pyr, &pts, &LkParams::default());
        assert!(!flow[0].found);
    }
}
