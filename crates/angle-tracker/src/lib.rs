//! Per-device roll-angle histogram tracking, grounded on the original
//! `AngleHistogramTracker`: buckets a homography's decomposed roll angle to
//! the nearest 10 degrees and reports the most frequently observed bucket
//! in O(1), without rescanning the whole histogram on every query.

use std::collections::{BTreeMap, HashMap};

use helmet_risk_common::DeviceId;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Pinhole camera intrinsics used to decompose a homography into a roll
/// angle. Defaults match the reference device's calibration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self { fx: 302.22, fy: 302.22, cx: 320.0, cy: 240.0 }
    }
}

impl CameraIntrinsics {
    fn as_matrix(&self) -> Mat3 {
        Mat3([[self.fx, 0.0, self.cx], [0.0, self.fy, self.cy], [0.0, 0.0, 1.0]])
    }

    fn inverse(&self) -> Mat3 {
        Mat3([
            [1.0 / self.fx, 0.0, -self.cx / self.fx],
            [0.0, 1.0 / self.fy, -self.cy / self.fy],
            [0.0, 0.0, 1.0],
        ])
    }
}

/// A 3x3 matrix in row-major order, used for camera intrinsics and
/// homographies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Mat3(pub [[f64; 3]; 3]);

impl Mat3 {
    #[must_use]
    pub fn identity() -> Self {
        Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    fn mul(&self, other: &Mat3) -> Mat3 {
        let mut out = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                out[i][j] = (0..3).map(|k| self.0[i][k] * other.0[k][j]).sum();
            }
        }
        Mat3(out)
    }

    fn column(&self, j: usize) -> [f64; 3] {
        [self.0[0][j], self.0[1][j], self.0[2][j]]
    }
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

/// Decomposes a homography into an approximate rotation by normalizing it
/// against the known camera intrinsics (`K^-1 H K`) and orthonormalizing
/// its first two columns via Gram-Schmidt, then reads the roll (z-axis
/// tilt) angle off the resulting rotation's third row. This is a
/// single-solution approximation of the planar homography-to-pose
/// decomposition rather than OpenCV's multi-solution Faugeras method,
/// adequate for a tilt indicator rather than full 6-DoF pose recovery.
#[must_use]
pub fn roll_angle_from_homography(h: &Mat3, intrinsics: &CameraIntrinsics) -> Option<f64> {
    let k = intrinsics.as_matrix();
    let k_inv = intrinsics.inverse();
    let normalized = k_inv.mul(h).mul(&k);

    let col0 = normalized.column(0);
    let col1 = normalized.column(1);

    let n0 = norm(col0);
    if n0 < 1e-9 {
        return None;
    }
    let r1 = scale(col0, 1.0 / n0);

    let r2_raw = sub(col1, scale(r1, dot(r1, col1)));
    let n1 = norm(r2_raw);
    if n1 < 1e-9 {
        return None;
    }
    let r2 = scale(r2_raw, 1.0 / n1);
    let r3 = cross(r1, r2);

    Some(r2[2].atan2(r3[2]).to_degrees())
}

/// Tracks the roll-angle histogram and last-seen homography for a single
/// device.
#[derive(Debug, Default)]
pub struct AngleHistogramTracker {
    angle_stats: HashMap<i32, u32>,
    homography: Option<Mat3>,
    max_angle: Option<i32>,
    max_angle_count: u32,
    current_angle: Option<f64>,
}

impl AngleHistogramTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_homography(&mut self, h: Mat3) {
        self.homography = Some(h);
    }

    /// Buckets `current_angle` to the nearest 10 degrees and updates the
    /// running histogram and most-common-angle cache.
    pub fn update(&mut self, current_angle: f64) {
        let bucket = (current_angle / 10.0).round() as i32 * 10;
        self.current_angle = Some(current_angle);

        let count = self.angle_stats.entry(bucket).or_insert(0);
        *count += 1;
        if *count > self.max_angle_count {
            self.max_angle = Some(bucket);
            self.max_angle_count = *count;
        }
        trace!(bucket, count = *count, "angle histogram update");
    }

    /// Decomposes the stored homography into a roll angle and folds it
    /// into the histogram. A no-op if no homography has been set.
    pub fn update_with_homography(&mut self, intrinsics: &CameraIntrinsics) {
        let Some(h) = self.homography else { return };
        if let Some(roll) = roll_angle_from_homography(&h, intrinsics) {
            self.update(roll);
        }
    }

    /// The most frequently observed 10-degree bucket, 0 if none yet.
    #[must_use]
    pub fn most_common_angle(&self) -> i32 {
        self.max_angle.unwrap_or(0)
    }

    #[must_use]
    pub fn current_angle(&self) -> Option<f64> {
        self.current_angle
    }

    #[must_use]
    pub fn stats(&self) -> BTreeMap<i32, u32> {
        self.angle_stats.iter().map(|(&k, &v)| (k, v)).collect()
    }
}

/// Owns one [`AngleHistogramTracker`] per connected device.
#[derive(Debug, Default)]
pub struct AngleTrackerRegistry {
    trackers: HashMap<DeviceId, AngleHistogramTracker>,
}

impl AngleTrackerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, device_id: &DeviceId) -> &mut AngleHistogramTracker {
        self.trackers.entry(device_id.clone()).or_insert_with(AngleHistogramTracker::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucketing_rounds_to_nearest_ten() {
        let mut tracker = AngleHistogramTracker::new();
        tracker.update(4.9);
        tracker.update(5.1);
        let stats = tracker.stats();
        assert_eq!(stats.get(&0), Some(&1));
        assert_eq!(stats.get(&10), Some(&1));
    }

    #[test]
    fn most_common_angle_tracks_the_mode() {
        let mut tracker = AngleHistogramTracker::new();
        for _ in 0..5 {
            tracker.update(12.0);
        }
        for _ in 0..3 {
            tracker.update(42.0);
        }
        assert_eq!(tracker.most_common_angle(), 10);
    }

    #[test]
    fn no_observations_reports_zero() {
        let tracker = AngleHistogramTracker::new();
        assert_eq!(tracker.most_common_angle(), 0);
        assert_eq!(tracker.current_angle(), None);
    }

    #[test]
    fn identity_homography_yields_zero_roll() {
        let intrinsics = CameraIntrinsics::default();
        let roll = roll_angle_from_homography(&Mat3::identity(), &intrinsics).unwrap();
        assert!(roll.abs() < 1e-6);
    }

    #[test]
    fn update_with_homography_is_noop_without_one_set() {
        let mut tracker = AngleHistogramTracker::new();
        tracker.update_with_homography(&CameraIntrinsics::default());
        assert_eq!(tracker.current_angle(), None);
    }

    #[test]
    fn registry_creates_distinct_trackers_per_device() {
        let mut registry = AngleTrackerRegistry::new();
        registry.get_or_create(&DeviceId("a".into())).update(10.0);
        registry.get_or_create(&DeviceId("b".into())).update(20.0);
        assert_eq!(registry.get_or_create(&DeviceId("a".into())).most_common_angle(), 10);
        assert_eq!(registry.get_or_create(&DeviceId("b".into())).most_common_angle(), 20);
    }
}
