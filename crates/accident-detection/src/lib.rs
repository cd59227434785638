//! Optical-flow accident detector (spec.md §4.6): tracks sparse feature
//! points frame-to-frame, fits a RANSAC homography to estimate camera
//! motion, and raises an incident once the frame-rate-normalized motion
//! magnitude stays high across a short run of frames. Also feeds the
//! homography's decomposed roll angle into the caller's per-device
//! [`AngleHistogramTracker`].

pub mod features;
pub mod homography;
pub mod optical_flow;

use std::collections::VecDeque;

use helmet_risk_angle_tracker::{AngleHistogramTracker, CameraIntrinsics};
use helmet_risk_common::{ErrorClass, ErrorClassify, Point2f};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use features::{good_features_to_track, FeatureParams};
use homography::{ransac_homography, RansacConfig};
use optical_flow::{build_pyramid, calc_optical_flow_pyr_lk, LkParams};

#[derive(Debug, Error)]
pub enum AccidentError {
    #[error("frame has zero width or height")]
    EmptyFrame,
}

impl ErrorClassify for AccidentError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::TransientInput
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccidentStatus {
    Safe,
    Incident,
}

impl Default for AccidentStatus {
    fn default() -> Self {
        AccidentStatus::Safe
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccidentConfig {
    pub base_frame_interval_ms: f64,
    pub motion_magnitude_threshold: f32,
    pub safe_threshold: u32,
    pub history_len: usize,
    pub min_old_valid: usize,
    pub min_new_valid: usize,
    pub feature_params: FeatureParams,
    pub lk_params: LkParams,
    pub ransac: RansacConfig,
}

impl Default for AccidentConfig {
    fn default() -> Self {
        Self {
            base_frame_interval_ms: 1000.0 / 7.0,
            motion_magnitude_threshold: 75.0,
            safe_threshold: 15,
            history_len: 20,
            min_old_valid: 10,
            min_new_valid: 4,
            feature_params: FeatureParams::default(),
            lk_params: LkParams::default(),
            ransac: RansacConfig::default(),
        }
    }
}

/// Per-device optical-flow accident detector. Owns the previous frame and
/// its feature points; takes the device's [`AngleHistogramTracker`] and
/// [`CameraIntrinsics`] by reference since those are shared with the
/// angle-tracking side of the pipeline.
pub struct AccidentDetector {
    config: AccidentConfig,
    prev_gray: Option<GrayImage>,
    prev_points: Option<Vec<Point2f>>,
    flow_history: VecDeque<f32>,
    status: AccidentStatus,
    safe_counter: u32,
}

impl std::fmt::Debug for AccidentDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccidentDetector")
            .field("config", &self.config)
            .field("has_prev_frame", &self.prev_gray.is_some())
            .field("prev_points", &self.prev_points.as_ref().map(|p| p.len()))
            .field("flow_history_len", &self.flow_history.len())
            .field("status", &self.status)
            .field("safe_counter", &self.safe_counter)
            .finish()
    }
}

impl Default for AccidentDetector {
    fn default() -> Self {
        Self::new(AccidentConfig::default())
    }
}

impl AccidentDetector {
    #[must_use]
    pub fn new(config: AccidentConfig) -> Self {
        Self { config, prev_gray: None, prev_points: None, flow_history: VecDeque::new(), status: AccidentStatus::Safe, safe_counter: 0 }
    }

    /// Processes one grayscale frame. `timestamp_ms` is the wall-clock gap
    /// since the previous frame; a non-positive or missing value falls
    /// back to the configured base interval.
    pub fn detect(
        &mut self,
        frame: &GrayImage,
        timestamp_ms: Option<f64>,
        angle_tracker: &mut AngleHistogramTracker,
        intrinsics: &CameraIntrinsics,
    ) -> Result<AccidentStatus, AccidentError> {
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            return Err(AccidentError::EmptyFrame);
        }
        let timestamp_ms = timestamp_ms.filter(|&t| t > 0.0).unwrap_or(self.config.base_frame_interval_ms);

        let Some(prev_gray) = self.prev_gray.clone() else {
            self.reseed(frame);
            return Ok(self.status);
        };

        let prev_points = self.prev_points.clone().unwrap_or_default();
        let mut magnitude = try_track(&prev_gray, frame, &prev_points, &self.config, angle_tracker, intrinsics);

        if magnitude.is_none() {
            let refreshed = good_features_to_track(&prev_gray, &self.config.feature_params);
            magnitude = try_track(&prev_gray, frame, &refreshed, &self.config, angle_tracker, intrinsics);
        }

        let Some(magnitude) = magnitude else {
            self.reseed(frame);
            return Ok(self.status);
        };

        let normalized = magnitude * (self.config.base_frame_interval_ms as f32 / timestamp_ms as f32);
        push_bounded(&mut self.flow_history, normalized, self.config.history_len);

        self.reseed(frame);
        self.update_status();
        debug!(status = ?self.status, normalized, "accident detector update");
        Ok(self.status)
    }

    fn reseed(&mut self, frame: &GrayImage) {
        self.prev_points = Some(good_features_to_track(frame, &self.config.feature_params));
        self.prev_gray = Some(frame.clone());
    }

    fn update_status(&mut self) {
        if self.flow_history.len() < 5 {
            return;
        }
        let recent_avg: f32 = self.flow_history.iter().rev().take(5).sum::<f32>() / 5.0;
        if recent_avg > self.config.motion_magnitude_threshold {
            self.status = AccidentStatus::Incident;
            self.safe_counter = 0;
        } else if self.status == AccidentStatus::Incident {
            self.safe_counter += 1;
            if self.safe_counter >= self.config.safe_threshold {
                self.status = AccidentStatus::Safe;
                self.safe_counter = 0;
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> AccidentStatus {
        self.status
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, item: T, cap: usize) {
    if deque.len() >= cap {
        deque.pop_front();
    }
    deque.push_back(item);
}

/// Tracks `prev_points` into `next`, fits a RANSAC homography to estimate
/// camera motion (updating `angle_tracker` with its decomposed roll
/// angle), and returns the mean inlier motion magnitude. Returns `None` if
/// too few points survive tracking to form a usable estimate.
fn try_track(
    prev_gray: &GrayImage,
    next_gray: &GrayImage,
    prev_points: &[Point2f],
    config: &AccidentConfig,
    angle_tracker: &mut AngleHistogramTracker,
    intrinsics: &CameraIntrinsics,
) -> Option<f32> {
    if prev_points.len() < config.min_old_valid {
        return None;
    }

    let prev_pyr = build_pyramid(prev_gray, config.lk_params.max_level);
    let next_pyr = build_pyramid(next_gray, config.lk_params.max_level);
    let flow = calc_optical_flow_pyr_lk(&prev_pyr, &next_pyr, prev_points, &config.lk_params);

    let mut old_valid = Vec::new();
    let mut new_valid = Vec::new();
    for (i, result) in flow.iter().enumerate() {
        if result.found {
            old_valid.push(prev_points[i]);
            new_valid.push(result.point);
        }
    }
    if old_valid.len() < config.min_old_valid || new_valid.len() < config.min_new_valid {
        return None;
    }

    let (old_set, new_set) = match ransac_homography(&old_valid, &new_valid, &config.ransac) {
        Some((h, mask)) => {
            angle_tracker.set_homography(h);
            angle_tracker.update_with_homography(intrinsics);

            let inlier_count = mask.iter().filter(|&&m| m).count();
            if inlier_count < config.min_old_valid {
                (old_valid, new_valid)
            } else {
                let old_in: Vec<Point2f> =
                    old_valid.iter().zip(&mask).filter(|(_, &m)| m).map(|(p, _)| *p).collect();
                let new_in: Vec<Point2f> =
                    new_valid.iter().zip(&mask).filter(|(_, &m)| m).map(|(p, _)| *p).collect();
                (old_in, new_in)
            }
        }
        None => (old_valid, new_valid),
    };

    if old_set.is_empty() {
        return None;
    }
    let total: f32 = old_set.iter().zip(&new_set).map(|(o, n)| o.dist(n)).sum();
    Some(total / old_set.len() as f32)
}
