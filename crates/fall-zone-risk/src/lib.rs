//! Fall-zone (descending-staircase) risk engine (spec.md §4.4). Extracts a
//! trapezoid from each tracked fall-zone mask, finds the vanishing point of
//! its two lateral sides, and scores whether the stairs descend away from
//! the worker ahead of them.

use std::collections::HashMap;

use helmet_risk_common::{ErrorClass, ErrorClassify, Mask, Point2f, Severity, TrackId};
use helmet_risk_motion_tracking::TrackedObject;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FallZoneError {
    #[error("mask has no set pixels")]
    EmptyMask,
}

impl ErrorClassify for FallZoneError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::TransientInput
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallZoneConfig {
    pub first_alert_score_threshold: i32,
    pub bottom_point_distance: f32,
    pub max_missing_frames: u32,
    pub img_height: f32,
    pub stair_angle_deg: f32,
    pub stair_landing_height: f32,
    pub max_age: u64,
}

impl Default for FallZoneConfig {
    fn default() -> Self {
        Self {
            first_alert_score_threshold: 2,
            bottom_point_distance: 15.0,
            max_missing_frames: 14,
            img_height: 640.0,
            stair_angle_deg: 35.0,
            stair_landing_height: 287.0,
            max_age: 70,
        }
    }
}

/// The four corners of a mask-derived stair trapezoid.
#[derive(Debug, Clone, Copy)]
pub struct Trapezoid {
    pub top_left: Point2f,
    pub top_right: Point2f,
    pub bottom_left: Point2f,
    pub bottom_right: Point2f,
}

/// Finds the mask's bounding box and centroid, partitions set pixels into
/// the four quadrants around the centroid, and picks each corner as the
/// quadrant-local extremum spec.md §4.4 step 1 names. An empty quadrant
/// falls back to the corresponding bounding-box corner.
#[must_use]
pub fn extract_trapezoid(mask: &Mask) -> Result<Trapezoid, FallZoneError> {
    let pixels: Vec<(f32, f32)> = mask.set_pixels().map(|(x, y)| (x as f32, y as f32)).collect();
    if pixels.is_empty() {
        return Err(FallZoneError::EmptyMask);
    }

    let (mut min_x, mut max_x, mut min_y, mut max_y) = (f32::MAX, f32::MIN, f32::MAX, f32::MIN);
    for &(x, y) in &pixels {
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }
    let cx = (min_x + max_x) / 2.0;
    let cy = (min_y + max_y) / 2.0;

    // Q1 = upper-right, Q2 = upper-left, Q3 = lower-left, Q4 = lower-right.
    let q1: Vec<(f32, f32)> = pixels.iter().copied().filter(|&(x, y)| x >= cx && y < cy).collect();
    let q2: Vec<(f32, f32)> = pixels.iter().copied().filter(|&(x, y)| x < cx && y < cy).collect();
    let q3: Vec<(f32, f32)> = pixels.iter().copied().filter(|&(x, y)| x < cx && y >= cy).collect();
    let q4: Vec<(f32, f32)> = pixels.iter().copied().filter(|&(x, y)| x >= cx && y >= cy).collect();

    let top_left = argmin(&q2, |&(x, y)| x + y).map_or(Point2f::new(min_x, min_y), |(x, y)| Point2f::new(x, y));
    let top_right = argmin(&q1, |&(x, y)| -x + y).map_or(Point2f::new(max_x, min_y), |(x, y)| Point2f::new(x, y));
    let bottom_left = argmin(&q3, |&(x, y)| x - y).map_or(Point2f::new(min_x, max_y), |(x, y)| Point2f::new(x, y));
    let bottom_right = argmax(&q4, |&(x, y)| x + y).map_or(Point2f::new(max_x, max_y), |(x, y)| Point2f::new(x, y));

    Ok(Trapezoid { top_left, top_right, bottom_left, bottom_right })
}

fn argmin<T: Copy>(items: &[T], key: impl Fn(&T) -> f32) -> Option<T> {
    items.iter().copied().min_by(|a, b| key(a).partial_cmp(&key(b)).unwrap())
}

fn argmax<T: Copy>(items: &[T], key: impl Fn(&T) -> f32) -> Option<T> {
    items.iter().copied().max_by(|a, b| key(a).partial_cmp(&key(b)).unwrap())
}

/// `atan2(dy, dx)` in degrees for the right and left lateral sides, each
/// measured from its top corner to its bottom corner.
#[must_use]
pub fn side_angles_deg(trap: &Trapezoid) -> (f32, f32) {
    let right = (trap.bottom_right.y - trap.top_right.y).atan2(trap.bottom_right.x - trap.top_right.x).to_degrees();
    let left = (trap.bottom_left.y - trap.top_left.y).atan2(trap.bottom_left.x - trap.top_left.x).to_degrees();
    (right, left)
}

/// A valid descending trapezoid has its right side sloping down-right
/// (`[0, 90]`) and its left side sloping down-left (`[90, 180]` or
/// `[-180, -90]`), i.e. wider at the bottom.
#[must_use]
pub fn is_valid_trapezoid(trap: &Trapezoid) -> bool {
    let (right, left) = side_angles_deg(trap);
    let right_ok = (0.0..=90.0).contains(&right);
    let left_ok = (90.0..=180.0).contains(&left) || (-180.0..=-90.0).contains(&left);
    right_ok && left_ok
}

/// Intersection of the two lateral sides extended as infinite lines. Both
/// vertical and near-vertical sides are handled by the same cross-product
/// formulation (no special case is needed); parallel sides (equal slope)
/// yield `None`.
#[must_use]
pub fn vanishing_point(trap: &Trapezoid) -> Option<Point2f> {
    line_intersection(trap.top_left, trap.bottom_left, trap.top_right, trap.bottom_right)
}

fn line_intersection(p1: Point2f, p2: Point2f, p3: Point2f, p4: Point2f) -> Option<Point2f> {
    let d1x = p2.x - p1.x;
    let d1y = p2.y - p1.y;
    let d2x = p4.x - p3.x;
    let d2y = p4.y - p3.y;
    let denom = d1x * d2y - d1y * d2x;
    if denom.abs() < 1e-6 {
        return None;
    }
    let t = ((p3.x - p1.x) * d2y - (p3.y - p1.y) * d2x) / denom;
    Some(Point2f::new(p1.x + t * d1x, p1.y + t * d1y))
}

/// `reference_y` per spec.md §4.4 step 3, given the trapezoid's base
/// center y.
#[must_use]
pub fn reference_y(base_cy: f32, config: &FallZoneConfig) -> f32 {
    (config.img_height / 2.0 - (config.img_height - base_cy)
        - config.stair_landing_height * config.stair_angle_deg.to_radians().sin())
    .round()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Descending {
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Clone)]
struct FallZoneTrackerState {
    descending_score: i32,
    is_descending: Descending,
    status: Severity,
    first_alert_bottom_points: Option<(Point2f, Point2f)>,
    last_bottom_points: Option<(Point2f, Point2f)>,
    missing_frame_count: u32,
    last_seen_frame: u64,
}

impl FallZoneTrackerState {
    fn new(frame_id: u64) -> Self {
        Self {
            descending_score: 0,
            is_descending: Descending::Unknown,
            status: Severity::Safe,
            first_alert_bottom_points: None,
            last_bottom_points: None,
            missing_frame_count: 0,
            last_seen_frame: frame_id,
        }
    }

    fn reset_on_disappearance(&mut self) {
        self.is_descending = Descending::Unknown;
        self.descending_score = 0;
        self.status = Severity::Safe;
    }
}

/// Per-device fall-zone risk engine.
#[derive(Debug, Default)]
pub struct FallZoneRiskEngine {
    config: FallZoneConfig,
    trackers: HashMap<TrackId, FallZoneTrackerState>,
}

impl FallZoneRiskEngine {
    #[must_use]
    pub fn new(config: FallZoneConfig) -> Self {
        Self { config, trackers: HashMap::new() }
    }

    pub fn update(&mut self, tracks: &[TrackedObject], frame_id: u64) {
        for track in tracks {
            let state = self.trackers.entry(track.id).or_insert_with(|| FallZoneTrackerState::new(frame_id));
            state.missing_frame_count = 0;
            state.last_seen_frame = frame_id;

            let Some(mask) = &track.mask else { continue };
            let Ok(trap) = extract_trapezoid(mask) else { continue };
            if !is_valid_trapezoid(&trap) {
                continue;
            }
            let Some(vp) = vanishing_point(&trap) else { continue };

            let base_cy = (trap.bottom_left.y + trap.bottom_right.y) / 2.0;
            let ref_y = reference_y(base_cy, &self.config);

            if ref_y < vp.y {
                state.descending_score += 1;
            } else {
                state.descending_score -= 1;
            }
            if state.descending_score > 0 {
                state.is_descending = Descending::Yes;
            } else if state.descending_score < 0 {
                state.is_descending = Descending::No;
            }

            let current_points = (trap.bottom_left, trap.bottom_right);
            state.last_bottom_points = Some(current_points);

            if state.is_descending == Descending::Yes {
                match state.status {
                    Severity::Safe => {
                        if state.descending_score >= self.config.first_alert_score_threshold {
                            state.status = Severity::Warning;
                            state.first_alert_bottom_points = Some(current_points);
                        }
                    }
                    Severity::Warning => {
                        let (bl, br) = current_points;
                        let hit_bottom_edge =
                            br.y >= 0.99 * self.config.img_height || bl.y >= 0.99 * self.config.img_height;
                        let moved_up = state.first_alert_bottom_points.is_some_and(|(snap_l, snap_r)| {
                            (snap_l.y - bl.y) >= self.config.bottom_point_distance
                                || (snap_r.y - br.y) >= self.config.bottom_point_distance
                        });
                        if hit_bottom_edge || moved_up {
                            state.status = Severity::Danger;
                        }
                    }
                    Severity::Danger => {}
                }
            }
        }

        let present: std::collections::HashSet<TrackId> = tracks.iter().map(|t| t.id).collect();
        for (&id, state) in self.trackers.iter_mut() {
            if present.contains(&id) {
                continue;
            }
            state.missing_frame_count += 1;
            if state.missing_frame_count >= self.config.max_missing_frames {
                state.reset_on_disappearance();
            }
        }

        let max_age = self.config.max_age;
        self.trackers.retain(|_, state| frame_id.saturating_sub(state.last_seen_frame) <= max_age);

        debug!(frame_id, live = self.trackers.len(), severity = %self.severity(), "fall-zone engine update");
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.trackers.values().map(|s| s.status).max().unwrap_or(Severity::Safe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmet_risk_common::{BoundingBox, ClassId};

    /// A trapezoid-shaped mask: narrow at the top, wide at the bottom,
    /// i.e. stairs receding away from the camera.
    fn trapezoid_mask(width: u32, height: u32, top_half_width: u32, bottom_half_width: u32) -> Mask {
        let mut data = vec![false; (width * height) as usize];
        let cx = width as f32 / 2.0;
        for y in 0..height {
            let t = y as f32 / (height - 1) as f32;
            let half_width = top_half_width as f32 + t * (bottom_half_width as f32 - top_half_width as f32);
            let lo = (cx - half_width).max(0.0) as u32;
            let hi = (cx + half_width).min(width as f32 - 1.0) as u32;
            for x in lo..=hi {
                data[(y * width + x) as usize] = true;
            }
        }
        Mask::new(width, height, data)
    }

    fn tracked_with_mask(id: u64, mask: Mask) -> TrackedObject {
        TrackedObject {
            id: TrackId(id),
            tlbr: BoundingBox::new(0.0, 0.0, mask.width as f32, mask.height as f32),
            score: 0.9,
            class_id: ClassId(4),
            mask: Some(mask),
            rotated_box: None,
            frame_id: 0,
        }
    }

    #[test]
    fn trapezoid_extraction_matches_quadrant_corners() {
        let mask = trapezoid_mask(200, 200, 20, 80);
        let trap = extract_trapezoid(&mask).unwrap();
        assert!(trap.bottom_right.x > trap.top_right.x, "base must be wider than the top on the right");
        assert!(trap.bottom_left.x < trap.top_left.x, "base must be wider than the top on the left");
    }

    #[test]
    fn valid_descending_trapezoid_passes_angle_check() {
        let mask = trapezoid_mask(200, 200, 20, 80);
        let trap = extract_trapezoid(&mask).unwrap();
        assert!(is_valid_trapezoid(&trap));
    }

    #[test]
    fn empty_mask_yields_no_trapezoid() {
        let mask = Mask::new(10, 10, vec![false; 100]);
        assert!(extract_trapezoid(&mask).is_err());
    }

    #[test]
    fn reference_y_formula_matches_spec() {
        let config = FallZoneConfig::default();
        let base_cy = 500.0;
        let expected = (config.img_height / 2.0 - (config.img_height - base_cy) - 287.0 * 35f32.to_radians().sin()).round();
        assert_eq!(reference_y(base_cy, &config), expected);
    }

    #[test]
    fn absence_resets_state_after_max_missing_frames() {
        let mut engine = FallZoneRiskEngine::new(FallZoneConfig::default());
        let mask = trapezoid_mask(200, 640, 20, 90);
        for frame in 1..=3u64 {
            engine.update(&[tracked_with_mask(1, mask.clone())], frame);
        }
        for frame in 4..20u64 {
            engine.update(&[], frame);
        }
        assert_eq!(engine.severity(), Severity::Safe);
    }

    #[test]
    fn stale_tracker_purged_after_max_age() {
        let mut engine = FallZoneRiskEngine::new(FallZoneConfig::default());
        let mask = trapezoid_mask(200, 640, 20, 90);
        engine.update(&[tracked_with_mask(1, mask)], 1);
        engine.update(&[], 75);
        assert!(engine.trackers.is_empty());
    }

    #[test]
    fn no_tracks_reports_safe() {
        let engine = FallZoneRiskEngine::new(FallZoneConfig::default());
        assert_eq!(engine.severity(), Severity::Safe);
    }
}
