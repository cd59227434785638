//! Vehicle proximity risk engine (spec.md §4.5): watches each tracked
//! vehicle's bounding-box height grow against a per-track baseline
//! established over its first few confident detections, and raises an
//! alert once the growth implies the vehicle has closed distance.

use std::collections::HashMap;

use helmet_risk_common::{Severity, TrackId};
use helmet_risk_motion_tracking::TrackedObject;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleConfig {
    pub warning_threshold: f32,
    pub danger_threshold: f32,
    pub min_detection_confidence: f32,
    pub user_looked_away_frames: u32,
    pub min_valid_frames: u32,
    pub tracker_max_age: u64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.3,
            danger_threshold: 0.6,
            min_detection_confidence: 0.5,
            user_looked_away_frames: 7,
            min_valid_frames: 2,
            tracker_max_age: 30,
        }
    }
}

#[derive(Debug, Clone)]
struct VehicleTrackerState {
    initial_height: Option<f32>,
    height_sum: f32,
    valid_frames: u32,
    max_alert_level: Severity,
    consecutive_misses: u32,
    last_seen_frame: u64,
}

impl VehicleTrackerState {
    fn new(frame_id: u64) -> Self {
        Self {
            initial_height: None,
            height_sum: 0.0,
            valid_frames: 0,
            max_alert_level: Severity::Safe,
            consecutive_misses: 0,
            last_seen_frame: frame_id,
        }
    }

    fn reset_baseline(&mut self) {
        self.initial_height = None;
        self.height_sum = 0.0;
        self.valid_frames = 0;
        self.max_alert_level = Severity::Safe;
    }
}

/// Per-device vehicle risk engine.
#[derive(Debug, Default)]
pub struct VehicleRiskEngine {
    config: VehicleConfig,
    trackers: HashMap<TrackId, VehicleTrackerState>,
}

impl VehicleRiskEngine {
    #[must_use]
    pub fn new(config: VehicleConfig) -> Self {
        Self { config, trackers: HashMap::new() }
    }

    pub fn update(&mut self, tracks: &[TrackedObject], frame_id: u64) {
        for track in tracks {
            let state = self.trackers.entry(track.id).or_insert_with(|| VehicleTrackerState::new(frame_id));
            state.last_seen_frame = frame_id;

            if track.score < self.config.min_detection_confidence {
                state.consecutive_misses += 1;
                if state.consecutive_misses >= self.config.user_looked_away_frames {
                    state.reset_baseline();
                }
                continue;
            }
            state.consecutive_misses = 0;

            let height = track.tlbr.height();
            if state.initial_height.is_none() {
                state.height_sum += height;
                state.valid_frames += 1;
                if state.valid_frames >= self.config.min_valid_frames {
                    state.initial_height = Some(state.height_sum / state.valid_frames as f32);
                }
                continue;
            }

            let Some(initial) = state.initial_height else { continue };
            if initial <= 0.0 {
                continue;
            }
            let growth_ratio = (height - initial) / initial;

            let level = if growth_ratio >= self.config.danger_threshold {
                Severity::Danger
            } else if growth_ratio >= self.config.warning_threshold {
                Severity::Warning
            } else {
                Severity::Safe
            };
            // Alert level is monotonic within a baseline: it never drops back
            // down just because the vehicle's apparent height fluctuated.
            if level > state.max_alert_level {
                state.max_alert_level = level;
            }
        }

        let present: std::collections::HashSet<TrackId> = tracks.iter().map(|t| t.id).collect();
        for (&id, state) in self.trackers.iter_mut() {
            if present.contains(&id) {
                continue;
            }
            state.consecutive_misses += 1;
            if state.consecutive_misses >= self.config.user_looked_away_frames {
                state.reset_baseline();
            }
        }

        let max_age = self.config.tracker_max_age;
        self.trackers.retain(|_, state| frame_id.saturating_sub(state.last_seen_frame) <= max_age);

        debug!(frame_id, live = self.trackers.len(), severity = %self.severity(), "vehicle engine update");
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.trackers.values().map(|s| s.max_alert_level).max().unwrap_or(Severity::Safe)
    }
}
