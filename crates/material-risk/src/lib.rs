//! Construction-material risk engine (spec.md §4.3): watches each tracked
//! material object's mask-derived rotated box grow in frame and raises an
//! alert once its shorter side has grown consistently past the worker's
//! initial reference size.

use std::collections::{HashMap, VecDeque};

use helmet_risk_common::{Severity, TrackId};
use helmet_risk_motion_tracking::TrackedObject;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialConfig {
    pub history_size: usize,
    pub min_frames_for_detection: usize,
    pub first_alert_threshold: f32,
    pub second_alert_ratio_threshold: f32,
    pub second_alert_absolute_threshold: f32,
    pub min_detection_confidence: f32,
    pub consecutive_frames_required: u32,
    pub max_consecutive_misses: u32,
    pub max_age: u64,
}

impl Default for MaterialConfig {
    fn default() -> Self {
        Self {
            history_size: 30,
            min_frames_for_detection: 5,
            first_alert_threshold: 1.10,
            second_alert_ratio_threshold: 1.25,
            second_alert_absolute_threshold: 1.35,
            min_detection_confidence: 0.7,
            consecutive_frames_required: 3,
            max_consecutive_misses: 10,
            max_age: 60,
        }
    }
}

#[derive(Debug, Clone)]
struct MaterialTrackerState {
    history: VecDeque<(u64, f32)>,
    initial_reference_size: Option<f32>,
    first_alert_reference_size: Option<f32>,
    status: Severity,
    warning_frame_count: u32,
    danger_frame_count: u32,
    consecutive_misses: u32,
    last_seen_frame: u64,
}

impl MaterialTrackerState {
    fn new(frame_id: u64) -> Self {
        Self {
            history: VecDeque::new(),
            initial_reference_size: None,
            first_alert_reference_size: None,
            status: Severity::Safe,
            warning_frame_count: 0,
            danger_frame_count: 0,
            consecutive_misses: 0,
            last_seen_frame: frame_id,
        }
    }
}

/// Per-device material risk engine. Holds one [`MaterialTrackerState`] per
/// track id; never mutates the tracks it observes.
#[derive(Debug, Default)]
pub struct MaterialRiskEngine {
    config: MaterialConfig,
    trackers: HashMap<TrackId, MaterialTrackerState>,
}

impl MaterialRiskEngine {
    #[must_use]
    pub fn new(config: MaterialConfig) -> Self {
        Self { config, trackers: HashMap::new() }
    }

    /// Observes every currently tracked material object for this frame,
    /// then ages out any tracker not seen this frame and purges stale ones.
    pub fn update(&mut self, tracks: &[TrackedObject], frame_id: u64) {
        for track in tracks {
            let state = self.trackers.entry(track.id).or_insert_with(|| MaterialTrackerState::new(frame_id));

            let Some(rotated_box) = track.rotated_box else { continue };
            if track.score < self.config.min_detection_confidence {
                continue;
            }
            state.consecutive_misses = 0;
            state.last_seen_frame = frame_id;

            let shorter_side = rotated_box.shorter_side();
            push_bounded(&mut state.history, (frame_id, shorter_side), self.config.history_size);

            if state.initial_reference_size.is_none() {
                if state.history.len() >= self.config.min_frames_for_detection {
                    let sizes: Vec<f32> = state.history.iter().map(|(_, s)| *s).collect();
                    state.initial_reference_size = Some(filtered_median(&sizes));
                }
                continue;
            }

            let Some(initial) = state.initial_reference_size else { continue };
            if initial <= 0.0 {
                continue;
            }
            let ratio = shorter_side / initial;

            match state.status {
                Severity::Safe => {
                    if ratio >= self.config.first_alert_threshold {
                        state.warning_frame_count += 1;
                    } else {
                        state.warning_frame_count = 0;
                    }
                    if state.warning_frame_count >= self.config.consecutive_frames_required {
                        state.status = Severity::Warning;
                        state.first_alert_reference_size = Some(shorter_side);
                        state.danger_frame_count = 0;
                    }
                }
                Severity::Warning => {
                    let from_first_alert = state
                        .first_alert_reference_size
                        .filter(|&r| r > 0.0)
                        .map_or(0.0, |r| shorter_side / r);
                    if ratio >= self.config.second_alert_absolute_threshold {
                        state.danger_frame_count += 1;
                    } else {
                        state.danger_frame_count = 0;
                    }
                    if from_first_alert >= self.config.second_alert_ratio_threshold
                        || state.danger_frame_count >= self.config.consecutive_frames_required
                    {
                        state.status = Severity::Danger;
                    }
                }
                Severity::Danger => {}
            }
        }

        let present: std::collections::HashSet<TrackId> = tracks.iter().map(|t| t.id).collect();
        for (&id, state) in self.trackers.iter_mut() {
            if present.contains(&id) {
                continue;
            }
            state.consecutive_misses += 1;
            if state.consecutive_misses >= self.config.max_consecutive_misses {
                state.status = Severity::Safe;
                state.first_alert_reference_size = None;
                state.warning_frame_count = 0;
                state.danger_frame_count = 0;
            }
        }

        let max_age = self.config.max_age;
        self.trackers.retain(|_, state| frame_id.saturating_sub(state.last_seen_frame) <= max_age);

        debug!(frame_id, live = self.trackers.len(), severity = %self.severity(), "material engine update");
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.trackers.values().map(|s| s.status).max().unwrap_or(Severity::Safe)
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, item: T, cap: usize) {
    if deque.len() >= cap {
        deque.pop_front();
    }
    deque.push_back(item);
}

/// Median of `values` after rejecting outliers outside `[Q1-1.5*IQR,
/// Q3+1.5*IQR]` (quartiles taken at indices `n/4` and `3n/4` of the sorted
/// list). Falls back to the raw median if every value is rejected.
fn filtered_median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let q1 = sorted[n / 4];
    let q3 = sorted[((3 * n) / 4).min(n - 1)];
    let iqr = q3 - q1;
    let lo = q1 - 1.5 * iqr;
    let hi = q3 + 1.5 * iqr;
    let filtered: Vec<f32> = sorted.iter().copied().filter(|&v| v >= lo && v <= hi).collect();
    if filtered.is_empty() {
        median_of_sorted(&sorted)
    } else {
        median_of_sorted(&filtered)
    }
}

fn median_of_sorted(sorted: &[f32]) -> f32 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmet_risk_common::{ClassId, RotatedBox};

    fn tracked(id: u64, shorter_side: f32, score: f32) -> TrackedObject {
        TrackedObject {
            id: TrackId(id),
            tlbr: helmet_risk_common::BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            score,
            class_id: ClassId(3),
            mask: None,
            rotated_box: Some(RotatedBox {
                center: helmet_risk_common::Point2f::new(50.0, 50.0),
                size: (shorter_side, shorter_side * 2.0),
                angle_deg: 0.0,
            }),
            frame_id: 0,
        }
    }

    #[test]
    fn stable_size_stays_safe() {
        let mut engine = MaterialRiskEngine::new(MaterialConfig::default());
        for frame in 1..=30u64 {
            engine.update(&[tracked(1, 100.0, 0.9)], frame);
        }
        assert_eq!(engine.severity(), Severity::Safe);
    }

    #[test]
    fn no_evaluation_before_stabilization_window() {
        let mut engine = MaterialRiskEngine::new(MaterialConfig::default());
        for frame in 1..=4u64 {
            engine.update(&[tracked(1, 100.0 + frame as f32 * 50.0, 0.9)], frame);
            assert_eq!(engine.severity(), Severity::Safe, "no evaluation before frame 5");
        }
    }

    #[test]
    fn growth_past_thresholds_reaches_danger() {
        let mut engine = MaterialRiskEngine::new(MaterialConfig::default());
        let sizes = [100.0, 100.0, 100.0, 100.0, 100.0, 101.0, 110.0, 112.0, 115.0, 140.0, 142.0, 145.0];
        let mut last = Severity::Safe;
        for (i, &size) in sizes.iter().enumerate() {
            engine.update(&[tracked(1, size, 0.9)], (i + 1) as u64);
            last = engine.severity();
        }
        assert_eq!(last, Severity::Danger);
    }

    #[test]
    fn low_confidence_frame_does_not_update_history() {
        let mut engine = MaterialRiskEngine::new(MaterialConfig::default());
        for frame in 1..=5u64 {
            engine.update(&[tracked(1, 100.0, 0.9)], frame);
        }
        // Low-confidence frame with a huge jump must be ignored.
        engine.update(&[tracked(1, 500.0, 0.1)], 6);
        assert_eq!(engine.severity(), Severity::Safe);
    }

    #[test]
    fn absence_reset_after_ten_misses() {
        let mut engine = MaterialRiskEngine::new(MaterialConfig::default());
        for frame in 1..=8u64 {
            engine.update(&[tracked(1, 100.0 + frame as f32 * 5.0, 0.9)], frame);
        }
        assert_eq!(engine.severity(), Severity::Warning);
        for frame in 9..19u64 {
            engine.update(&[], frame);
        }
        assert_eq!(engine.severity(), Severity::Safe);
    }

    #[test]
    fn low_confidence_presence_does_not_reset_miss_counter_or_last_seen() {
        let mut engine = MaterialRiskEngine::new(MaterialConfig::default());
        engine.update(&[tracked(1, 100.0, 0.9)], 1);
        // The track stays present every frame but drops below the
        // confidence gate: it's neither updated (gated out) nor counted as
        // missing (it's still in this frame's track list), so its miss
        // counter and last-seen timestamp must stay exactly where the first
        // good frame left them.
        for frame in 2..=11u64 {
            engine.update(&[tracked(1, 100.0, 0.1)], frame);
        }
        let state = engine.trackers.get(&TrackId(1)).unwrap();
        assert_eq!(state.consecutive_misses, 0);
        assert_eq!(state.last_seen_frame, 1);
    }

    #[test]
    fn stale_tracker_purged_after_max_age() {
        let mut engine = MaterialRiskEngine::new(MaterialConfig::default());
        engine.update(&[tracked(1, 100.0, 0.9)], 1);
        engine.update(&[], 65);
        assert!(engine.trackers.is_empty());
    }
}
