//! Multi-object tracker: ByteTrack's two-stage high/low-score association
//! extended with rotated-box support for mask-bearing classes (spec.md
//! §4.2). Owns no downstream risk logic — it only assigns and retires
//! persistent [`TrackId`]s and reports the currently confirmed tracks.

pub mod geometry;
pub mod matching;
pub mod track;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use helmet_risk_common::{BoundingBox, ClassGroups, ClassId, ErrorClass, ErrorClassify, Mask, RotatedBox, TrackId};
use helmet_risk_kalman_filter::{KalmanFilter, KalmanState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use geometry::{rotated_box_from_mask, rotated_iou};
use matching::{fuse_score, linear_assignment, position_weighted_similarity};
pub use track::{Track, TrackState};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("detection batch has mismatched boxes/scores/classes lengths")]
    MalformedBatch,
}

impl ErrorClassify for TrackerError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::TransientInput
    }
}

/// One frame's detection, as produced by the external detector adapter
/// (spec.md §6). Masks are only present for classes the detector segments.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class_id: ClassId,
    pub mask: Option<Mask>,
}

/// Tracker configuration (spec.md §3 `TrackerArgs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerArgs {
    pub track_thresh: f32,
    pub track_buffer: u32,
    pub match_thresh: f32,
    pub mot20: bool,
    /// Frames per second this tracker instance runs at; feeds `max_time_lost`.
    pub frame_rate: f32,
    /// `(height, width)` the detector's boxes are expressed in — the model's
    /// input resolution, not necessarily the decoded frame's own size (spec.md
    /// §4.2 step 1's `input_h`/`input_w`).
    pub input_size: (u32, u32),
}

impl Default for TrackerArgs {
    fn default() -> Self {
        Self {
            track_thresh: 0.5,
            track_buffer: 30,
            match_thresh: 0.8,
            mot20: false,
            frame_rate: 30.0,
            input_size: (640, 640),
        }
    }
}

impl TrackerArgs {
    #[must_use]
    pub fn det_thresh(&self) -> f32 {
        self.track_thresh + 0.1
    }

    #[must_use]
    pub fn max_time_lost(&self) -> u64 {
        (self.frame_rate / 30.0 * self.track_buffer as f32).round() as u64
    }
}

const LOW_SCORE_MIN: f32 = 0.1;
const SECOND_STAGE_COST_CAP: f32 = 0.5;
const UNCONFIRMED_COST_CAP: f32 = 0.7;
const DEDUPE_IOU_THRESH: f32 = 0.85;
const POSITION_WEIGHT: f32 = 0.4;
const MAX_CENTER_DIST: f32 = 80.0;

/// Process-wide, never-reused track-id allocator (spec.md §3/§5). Shared
/// across every device's [`Tracker`] via `Arc` since track ids are a single
/// global counter, not per-device.
#[derive(Debug, Default)]
pub struct TrackIdAllocator(AtomicU64);

impl TrackIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    #[must_use]
    pub fn next(&self) -> TrackId {
        TrackId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A currently confirmed, activated track enriched with its latest
/// observation (spec.md §4.2 "Output").
#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub id: TrackId,
    pub tlbr: BoundingBox,
    pub score: f32,
    pub class_id: ClassId,
    pub mask: Option<Mask>,
    pub rotated_box: Option<RotatedBox>,
    pub frame_id: u64,
}

impl TrackedObject {
    fn from_track(track: &Track) -> Self {
        Self {
            id: track.id,
            tlbr: track.tlbr(),
            score: track.score,
            class_id: track.class_id,
            mask: track.mask.clone(),
            rotated_box: track.rotated_box,
            frame_id: track.frame_id,
        }
    }
}

struct ScoredDetection<'a> {
    det: &'a Detection,
    rotated_box: Option<RotatedBox>,
}

/// ByteTrack-with-rotated-box multi-object tracker. One instance per
/// connected device; holds no state shared with any other device.
pub struct Tracker {
    args: TrackerArgs,
    class_groups: ClassGroups,
    kf: KalmanFilter,
    id_alloc: Arc<TrackIdAllocator>,
    /// Tracks not yet retired: mix of `New` (unconfirmed), `Tracked` and
    /// `Lost` states, partitioned fresh at the top of every `update`.
    tracks: Vec<Track>,
    frame_id: u64,
}

impl Tracker {
    #[must_use]
    pub fn new(args: TrackerArgs, class_groups: ClassGroups, id_alloc: Arc<TrackIdAllocator>) -> Self {
        Self {
            args,
            class_groups,
            kf: KalmanFilter::new(),
            id_alloc,
            tracks: Vec::new(),
            frame_id: 0,
        }
    }

    /// The current frame counter, incremented once per [`Tracker::update`]
    /// call. Callers that need to age per-track state on frames with zero
    /// detections (the per-class risk engines) read this rather than
    /// deriving a frame id from the (possibly empty) output.
    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Runs one frame of the ten-stage association pipeline (spec.md §4.2)
    /// and returns the currently activated, tracked objects. `frame_size` is
    /// the decoded frame's own `(height, width)` (spec.md's `img_h`/`img_w`);
    /// boxes are rescaled from `args.input_size` into that space before any
    /// cost is computed (stage 1).
    pub fn update(&mut self, detections: &[Detection], frame_size: (u32, u32)) -> Vec<TrackedObject> {
        self.frame_id += 1;
        let frame_id = self.frame_id;

        let (input_h, input_w) = self.args.input_size;
        let (img_h, img_w) = frame_size;
        let scale = (input_h as f32 / img_h as f32).min(input_w as f32 / img_w as f32);
        let scaled: Vec<Detection> = detections
            .iter()
            .map(|det| Detection { bbox: scale_bbox(&det.bbox, scale), ..det.clone() })
            .collect();

        let scored: Vec<ScoredDetection<'_>> = scaled
            .iter()
            .map(|det| {
                let rotated_box = if self.class_groups.wants_rotated_box(det.class_id) {
                    det.mask.as_ref().and_then(rotated_box_from_mask)
                } else {
                    None
                };
                ScoredDetection { det, rotated_box }
            })
            .collect();

        let high: Vec<&ScoredDetection<'_>> = scored.iter().filter(|d| d.det.score > self.args.track_thresh).collect();
        let low: Vec<&ScoredDetection<'_>> = scored
            .iter()
            .filter(|d| d.det.score > LOW_SCORE_MIN && d.det.score <= self.args.track_thresh)
            .collect();

        // Stage 3: partition existing tracks, build the predicted pool.
        let existing = std::mem::take(&mut self.tracks);
        let (mut unconfirmed, mut pool): (Vec<Track>, Vec<Track>) =
            existing.into_iter().partition(|t| t.state == TrackState::New);
        let pool_was_tracked: Vec<bool> = pool.iter().map(|t| t.state == TrackState::Tracked).collect();

        self.multi_predict(&mut pool);

        // Stage 4: first association (high-score detections).
        let cost = self.cost_matrix(&pool, &high);
        let mut cost = cost;
        if !self.args.mot20 {
            let scores: Vec<f32> = high.iter().map(|d| d.det.score).collect();
            fuse_score(&mut cost, &scores);
        }
        let assignment = linear_assignment(&cost, self.args.match_thresh);

        let mut pool_matched = vec![false; pool.len()];
        let mut high_matched = vec![false; high.len()];
        for &(p, h) in &assignment.matches {
            self.apply_match(&mut pool[p], high[h], frame_id);
            pool_matched[p] = true;
            high_matched[h] = true;
        }

        // Stage 5: second association — only tracks that were TRACKED
        // (not LOST) entering stage 4, still unmatched, against low-score.
        let second_stage_rows: Vec<usize> =
            (0..pool.len()).filter(|&p| !pool_matched[p] && pool_was_tracked[p]).collect();
        if !second_stage_rows.is_empty() && !low.is_empty() {
            let rows: Vec<&Track> = second_stage_rows.iter().map(|&p| &pool[p]).collect();
            let low_cost = self.iou_only_cost_matrix(&rows, &low);
            let low_assignment = linear_assignment(&low_cost, SECOND_STAGE_COST_CAP);
            let mut low_matched = vec![false; low.len()];
            for &(row, l) in &low_assignment.matches {
                let p = second_stage_rows[row];
                self.apply_match(&mut pool[p], low[l], frame_id);
                pool_matched[p] = true;
                low_matched[l] = true;
            }
        }

        // Stage 6: remaining unmatched tracks that were TRACKED become LOST.
        for (p, track) in pool.iter_mut().enumerate() {
            if !pool_matched[p] && pool_was_tracked[p] {
                track.mark_lost();
            }
        }

        // Stage 7: unconfirmed association against still-unmatched high dets.
        let unmatched_high: Vec<&ScoredDetection<'_>> =
            high.iter().enumerate().filter(|(h, _)| !high_matched[*h]).map(|(_, d)| *d).collect();
        let unmatched_high_idx: Vec<usize> = (0..high.len()).filter(|&h| !high_matched[h]).collect();

        let mut unconfirmed_cost = self.cost_matrix(&unconfirmed, &unmatched_high);
        if !self.args.mot20 {
            let scores: Vec<f32> = unmatched_high.iter().map(|d| d.det.score).collect();
            fuse_score(&mut unconfirmed_cost, &scores);
        }
        let unconfirmed_assignment = linear_assignment(&unconfirmed_cost, UNCONFIRMED_COST_CAP);

        let mut unconfirmed_matched = vec![false; unconfirmed.len()];
        let mut high_matched_stage7 = vec![false; unmatched_high.len()];
        for &(u, h) in &unconfirmed_assignment.matches {
            self.apply_match(&mut unconfirmed[u], unmatched_high[h], frame_id);
            unconfirmed_matched[u] = true;
            high_matched_stage7[h] = true;
        }
        for (u, track) in unconfirmed.iter_mut().enumerate() {
            if !unconfirmed_matched[u] {
                track.mark_removed();
            }
        }

        // Stage 8: spawn new tracks from detections still unmatched here,
        // clearing det_thresh. Activated immediately only on frame 1.
        let mut newly_created = Vec::new();
        for (h, det) in unmatched_high.iter().enumerate() {
            if high_matched_stage7[h] {
                continue;
            }
            if det.det.score < self.args.det_thresh() {
                continue;
            }
            let activate_now = frame_id == 1;
            let track = Track::new(
                self.id_alloc.next(),
                &self.kf,
                &det.det.bbox,
                det.det.class_id,
                det.det.score,
                frame_id,
                det.det.mask.clone(),
                det.rotated_box,
                activate_now,
            );
            newly_created.push(track);
        }
        let _ = unmatched_high_idx;

        // Stage 9: retire long-lost tracks.
        let max_time_lost = self.args.max_time_lost();
        pool.retain(|t| {
            if t.state == TrackState::Lost && frame_id.saturating_sub(t.end_frame) > max_time_lost {
                false
            } else {
                true
            }
        });

        // Reassemble: tracked/lost pool + surviving unconfirmed + new.
        let mut all: Vec<Track> = pool;
        all.retain(|t| t.state != TrackState::Removed);
        all.extend(unconfirmed.into_iter().filter(|t| t.state != TrackState::Removed));
        all.extend(newly_created);

        // Stage 10: dedupe TRACKED/LOST pairs with high overlap.
        dedupe_overlapping(&mut all, DEDUPE_IOU_THRESH);

        let out: Vec<TrackedObject> = all
            .iter()
            .filter(|t| t.state == TrackState::Tracked && t.is_activated)
            .map(TrackedObject::from_track)
            .collect();

        debug!(frame_id, live = all.len(), reported = out.len(), "tracker update");
        self.tracks = all;
        out
    }

    fn multi_predict(&self, pool: &mut [Track]) {
        let mut states: Vec<KalmanState> = pool.iter().map(|t| t.kalman_state.clone()).collect();
        self.kf.multi_predict(&mut states);
        for (track, state) in pool.iter_mut().zip(states) {
            track.kalman_state = state;
        }
    }

    fn apply_match(&self, track: &mut Track, det: &ScoredDetection<'_>, frame_id: u64) {
        track.update(&self.kf, &det.det.bbox, det.det.score, det.det.mask.clone(), det.rotated_box, frame_id);
    }

    /// `1 - IoU` (or position-weighted rotated-IoU combo where eligible)
    /// cost matrix between a track pool and a set of detections.
    fn cost_matrix(&self, tracks: &[Track], dets: &[&ScoredDetection<'_>]) -> Vec<Vec<f32>> {
        tracks
            .iter()
            .map(|t| {
                dets.iter()
                    .map(|d| {
                        let both_eligible = self.class_groups.wants_rotated_box(t.class_id)
                            && self.class_groups.wants_rotated_box(d.det.class_id)
                            && t.rotated_box.is_some()
                            && d.rotated_box.is_some();
                        if both_eligible {
                            let tb = t.rotated_box.expect("checked above");
                            let db = d.rotated_box.expect("checked above");
                            let riou = rotated_iou(&tb, &db);
                            let center_dist = tb.center.dist(&db.center);
                            let sim = position_weighted_similarity(riou, center_dist, POSITION_WEIGHT, MAX_CENTER_DIST);
                            1.0 - sim
                        } else {
                            1.0 - t.tlbr().iou(&d.det.bbox)
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Plain axis-aligned `1 - IoU`, no rotated-box combo — used by the
    /// low-score second association (spec.md §4.2 stage 5).
    fn iou_only_cost_matrix(&self, tracks: &[&Track], dets: &[&ScoredDetection<'_>]) -> Vec<Vec<f32>> {
        tracks.iter().map(|t| dets.iter().map(|d| 1.0 - t.tlbr().iou(&d.det.bbox)).collect()).collect()
    }
}

/// Stage 1 (spec.md §4.2): rescales a detector-space box into the decoded
/// frame's own coordinate space by dividing through by `scale`.
fn scale_bbox(bbox: &BoundingBox, scale: f32) -> BoundingBox {
    BoundingBox::new(bbox.x1 / scale, bbox.y1 / scale, bbox.x2 / scale, bbox.y2 / scale)
}

/// Stage 10: for any `(tracked, lost)` pair with IoU above `thresh`, keeps
/// the longer-lived one and removes the other.
fn dedupe_overlapping(tracks: &mut [Track], thresh: f32) {
    let n = tracks.len();
    let mut removed = vec![false; n];
    for i in 0..n {
        if removed[i] || tracks[i].state != TrackState::Tracked {
            continue;
        }
        for j in 0..n {
            if i == j || removed[j] || tracks[j].state != TrackState::Lost {
                continue;
            }
            if tracks[i].tlbr().iou(&tracks[j].tlbr()) > thresh {
                if tracks[i].lifetime_in_state() >= tracks[j].lifetime_in_state() {
                    removed[j] = true;
                } else {
                    removed[i] = true;
                    break;
                }
            }
        }
    }
    for (track, is_removed) in tracks.iter_mut().zip(removed) {
        if is_removed {
            track.mark_removed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmet_risk_common::ClassId;

    /// Frame size matching `TrackerArgs::default().input_size`, so `scale`
    /// is 1.0 and these tests' box coordinates pass through unchanged.
    const FRAME: (u32, u32) = (640, 640);

    fn det(cx: f32, cy: f32, w: f32, h: f32, score: f32, class_id: u32) -> Detection {
        Detection {
            bbox: BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
            score,
            class_id: ClassId(class_id),
            mask: None,
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(TrackerArgs::default(), ClassGroups::default(), Arc::new(TrackIdAllocator::new()))
    }

    #[test]
    fn first_frame_activates_immediately() {
        let mut tracker = tracker();
        let tracks = tracker.update(&[det(100.0, 100.0, 50.0, 50.0, 0.9, 1)], FRAME);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, TrackId(1));
    }

    #[test]
    fn track_id_persists_across_frames_for_same_object() {
        let mut tracker = tracker();
        let tracks0 = tracker.update(&[det(100.0, 100.0, 50.0, 50.0, 0.9, 1)], FRAME);
        let tracks1 = tracker.update(&[det(102.0, 101.0, 50.0, 50.0, 0.9, 1)], FRAME);
        assert_eq!(tracks0[0].id, tracks1[0].id);
    }

    #[test]
    fn new_object_on_second_frame_requires_confirmation() {
        let mut tracker = tracker();
        // frame 1: one object, activates immediately per spec.
        tracker.update(&[det(100.0, 100.0, 50.0, 50.0, 0.9, 1)], FRAME);
        // frame 2: a brand new object appears — should not report until frame 3.
        let tracks = tracker.update(&[det(100.0, 100.0, 50.0, 50.0, 0.9, 1), det(400.0, 400.0, 50.0, 50.0, 0.9, 1)], FRAME);
        assert_eq!(tracks.len(), 1, "new object must wait for a second association");
        let tracks = tracker.update(&[det(102.0, 101.0, 50.0, 50.0, 0.9, 1), det(402.0, 401.0, 50.0, 50.0, 0.9, 1)], FRAME);
        assert_eq!(tracks.len(), 2, "second association confirms the new track");
    }

    #[test]
    fn distinct_objects_receive_distinct_ids() {
        let mut tracker = tracker();
        let tracks = tracker.update(&[det(50.0, 50.0, 30.0, 30.0, 0.9, 1), det(500.0, 500.0, 30.0, 30.0, 0.9, 1)], FRAME);
        assert_eq!(tracks.len(), 2);
        assert_ne!(tracks[0].id, tracks[1].id);
    }

    #[test]
    fn track_ids_are_never_reused_after_loss() {
        let mut tracker = Tracker::new(
            TrackerArgs { track_buffer: 1, frame_rate: 30.0, ..Default::default() },
            ClassGroups::default(),
            Arc::new(TrackIdAllocator::new()),
        );
        tracker.update(&[det(100.0, 100.0, 50.0, 50.0, 0.9, 1)], FRAME);
        let first_id = tracker.update(&[], FRAME);
        assert!(first_id.is_empty());
        // Long absence retires the track; a new detection must allocate a fresh id.
        for _ in 0..5 {
            tracker.update(&[], FRAME);
        }
        // Past frame 1, a brand new track needs a second association to confirm.
        let tracks = tracker.update(&[det(100.0, 100.0, 50.0, 50.0, 0.9, 1)], FRAME);
        assert!(tracks.is_empty());
        let tracks = tracker.update(&[det(101.0, 100.0, 50.0, 50.0, 0.9, 1)], FRAME);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, TrackId(2));
    }

    #[test]
    fn low_score_detection_keeps_track_alive_but_never_creates_one() {
        let mut tracker = tracker();
        tracker.update(&[det(100.0, 100.0, 50.0, 50.0, 0.9, 1)], FRAME);
        let tracks = tracker.update(&[det(103.0, 102.0, 50.0, 50.0, 0.3, 1)], FRAME);
        assert_eq!(tracks.len(), 1, "low-score match keeps the existing track tracked");
    }

    #[test]
    fn empty_frame_reports_no_tracks() {
        let mut tracker = tracker();
        assert!(tracker.update(&[], FRAME).is_empty());
    }

    #[test]
    fn max_time_lost_matches_frame_rate_formula() {
        let args = TrackerArgs { frame_rate: 7.0, track_buffer: 30, ..Default::default() };
        assert_eq!(args.max_time_lost(), (7.0 / 30.0 * 30.0_f32).round() as u64);
    }

    #[test]
    fn boxes_are_rescaled_from_input_size_into_frame_size() {
        // Detector boxes are expressed in a 320x320 input space but the
        // decoded frame is 640x640: scale = min(320/640, 320/640) = 0.5, so
        // a box of (40,40)-(80,80) lands at (80,80)-(160,160) in frame space.
        let args = TrackerArgs { input_size: (320, 320), ..Default::default() };
        let mut tracker = Tracker::new(args, ClassGroups::default(), Arc::new(TrackIdAllocator::new()));
        let small_space_det =
            Detection { bbox: BoundingBox::new(40.0, 40.0, 80.0, 80.0), score: 0.9, class_id: ClassId(1), mask: None };
        let tracks = tracker.update(&[small_space_det], (640, 640));
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].tlbr, BoundingBox::new(80.0, 80.0, 160.0, 160.0));
    }
}
