//! Integration tests for the ByteTrack-with-rotated-box multi-object tracker.

use std::sync::Arc;

use helmet_risk_common::{BoundingBox, ClassGroups, ClassId};
use helmet_risk_motion_tracking::{Detection, Tracker, TrackerArgs, TrackIdAllocator};

fn det(cx: f32, cy: f32, w: f32, h: f32, score: f32, class_id: u32) -> Detection {
    Detection {
        bbox: BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
        score,
        class_id: ClassId(class_id),
        mask: None,
    }
}

const FRAME: (u32, u32) = (640, 640);

fn new_tracker() -> Tracker {
    Tracker::new(TrackerArgs::default(), ClassGroups::default(), Arc::new(TrackIdAllocator::new()))
}

#[test]
fn empty_stream_reports_no_tracks() {
    let mut tracker = new_tracker();
    for _ in 0..10 {
        assert!(tracker.update(&[], FRAME).is_empty());
    }
}

#[test]
fn single_object_tracked_across_frames() {
    let mut tracker = new_tracker();
    let tracks0 = tracker.update(&[det(100.0, 100.0, 40.0, 60.0, 0.9, 1)], FRAME);
    assert_eq!(tracks0.len(), 1);
    let id = tracks0[0].id;

    let tracks1 = tracker.update(&[det(105.0, 103.0, 40.0, 60.0, 0.9, 1)], FRAME);
    assert_eq!(tracks1.len(), 1);
    assert_eq!(tracks1[0].id, id);

    let tracks2 = tracker.update(&[det(110.0, 106.0, 40.0, 60.0, 0.9, 1)], FRAME);
    assert_eq!(tracks2.len(), 1);
    assert_eq!(tracks2[0].id, id);
}

#[test]
fn multiple_simultaneous_objects_get_distinct_ids() {
    let mut tracker = new_tracker();
    let tracks = tracker.update(&[
        det(50.0, 50.0, 30.0, 30.0, 0.9, 1),
        det(500.0, 500.0, 30.0, 30.0, 0.9, 2),
        det(900.0, 100.0, 30.0, 30.0, 0.9, 6),
    ], FRAME);
    assert_eq!(tracks.len(), 3);
    let mut ids: Vec<_> = tracks.iter().map(|t| t.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[test]
fn track_survives_a_short_gap_via_lost_state() {
    let mut tracker = new_tracker();
    tracker.update(&[det(100.0, 100.0, 40.0, 60.0, 0.9, 1)], FRAME);
    // A couple of missed frames (within track_buffer=30) should not retire it.
    tracker.update(&[], FRAME);
    tracker.update(&[], FRAME);
    let tracks = tracker.update(&[det(102.0, 101.0, 40.0, 60.0, 0.9, 1)], FRAME);
    assert_eq!(tracks.len(), 1, "track should re-associate after a short gap");
}

#[test]
fn track_is_retired_after_max_time_lost() {
    let mut tracker = Tracker::new(
        TrackerArgs { track_buffer: 2, frame_rate: 30.0, ..Default::default() },
        ClassGroups::default(),
        Arc::new(TrackIdAllocator::new()),
    );
    tracker.update(&[det(100.0, 100.0, 40.0, 60.0, 0.9, 1)], FRAME);
    for _ in 0..5 {
        tracker.update(&[], FRAME);
    }
    // Long after max_time_lost, re-appearing in the same spot allocates a
    // fresh identity rather than reviving the retired one.
    tracker.update(&[det(100.0, 100.0, 40.0, 60.0, 0.9, 1)], FRAME);
    let tracks = tracker.update(&[det(101.0, 100.0, 40.0, 60.0, 0.9, 1)], FRAME);
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].id.0, 2);
}

#[test]
fn low_score_detections_never_spawn_new_tracks() {
    let mut tracker = new_tracker();
    let tracks = tracker.update(&[det(100.0, 100.0, 40.0, 60.0, 0.3, 1)], FRAME);
    assert!(tracks.is_empty(), "a detection below track_thresh must never create a track");
}

#[test]
fn track_ids_strictly_increase_and_are_never_reused() {
    let mut tracker = new_tracker();
    let mut seen = Vec::new();
    for i in 0..5 {
        let tracks = tracker.update(&[det(50.0 + i as f32 * 200.0, 50.0, 30.0, 30.0, 0.9, 1)], FRAME);
        seen.extend(tracks.iter().map(|t| t.id.0));
    }
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted, "ids must be assigned in strictly increasing order");
    let mut dedup = sorted.clone();
    dedup.dedup();
    assert_eq!(sorted, dedup, "no id may repeat");
}
