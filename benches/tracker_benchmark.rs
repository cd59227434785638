// Tracker association benchmark - measure update() cost at varying detection counts
//
// Run with: cargo bench --bench tracker_benchmark

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use helmet_risk_common::{BoundingBox, ClassGroups, ClassId};
use helmet_risk_motion_tracking::{Detection, Tracker, TrackIdAllocator, TrackerArgs};

/// `(height, width)` of the synthetic frame the benchmarked detections are
/// expressed in, matching `TrackerArgs::default().input_size` so `update`'s
/// stage-1 rescale is a no-op and doesn't skew the measured association cost.
const FRAME: (u32, u32) = (640, 640);

/// A synthetic frame of detections scattered across a 1920x1080 image, one
/// per tracked class so every detection lands in the tracker's class-gated
/// association pass.
fn synthetic_detections(count: usize) -> Vec<Detection> {
    (0..count)
        .map(|i| {
            let x = (i as f32 * 37.0) % 1800.0;
            let y = (i as f32 * 53.0) % 1000.0;
            Detection {
                bbox: BoundingBox::new(x, y, x + 80.0, y + 80.0),
                score: 0.6 + (i % 4) as f32 * 0.1,
                class_id: ClassId((i % 5) as u32),
                mask: None,
            }
        })
        .collect()
}

/// Re-running the same detections each frame exercises the steady-state
/// association path (existing tracks, not new births) after a short warmup.
fn bench_update_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_update");

    for count in [10usize, 50, 200] {
        group.bench_with_input(BenchmarkId::new("detections", count), &count, |b, &count| {
            let detections = synthetic_detections(count);
            let id_alloc = Arc::new(TrackIdAllocator::new());
            let mut tracker = Tracker::new(TrackerArgs::default(), ClassGroups::default(), id_alloc);
            for _ in 0..5 {
                tracker.update(&detections, FRAME);
            }

            b.iter(|| {
                let tracks = tracker.update(black_box(&detections), FRAME);
                black_box(tracks);
            });
        });
    }

    group.finish();
}

/// Cold-start association: every detection is a new track birth.
fn bench_update_cold_start(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_update_cold_start");

    group.bench_function("200_new_tracks", |b| {
        b.iter(|| {
            let id_alloc = Arc::new(TrackIdAllocator::new());
            let mut tracker = Tracker::new(TrackerArgs::default(), ClassGroups::default(), id_alloc);
            let tracks = tracker.update(black_box(&synthetic_detections(200)), FRAME);
            black_box(tracks);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_update_steady_state, bench_update_cold_start);
criterion_main!(benches);
