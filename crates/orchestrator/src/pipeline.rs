//! Per-device pipeline (spec.md §5): owns one [`Tracker`], one engine-state
//! map per risk class, one [`AccidentDetector`] and one
//! [`AngleHistogramTracker`]. Each incoming frame fans out into the
//! `tracked_path`/`accident_path` task graph, joined at the end to produce
//! one risk code. [`PipelineRegistry`] owns one [`Pipeline`] per connected
//! device plus the process-wide track-id allocator they share.

use std::collections::HashMap;
use std::sync::Arc;

use helmet_risk_accident_detection::{AccidentConfig, AccidentDetector, AccidentStatus};
use helmet_risk_angle_tracker::{AngleHistogramTracker, CameraIntrinsics};
use helmet_risk_common::{ClassGroup, ClassGroups, DeviceId, Severity};
use helmet_risk_fall_zone_risk::{FallZoneConfig, FallZoneRiskEngine};
use helmet_risk_material_risk::{MaterialConfig, MaterialRiskEngine};
use helmet_risk_motion_tracking::{Detection, Tracker, TrackIdAllocator, TrackedObject, TrackerArgs};
use helmet_risk_vehicle_risk::{VehicleConfig, VehicleRiskEngine};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::external::{DecodedFrame, DetectorAdapter, RiskNotifier};
use crate::frame_envelope::FrameEnvelope;
use crate::fusion::{self, EngineSeverities};
use crate::RiskEngine;

/// Back-pressure policy for frames arriving faster than the pipeline can
/// process them (spec.md §5). `LatestFrameWins` — the reference policy —
/// replaces any still-pending frame with the newest one and folds the
/// superseded frame's capture interval into the next processed frame's
/// interval, so the accident detector's frame-rate normalization stays
/// correct across dropped frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    LatestFrameWins,
    SkipAndAccumulate,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::LatestFrameWins
    }
}

/// Every tunable named in spec.md §6, grouped per component so a
/// deployment can override any of them from a single deserialized config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub tracker: TrackerArgs,
    pub class_groups: ClassGroups,
    pub material: MaterialConfig,
    pub fall_zone: FallZoneConfig,
    pub vehicle: VehicleConfig,
    pub accident: AccidentConfig,
    pub intrinsics: CameraIntrinsics,
    pub backpressure: BackpressurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerArgs::default(),
            class_groups: ClassGroups::default(),
            material: MaterialConfig::default(),
            fall_zone: FallZoneConfig::default(),
            vehicle: VehicleConfig::default(),
            accident: AccidentConfig::default(),
            intrinsics: CameraIntrinsics::default(),
            backpressure: BackpressurePolicy::default(),
        }
    }
}

/// One connected device's pipeline state. Shares only the process-wide
/// [`TrackIdAllocator`] with every other device; everything else here is
/// exclusively owned.
pub struct Pipeline {
    device_id: DeviceId,
    intrinsics: CameraIntrinsics,
    class_groups: ClassGroups,
    tracker: Arc<Mutex<Tracker>>,
    material: Arc<Mutex<MaterialRiskEngine>>,
    fall_zone: Arc<Mutex<FallZoneRiskEngine>>,
    vehicle: Arc<Mutex<VehicleRiskEngine>>,
    accident: Arc<Mutex<AccidentDetector>>,
    angle_tracker: Arc<Mutex<AngleHistogramTracker>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(device_id: DeviceId, config: PipelineConfig, id_alloc: Arc<TrackIdAllocator>) -> Self {
        let PipelineConfig { tracker, class_groups, material, fall_zone, vehicle, accident, intrinsics, backpressure: _ } =
            config;
        Self {
            device_id,
            intrinsics,
            class_groups: class_groups.clone(),
            tracker: Arc::new(Mutex::new(Tracker::new(tracker, class_groups, id_alloc))),
            material: Arc::new(Mutex::new(MaterialRiskEngine::new(material))),
            fall_zone: Arc::new(Mutex::new(FallZoneRiskEngine::new(fall_zone))),
            vehicle: Arc::new(Mutex::new(VehicleRiskEngine::new(vehicle))),
            accident: Arc::new(Mutex::new(AccidentDetector::new(accident))),
            angle_tracker: Arc::new(Mutex::new(AngleHistogramTracker::new())),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Runs the full per-frame task graph (spec.md §4.7/§5): `tracked_path`
    /// (detection → tracking → the three engines, themselves run in
    /// parallel) and `accident_path` run as two spawned tasks, joined here
    /// before fusion. Never fails: a cancelled or panicked sub-task falls
    /// back to its component's last-known severity/status, per spec.md §7.
    pub async fn process_frame(
        &self,
        envelope: &FrameEnvelope,
        frame: DecodedFrame,
        detector: Arc<dyn DetectorAdapter>,
    ) -> u8 {
        let frame = Arc::new(frame);
        let interval_ms = envelope.capture_interval();

        let tracked_path = tokio::spawn(run_tracked_path(
            self.tracker.clone(),
            self.material.clone(),
            self.fall_zone.clone(),
            self.vehicle.clone(),
            self.class_groups.clone(),
            detector,
            frame.clone(),
        ));

        let accident_path = tokio::spawn(run_accident_path(
            self.accident.clone(),
            self.angle_tracker.clone(),
            self.intrinsics,
            frame,
            interval_ms,
        ));

        let severities = match tracked_path.await {
            Ok(severities) => severities,
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "tracked path cancelled, falling back to last severities");
                current_severities(&self.material, &self.fall_zone, &self.vehicle).await
            }
        };

        let accident_status = match accident_path.await {
            Ok(status) => status,
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "accident path cancelled, falling back to last status");
                self.accident.lock().await.status()
            }
        };

        let risk_code = fusion::fuse(severities, accident_status);
        debug!(device_id = %self.device_id, risk_code, ?accident_status, "pipeline frame fused");
        risk_code
    }
}

async fn current_severities(
    material: &Arc<Mutex<MaterialRiskEngine>>,
    fall_zone: &Arc<Mutex<FallZoneRiskEngine>>,
    vehicle: &Arc<Mutex<VehicleRiskEngine>>,
) -> EngineSeverities {
    EngineSeverities {
        material: material.lock().await.severity(),
        fall_zone: fall_zone.lock().await.severity(),
        vehicle: vehicle.lock().await.severity(),
    }
}

async fn run_tracked_path(
    tracker: Arc<Mutex<Tracker>>,
    material: Arc<Mutex<MaterialRiskEngine>>,
    fall_zone: Arc<Mutex<FallZoneRiskEngine>>,
    vehicle: Arc<Mutex<VehicleRiskEngine>>,
    class_groups: ClassGroups,
    detector: Arc<dyn DetectorAdapter>,
    frame: Arc<DecodedFrame>,
) -> EngineSeverities {
    // DetectorFailure is treated as an empty frame (spec.md §7): engines
    // still run, they just observe nothing this frame.
    let detections: Vec<Detection> = match detector.detect(&frame) {
        Ok(batch) => batch
            .detections
            .into_iter()
            .map(|d| Detection { bbox: d.bbox, score: d.score, class_id: d.class_id, mask: d.mask })
            .collect(),
        Err(e) => {
            warn!(error = %e, "detector failure, treating frame as empty");
            Vec::new()
        }
    };

    let (width, height) = frame.dimensions();
    let (tracked_objects, frame_id) = {
        let mut guard = tracker.lock().await;
        let tracked_objects = guard.update(&detections, (height, width));
        let frame_id = guard.frame_id();
        (tracked_objects, frame_id)
    };

    let mut material_tracks = Vec::new();
    let mut fall_zone_tracks = Vec::new();
    let mut vehicle_tracks = Vec::new();
    for track in tracked_objects {
        match class_groups.group_of(track.class_id) {
            Some(ClassGroup::Material) => material_tracks.push(track),
            Some(ClassGroup::FallZone) => fall_zone_tracks.push(track),
            Some(ClassGroup::Vehicle) => vehicle_tracks.push(track),
            None => {}
        }
    }

    // Worker pool of size 3 (spec.md §5): each engine observes its own
    // class-filtered slice of tracks independently.
    let material_task = tokio::spawn(run_engine(material.clone(), material_tracks, frame_id));
    let fall_zone_task = tokio::spawn(run_engine(fall_zone.clone(), fall_zone_tracks, frame_id));
    let vehicle_task = tokio::spawn(run_engine(vehicle.clone(), vehicle_tracks, frame_id));

    let material_sev = match material_task.await {
        Ok(sev) => sev,
        Err(_) => material.lock().await.severity(),
    };
    let fall_zone_sev = match fall_zone_task.await {
        Ok(sev) => sev,
        Err(_) => fall_zone.lock().await.severity(),
    };
    let vehicle_sev = match vehicle_task.await {
        Ok(sev) => sev,
        Err(_) => vehicle.lock().await.severity(),
    };

    EngineSeverities { material: material_sev, fall_zone: fall_zone_sev, vehicle: vehicle_sev }
}

async fn run_engine<E>(engine: Arc<Mutex<E>>, tracks: Vec<TrackedObject>, frame_id: u64) -> Severity
where
    E: RiskEngine + 'static,
{
    let mut guard = engine.lock().await;
    guard.observe(&tracks, frame_id);
    guard.severity()
}

async fn run_accident_path(
    accident: Arc<Mutex<AccidentDetector>>,
    angle_tracker: Arc<Mutex<AngleHistogramTracker>>,
    intrinsics: CameraIntrinsics,
    frame: Arc<DecodedFrame>,
    interval_ms: Option<f64>,
) -> AccidentStatus {
    let gray = frame.to_gray();
    let mut accident_guard = accident.lock().await;
    let mut angle_guard = angle_tracker.lock().await;
    match accident_guard.detect(&gray, interval_ms, &mut angle_guard, &intrinsics) {
        Ok(status) => status,
        Err(_) => accident_guard.status(),
    }
}

struct PendingFrame {
    envelope: FrameEnvelope,
    frame: DecodedFrame,
}

/// Single-slot per-device mailbox implementing [`BackpressurePolicy`].
struct FrameInbox {
    policy: BackpressurePolicy,
    slot: Option<PendingFrame>,
    skipped_interval_ms: f64,
}

impl FrameInbox {
    fn new(policy: BackpressurePolicy) -> Self {
        Self { policy, slot: None, skipped_interval_ms: 0.0 }
    }

    fn submit(&mut self, envelope: FrameEnvelope, frame: DecodedFrame) {
        match self.policy {
            BackpressurePolicy::LatestFrameWins => {
                if let Some(old) = self.slot.take() {
                    self.skipped_interval_ms += f64::from(old.envelope.capture_interval_ms);
                }
                self.slot = Some(PendingFrame { envelope, frame });
            }
            BackpressurePolicy::SkipAndAccumulate => {
                if self.slot.is_none() {
                    self.slot = Some(PendingFrame { envelope, frame });
                } else {
                    self.skipped_interval_ms += f64::from(envelope.capture_interval_ms);
                }
            }
        }
    }

    fn take(&mut self) -> Option<(PendingFrame, f64)> {
        let pending = self.slot.take()?;
        let skipped = std::mem::take(&mut self.skipped_interval_ms);
        Some((pending, skipped))
    }
}

struct DeviceSlot {
    pipeline: Pipeline,
    inbox: FrameInbox,
}

/// Owns one [`Pipeline`] per connected device plus the process-wide
/// [`TrackIdAllocator`] every device's tracker draws from (spec.md §5's
/// one shared resource). Frames are submitted as they arrive and drained
/// one at a time per device, preserving frame-arrival output order.
pub struct PipelineRegistry {
    id_alloc: Arc<TrackIdAllocator>,
    config: PipelineConfig,
    devices: HashMap<DeviceId, DeviceSlot>,
}

impl PipelineRegistry {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self { id_alloc: Arc::new(TrackIdAllocator::new()), config, devices: HashMap::new() }
    }

    /// Submits a frame for `device_id`, creating its pipeline on first
    /// contact. Applies the configured [`BackpressurePolicy`] if a frame is
    /// already pending.
    pub fn submit_frame(&mut self, device_id: DeviceId, envelope: FrameEnvelope, frame: DecodedFrame) {
        let id_alloc = self.id_alloc.clone();
        let config = self.config.clone();
        let policy = self.config.backpressure;
        let slot = self.devices.entry(device_id.clone()).or_insert_with(|| DeviceSlot {
            pipeline: Pipeline::new(device_id, config, id_alloc),
            inbox: FrameInbox::new(policy),
        });
        slot.inbox.submit(envelope, frame);
    }

    /// Processes the pending frame for `device_id`, if any, and notifies
    /// `notifier` with the fused risk code. `None` if nothing was pending.
    pub async fn drain_device(
        &mut self,
        device_id: &DeviceId,
        detector: Arc<dyn DetectorAdapter>,
        notifier: &dyn RiskNotifier,
    ) -> Option<u8> {
        let slot = self.devices.get_mut(device_id)?;
        let (pending, skipped_ms) = slot.inbox.take()?;
        let mut envelope = pending.envelope;
        envelope.capture_interval_ms = envelope.capture_interval_ms.saturating_add(skipped_ms.round() as u32);
        let risk_code = slot.pipeline.process_frame(&envelope, pending.frame, detector).await;
        notifier.notify(device_id, risk_code, None);
        Some(risk_code)
    }

    /// Device disconnect (spec.md §5/§7 `PipelineFatal`): releases all
    /// per-device state. In-flight tasks belonging to this device's
    /// pipeline are not forcibly aborted here — dropping the last `Arc` to
    /// their engines/tracker lets any already-spawned task finish against
    /// state that simply won't be read again, which is the cooperative
    /// cancellation point spec.md §5 describes.
    pub fn remove_device(&mut self, device_id: &DeviceId) {
        self.devices.remove(device_id);
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
