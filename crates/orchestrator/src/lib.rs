//! Per-device risk pipeline orchestration.
//!
//! Wires the tracker and the three per-class risk engines to the accident
//! detector, fanning each incoming frame out across `tokio::spawn` tasks and
//! fusing their results into a single risk code (spec.md §4.7, §5, §7).

pub mod external;
pub mod frame_envelope;
pub mod fusion;
pub mod pipeline;

use helmet_risk_common::{ErrorClass, ErrorClassify, Severity};
use helmet_risk_motion_tracking::TrackedObject;
use thiserror::Error;

pub use external::{event_blob_key, DecodedFrame, DetectionBatch, DetectorAdapter, DetectorFailure, FramePreprocessor, RawDetection, RiskNotifier, TransientInputError};
pub use frame_envelope::FrameEnvelope;
pub use fusion::{EngineSeverities, FALL_ZONE_OFFSET, MATERIAL_OFFSET, UNKNOWN_ACCIDENT_CODE, VEHICLE_OFFSET};
pub use pipeline::{BackpressurePolicy, Pipeline, PipelineConfig, PipelineRegistry};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("malformed frame envelope: {0}")]
    MalformedEnvelope(String),
}

impl ErrorClassify for OrchestratorError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::TransientInput
    }
}

/// Uniform per-class engine API (spec.md §4 `RiskEngine`): observe this
/// frame's class-filtered tracks, then read back the engine's current
/// severity. Implemented by [`helmet_risk_material_risk::MaterialRiskEngine`],
/// [`helmet_risk_fall_zone_risk::FallZoneRiskEngine`] and
/// [`helmet_risk_vehicle_risk::VehicleRiskEngine`], each delegating to its
/// own inherent `update`/`severity` methods.
pub trait RiskEngine {
    fn observe(&mut self, tracks: &[TrackedObject], frame_id: u64);
    fn severity(&self) -> Severity;
}

impl RiskEngine for helmet_risk_material_risk::MaterialRiskEngine {
    fn observe(&mut self, tracks: &[TrackedObject], frame_id: u64) {
        self.update(tracks, frame_id);
    }

    fn severity(&self) -> Severity {
        self.severity()
    }
}

impl RiskEngine for helmet_risk_fall_zone_risk::FallZoneRiskEngine {
    fn observe(&mut self, tracks: &[TrackedObject], frame_id: u64) {
        self.update(tracks, frame_id);
    }

    fn severity(&self) -> Severity {
        self.severity()
    }
}

impl RiskEngine for helmet_risk_vehicle_risk::VehicleRiskEngine {
    fn observe(&mut self, tracks: &[TrackedObject], frame_id: u64) {
        self.update(tracks, frame_id);
    }

    fn severity(&self) -> Severity {
        self.severity()
    }
}
