//! Boundary types and traits for the collaborators spec.md §1/§6 declares
//! out of scope (transport, detector, preprocessor, notifier). This crate
//! only defines the Rust-side interface a real deployment implements
//! against; none of these traits has a production implementation here.

use helmet_risk_common::{BoundingBox, ClassId, DeviceId, ErrorClass, ErrorClassify, Mask};
use image::{GrayImage, RgbImage};
use thiserror::Error;

/// A single decoded, already-preprocessed frame (fisheye-corrected and
/// rotated upstream, per spec.md §6). Color is kept around for the
/// detector; the accident path only needs [`DecodedFrame::to_gray`].
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub image: RgbImage,
}

impl DecodedFrame {
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[must_use]
    pub fn to_gray(&self) -> GrayImage {
        image::imageops::colorops::grayscale(&self.image)
    }
}

/// One detection as produced by the external detector, before it reaches
/// the tracker's own `Detection` type.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class_id: ClassId,
    pub mask: Option<Mask>,
}

/// A full frame's worth of detector output (spec.md §6 `detect`).
#[derive(Debug, Clone, Default)]
pub struct DetectionBatch {
    pub detections: Vec<RawDetection>,
}

#[derive(Debug, Error)]
pub enum DetectorFailure {
    #[error("detector produced an empty or malformed box tensor")]
    Empty,
}

impl ErrorClassify for DetectorFailure {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::Detector
    }
}

#[derive(Debug, Error)]
pub enum TransientInputError {
    #[error("malformed frame payload: {0}")]
    MalformedPayload(String),
}

impl ErrorClassify for TransientInputError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::TransientInput
    }
}

/// The external YOLO-style segmentation detector (spec.md §1/§6). Consumed,
/// never implemented by this crate.
pub trait DetectorAdapter: Send + Sync {
    fn detect(&self, frame: &DecodedFrame) -> Result<DetectionBatch, DetectorFailure>;
}

/// The external fisheye-correction + rotation preprocessor (spec.md §6).
pub trait FramePreprocessor: Send + Sync {
    fn preprocess(&self, raw: &[u8]) -> Result<DecodedFrame, TransientInputError>;
}

/// The downstream HTTP notification channel (spec.md §6). At-least-once;
/// failures are logged by the implementation and must never block the
/// pipeline (spec.md §7's propagation policy).
pub trait RiskNotifier: Send + Sync {
    fn notify(&self, device: &DeviceId, risk_code: u8, event_blob_key: Option<String>);
}

/// Builds an event-blob key of the form `device:{device_id}:event:{epoch_ms}`
/// (spec.md §6), for callers that store event image buffers externally.
#[must_use]
pub fn event_blob_key(device: &DeviceId, epoch_ms: u64) -> String {
    format!("device:{device}:event:{epoch_ms}")
}
