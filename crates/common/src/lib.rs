//! Shared geometry, severity and classification types used across the
//! risk-assessment core. Every crate in this workspace builds on these
//! primitives instead of redefining its own box/point types.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A 2-D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point2f {
    pub x: f32,
    pub y: f32,
}

impl Point2f {
    #[must_use]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn dist(&self, other: &Point2f) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned bounding box in `(x1, y1, x2, y2)` image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    #[must_use]
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    #[must_use]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Top-left/width/height form: `(x, y, w, h)`.
    #[must_use]
    pub fn tlwh(&self) -> (f32, f32, f32, f32) {
        (self.x1, self.y1, self.width(), self.height())
    }

    #[must_use]
    pub fn center(&self) -> Point2f {
        Point2f::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Intersection-over-union with another axis-aligned box.
    #[must_use]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let inter = iw * ih;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Minimum-area oriented rectangle, the rotated-box equivalent of OpenCV's
/// `RotatedRect`: center, `(width, height)`, and rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotatedBox {
    pub center: Point2f,
    pub size: (f32, f32),
    pub angle_deg: f32,
}

impl RotatedBox {
    #[must_use]
    pub fn shorter_side(&self) -> f32 {
        self.size.0.min(self.size.1)
    }

    /// The four corners in image coordinates, ordered counter-clockwise.
    #[must_use]
    pub fn corners(&self) -> [Point2f; 4] {
        let (w, h) = self.size;
        let theta = self.angle_deg.to_radians();
        let (sin, cos) = theta.sin_cos();
        let half = [(-w / 2.0, -h / 2.0), (w / 2.0, -h / 2.0), (w / 2.0, h / 2.0), (-w / 2.0, h / 2.0)];
        let mut out = [Point2f::default(); 4];
        for (i, (dx, dy)) in half.iter().enumerate() {
            out[i] = Point2f::new(
                self.center.x + dx * cos - dy * sin,
                self.center.y + dx * sin + dy * cos,
            );
        }
        out
    }
}

/// Binary segmentation mask, row-major, one bool per pixel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>,
}

impl Mask {
    #[must_use]
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self { width, height, data }
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[(y * self.width + x) as usize]
    }

    /// Coordinates of every set pixel.
    pub fn set_pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).filter_map(move |x| if self.get(x, y) { Some((x, y)) } else { None })
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&b| b)
    }
}

/// Per-engine severity ordinal. `Ord`-derived so aggregating the maximum
/// severity across trackers is a plain `Iterator::max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Severity {
    #[default]
    Safe = 0,
    Warning = 1,
    Danger = 2,
}

impl Severity {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Safe => write!(f, "SAFE"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Danger => write!(f, "DANGER"),
        }
    }
}

/// Detector class id, as produced by the external detector adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

/// Stable identity for a connected helmet device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically assigned tracker identity, process-wide, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Class-group membership used to route tracked objects to the three
/// per-class risk engines and to decide which classes carry a rotated box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassGroups {
    pub vehicle_classes: HashSet<ClassId>,
    pub material_classes: HashSet<ClassId>,
    pub fall_zone_classes: HashSet<ClassId>,
    /// Classes that carry a mask-derived rotated box (`SPECIFIC_CLASSES`).
    pub rotated_box_classes: HashSet<ClassId>,
}

impl Default for ClassGroups {
    fn default() -> Self {
        Self {
            vehicle_classes: [ClassId(1), ClassId(2)].into_iter().collect(),
            material_classes: [ClassId(3)].into_iter().collect(),
            fall_zone_classes: [ClassId(4), ClassId(5)].into_iter().collect(),
            rotated_box_classes: [ClassId(3)].into_iter().collect(),
        }
    }
}

/// Which of the three per-class engines a tracked object is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassGroup {
    Vehicle,
    Material,
    FallZone,
}

impl ClassGroups {
    /// Routes a class id to its engine group, if any. A class absent from
    /// every group is simply not tracked by any risk engine.
    #[must_use]
    pub fn group_of(&self, class_id: ClassId) -> Option<ClassGroup> {
        if self.vehicle_classes.contains(&class_id) {
            Some(ClassGroup::Vehicle)
        } else if self.material_classes.contains(&class_id) {
            Some(ClassGroup::Material)
        } else if self.fall_zone_classes.contains(&class_id) {
            Some(ClassGroup::FallZone)
        } else {
            None
        }
    }

    #[must_use]
    pub fn wants_rotated_box(&self, class_id: ClassId) -> bool {
        self.rotated_box_classes.contains(&class_id)
    }
}

/// Cross-cutting error classification (spec §7). Every domain-specific
/// `thiserror` enum in this workspace implements this so the orchestrator
/// can apply a uniform propagation policy without matching on concrete
/// error variants from crates it doesn't otherwise depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input for a single frame or track; skip it, state untouched.
    TransientInput,
    /// An analytical step (Cholesky, RANSAC, homography) failed numerically;
    /// the caller keeps its previous state.
    Numeric,
    /// The detector produced nothing useful for this frame.
    Detector,
    /// Unrecoverable for this device; release its state.
    PipelineFatal,
}

pub trait ErrorClassify {
    fn error_class(&self) -> ErrorClass;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_iou_identical_boxes_is_one() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_iou_disjoint_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Danger > Severity::Warning);
        assert!(Severity::Warning > Severity::Safe);
        assert_eq!([Severity::Safe, Severity::Danger, Severity::Warning].into_iter().max(), Some(Severity::Danger));
    }

    #[test]
    fn class_groups_defaults_match_reference_config() {
        let groups = ClassGroups::default();
        assert_eq!(groups.group_of(ClassId(1)), Some(ClassGroup::Vehicle));
        assert_eq!(groups.group_of(ClassId(3)), Some(ClassGroup::Material));
        assert_eq!(groups.group_of(ClassId(4)), Some(ClassGroup::FallZone));
        assert_eq!(groups.group_of(ClassId(99)), None);
        assert!(groups.wants_rotated_box(ClassId(3)));
        assert!(!groups.wants_rotated_box(ClassId(1)));
    }

    #[test]
    fn rotated_box_corners_axis_aligned_matches_bbox() {
        let rb = RotatedBox { center: Point2f::new(5.0, 5.0), size: (10.0, 10.0), angle_deg: 0.0 };
        let corners = rb.corners();
        assert!((corners[0].x - 0.0).abs() < 1e-4);
        assert!((corners[2].x - 10.0).abs() < 1e-4);
    }
}
