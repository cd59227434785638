//! Track: a persistent cross-frame identity carrying Kalman state plus the
//! optional mask/rotated-box data some classes use for association.

use helmet_risk_common::{BoundingBox, ClassId, Mask, RotatedBox, TrackId};
use helmet_risk_kalman_filter::{KalmanFilter, KalmanState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    New,
    Tracked,
    Lost,
    Removed,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub state: TrackState,
    pub is_activated: bool,
    pub class_id: ClassId,
    pub score: f32,
    pub kalman_state: KalmanState,
    pub mask: Option<Mask>,
    pub rotated_box: Option<RotatedBox>,
    pub tracklet_len: u32,
    pub start_frame: u64,
    pub frame_id: u64,
    pub end_frame: u64,
}

fn bbox_to_xyah(bbox: &BoundingBox) -> [f64; 4] {
    let (x, y, w, h) = bbox.tlwh();
    let cx = x as f64 + w as f64 / 2.0;
    let cy = y as f64 + h as f64 / 2.0;
    let a = if h > 0.0 { (w / h) as f64 } else { 0.0 };
    [cx, cy, a, h as f64]
}

impl Track {
    #[must_use]
    pub fn new(
        id: TrackId,
        kf: &KalmanFilter,
        bbox: &BoundingBox,
        class_id: ClassId,
        score: f32,
        frame_id: u64,
        mask: Option<Mask>,
        rotated_box: Option<RotatedBox>,
        activate_now: bool,
    ) -> Self {
        let kalman_state = kf.initiate(bbox_to_xyah(bbox));
        Track {
            id,
            state: if activate_now { TrackState::Tracked } else { TrackState::New },
            is_activated: activate_now,
            class_id,
            score,
            kalman_state,
            mask,
            rotated_box,
            tracklet_len: 0,
            start_frame: frame_id,
            frame_id,
            end_frame: frame_id,
        }
    }

    #[must_use]
    pub fn tlwh(&self) -> (f32, f32, f32, f32) {
        let xyah = self.kalman_state.xyah();
        let h = xyah[3] as f32;
        let w = xyah[2] as f32 * h;
        let cx = xyah[0] as f32;
        let cy = xyah[1] as f32;
        (cx - w / 2.0, cy - h / 2.0, w, h)
    }

    #[must_use]
    pub fn tlbr(&self) -> BoundingBox {
        let (x, y, w, h) = self.tlwh();
        BoundingBox::new(x, y, x + w, y + h)
    }

    /// Applies an associated detection's measurement to the Kalman filter
    /// and refreshes the track's last-known score/class/mask/rotated box.
    pub fn update(
        &mut self,
        kf: &KalmanFilter,
        bbox: &BoundingBox,
        score: f32,
        mask: Option<Mask>,
        rotated_box: Option<RotatedBox>,
        frame_id: u64,
    ) {
        if let Ok(next) = kf.update(&self.kalman_state, bbox_to_xyah(bbox)) {
            self.kalman_state = next;
        }
        self.score = score;
        self.mask = mask;
        self.rotated_box = rotated_box;
        self.state = TrackState::Tracked;
        self.is_activated = true;
        self.tracklet_len += 1;
        self.frame_id = frame_id;
        self.end_frame = frame_id;
    }

    pub fn mark_lost(&mut self) {
        self.state = TrackState::Lost;
    }

    pub fn mark_removed(&mut self) {
        self.state = TrackState::Removed;
    }

    /// How long this track has held its current state, in frames — used to
    /// break ties when deduplicating overlapping tracked/lost pairs.
    #[must_use]
    pub fn lifetime_in_state(&self) -> u64 {
        self.frame_id.saturating_sub(self.start_frame)
    }
}
