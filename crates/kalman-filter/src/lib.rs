//! Eight-dimensional constant-velocity Kalman filter over bounding boxes in
//! `(cx, cy, aspect, height)` measurement space, plus their velocities.
//!
//! The state layout, motion model and noise weighting follow the tracker's
//! reference filter exactly: position noise scales with the box height by
//! `std_weight_position`, velocity noise by `std_weight_velocity`, and the
//! aspect-ratio terms use small fixed constants rather than height-scaled
//! ones.

use helmet_risk_common::ErrorClass;
use thiserror::Error;

/// 95%-confidence inverse chi-square values, indexed by degrees of freedom
/// (index 0 unused). Only indices 2 and 4 are consulted by this workspace,
/// but the full table is kept so the constant stays traceable to its source.
pub const CHI2INV95: [f64; 10] = [
    0.0, 3.8415, 5.9915, 7.8147, 9.4877, 11.070, 12.592, 14.067, 15.507, 16.919,
];

#[derive(Debug, Error)]
pub enum KalmanError {
    #[error("projected covariance is not positive-definite (Cholesky failed)")]
    CholeskyFailed,
    #[error("measurement/state dimension mismatch")]
    DimensionMismatch,
}

impl helmet_risk_common::ErrorClassify for KalmanError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::Numeric
    }
}

/// Which distance the caller wants from [`KalmanFilter::gating_distance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatingMetric {
    /// Plain squared Euclidean distance in measurement space.
    Gaussian,
    /// Squared Mahalanobis distance against the projected covariance.
    Maha,
}

/// One track's Kalman state: an 8-vector mean and its 8x8 covariance.
#[derive(Debug, Clone)]
pub struct KalmanState {
    pub mean: [f64; 8],
    pub covariance: [[f64; 8]; 8],
}

impl KalmanState {
    #[must_use]
    pub fn xyah(&self) -> [f64; 4] {
        [self.mean[0], self.mean[1], self.mean[2], self.mean[3]]
    }
}

/// Constant-velocity Kalman filter over the 8-D `(cx, cy, a, h, vcx, vcy,
/// va, vh)` state, with `Δt = 1` (one frame).
#[derive(Debug, Clone, Copy)]
pub struct KalmanFilter {
    std_weight_position: f64,
    std_weight_velocity: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self {
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }
}

impl KalmanFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a track state from a single `(cx, cy, a, h)` measurement.
    /// Velocities start at zero.
    #[must_use]
    pub fn initiate(&self, measurement: [f64; 4]) -> KalmanState {
        let h = measurement[3];
        let std = [
            2.0 * self.std_weight_position * h,
            2.0 * self.std_weight_position * h,
            1e-2,
            2.0 * self.std_weight_position * h,
            10.0 * self.std_weight_velocity * h,
            10.0 * self.std_weight_velocity * h,
            1e-5,
            10.0 * self.std_weight_velocity * h,
        ];
        let mut mean = [0.0; 8];
        mean[0..4].copy_from_slice(&measurement);
        let mut covariance = [[0.0; 8]; 8];
        for i in 0..8 {
            covariance[i][i] = std[i] * std[i];
        }
        KalmanState { mean, covariance }
    }

    fn motion_mat() -> [[f64; 8]; 8] {
        let mut m = [[0.0; 8]; 8];
        for i in 0..8 {
            m[i][i] = 1.0;
        }
        for i in 0..4 {
            m[i][4 + i] = 1.0; // dt = 1
        }
        m
    }

    fn update_mat() -> [[f64; 8]; 4] {
        let mut m = [[0.0; 8]; 4];
        for i in 0..4 {
            m[i][i] = 1.0;
        }
        m
    }

    /// One-step motion prediction: advances the mean and inflates the
    /// covariance by the process noise.
    #[must_use]
    pub fn predict(&self, state: &KalmanState) -> KalmanState {
        let h = state.mean[3];
        let std_pos = [self.std_weight_position * h, self.std_weight_position * h, 1e-2, self.std_weight_position * h];
        let std_vel = [self.std_weight_velocity * h, self.std_weight_velocity * h, 1e-5, self.std_weight_velocity * h];
        let mut motion_cov = [[0.0; 8]; 8];
        for i in 0..4 {
            motion_cov[i][i] = std_pos[i] * std_pos[i];
            motion_cov[4 + i][4 + i] = std_vel[i] * std_vel[i];
        }

        let f = Self::motion_mat();
        let mean = mat_vec_mul(&f, &state.mean);
        let fp = mat_mat_mul_8(&f, &state.covariance);
        let ft = transpose_8(&f);
        let mut covariance = mat_mat_mul_8(&fp, &ft);
        for i in 0..8 {
            for j in 0..8 {
                covariance[i][j] += motion_cov[i][j];
            }
        }
        KalmanState { mean, covariance }
    }

    /// Vectorized predict over a slice of states, in place.
    pub fn multi_predict(&self, states: &mut [KalmanState]) {
        for state in states.iter_mut() {
            *state = self.predict(state);
        }
    }

    /// Projects the 8-D state into 4-D measurement space, adding the
    /// measurement (innovation) noise.
    #[must_use]
    pub fn project(&self, state: &KalmanState) -> ([f64; 4], [[f64; 4]; 4]) {
        let h = state.mean[3];
        let std = [self.std_weight_position * h, self.std_weight_position * h, 1e-1, self.std_weight_position * h];
        let mut innovation_cov = [[0.0; 4]; 4];
        for i in 0..4 {
            innovation_cov[i][i] = std[i] * std[i];
        }
        let h_mat = Self::update_mat();
        let mean = mat8x4_vec_mul(&h_mat, &state.mean);
        let hp = mat8x4_mat8x8_mul(&h_mat, &state.covariance);
        let mut cov = mat4x8_mat8x4_mul(&hp, &h_mat);
        for i in 0..4 {
            for j in 0..4 {
                cov[i][j] += innovation_cov[i][j];
            }
        }
        (mean, cov)
    }

    /// Corrects the predicted state with an observed `(cx, cy, a, h)`
    /// measurement via a Cholesky-solved Kalman gain.
    pub fn update(&self, state: &KalmanState, measurement: [f64; 4]) -> Result<KalmanState, KalmanError> {
        let (projected_mean, projected_cov) = self.project(state);
        let chol = cholesky4(&projected_cov).ok_or(KalmanError::CholeskyFailed)?;

        // kalman_gain = (covariance @ H^T) solved against projected_cov, transposed.
        let h_mat = Self::update_mat();
        let ht = transpose_8x4(&h_mat);
        let ph_t = mat_mat8x8_mat8x4_mul(&state.covariance, &ht); // 8x4

        let mut kalman_gain = [[0.0; 4]; 8];
        for row in 0..8 {
            let rhs = [ph_t[row][0], ph_t[row][1], ph_t[row][2], ph_t[row][3]];
            let solved = cholesky_solve4(&chol, rhs);
            kalman_gain[row] = solved;
        }

        let innovation = [
            measurement[0] - projected_mean[0],
            measurement[1] - projected_mean[1],
            measurement[2] - projected_mean[2],
            measurement[3] - projected_mean[3],
        ];

        let mut mean = state.mean;
        for i in 0..8 {
            let mut delta = 0.0;
            for j in 0..4 {
                delta += innovation[j] * kalman_gain[i][j];
            }
            mean[i] += delta;
        }

        // covariance -= kalman_gain @ projected_cov @ kalman_gain^T
        let kg_p = mat8x4_mat4x4_mul(&kalman_gain, &projected_cov); // 8x4
        let mut covariance = state.covariance;
        for i in 0..8 {
            for j in 0..8 {
                let mut delta = 0.0;
                for k in 0..4 {
                    delta += kg_p[i][k] * kalman_gain[j][k];
                }
                covariance[i][j] -= delta;
            }
        }

        Ok(KalmanState { mean, covariance })
    }

    /// Gating distance from a track's projected state to each of several
    /// candidate `(cx, cy, a, h)` measurements.
    #[must_use]
    pub fn gating_distance(
        &self,
        state: &KalmanState,
        measurements: &[[f64; 4]],
        only_position: bool,
        metric: GatingMetric,
    ) -> Vec<f64> {
        let (mean, cov) = self.project(state);

        if only_position {
            let mean2 = [mean[0], mean[1]];
            let cov2 = [[cov[0][0], cov[0][1]], [cov[1][0], cov[1][1]]];
            return measurements
                .iter()
                .map(|m| {
                    let d = [m[0] - mean2[0], m[1] - mean2[1]];
                    match metric {
                        GatingMetric::Gaussian => d[0] * d[0] + d[1] * d[1],
                        GatingMetric::Maha => {
                            let chol = cholesky2(&cov2);
                            match chol {
                                Some(l) => {
                                    let z = forward_substitute2(&l, d);
                                    z[0] * z[0] + z[1] * z[1]
                                }
                                None => f64::INFINITY,
                            }
                        }
                    }
                })
                .collect();
        }

        measurements
            .iter()
            .map(|m| {
                let d = [m[0] - mean[0], m[1] - mean[1], m[2] - mean[2], m[3] - mean[3]];
                match metric {
                    GatingMetric::Gaussian => d.iter().map(|v| v * v).sum(),
                    GatingMetric::Maha => match cholesky4(&cov) {
                        Some(l) => {
                            let z = forward_substitute4(&l, d);
                            z.iter().map(|v| v * v).sum()
                        }
                        None => f64::INFINITY,
                    },
                }
            })
            .collect()
    }
}

fn mat_vec_mul(m: &[[f64; 8]; 8], v: &[f64; 8]) -> [f64; 8] {
    let mut out = [0.0; 8];
    for i in 0..8 {
        out[i] = (0..8).map(|j| m[i][j] * v[j]).sum();
    }
    out
}

fn mat8x4_vec_mul(m: &[[f64; 8]; 4], v: &[f64; 8]) -> [f64; 4] {
    let mut out = [0.0; 4];
    for i in 0..4 {
        out[i] = (0..8).map(|j| m[i][j] * v[j]).sum();
    }
    out
}

fn mat_mat_mul_8(a: &[[f64; 8]; 8], b: &[[f64; 8]; 8]) -> [[f64; 8]; 8] {
    let mut out = [[0.0; 8]; 8];
    for i in 0..8 {
        for j in 0..8 {
            out[i][j] = (0..8).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn transpose_8(m: &[[f64; 8]; 8]) -> [[f64; 8]; 8] {
    let mut out = [[0.0; 8]; 8];
    for i in 0..8 {
        for j in 0..8 {
            out[j][i] = m[i][j];
        }
    }
    out
}

fn transpose_8x4(m: &[[f64; 8]; 4]) -> [[f64; 4]; 8] {
    let mut out = [[0.0; 4]; 8];
    for i in 0..4 {
        for j in 0..8 {
            out[j][i] = m[i][j];
        }
    }
    out
}

fn mat8x4_mat8x8_mul(h: &[[f64; 8]; 4], cov: &[[f64; 8]; 8]) -> [[f64; 8]; 4] {
    let mut out = [[0.0; 8]; 4];
    for i in 0..4 {
        for j in 0..8 {
            out[i][j] = (0..8).map(|k| h[i][k] * cov[k][j]).sum();
        }
    }
    out
}

fn mat4x8_mat8x4_mul(a: &[[f64; 8]; 4], h: &[[f64; 8]; 4]) -> [[f64; 4]; 4] {
    let mut out = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            out[i][j] = (0..8).map(|k| a[i][k] * h[j][k]).sum();
        }
    }
    out
}

fn mat_mat8x8_mat8x4_mul(cov: &[[f64; 8]; 8], ht: &[[f64; 4]; 8]) -> [[f64; 4]; 8] {
    let mut out = [[0.0; 4]; 8];
    for i in 0..8 {
        for j in 0..4 {
            out[i][j] = (0..8).map(|k| cov[i][k] * ht[k][j]).sum();
        }
    }
    out
}

fn mat8x4_mat4x4_mul(kg: &[[f64; 4]; 8], cov4: &[[f64; 4]; 4]) -> [[f64; 4]; 8] {
    let mut out = [[0.0; 4]; 8];
    for i in 0..8 {
        for j in 0..4 {
            out[i][j] = (0..4).map(|k| kg[i][k] * cov4[k][j]).sum();
        }
    }
    out
}

/// Lower-triangular Cholesky factor of a 4x4 symmetric positive-definite
/// matrix, or `None` if it is not positive-definite.
fn cholesky4(a: &[[f64; 4]; 4]) -> Option<[[f64; 4]; 4]> {
    let mut l = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..=i {
            let mut sum = a[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[i][j] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    Some(l)
}

fn cholesky2(a: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let mut l = [[0.0; 2]; 2];
    for i in 0..2 {
        for j in 0..=i {
            let mut sum = a[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[i][j] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    Some(l)
}

fn forward_substitute4(l: &[[f64; 4]; 4], b: [f64; 4]) -> [f64; 4] {
    let mut z = [0.0; 4];
    for i in 0..4 {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i][k] * z[k];
        }
        z[i] = sum / l[i][i];
    }
    z
}

fn forward_substitute2(l: &[[f64; 2]; 2], b: [f64; 2]) -> [f64; 2] {
    let mut z = [0.0; 2];
    for i in 0..2 {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i][k] * z[k];
        }
        z[i] = sum / l[i][i];
    }
    z
}

/// Solves `L L^T x = b` for `x` given the Cholesky factor `L`.
fn cholesky_solve4(l: &[[f64; 4]; 4], b: [f64; 4]) -> [f64; 4] {
    let y = forward_substitute4(l, b);
    let mut x = [0.0; 4];
    for i in (0..4).rev() {
        let mut sum = y[i];
        for k in (i + 1)..4 {
            sum -= l[k][i] * x[k];
        }
        x[i] = sum / l[i][i];
    }
    x
}
