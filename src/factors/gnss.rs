//! GNSS residuals: the pseudorange/Doppler factor tying window states to
//! the ECEF anchor, the receiver clock-bias coupling, and the clock-drift
//! smoothing factor.

use nalgebra::{DMatrix, Matrix3, Quaternion, RowVector3, UnitQuaternion, Vector3};

use crate::gnss::{
    ecef2geo, ecef2rotation, klobuchar_iono_delay, saastamoinen_tropo_delay, sat_azel,
    satellite_state_for, EphemerisPtr, GnssObservation, EARTH_OMEGA, LIGHT_SPEED,
};
use crate::solver::Factor;

/// Scaling applied on top of the per-observation standard deviations.
const RELATIVE_SQRT_INFO: f64 = 10.0;

fn unpack_pose(p: &[f64]) -> (Vector3<f64>, UnitQuaternion<f64>) {
    (
        Vector3::new(p[0], p[1], p[2]),
        UnitQuaternion::from_quaternion(Quaternion::new(p[6], p[3], p[4], p[5])),
    )
}

fn rot_z(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    Matrix3::new(
        c, -s, 0.0,
        s, c, 0.0,
        0.0, 0.0, 1.0,
    )
}

fn drot_z(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    Matrix3::new(
        -s, -c, 0.0,
        c, -s, 0.0,
        0.0, 0.0, 0.0,
    )
}

/// Pseudorange + Doppler residual (dim 2) for one satellite observation.
///
/// The receiver state at the observation epoch is interpolated between the
/// two bracketing window frames with `ts_ratio`. Blocks: `pose_i (7)`,
/// `speed_bias_i (9)`, `pose_j (7)`, `speed_bias_j (9)`, `rcv_dt (1)`,
/// `rcv_ddt (1)`, `yaw_enu_local (1)`, `anc_ecef (3)`.
pub struct GnssPsrDoppFactor {
    obs: GnssObservation,
    ephem: EphemerisPtr,
    iono_params: Vec<f64>,
    ts_ratio: f64,
}

impl GnssPsrDoppFactor {
    pub fn new(
        obs: GnssObservation,
        ephem: EphemerisPtr,
        iono_params: Vec<f64>,
        ts_ratio: f64,
    ) -> Self {
        Self {
            obs,
            ephem,
            iono_params,
            ts_ratio,
        }
    }
}

impl Factor for GnssPsrDoppFactor {
    fn num_residuals(&self) -> usize {
        2
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7, 9, 7, 9, 1, 1, 1, 3]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        let (p_i, _) = unpack_pose(params[0]);
        let v_i = Vector3::new(params[1][0], params[1][1], params[1][2]);
        let (p_j, _) = unpack_pose(params[2]);
        let v_j = Vector3::new(params[3][0], params[3][1], params[3][2]);
        let rcv_dt = params[4][0];
        let rcv_ddt = params[5][0];
        let yaw = params[6][0];
        let anc = Vector3::new(params[7][0], params[7][1], params[7][2]);

        let ts = self.ts_ratio;
        let local_pos = ts * p_i + (1.0 - ts) * p_j;
        let local_vel = ts * v_i + (1.0 - ts) * v_j;

        let r_enu_local = rot_z(yaw);
        let r_ecef_enu = ecef2rotation(&anc);
        let r_ecef_local = r_ecef_enu * r_enu_local;

        let p_ecef = anc + r_ecef_local * local_pos;
        let v_ecef = r_ecef_local * local_vel;

        let sat = satellite_state_for(&self.obs, &self.ephem);
        let rv = sat.pos - p_ecef;
        let range = rv.norm();
        let unit = rv / range;

        let geo = ecef2geo(&p_ecef);
        let (az, el) = sat_azel(&p_ecef, &sat.pos);
        let iono = klobuchar_iono_delay(self.obs.time_s, geo.x, geo.y, az, el, &self.iono_params);
        let tropo = saastamoinen_tropo_delay(geo.z, el, 0.5);

        let sin_el2 = el.sin() * el.sin();
        let pr_weight = sin_el2 / self.obs.psr_std * RELATIVE_SQRT_INFO;
        let dp_weight = sin_el2 / self.obs.dopp_std * RELATIVE_SQRT_INFO;

        let sagnac = EARTH_OMEGA / LIGHT_SPEED
            * (sat.pos.x * p_ecef.y - sat.pos.y * p_ecef.x);
        let psr_estimated =
            range + sagnac + rcv_dt - sat.clock_bias * LIGHT_SPEED + iono + tropo;
        residuals[0] = (psr_estimated - self.obs.psr) * pr_weight;

        let dopp_sagnac = EARTH_OMEGA / LIGHT_SPEED
            * (sat.vel.x * p_ecef.y + sat.pos.x * v_ecef.y
                - sat.vel.y * p_ecef.x
                - sat.pos.y * v_ecef.x);
        let dopp_estimated = (sat.vel - v_ecef).dot(&unit) + dopp_sagnac + rcv_ddt
            - sat.clock_drift * LIGHT_SPEED;
        let wavelength = self.obs.wavelength();
        residuals[1] = (dopp_estimated + self.obs.dopp * wavelength) * dp_weight;

        let Some(jacs) = jacobians else { return true };

        // range row w.r.t. the receiver ECEF position
        let d_psr_dp: RowVector3<f64> = -unit.transpose();
        // doppler row w.r.t. the receiver ECEF position (line-of-sight
        // direction change)
        let d_dopp_dp: RowVector3<f64> = (sat.vel - v_ecef).transpose()
            * (unit * unit.transpose() - Matrix3::identity())
            / range;
        let d_dopp_dv: RowVector3<f64> = -unit.transpose();

        if let Some(j) = jacs[0].as_mut() {
            j.fill(0.0);
            let row0 = d_psr_dp * r_ecef_local * ts * pr_weight;
            let row1 = d_dopp_dp * r_ecef_local * ts * dp_weight;
            j.view_mut((0, 0), (1, 3)).copy_from(&row0);
            j.view_mut((1, 0), (1, 3)).copy_from(&row1);
        }
        if let Some(j) = jacs[1].as_mut() {
            j.fill(0.0);
            let row1 = d_dopp_dv * r_ecef_local * ts * dp_weight;
            j.view_mut((1, 0), (1, 3)).copy_from(&row1);
        }
        if let Some(j) = jacs[2].as_mut() {
            j.fill(0.0);
            let row0 = d_psr_dp * r_ecef_local * (1.0 - ts) * pr_weight;
            let row1 = d_dopp_dp * r_ecef_local * (1.0 - ts) * dp_weight;
            j.view_mut((0, 0), (1, 3)).copy_from(&row0);
            j.view_mut((1, 0), (1, 3)).copy_from(&row1);
        }
        if let Some(j) = jacs[3].as_mut() {
            j.fill(0.0);
            let row1 = d_dopp_dv * r_ecef_local * (1.0 - ts) * dp_weight;
            j.view_mut((1, 0), (1, 3)).copy_from(&row1);
        }
        if let Some(j) = jacs[4].as_mut() {
            j.fill(0.0);
            j[(0, 0)] = pr_weight;
        }
        if let Some(j) = jacs[5].as_mut() {
            j.fill(0.0);
            j[(1, 0)] = dp_weight;
        }
        if let Some(j) = jacs[6].as_mut() {
            j.fill(0.0);
            let d_rot = r_ecef_enu * drot_z(yaw);
            j[(0, 0)] = (d_psr_dp * (d_rot * local_pos))[0] * pr_weight;
            j[(1, 0)] = ((d_dopp_dp * (d_rot * local_pos))[0]
                + (d_dopp_dv * (d_rot * local_vel))[0])
                * dp_weight;
        }
        if let Some(j) = jacs[7].as_mut() {
            j.fill(0.0);
            let row0 = d_psr_dp * pr_weight;
            let row1 = d_dopp_dp * dp_weight;
            j.view_mut((0, 0), (1, 3)).copy_from(&row0);
            j.view_mut((1, 0), (1, 3)).copy_from(&row1);
        }
        true
    }
}

/// Couples consecutive per-system receiver clock biases with the clock
/// drift: `dt_{i+1} − dt_i − ½(ddt_i + ddt_{i+1})·Δt = 0`. Blocks:
/// `dt_i (1)`, `dt_{i+1} (1)`, `ddt_i (1)`, `ddt_{i+1} (1)`.
pub struct DtDdtFactor {
    delta_t: f64,
}

impl DtDdtFactor {
    pub fn new(delta_t: f64) -> Self {
        Self { delta_t }
    }
}

impl Factor for DtDdtFactor {
    fn num_residuals(&self) -> usize {
        1
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![1, 1, 1, 1]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        let (dt_i, dt_j) = (params[0][0], params[1][0]);
        let (ddt_i, ddt_j) = (params[2][0], params[3][0]);
        residuals[0] = dt_j - dt_i - 0.5 * (ddt_i + ddt_j) * self.delta_t;

        if let Some(jacs) = jacobians {
            if let Some(j) = jacs[0].as_mut() {
                j[(0, 0)] = -1.0;
            }
            if let Some(j) = jacs[1].as_mut() {
                j[(0, 0)] = 1.0;
            }
            if let Some(j) = jacs[2].as_mut() {
                j[(0, 0)] = -0.5 * self.delta_t;
            }
            if let Some(j) = jacs[3].as_mut() {
                j[(0, 0)] = 0.5 * self.delta_t;
            }
        }
        true
    }
}

/// Penalizes clock-drift changes between consecutive frames:
/// `w·(ddt_{i+1} − ddt_i) = 0`.
pub struct DdtSmoothFactor {
    weight: f64,
}

impl DdtSmoothFactor {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }
}

impl Factor for DdtSmoothFactor {
    fn num_residuals(&self) -> usize {
        1
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![1, 1]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        residuals[0] = self.weight * (params[1][0] - params[0][0]);
        if let Some(jacs) = jacobians {
            if let Some(j) = jacs[0].as_mut() {
                j[(0, 0)] = -self.weight;
            }
            if let Some(j) = jacs[1].as_mut() {
                j[(0, 0)] = self.weight;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::{Ephemeris, SatSystem, SatelliteState};
    use std::sync::Arc;

    struct FixedSat {
        pos: Vector3<f64>,
    }

    impl Ephemeris for FixedSat {
        fn system(&self) -> SatSystem {
            SatSystem::Gps
        }
        fn toe_s(&self) -> f64 {
            0.0
        }
        fn satellite_state(&self, _t: f64) -> SatelliteState {
            SatelliteState {
                pos: self.pos,
                vel: Vector3::zeros(),
                clock_bias: 0.0,
                clock_drift: 0.0,
            }
        }
    }

    fn anchor() -> Vector3<f64> {
        Vector3::new(-2_700_000.0, 4_500_000.0, 3_600_000.0)
    }

    #[test]
    fn pseudorange_residual_tracks_clock_bias() {
        let anc = anchor();
        let sat_pos = anc.normalize() * 26_000_000.0;
        let ephem: EphemerisPtr = Arc::new(FixedSat { pos: sat_pos });

        // geometric range ignoring atmosphere
        let range = (sat_pos - anc).norm();
        let sagnac =
            EARTH_OMEGA / LIGHT_SPEED * (sat_pos.x * anc.y - sat_pos.y * anc.x);

        let obs = GnssObservation {
            sat: 5,
            system: SatSystem::Gps,
            time_s: 100_000.0,
            psr: range + sagnac,
            psr_std: 1.0,
            dopp: 0.0,
            dopp_std: 0.1,
            snr: 45.0,
            freq_hz: crate::gnss::GPS_L1_FREQ,
        };
        let factor = GnssPsrDoppFactor::new(obs, ephem, vec![], 1.0);

        let pose = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let sb = [0.0; 9];
        let anc_p = [anc.x, anc.y, anc.z];

        // with zero clock bias the residual is the atmospheric delay;
        // shifting rcv_dt by +10 m moves the residual by +10·weight
        let mut r0 = [0.0; 2];
        factor.evaluate(
            &[&pose, &sb, &pose, &sb, &[0.0], &[0.0], &[0.0], &anc_p],
            &mut r0,
            None,
        );
        let mut r1 = [0.0; 2];
        factor.evaluate(
            &[&pose, &sb, &pose, &sb, &[10.0], &[0.0], &[0.0], &anc_p],
            &mut r1,
            None,
        );
        // zenith satellite: sin²(el) ≈ 1, weight ≈ 10
        assert!((r1[0] - r0[0] - 100.0).abs() < 1.0, "Δr = {}", r1[0] - r0[0]);
    }

    #[test]
    fn dt_ddt_coupling_is_consistent() {
        let factor = DtDdtFactor::new(2.0);
        let mut r = [0.0];
        // dt advanced exactly by the mean drift over Δt = 2 s
        factor.evaluate(&[&[5.0], &[9.0], &[1.5], &[2.5]], &mut r, None);
        assert!(r[0].abs() < 1e-12);
        factor.evaluate(&[&[5.0], &[10.0], &[1.5], &[2.5]], &mut r, None);
        assert!((r[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ddt_smooth_penalizes_drift_changes() {
        let factor = DdtSmoothFactor::new(3.0);
        let mut r = [0.0];
        factor.evaluate(&[&[2.0], &[2.5]], &mut r, None);
        assert!((r[0] - 1.5).abs() < 1e-12);
    }
}
