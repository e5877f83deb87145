//! GNSS-VI alignment: coarse receiver localization from pseudoranges,
//! yaw alignment between the local world frame and ENU using Doppler
//! velocities, and nonlinear anchor refinement.
//!
//! The two nonlinear stages are plain Euclidean least-squares problems
//! and run through the `levenberg-marquardt` crate; the coarse stage is a
//! damped Gauss-Newton single-point positioning solve.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Owned, SVector, Vector3};
use tracing::{debug, warn};

use crate::gnss::{
    ecef2geo, ecef2rotation, klobuchar_iono_delay, saastamoinen_tropo_delay, sat_azel,
    satellite_state_for, EphemerisPtr, GnssObservation, SatelliteState, EARTH_OMEGA, LIGHT_SPEED,
};

/// One window frame's gated observations with their matched ephemerides.
pub type FrameObservations = Vec<(GnssObservation, EphemerisPtr)>;

/// Result of the full alignment.
#[derive(Debug, Clone)]
pub struct GnssAlignment {
    pub anchor_ecef: Vector3<f64>,
    pub yaw_enu_local: f64,
    pub rcv_ddt: f64,
    /// Per-system receiver clock biases at the oldest window frame (m).
    pub rcv_dt: [f64; 4],
    /// Which systems actually contributed observations.
    pub observed_systems: [bool; 4],
}

pub struct GnssViInitializer<'a> {
    frames: &'a [FrameObservations],
    iono_params: Vec<f64>,
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

fn sagnac(sat_pos: &Vector3<f64>, rcv: &Vector3<f64>) -> f64 {
    EARTH_OMEGA / LIGHT_SPEED * (sat_pos.x * rcv.y - sat_pos.y * rcv.x)
}

impl<'a> GnssViInitializer<'a> {
    pub fn new(frames: &'a [FrameObservations], iono_params: Vec<f64>) -> Self {
        Self { frames, iono_params }
    }

    /// Weighted least-squares single-point solution over all window
    /// observations: `(x, y, z, dt_GPS, dt_GLO, dt_GAL, dt_BDS)`.
    pub fn coarse_localization(&self) -> Option<(SVector<f64, 7>, [bool; 4])> {
        let mut x = SVector::<f64, 7>::zeros();
        let mut observed = [false; 4];
        for frame in self.frames {
            for (obs, _) in frame {
                observed[obs.system.index()] = true;
            }
        }

        for iter in 0..10 {
            let mut h = nalgebra::SMatrix::<f64, 7, 7>::zeros();
            let mut b = SVector::<f64, 7>::zeros();
            let rcv: Vector3<f64> = x.fixed_rows::<3>(0).into_owned();
            let have_fix = rcv.norm() > 1e3;

            for frame in self.frames {
                for (obs, ephem) in frame {
                    let sat = satellite_state_for(obs, ephem);
                    let rv = sat.pos - rcv;
                    let range = rv.norm();
                    let unit = rv / range;

                    let mut correction = sagnac(&sat.pos, &rcv) - sat.clock_bias * LIGHT_SPEED;
                    if have_fix {
                        let geo = ecef2geo(&rcv);
                        let (az, el) = sat_azel(&rcv, &sat.pos);
                        correction += klobuchar_iono_delay(
                            obs.time_s, geo.x, geo.y, az, el, &self.iono_params,
                        );
                        correction += saastamoinen_tropo_delay(geo.z, el, 0.5);
                    }

                    let sys = obs.system.index();
                    let predicted = range + correction + x[3 + sys];
                    let residual = obs.psr - predicted;
                    let w = 1.0 / obs.psr_std.max(0.1);

                    let mut row = SVector::<f64, 7>::zeros();
                    row.fixed_rows_mut::<3>(0).copy_from(&(-unit));
                    row[3 + sys] = 1.0;

                    h += w * row * row.transpose();
                    b += w * row * residual;
                }
            }
            // keep unobserved clock columns out of the solve
            for k in 0..4 {
                if !observed[k] {
                    h[(3 + k, 3 + k)] += 1.0;
                }
            }
            for i in 0..7 {
                h[(i, i)] += 1e-9;
            }

            let chol = nalgebra::Cholesky::new(h)?;
            let dx = chol.solve(&b);
            x += dx;
            if dx.norm() < 1e-4 {
                debug!("coarse localization converged after {} iterations", iter + 1);
                break;
            }
        }

        let pos: Vector3<f64> = x.fixed_rows::<3>(0).into_owned();
        if !pos.norm().is_finite() || pos.norm() < 6.0e6 || pos.norm() > 7.0e6 {
            warn!("coarse localization rejected, |p| = {:.0}", pos.norm());
            return None;
        }
        for k in 0..4 {
            if !observed[k] {
                x[3 + k] = 0.0;
            }
        }
        Some((x, observed))
    }

    /// Fits the single yaw between the local world frame and ENU (plus the
    /// receiver clock drift) against Doppler-derived velocities.
    pub fn yaw_alignment(
        &self,
        local_vs: &[Vector3<f64>],
        anchor: &Vector3<f64>,
    ) -> Option<(f64, f64)> {
        let mut rows = Vec::new();
        for (i, frame) in self.frames.iter().enumerate() {
            for (obs, ephem) in frame {
                let sat = satellite_state_for(obs, ephem);
                let unit = (sat.pos - anchor).normalize();
                rows.push(DoppRow {
                    sat,
                    unit,
                    dopp_m: obs.dopp * obs.wavelength(),
                    weight: 1.0 / obs.dopp_std.max(0.01),
                    frame: i,
                });
            }
        }
        if rows.is_empty() {
            return None;
        }

        let problem = YawAlignProblem {
            x: SVector::<f64, 2>::zeros(),
            rows,
            local_vs: local_vs.to_vec(),
            r_ecef_enu: ecef2rotation(anchor),
            anchor: *anchor,
        };
        let (solved, report) = LevenbergMarquardt::new().minimize(problem);
        if !report.termination.was_successful() {
            warn!("yaw alignment did not converge: {:?}", report.termination);
            return None;
        }
        let mut yaw = solved.x[0];
        while yaw > std::f64::consts::PI {
            yaw -= 2.0 * std::f64::consts::PI;
        }
        while yaw <= -std::f64::consts::PI {
            yaw += 2.0 * std::f64::consts::PI;
        }
        Some((yaw, solved.x[1]))
    }

    /// Joint refinement of the ECEF anchor and the per-system clock
    /// biases, holding the aligned yaw and drift fixed.
    pub fn anchor_refinement(
        &self,
        local_ps: &[Vector3<f64>],
        yaw: f64,
        rcv_ddt: f64,
        rough: &SVector<f64, 7>,
        observed: &[bool; 4],
    ) -> Option<SVector<f64, 7>> {
        let mut rows = Vec::new();
        for (i, frame) in self.frames.iter().enumerate() {
            for (obs, ephem) in frame {
                let sat = satellite_state_for(obs, ephem);
                rows.push(PsrRow {
                    sat,
                    psr: obs.psr,
                    weight: 1.0 / obs.psr_std.max(0.1),
                    sys: obs.system.index(),
                    frame: i,
                });
            }
        }
        if rows.is_empty() {
            return None;
        }

        let problem = AnchorRefineProblem {
            x: *rough,
            rows,
            local_ps: local_ps.to_vec(),
            r_enu_local: rot_z(yaw),
            rcv_ddt,
            observed: *observed,
        };
        let (solved, report) = LevenbergMarquardt::new().minimize(problem);
        if !report.termination.was_successful() {
            warn!("anchor refinement did not converge: {:?}", report.termination);
            return None;
        }
        Some(solved.x)
    }

    /// Runs all stages; `local_ps`/`local_vs` are the window positions and
    /// velocities in the local world frame.
    pub fn align(
        &self,
        local_ps: &[Vector3<f64>],
        local_vs: &[Vector3<f64>],
    ) -> Option<GnssAlignment> {
        let (rough, observed) = self.coarse_localization()?;
        let rough_anchor: Vector3<f64> = rough.fixed_rows::<3>(0).into_owned();

        let (yaw, rcv_ddt) = self.yaw_alignment(local_vs, &rough_anchor)?;
        let refined = self.anchor_refinement(local_ps, yaw, rcv_ddt, &rough, &observed)?;

        let mut rcv_dt = [0.0; 4];
        let fallback = (0..4).find(|k| observed[*k])?;
        for k in 0..4 {
            rcv_dt[k] = if observed[k] {
                refined[3 + k]
            } else {
                refined[3 + fallback]
            };
        }
        Some(GnssAlignment {
            anchor_ecef: refined.fixed_rows::<3>(0).into_owned(),
            yaw_enu_local: yaw,
            rcv_ddt,
            rcv_dt,
            observed_systems: observed,
        })
    }
}

struct DoppRow {
    sat: SatelliteState,
    unit: Vector3<f64>,
    dopp_m: f64,
    weight: f64,
    frame: usize,
}

/// Yaw + clock-drift fit on Doppler residuals.
struct YawAlignProblem {
    x: SVector<f64, 2>,
    rows: Vec<DoppRow>,
    local_vs: Vec<Vector3<f64>>,
    r_ecef_enu: Matrix3<f64>,
    anchor: Vector3<f64>,
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for YawAlignProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.x[0] = x[0];
        self.x[1] = x[1];
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_column_slice(self.x.as_slice())
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let (yaw, ddt) = (self.x[0], self.x[1]);
        let r_ecef_local = self.r_ecef_enu * rot_z(yaw);
        let mut r = DVector::zeros(self.rows.len());
        for (k, row) in self.rows.iter().enumerate() {
            let v_ecef = r_ecef_local * self.local_vs[row.frame];
            let dopp_sagnac = EARTH_OMEGA / LIGHT_SPEED
                * (row.sat.vel.x * self.anchor.y + row.sat.pos.x * v_ecef.y
                    - row.sat.vel.y * self.anchor.x
                    - row.sat.pos.y * v_ecef.x);
            r[k] = ((row.sat.vel - v_ecef).dot(&row.unit) + dopp_sagnac + ddt
                - row.sat.clock_drift * LIGHT_SPEED
                + row.dopp_m)
                * row.weight;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let yaw = self.x[0];
        let d_rot = self.r_ecef_enu * drot_z(yaw);
        let mut j = DMatrix::zeros(self.rows.len(), 2);
        for (k, row) in self.rows.iter().enumerate() {
            let dv = d_rot * self.local_vs[row.frame];
            let d_sagnac = EARTH_OMEGA / LIGHT_SPEED
                * (row.sat.pos.x * dv.y - row.sat.pos.y * dv.x);
            j[(k, 0)] = (-dv.dot(&row.unit) + d_sagnac) * row.weight;
            j[(k, 1)] = row.weight;
        }
        Some(j)
    }
}

struct PsrRow {
    sat: SatelliteState,
    psr: f64,
    weight: f64,
    sys: usize,
    frame: usize,
}

/// Anchor + per-system clock-bias refinement on pseudoranges.
struct AnchorRefineProblem {
    x: SVector<f64, 7>,
    rows: Vec<PsrRow>,
    local_ps: Vec<Vector3<f64>>,
    r_enu_local: Matrix3<f64>,
    rcv_ddt: f64,
    observed: [bool; 4],
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for AnchorRefineProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        for i in 0..7 {
            self.x[i] = x[i];
        }
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_column_slice(self.x.as_slice())
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let anc: Vector3<f64> = self.x.fixed_rows::<3>(0).into_owned();
        let r_ecef_local = ecef2rotation(&anc) * self.r_enu_local;
        let mut r = DVector::zeros(self.rows.len());
        for (k, row) in self.rows.iter().enumerate() {
            let rcv = anc + r_ecef_local * self.local_ps[row.frame];
            let range = (row.sat.pos - rcv).norm();
            let dt = self.x[3 + row.sys] + self.rcv_ddt * row.frame as f64;
            let predicted = range + sagnac(&row.sat.pos, &rcv) + dt
                - row.sat.clock_bias * LIGHT_SPEED;
            r[k] = (predicted - row.psr) * row.weight;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let anc: Vector3<f64> = self.x.fixed_rows::<3>(0).into_owned();
        let r_ecef_local = ecef2rotation(&anc) * self.r_enu_local;
        let mut j = DMatrix::zeros(self.rows.len(), 7);
        for (k, row) in self.rows.iter().enumerate() {
            let rcv = anc + r_ecef_local * self.local_ps[row.frame];
            let unit = (row.sat.pos - rcv).normalize();
            for c in 0..3 {
                j[(k, c)] = -unit[c] * row.weight;
            }
            if self.observed[row.sys] {
                j[(k, 3 + row.sys)] = row.weight;
            }
        }
        Some(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::{Ephemeris, SatSystem};
    use std::sync::Arc;

    struct StaticSat {
        pos: Vector3<f64>,
        vel: Vector3<f64>,
    }

    impl Ephemeris for StaticSat {
        fn system(&self) -> SatSystem {
            SatSystem::Gps
        }
        fn toe_s(&self) -> f64 {
            0.0
        }
        fn satellite_state(&self, _t: f64) -> crate::gnss::SatelliteState {
            crate::gnss::SatelliteState {
                pos: self.pos,
                vel: self.vel,
                clock_bias: 0.0,
                clock_drift: 0.0,
            }
        }
    }

    fn receiver() -> Vector3<f64> {
        Vector3::new(-2_700_000.0, 4_500_000.0, 3_600_000.0).normalize() * 6_378_000.0
    }

    fn constellation(rcv: &Vector3<f64>) -> Vec<Vector3<f64>> {
        let r_enu = ecef2rotation(rcv);
        let mut sats = Vec::new();
        // spread satellites across the sky at healthy elevations
        for (az_deg, el_deg) in [
            (0.0, 70.0), (60.0, 45.0), (120.0, 50.0),
            (180.0, 60.0), (240.0, 40.0), (300.0, 55.0),
            (30.0, 35.0), (210.0, 75.0), (90.0, 65.0), (270.0, 30.0),
        ] {
            let az = f64::to_radians(az_deg);
            let el = f64::to_radians(el_deg);
            let dir_enu = Vector3::new(el.cos() * az.sin(), el.cos() * az.cos(), el.sin());
            sats.push(rcv + r_enu * dir_enu * 22_000_000.0);
        }
        sats
    }

    fn psr_for(rcv: &Vector3<f64>, sat: &Vector3<f64>, dt: f64) -> f64 {
        (sat - rcv).norm() + sagnac(sat, rcv) + dt
    }

    #[test]
    fn coarse_localization_finds_receiver() {
        let rcv = receiver();
        let clock = 42.0; // meters
        let frames: Vec<FrameObservations> = (0..3)
            .map(|_| {
                constellation(&rcv)
                    .iter()
                    .enumerate()
                    .map(|(s, sat)| {
                        let obs = GnssObservation {
                            sat: s as u32,
                            system: SatSystem::Gps,
                            time_s: 100.0,
                            psr: psr_for(&rcv, sat, clock),
                            psr_std: 0.5,
                            dopp: 0.0,
                            dopp_std: 0.05,
                            snr: 45.0,
                            freq_hz: crate::gnss::GPS_L1_FREQ,
                        };
                        let eph: EphemerisPtr = Arc::new(StaticSat {
                            pos: *sat,
                            vel: Vector3::zeros(),
                        });
                        (obs, eph)
                    })
                    .collect()
            })
            .collect();

        let init = GnssViInitializer::new(&frames, vec![]);
        let (x, observed) = init.coarse_localization().expect("solution");
        let pos: Vector3<f64> = x.fixed_rows::<3>(0).into_owned();
        // atmosphere-free synthetic data converges tightly
        assert!((pos - rcv).norm() < 1.0, "error {}", (pos - rcv).norm());
        assert!((x[3] - clock).abs() < 1.0);
        assert!(observed[0] && !observed[1]);
    }

    #[test]
    fn yaw_alignment_recovers_heading() {
        let rcv = receiver();
        let yaw_true = 0.6_f64;
        let r_ecef_enu = ecef2rotation(&rcv);
        let r_ecef_local = r_ecef_enu * rot_z(yaw_true);

        // body moves at 1.5 m/s along local x
        let local_v = Vector3::new(1.5, 0.0, 0.0);
        let v_ecef = r_ecef_local * local_v;

        let frames: Vec<FrameObservations> = (0..3)
            .map(|_| {
                constellation(&rcv)
                    .iter()
                    .enumerate()
                    .map(|(s, sat)| {
                        let unit = (sat - rcv).normalize();
                        let dopp_sagnac = EARTH_OMEGA / LIGHT_SPEED
                            * (sat.x * v_ecef.y - sat.y * v_ecef.x);
                        // measurement consistent with the factor model
                        let dopp_m = -((-v_ecef).dot(&unit) + dopp_sagnac);
                        let obs = GnssObservation {
                            sat: s as u32,
                            system: SatSystem::Gps,
                            time_s: 100.0,
                            psr: (sat - rcv).norm(),
                            psr_std: 0.5,
                            dopp: dopp_m / (LIGHT_SPEED / crate::gnss::GPS_L1_FREQ),
                            dopp_std: 0.05,
                            snr: 45.0,
                            freq_hz: crate::gnss::GPS_L1_FREQ,
                        };
                        let eph: EphemerisPtr = Arc::new(StaticSat {
                            pos: *sat,
                            vel: Vector3::zeros(),
                        });
                        (obs, eph)
                    })
                    .collect()
            })
            .collect();

        let init = GnssViInitializer::new(&frames, vec![]);
        let local_vs = vec![local_v; 3];
        let (yaw, ddt) = init.yaw_alignment(&local_vs, &rcv).expect("yaw");
        assert!((yaw - yaw_true).abs() < 1e-4, "yaw {yaw} vs {yaw_true}");
        assert!(ddt.abs() < 1e-3);
    }
}
