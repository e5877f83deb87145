//! The sliding-window estimator core: per-iteration problem assembly,
//! solve, unpack, marginalization, and window shift.
//!
//! Everything here is accessed by the measurement dispatcher only, under
//! the process mutex owned by the wrapping [`super::Estimator`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector2, Vector3, Vector6};
use tracing::{debug, info, warn};

use crate::config::{Config, GNSS_IONO_DEFAULT_PARAMS};
use crate::factors::{
    DdtSmoothFactor, DtDdtFactor, GnssPsrDoppFactor, ImuEncoderFactor, ImuFactor,
    ProjectionOneFrameTwoCam, ProjectionTwoFrameOneCam, ProjectionTwoFrameTwoCam,
};
use crate::features::{FeatureFrame, FeatureManager, MarginalizationFlag};
use crate::geometry::so3::{delta_q, g2r, r2ypr, ypr2r};
use crate::gnss::{ecef2rotation, sat_azel, satellite_state_for, EphemerisPtr, GnssObservation};
use crate::imu::Preintegration;
use crate::init::{
    GlobalSfm, GnssViInitializer, ImageFrame, InitialExRotation, SfmFeature,
};
use crate::solver::marginalization::{MarginalizationFactor, MarginalizationInfo};
use crate::solver::{BlockKey, Loss, Manifold, Problem, SolverOptions};

use super::output::OutputEvent;

/// Estimator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverFlag {
    Initial,
    NonLinear,
}

// parameter-block key space, one tag per block family
const KIND_POSE: u64 = 1;
const KIND_SPEED_BIAS: u64 = 2;
const KIND_EX_POSE: u64 = 3;
const KIND_TD: u64 = 4;
const KIND_FEATURE: u64 = 5;
const KIND_RCV_DT: u64 = 6;
const KIND_RCV_DDT: u64 = 7;
const KIND_YAW: u64 = 8;
const KIND_ANCHOR: u64 = 9;

fn key(kind: u64, index: u64) -> BlockKey {
    BlockKey(kind << 32 | index)
}

/// Seed for the fast predictor after an estimator iteration.
#[derive(Debug, Clone, Copy)]
pub struct LatestSeed {
    pub time: f64,
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    pub v: Vector3<f64>,
    pub ba: Vector3<f64>,
    pub bg: Vector3<f64>,
    pub acc_0: Vector3<f64>,
    pub gyr_0: Vector3<f64>,
    pub g: Vector3<f64>,
}

pub struct EstimatorCore {
    cfg: Config,

    pub solver_flag: SolverFlag,
    pub marginalization_flag: MarginalizationFlag,

    // window state, slot W+1 wide
    pub headers: Vec<f64>,
    pub ps: Vec<Vector3<f64>>,
    pub vs: Vec<Vector3<f64>>,
    pub rs: Vec<Matrix3<f64>>,
    pub bas: Vec<Vector3<f64>>,
    pub bgs: Vec<Vector3<f64>>,
    pub frame_count: usize,
    pub td: f64,
    g: Vector3<f64>,
    tic: [Vector3<f64>; 2],
    ric: [Matrix3<f64>; 2],
    estimate_extrinsic: u8,

    pre_integrations: Vec<Option<Preintegration>>,
    acc_0: Vector3<f64>,
    gyr_0: Vector3<f64>,
    enc_v_0: Vector6<f64>,
    first_imu: bool,
    init_first_pose_flag: bool,
    initial_timestamp: f64,

    pub f_manager: FeatureManager,
    all_image_frame: Vec<(f64, ImageFrame)>,
    tmp_pre_integration: Option<Preintegration>,
    initial_ex_rotation: InitialExRotation,

    // GNSS state
    pub gnss_ready: bool,
    anc_ecef: Vector3<f64>,
    r_ecef_enu: Matrix3<f64>,
    pub yaw_enu_local: f64,
    gnss_meas_buf: Vec<Vec<(GnssObservation, EphemerisPtr)>>,
    sat2ephem: BTreeMap<u32, Vec<EphemerisPtr>>,
    sat_track_status: BTreeMap<u32, u32>,
    latest_iono_params: Vec<f64>,
    diff_t_gnss_local: f64,
    para_rcv_dt: Vec<f64>,
    para_rcv_ddt: Vec<f64>,
    pub ecef_pos: Vector3<f64>,
    pub enu_pos: Vector3<f64>,
    pub enu_vel: Vector3<f64>,
    pub enu_ypr: Vector3<f64>,

    // packed parameter mirrors of the window state
    para_pose: Vec<[f64; 7]>,
    para_speed_bias: Vec<[f64; 9]>,
    para_feature: Vec<f64>,
    para_ex_pose: [[f64; 7]; 2],
    para_td: f64,
    para_yaw: f64,
    para_anc: [f64; 3],

    last_marginalization: Option<Arc<MarginalizationInfo>>,
    last_marginalization_keys: Vec<BlockKey>,

    open_ex_estimation: bool,
    failure_occur: bool,
    back_r0: Matrix3<f64>,
    back_p0: Vector3<f64>,
    last_r: Matrix3<f64>,
    last_p: Vector3<f64>,
    last_r0: Matrix3<f64>,
    last_p0: Vector3<f64>,
    pub key_poses: Vec<Vector3<f64>>,
}

impl EstimatorCore {
    pub fn new(cfg: Config) -> Self {
        let w = cfg.window_size;
        let mut core = Self {
            solver_flag: SolverFlag::Initial,
            marginalization_flag: MarginalizationFlag::MarginOld,
            headers: vec![0.0; w + 1],
            ps: vec![Vector3::zeros(); w + 1],
            vs: vec![Vector3::zeros(); w + 1],
            rs: vec![Matrix3::identity(); w + 1],
            bas: vec![Vector3::zeros(); w + 1],
            bgs: vec![Vector3::zeros(); w + 1],
            frame_count: 0,
            td: cfg.td,
            g: cfg.g,
            tic: cfg.tic,
            ric: cfg.ric,
            estimate_extrinsic: cfg.estimate_extrinsic,
            pre_integrations: (0..=w).map(|_| None).collect(),
            acc_0: Vector3::zeros(),
            gyr_0: Vector3::zeros(),
            enc_v_0: Vector6::zeros(),
            first_imu: false,
            init_first_pose_flag: false,
            initial_timestamp: 0.0,
            f_manager: FeatureManager::new(cfg.min_parallax(), w),
            all_image_frame: Vec::new(),
            tmp_pre_integration: None,
            initial_ex_rotation: InitialExRotation::new(w),
            gnss_ready: false,
            anc_ecef: Vector3::zeros(),
            r_ecef_enu: Matrix3::identity(),
            yaw_enu_local: 0.0,
            gnss_meas_buf: vec![Vec::new(); w + 1],
            sat2ephem: BTreeMap::new(),
            sat_track_status: BTreeMap::new(),
            latest_iono_params: GNSS_IONO_DEFAULT_PARAMS.to_vec(),
            diff_t_gnss_local: 0.0,
            para_rcv_dt: vec![0.0; (w + 1) * 4],
            para_rcv_ddt: vec![0.0; w + 1],
            ecef_pos: Vector3::zeros(),
            enu_pos: Vector3::zeros(),
            enu_vel: Vector3::zeros(),
            enu_ypr: Vector3::zeros(),
            para_pose: vec![[0.0; 7]; w + 1],
            para_speed_bias: vec![[0.0; 9]; w + 1],
            para_feature: Vec::new(),
            para_ex_pose: [[0.0; 7]; 2],
            para_td: 0.0,
            para_yaw: 0.0,
            para_anc: [0.0; 3],
            last_marginalization: None,
            last_marginalization_keys: Vec::new(),
            open_ex_estimation: false,
            failure_occur: false,
            back_r0: Matrix3::identity(),
            back_p0: Vector3::zeros(),
            last_r: Matrix3::identity(),
            last_p: Vector3::zeros(),
            last_r0: Matrix3::identity(),
            last_p0: Vector3::zeros(),
            key_poses: Vec::new(),
            cfg,
        };
        core.clear_state();
        core.set_parameter();
        core
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    fn window_size(&self) -> usize {
        self.cfg.window_size
    }

    /// Resets everything back to the pre-initialization state. Sensor
    /// buffers live in the wrapper and are cleared there.
    pub fn clear_state(&mut self) {
        let w = self.window_size();
        for i in 0..=w {
            self.headers[i] = 0.0;
            self.rs[i] = Matrix3::identity();
            self.ps[i] = Vector3::zeros();
            self.vs[i] = Vector3::zeros();
            self.bas[i] = Vector3::zeros();
            self.bgs[i] = Vector3::zeros();
            self.pre_integrations[i] = None;
            self.gnss_meas_buf[i].clear();
        }
        for c in 0..2 {
            self.tic[c] = Vector3::zeros();
            self.ric[c] = Matrix3::identity();
        }
        self.first_imu = false;
        self.frame_count = 0;
        self.solver_flag = SolverFlag::Initial;
        self.initial_timestamp = 0.0;
        self.init_first_pose_flag = false;
        self.all_image_frame.clear();
        self.tmp_pre_integration = None;

        self.gnss_ready = false;
        self.anc_ecef = Vector3::zeros();
        self.r_ecef_enu = Matrix3::identity();
        self.yaw_enu_local = 0.0;
        self.para_yaw = 0.0;
        self.sat2ephem.clear();
        self.sat_track_status.clear();
        self.latest_iono_params = GNSS_IONO_DEFAULT_PARAMS.to_vec();
        self.diff_t_gnss_local = 0.0;
        self.para_rcv_dt.iter_mut().for_each(|v| *v = 0.0);
        self.para_rcv_ddt.iter_mut().for_each(|v| *v = 0.0);

        self.last_marginalization = None;
        self.last_marginalization_keys.clear();
        self.f_manager.clear_state();
        self.failure_occur = false;
        self.open_ex_estimation = false;
    }

    /// Re-applies configured extrinsics, time offset, and gravity after a
    /// reset.
    pub fn set_parameter(&mut self) {
        for c in 0..self.cfg.num_of_cam.min(2) {
            self.tic[c] = self.cfg.tic[c];
            self.ric[c] = self.cfg.ric[c];
        }
        self.f_manager.clear_state();
        self.td = self.cfg.td;
        self.g = self.cfg.g;
        self.estimate_extrinsic = self.cfg.estimate_extrinsic;
        info!("gravity set to {:?}", self.g.as_slice());
    }

    /// Toggles sensors at runtime; returns `true` when a full restart is
    /// required (IMU switched on).
    pub fn change_sensor_type(&mut self, use_imu: bool, use_stereo: bool) -> bool {
        if !use_imu && !use_stereo {
            warn!("at least two sensors required, ignoring request");
            return false;
        }
        let mut restart = false;
        if self.cfg.use_imu != use_imu {
            self.cfg.use_imu = use_imu;
            if use_imu {
                restart = true;
            } else {
                self.last_marginalization = None;
                self.last_marginalization_keys.clear();
                self.tmp_pre_integration = None;
            }
        }
        self.cfg.stereo = use_stereo;
        info!("sensor change: imu {use_imu}, stereo {use_stereo}");
        restart
    }

    // ── ephemeris / iono / time inputs ────────────────────────────────

    pub fn input_ephem(&mut self, ephem: EphemerisPtr, sat: u32) {
        let list = self.sat2ephem.entry(sat).or_default();
        let toe = ephem.toe_s();
        if !list.iter().any(|e| (e.toe_s() - toe).abs() < 1e-3) {
            list.push(ephem);
        }
    }

    pub fn input_iono_params(&mut self, params: &[f64]) {
        if params.len() != 8 {
            return;
        }
        self.latest_iono_params = params.to_vec();
    }

    pub fn input_gnss_time_diff(&mut self, t_diff: f64) {
        self.diff_t_gnss_local = t_diff;
    }

    // ── IMU propagation ───────────────────────────────────────────────

    fn make_pre_integration(&self, slot: usize) -> Preintegration {
        if self.cfg.encoder_enable {
            Preintegration::new_with_encoder(
                self.acc_0,
                self.gyr_0,
                self.enc_v_0,
                self.bas[slot],
                self.bgs[slot],
                self.cfg.imu_noise,
                self.cfg.encoder_extrinsics.clone(),
            )
        } else {
            Preintegration::new(
                self.acc_0,
                self.gyr_0,
                self.bas[slot],
                self.bgs[slot],
                self.cfg.imu_noise,
            )
        }
    }

    /// Midpoint-propagates the newest window state with one IMU sample and
    /// feeds the slot's pre-integration.
    pub fn process_imu(
        &mut self,
        dt: f64,
        acc: Vector3<f64>,
        gyr: Vector3<f64>,
        enc_v: Option<Vector6<f64>>,
    ) {
        assert!(dt >= 0.0, "non-monotonic IMU timestamps");
        if !self.first_imu {
            self.first_imu = true;
            self.acc_0 = acc;
            self.gyr_0 = gyr;
            self.enc_v_0 = enc_v.unwrap_or_else(Vector6::zeros);
        }

        if self.pre_integrations[self.frame_count].is_none() {
            self.pre_integrations[self.frame_count] = Some(self.make_pre_integration(self.frame_count));
        }
        if self.frame_count != 0 {
            self.pre_integrations[self.frame_count]
                .as_mut()
                .expect("created above")
                .push_back(dt, acc, gyr, enc_v);
            if let Some(tmp) = self.tmp_pre_integration.as_mut() {
                tmp.push_back(dt, acc, gyr, enc_v);
            }

            let j = self.frame_count;
            let un_acc_0 = self.rs[j] * (self.acc_0 - self.bas[j]) - self.g;
            let un_gyr = 0.5 * (self.gyr_0 + gyr) - self.bgs[j];
            self.rs[j] *= delta_q(&(un_gyr * dt)).to_rotation_matrix().into_inner();
            let un_acc_1 = self.rs[j] * (acc - self.bas[j]) - self.g;
            let un_acc = 0.5 * (un_acc_0 + un_acc_1);
            self.ps[j] += dt * self.vs[j] + 0.5 * dt * dt * un_acc;
            self.vs[j] += dt * un_acc;
        }
        self.acc_0 = acc;
        self.gyr_0 = gyr;
        if let Some(v) = enc_v {
            self.enc_v_0 = v;
        }
    }

    /// Aligns the very first window frame with gravity from the initial
    /// accelerometer average; yaw is removed.
    pub fn init_first_imu_pose(&mut self, acc_samples: &[(f64, Vector3<f64>)]) {
        info!("initializing first IMU pose");
        self.init_first_pose_flag = true;
        let n = acc_samples.len().max(1);
        let aver_acc: Vector3<f64> =
            acc_samples.iter().map(|(_, a)| *a).sum::<Vector3<f64>>() / n as f64;
        debug!("average acceleration {:?}", aver_acc.as_slice());
        self.rs[0] = g2r(&aver_acc);
        debug!("initial R0 ypr {:?}", r2ypr(&self.rs[0]).as_slice());
    }

    pub fn first_pose_initialized(&self) -> bool {
        self.init_first_pose_flag
    }

    /// Seeds the first pose from an external source instead.
    pub fn init_first_pose(&mut self, p: Vector3<f64>, r: Matrix3<f64>) {
        self.ps[0] = p;
        self.rs[0] = r;
        self.init_first_pose_flag = true;
    }

    /// Consumes one extracted sensor interval `(prev_time, cur_time]`,
    /// interpolating wheel speeds at IMU timestamps when present.
    pub fn process_sensor_interval(
        &mut self,
        acc: &[(f64, Vector3<f64>)],
        gyr: &[(f64, Vector3<f64>)],
        enc: Option<&[(f64, Vector6<f64>)]>,
        prev_time: f64,
        cur_time: f64,
    ) {
        if !self.init_first_pose_flag {
            self.init_first_imu_pose(acc);
        }
        let mut last_velocity = Vector6::zeros();
        for i in 0..acc.len() {
            let t = acc[i].0;
            let dt = if i == 0 {
                acc[i].0 - prev_time
            } else if i == acc.len() - 1 {
                cur_time - acc[i - 1].0
            } else {
                acc[i].0 - acc[i - 1].0
            };
            assert!(dt >= 0.0, "non-monotonic sensor interval");

            let enc_velocity = enc.map(|samples| {
                let mut velocity = if samples.is_empty() {
                    let mut v = Vector6::zeros();
                    v.fixed_rows_mut::<3>(0).copy_from(&self.vs[self.frame_count]);
                    v.fixed_rows_mut::<3>(3).copy_from(&self.vs[self.frame_count]);
                    v
                } else {
                    samples[0].1
                };
                let mut bracket: (Option<(f64, Vector6<f64>)>, Option<(f64, Vector6<f64>)>) =
                    (None, None);
                for s in samples {
                    if s.0 <= t {
                        bracket.0 = Some(*s);
                    } else {
                        bracket.1 = Some(*s);
                        break;
                    }
                }
                if let (Some((t0, v0)), Some((t1, v1))) = bracket {
                    let dt0 = t - t0;
                    let dt1 = t1 - t;
                    if dt0 >= 0.0 && dt1 >= 0.0 && dt0 + dt1 > 0.0 {
                        let w1 = dt1 / (dt0 + dt1);
                        let w2 = dt0 / (dt0 + dt1);
                        velocity = w1 * v0 + w2 * v1;
                    }
                }
                velocity
            });

            if enc.is_some() && t > cur_time && i > 0 {
                // boundary sample: blend toward cur_time
                let dt1 = dt;
                let dt2 = t - cur_time;
                let w1 = dt2 / (dt1 + dt2);
                let w2 = dt1 / (dt1 + dt2);
                let acc_b = w1 * acc[i - 1].1 + w2 * acc[i].1;
                let gyr_b = w1 * gyr[i - 1].1 + w2 * gyr[i].1;
                let enc_b = w1 * last_velocity + w2 * enc_velocity.expect("encoder enabled");
                self.process_imu(dt, acc_b, gyr_b, Some(enc_b));
            } else {
                self.process_imu(dt, acc[i].1, gyr[i].1, enc_velocity);
            }
            if let Some(v) = enc_velocity {
                last_velocity = v;
            }
        }
    }

    // ── GNSS ingestion ────────────────────────────────────────────────

    /// Gates one observation batch into the newest window slot.
    pub fn process_gnss(&mut self, batch: &[GnssObservation]) {
        let mut valid = Vec::new();
        for obs in batch {
            let Some(ephems) = self.sat2ephem.get(&obs.sat) else {
                continue;
            };
            // best-matching ephemeris by time-of-ephemeris age
            let mut best: Option<(&EphemerisPtr, f64)> = None;
            for e in ephems {
                let age = (e.toe_s() - obs.time_s).abs();
                if best.as_ref().map_or(true, |(_, b)| age < *b) {
                    best = Some((e, age));
                }
            }
            let Some((ephem, age)) = best else { continue };
            if age >= self.cfg.eph_valid_seconds {
                warn!("ephemeris for sat {} no longer valid", obs.sat);
                continue;
            }
            let ephem = ephem.clone();

            if obs.psr_std > self.cfg.gnss_psr_std_thres
                || obs.dopp_std > self.cfg.gnss_dopp_std_thres
            {
                self.sat_track_status.insert(obs.sat, 0);
                continue;
            }
            let count = self.sat_track_status.entry(obs.sat).or_insert(0);
            *count += 1;
            if *count < self.cfg.gnss_track_num_thres {
                continue;
            }

            if self.gnss_ready {
                let sat_state = satellite_state_for(obs, &ephem);
                let (_, el) = sat_azel(&self.ecef_pos, &sat_state.pos);
                if el < self.cfg.gnss_elevation_thres.to_radians() {
                    continue;
                }
            }
            valid.push((obs.clone(), ephem));
        }
        self.gnss_meas_buf[self.frame_count] = valid;
    }

    /// GNSS-VI alignment: coarse localization, yaw alignment, anchor
    /// refinement. Requires dense observations over the whole window and
    /// enough horizontal motion.
    pub fn gnss_vi_align(&mut self) -> bool {
        if self.solver_flag == SolverFlag::Initial {
            return false;
        }
        if self.gnss_ready {
            return true;
        }
        let w = self.window_size();
        for i in 0..=w {
            if self.gnss_meas_buf[i].len() < 10 {
                return false;
            }
        }
        let mut avg_hor_vel = Vector2::zeros();
        for i in 0..=w {
            avg_hor_vel += self.vs[i].xy().abs();
        }
        avg_hor_vel /= (w + 1) as f64;
        if avg_hor_vel.norm() < 0.3 {
            warn!("velocity excitation not enough for GNSS-VI alignment");
            return false;
        }

        let frames: Vec<_> = self.gnss_meas_buf.clone();
        let initializer = GnssViInitializer::new(&frames, self.latest_iono_params.clone());
        let Some(alignment) = initializer.align(&self.ps, &self.vs) else {
            warn!("GNSS-VI alignment failed");
            return false;
        };

        for i in 0..=w {
            self.para_rcv_ddt[i] = alignment.rcv_ddt;
            for k in 0..4 {
                self.para_rcv_dt[i * 4 + k] =
                    alignment.rcv_dt[k] + alignment.rcv_ddt * i as f64;
            }
        }
        self.anc_ecef = alignment.anchor_ecef;
        self.r_ecef_enu = ecef2rotation(&self.anc_ecef);
        self.yaw_enu_local = alignment.yaw_enu_local;
        info!(
            "GNSS-VI aligned: yaw {:.2}°, anchor |{:.0}|",
            self.yaw_enu_local.to_degrees(),
            self.anc_ecef.norm()
        );
        true
    }

    pub fn update_gnss_statistics(&mut self) {
        let w = self.window_size();
        let r_enu_local = nalgebra::Rotation3::from_axis_angle(
            &Vector3::z_axis(),
            self.yaw_enu_local,
        )
        .into_inner();
        self.enu_pos = r_enu_local * self.ps[w];
        self.enu_vel = r_enu_local * self.vs[w];
        self.enu_ypr = r2ypr(&(r_enu_local * self.rs[w]));
        self.ecef_pos = self.anc_ecef + self.r_ecef_enu * self.enu_pos;
    }

    // ── per-frame processing ──────────────────────────────────────────

    /// One estimator iteration for a feature frame stamped `header`.
    pub fn process_image(&mut self, image: &FeatureFrame, header: f64) {
        debug!("adding {} feature points", image.len());
        let w = self.window_size();

        self.marginalization_flag =
            self.f_manager
                .add_feature_check_parallax(self.frame_count, image, self.td);
        debug!(
            "this frame is {}",
            if self.marginalization_flag == MarginalizationFlag::MarginOld {
                "a keyframe"
            } else {
                "not a keyframe"
            }
        );
        self.headers[self.frame_count] = header;

        let mut frame = ImageFrame::new(image.clone(), header);
        frame.pre_integration = self.tmp_pre_integration.take();
        self.all_image_frame.push((header, frame));
        self.tmp_pre_integration = Some(self.make_pre_integration(self.frame_count));

        if self.estimate_extrinsic == 2 && self.frame_count != 0 {
            info!("calibrating extrinsic rotation, rotation movement is needed");
            let corres = self
                .f_manager
                .get_corresponding(self.frame_count - 1, self.frame_count);
            let delta_q_imu = self.pre_integrations[self.frame_count]
                .as_ref()
                .map(|p| p.delta_q)
                .unwrap_or_else(UnitQuaternion::identity);
            if let Some(calib_ric) = self.initial_ex_rotation.calibrate(&corres, delta_q_imu) {
                warn!("initial extrinsic rotation calibration success");
                self.ric[0] = calib_ric;
                self.estimate_extrinsic = 1;
            }
        }

        if self.solver_flag == SolverFlag::Initial {
            // monocular + IMU initialization
            if !self.cfg.stereo && self.cfg.use_imu && self.frame_count == w {
                let mut result = false;
                if self.estimate_extrinsic != 2 && header - self.initial_timestamp > 0.1 {
                    result = self.initial_structure();
                    self.initial_timestamp = header;
                }
                if result {
                    self.optimization();
                    self.solver_flag = SolverFlag::NonLinear;
                    self.slide_window();
                    info!("initialization finished");
                } else {
                    self.slide_window();
                }
            }

            // stereo + IMU initialization
            if self.cfg.stereo && self.cfg.use_imu {
                self.f_manager.init_frame_pose_by_pnp(
                    self.frame_count,
                    &mut self.ps,
                    &mut self.rs,
                    &self.tic,
                    &self.ric,
                );
                self.f_manager
                    .triangulate(self.frame_count, &self.ps, &self.rs, &self.tic, &self.ric);
                if self.frame_count == w {
                    for (i, (_, frame)) in self.all_image_frame.iter_mut().enumerate() {
                        if i <= w {
                            frame.r = self.rs[i];
                            frame.t_vec = self.ps[i];
                        }
                    }
                    let mut frames: Vec<ImageFrame> = self
                        .all_image_frame
                        .iter()
                        .map(|(t, f)| {
                            let mut copy = ImageFrame::new(FeatureFrame::new(), *t);
                            copy.r = f.r;
                            copy.t_vec = f.t_vec;
                            copy.pre_integration = f.pre_integration.clone();
                            copy
                        })
                        .collect();
                    crate::init::solve_gyroscope_bias(&mut frames, &mut self.bgs);
                    for (dst, src) in self.all_image_frame.iter_mut().zip(frames.into_iter()) {
                        dst.1.pre_integration = src.pre_integration;
                    }
                    for i in 0..=w {
                        if let Some(pre) = self.pre_integrations[i].as_mut() {
                            pre.repropagate(Vector3::zeros(), self.bgs[i]);
                        }
                    }
                    self.optimization();
                    self.solver_flag = SolverFlag::NonLinear;
                    self.slide_window();
                    info!("initialization finished");
                }
            }

            // stereo without IMU
            if self.cfg.stereo && !self.cfg.use_imu {
                self.f_manager.init_frame_pose_by_pnp(
                    self.frame_count,
                    &mut self.ps,
                    &mut self.rs,
                    &self.tic,
                    &self.ric,
                );
                self.f_manager
                    .triangulate(self.frame_count, &self.ps, &self.rs, &self.tic, &self.ric);
                self.optimization();
                if self.frame_count == w {
                    self.optimization();
                    self.solver_flag = SolverFlag::NonLinear;
                    self.slide_window();
                    info!("initialization finished");
                }
            }

            if self.frame_count < w {
                self.frame_count += 1;
                let prev = self.frame_count - 1;
                self.ps[self.frame_count] = self.ps[prev];
                self.vs[self.frame_count] = self.vs[prev];
                self.rs[self.frame_count] = self.rs[prev];
                self.bas[self.frame_count] = self.bas[prev];
                self.bgs[self.frame_count] = self.bgs[prev];
            }
        } else {
            if !self.cfg.use_imu {
                self.f_manager.init_frame_pose_by_pnp(
                    self.frame_count,
                    &mut self.ps,
                    &mut self.rs,
                    &self.tic,
                    &self.ric,
                );
            }
            self.f_manager
                .triangulate(self.frame_count, &self.ps, &self.rs, &self.tic, &self.ric);
            self.optimization();

            if self.cfg.gnss_enable {
                if !self.gnss_ready {
                    self.gnss_ready = self.gnss_vi_align();
                }
                if self.gnss_ready {
                    self.update_gnss_statistics();
                }
            }

            let remove_index = self.outliers_rejection();
            self.f_manager.remove_outlier(&remove_index);

            if self.failure_detection() {
                warn!("failure detection!");
                self.failure_occur = true;
                self.clear_state();
                self.set_parameter();
                warn!("system reboot!");
                return;
            }

            self.slide_window();
            self.f_manager.remove_failures();

            self.key_poses.clear();
            for i in 0..=w {
                self.key_poses.push(self.ps[i]);
            }
            self.last_r = self.rs[w];
            self.last_p = self.ps[w];
            self.last_r0 = self.rs[0];
            self.last_p0 = self.ps[0];
        }
    }

    // ── initialization ────────────────────────────────────────────────

    fn initial_structure(&mut self) -> bool {
        // IMU excitation check
        {
            let mut sum_g = Vector3::zeros();
            let mut count = 0usize;
            for (_, frame) in self.all_image_frame.iter().skip(1) {
                if let Some(pre) = frame.pre_integration.as_ref() {
                    if pre.sum_dt > 0.0 {
                        sum_g += pre.delta_v / pre.sum_dt;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                let aver_g = sum_g / count as f64;
                let mut var = 0.0;
                for (_, frame) in self.all_image_frame.iter().skip(1) {
                    if let Some(pre) = frame.pre_integration.as_ref() {
                        if pre.sum_dt > 0.0 {
                            let tmp_g = pre.delta_v / pre.sum_dt;
                            var += (tmp_g - aver_g).norm_squared();
                        }
                    }
                }
                var = (var / count as f64).sqrt();
                if var < 0.25 {
                    info!("IMU excitation not enough");
                }
            }
        }

        // global SfM over the window features
        let mut sfm_features: Vec<SfmFeature> = self
            .f_manager
            .feature
            .iter()
            .map(|track| {
                let obs = track
                    .feature_per_frame
                    .iter()
                    .enumerate()
                    .map(|(k, f)| (track.start_frame + k, f.point.xy()))
                    .collect();
                SfmFeature::new(track.feature_id, obs)
            })
            .collect();

        let Some((relative_r, relative_t, l)) = self.relative_pose() else {
            info!("not enough features or parallax; move device around");
            return false;
        };

        let Some(sfm) = GlobalSfm::construct(
            self.frame_count + 1,
            l,
            &relative_r,
            &relative_t,
            &mut sfm_features,
        ) else {
            debug!("global SfM failed");
            self.marginalization_flag = MarginalizationFlag::MarginOld;
            return false;
        };

        // PnP for all intermediate image frames outside the window
        let mut i = 0usize;
        let headers = self.headers.clone();
        let ric0 = self.ric[0];
        let mut ok = true;
        for (t, frame) in self.all_image_frame.iter_mut() {
            if i <= self.frame_count && (*t - headers[i]).abs() < 1e-9 {
                frame.is_key_frame = true;
                frame.r = sfm.rotations[i].to_rotation_matrix().into_inner() * ric0.transpose();
                frame.t_vec = sfm.translations[i];
                i += 1;
                continue;
            }
            if i <= self.frame_count && *t > headers[i] {
                i += 1;
            }
            let guess = i.min(self.frame_count);
            frame.is_key_frame = false;
            let mut r_cw = (sfm.rotations[guess].to_rotation_matrix().into_inner()).transpose();
            let mut t_cw = -r_cw * sfm.translations[guess];

            let mut pts3d = Vec::new();
            let mut pts2d = Vec::new();
            for (id, obs_list) in &frame.points {
                if let Some(world) = sfm.tracked_points.get(id) {
                    for obs in obs_list {
                        if obs.camera_id == 0 {
                            pts3d.push(*world);
                            pts2d.push(obs.point.xy());
                        }
                    }
                }
            }
            if pts3d.len() < 6 {
                debug!("not enough points for PnP: {}", pts3d.len());
                ok = false;
                break;
            }
            if !crate::geometry::solve_pnp(&pts3d, &pts2d, &mut r_cw, &mut t_cw) {
                debug!("PnP failed for intermediate frame");
                ok = false;
                break;
            }
            let r_wc = r_cw.transpose();
            frame.r = r_wc * ric0.transpose();
            frame.t_vec = -r_wc * t_cw;
        }
        if !ok {
            return false;
        }

        if self.visual_initial_align() {
            true
        } else {
            info!("misaligned visual structure with IMU");
            false
        }
    }

    /// Finds the first window frame with enough correspondence and
    /// parallax against the newest frame.
    fn relative_pose(&self) -> Option<(Matrix3<f64>, Vector3<f64>, usize)> {
        let w = self.window_size();
        for i in 0..w {
            let corres = self.f_manager.get_corresponding(i, w);
            if corres.len() > 20 {
                let sum_parallax: f64 = corres
                    .iter()
                    .map(|(a, b)| (a.xy() - b.xy()).norm())
                    .sum();
                let average_parallax = sum_parallax / corres.len() as f64;
                if average_parallax * self.cfg.focal_length > 30.0 {
                    if let Some((r, t)) = crate::geometry::solve_relative_rt(&corres) {
                        debug!(
                            "average parallax {:.1} px, choosing frame {i} as reference",
                            average_parallax * self.cfg.focal_length
                        );
                        return Some((r, t, i));
                    }
                }
            }
        }
        None
    }

    fn visual_initial_align(&mut self) -> bool {
        let w = self.window_size();
        let tic0 = self.tic[0];
        let g_norm = self.cfg.g.norm();

        let mut frames: Vec<ImageFrame> = self
            .all_image_frame
            .iter()
            .map(|(t, f)| {
                let mut copy = ImageFrame::new(FeatureFrame::new(), *t);
                copy.r = f.r;
                copy.t_vec = f.t_vec;
                copy.is_key_frame = f.is_key_frame;
                copy.pre_integration = f.pre_integration.clone();
                copy
            })
            .collect();

        let mut g_c0 = Vector3::zeros();
        let Some(x) =
            crate::init::visual_imu_alignment(&mut frames, &mut self.bgs, &tic0, g_norm, &mut g_c0)
        else {
            debug!("solving gravity failed");
            return false;
        };
        // keep the re-propagated pre-integrations of the frames
        for (dst, src) in self.all_image_frame.iter_mut().zip(frames.iter_mut()) {
            dst.1.pre_integration = src.pre_integration.take();
        }

        // adopt the SfM poses for the window states
        for i in 0..=self.frame_count {
            let t = self.headers[i];
            if let Some((_, frame)) = self
                .all_image_frame
                .iter()
                .find(|(ft, _)| (*ft - t).abs() < 1e-9)
            {
                self.ps[i] = frame.t_vec;
                self.rs[i] = frame.r;
            }
        }

        let s = x[x.len() - 1] / 100.0;
        for i in 0..=w {
            if let Some(pre) = self.pre_integrations[i].as_mut() {
                pre.repropagate(Vector3::zeros(), self.bgs[i]);
            }
        }
        for i in (0..=self.frame_count).rev() {
            self.ps[i] = s * self.ps[i]
                - self.rs[i] * tic0
                - (s * self.ps[0] - self.rs[0] * tic0);
        }

        let mut kv = 0usize;
        for (_, frame) in &self.all_image_frame {
            if frame.is_key_frame && kv * 3 + 2 < x.len() {
                if kv <= w {
                    self.vs[kv] = frame.r * Vector3::new(x[kv * 3], x[kv * 3 + 1], x[kv * 3 + 2]);
                }
                kv += 1;
            }
        }

        let mut r0 = g2r(&g_c0);
        let yaw = r2ypr(&(r0 * self.rs[0])).x;
        r0 = ypr2r(&Vector3::new(-yaw, 0.0, 0.0)) * r0;
        self.g = r0 * g_c0;
        let rot_diff = r0;
        for i in 0..=self.frame_count {
            self.ps[i] = rot_diff * self.ps[i];
            self.rs[i] = rot_diff * self.rs[i];
            self.vs[i] = rot_diff * self.vs[i];
        }
        debug!("g0 {:?}", self.g.as_slice());
        debug!("initial R0 ypr {:?}", r2ypr(&self.rs[0]).as_slice());

        self.f_manager.clear_depth();
        self.f_manager
            .triangulate(self.frame_count, &self.ps, &self.rs, &self.tic, &self.ric);
        true
    }

    // ── packing / unpacking ───────────────────────────────────────────

    fn vector2double(&mut self) {
        for i in 0..=self.window_size() {
            let q = UnitQuaternion::from_matrix(&self.rs[i]);
            self.para_pose[i] = [
                self.ps[i].x, self.ps[i].y, self.ps[i].z, q.i, q.j, q.k, q.w,
            ];
            if self.cfg.use_imu {
                self.para_speed_bias[i] = [
                    self.vs[i].x, self.vs[i].y, self.vs[i].z,
                    self.bas[i].x, self.bas[i].y, self.bas[i].z,
                    self.bgs[i].x, self.bgs[i].y, self.bgs[i].z,
                ];
            }
        }
        for c in 0..self.cfg.num_of_cam.min(2) {
            let q = UnitQuaternion::from_matrix(&self.ric[c]);
            self.para_ex_pose[c] = [
                self.tic[c].x, self.tic[c].y, self.tic[c].z, q.i, q.j, q.k, q.w,
            ];
        }
        self.para_feature = self.f_manager.get_depth_vector();
        self.para_td = self.td;
        self.para_yaw = self.yaw_enu_local;
        self.para_anc = [self.anc_ecef.x, self.anc_ecef.y, self.anc_ecef.z];
    }

    fn double2vector(&mut self) {
        let w = self.window_size();
        let mut origin_r0 = r2ypr(&self.rs[0]);
        let mut origin_p0 = self.ps[0];
        if self.failure_occur {
            origin_r0 = r2ypr(&self.last_r0);
            origin_p0 = self.last_p0;
            self.failure_occur = false;
        }

        if self.cfg.use_imu {
            let opt_r0 = UnitQuaternion::from_quaternion(Quaternion::new(
                self.para_pose[0][6],
                self.para_pose[0][3],
                self.para_pose[0][4],
                self.para_pose[0][5],
            ))
            .to_rotation_matrix()
            .into_inner();
            let origin_r00 = r2ypr(&opt_r0);
            let y_diff = origin_r0.x - origin_r00.x;
            let mut rot_diff = ypr2r(&Vector3::new(y_diff, 0.0, 0.0));
            if (origin_r0.y.abs() - 90.0).abs() < 1.0 || (origin_r00.y.abs() - 90.0).abs() < 1.0 {
                debug!("euler singular point!");
                rot_diff = self.rs[0] * opt_r0.transpose();
            }

            for i in 0..=w {
                let q = UnitQuaternion::from_quaternion(Quaternion::new(
                    self.para_pose[i][6],
                    self.para_pose[i][3],
                    self.para_pose[i][4],
                    self.para_pose[i][5],
                ));
                self.rs[i] = rot_diff * q.to_rotation_matrix().into_inner();
                self.ps[i] = rot_diff
                    * Vector3::new(
                        self.para_pose[i][0] - self.para_pose[0][0],
                        self.para_pose[i][1] - self.para_pose[0][1],
                        self.para_pose[i][2] - self.para_pose[0][2],
                    )
                    + origin_p0;
                self.vs[i] = rot_diff
                    * Vector3::new(
                        self.para_speed_bias[i][0],
                        self.para_speed_bias[i][1],
                        self.para_speed_bias[i][2],
                    );
                self.bas[i] = Vector3::new(
                    self.para_speed_bias[i][3],
                    self.para_speed_bias[i][4],
                    self.para_speed_bias[i][5],
                );
                self.bgs[i] = Vector3::new(
                    self.para_speed_bias[i][6],
                    self.para_speed_bias[i][7],
                    self.para_speed_bias[i][8],
                );
            }
        } else {
            for i in 0..=w {
                let q = UnitQuaternion::from_quaternion(Quaternion::new(
                    self.para_pose[i][6],
                    self.para_pose[i][3],
                    self.para_pose[i][4],
                    self.para_pose[i][5],
                ));
                self.rs[i] = q.to_rotation_matrix().into_inner();
                self.ps[i] = Vector3::new(
                    self.para_pose[i][0],
                    self.para_pose[i][1],
                    self.para_pose[i][2],
                );
            }
        }

        if self.cfg.use_imu {
            for c in 0..self.cfg.num_of_cam.min(2) {
                self.tic[c] = Vector3::new(
                    self.para_ex_pose[c][0],
                    self.para_ex_pose[c][1],
                    self.para_ex_pose[c][2],
                );
                self.ric[c] = UnitQuaternion::from_quaternion(Quaternion::new(
                    self.para_ex_pose[c][6],
                    self.para_ex_pose[c][3],
                    self.para_ex_pose[c][4],
                    self.para_ex_pose[c][5],
                ))
                .to_rotation_matrix()
                .into_inner();
            }
            self.td = self.para_td;
        }

        let depths = self.para_feature.clone();
        self.f_manager.set_depth(&depths);

        if self.gnss_ready {
            self.yaw_enu_local = self.para_yaw;
            self.anc_ecef = Vector3::new(self.para_anc[0], self.para_anc[1], self.para_anc[2]);
            self.r_ecef_enu = ecef2rotation(&self.anc_ecef);
        }
    }

    fn param_value(&self, k: BlockKey) -> Vec<f64> {
        let kind = k.0 >> 32;
        let idx = (k.0 & 0xffff_ffff) as usize;
        match kind {
            KIND_POSE => self.para_pose[idx].to_vec(),
            KIND_SPEED_BIAS => self.para_speed_bias[idx].to_vec(),
            KIND_EX_POSE => self.para_ex_pose[idx].to_vec(),
            KIND_TD => vec![self.para_td],
            KIND_FEATURE => vec![self.para_feature[idx]],
            KIND_RCV_DT => vec![self.para_rcv_dt[idx]],
            KIND_RCV_DDT => vec![self.para_rcv_ddt[idx]],
            KIND_YAW => vec![self.para_yaw],
            KIND_ANCHOR => self.para_anc.to_vec(),
            _ => unreachable!("unknown block key"),
        }
    }

    fn param_manifold(&self, k: BlockKey) -> Manifold {
        match k.0 >> 32 {
            KIND_POSE | KIND_EX_POSE => Manifold::Pose,
            _ => Manifold::Euclidean,
        }
    }

    // ── optimization ──────────────────────────────────────────────────

    fn optimization(&mut self) {
        let w = self.window_size();
        self.vector2double();

        let mut problem = Problem::new();
        let loss = Loss::Huber(1.0);

        for i in 0..=self.frame_count {
            problem.add_parameter_block(key(KIND_POSE, i as u64), &self.para_pose[i], Manifold::Pose);
            if self.cfg.use_imu {
                problem.add_parameter_block(
                    key(KIND_SPEED_BIAS, i as u64),
                    &self.para_speed_bias[i],
                    Manifold::Euclidean,
                );
            }
        }
        if !self.cfg.use_imu {
            problem.set_parameter_block_constant(key(KIND_POSE, 0));
        }

        for c in 0..self.cfg.num_of_cam.min(2) {
            problem.add_parameter_block(
                key(KIND_EX_POSE, c as u64),
                &self.para_ex_pose[c],
                Manifold::Pose,
            );
            let excited = self.cfg.estimate_extrinsic != 0
                && self.frame_count == w
                && self.vs[0].norm() > 0.2;
            if excited || self.open_ex_estimation {
                self.open_ex_estimation = true;
            } else {
                problem.set_parameter_block_constant(key(KIND_EX_POSE, c as u64));
            }
        }

        problem.add_parameter_block(key(KIND_TD, 0), &[self.para_td], Manifold::Euclidean);
        if !self.cfg.estimate_td || self.vs[0].norm() < 0.2 {
            problem.set_parameter_block_constant(key(KIND_TD, 0));
        }

        if self.gnss_ready {
            problem.add_parameter_block(key(KIND_YAW, 0), &[self.para_yaw], Manifold::Euclidean);
            let mut avg_hor_vel = Vector2::zeros();
            for i in 0..=w {
                avg_hor_vel += self.vs[i].xy().abs();
            }
            avg_hor_vel /= (w + 1) as f64;
            let starving = self.gnss_meas_buf.iter().any(|m| m.len() < 10);
            if avg_hor_vel.norm() < 0.3 || starving {
                problem.set_parameter_block_constant(key(KIND_YAW, 0));
            }
            problem.add_parameter_block(key(KIND_ANCHOR, 0), &self.para_anc, Manifold::Euclidean);
            for i in 0..=w {
                for k_sys in 0..4usize {
                    problem.add_parameter_block(
                        key(KIND_RCV_DT, (i * 4 + k_sys) as u64),
                        &[self.para_rcv_dt[i * 4 + k_sys]],
                        Manifold::Euclidean,
                    );
                }
                problem.add_parameter_block(
                    key(KIND_RCV_DDT, i as u64),
                    &[self.para_rcv_ddt[i]],
                    Manifold::Euclidean,
                );
            }
        }

        if let Some(info) = self.last_marginalization.as_ref() {
            if info.valid {
                problem.add_residual_block(
                    Box::new(MarginalizationFactor::new(info.clone())),
                    Loss::Trivial,
                    self.last_marginalization_keys.clone(),
                );
            }
        }

        if self.cfg.use_imu {
            for i in 0..self.frame_count {
                let j = i + 1;
                let Some(pre) = self.pre_integrations[j].as_ref() else {
                    continue;
                };
                if pre.sum_dt > 10.0 {
                    continue;
                }
                let pre = Arc::new(pre.clone());
                let keys = vec![
                    key(KIND_POSE, i as u64),
                    key(KIND_SPEED_BIAS, i as u64),
                    key(KIND_POSE, j as u64),
                    key(KIND_SPEED_BIAS, j as u64),
                ];
                if self.cfg.encoder_enable {
                    problem.add_residual_block(
                        Box::new(ImuEncoderFactor::new(pre, self.g)),
                        Loss::Trivial,
                        keys,
                    );
                } else {
                    problem.add_residual_block(
                        Box::new(ImuFactor::new(pre, self.g)),
                        Loss::Trivial,
                        keys,
                    );
                }
            }
        }

        if self.gnss_ready {
            for i in 0..=w {
                for (obs, ephem) in &self.gnss_meas_buf[i] {
                    let (lower_idx, ts_ratio) = self.obs_interp(i, obs);
                    let sys_idx = obs.system.index();
                    problem.add_residual_block(
                        Box::new(GnssPsrDoppFactor::new(
                            obs.clone(),
                            ephem.clone(),
                            self.latest_iono_params.clone(),
                            ts_ratio,
                        )),
                        Loss::Trivial,
                        vec![
                            key(KIND_POSE, lower_idx as u64),
                            key(KIND_SPEED_BIAS, lower_idx as u64),
                            key(KIND_POSE, (lower_idx + 1) as u64),
                            key(KIND_SPEED_BIAS, (lower_idx + 1) as u64),
                            key(KIND_RCV_DT, (i * 4 + sys_idx) as u64),
                            key(KIND_RCV_DDT, i as u64),
                            key(KIND_YAW, 0),
                            key(KIND_ANCHOR, 0),
                        ],
                    );
                }
            }
            for k_sys in 0..4usize {
                for i in 0..w {
                    let gnss_dt = self.headers[i + 1] - self.headers[i];
                    problem.add_residual_block(
                        Box::new(DtDdtFactor::new(gnss_dt)),
                        Loss::Trivial,
                        vec![
                            key(KIND_RCV_DT, (i * 4 + k_sys) as u64),
                            key(KIND_RCV_DT, ((i + 1) * 4 + k_sys) as u64),
                            key(KIND_RCV_DDT, i as u64),
                            key(KIND_RCV_DDT, (i + 1) as u64),
                        ],
                    );
                }
            }
            for i in 0..w {
                problem.add_residual_block(
                    Box::new(DdtSmoothFactor::new(self.cfg.gnss_ddt_weight)),
                    Loss::Trivial,
                    vec![key(KIND_RCV_DDT, i as u64), key(KIND_RCV_DDT, (i + 1) as u64)],
                );
            }
        }

        let mut visual_count = 0usize;
        {
            let mut feature_index: isize = -1;
            for track in self.f_manager.feature.iter_mut() {
                track.used_num = track.feature_per_frame.len();
                if track.used_num < 4 {
                    continue;
                }
                feature_index += 1;
                let fkey = key(KIND_FEATURE, feature_index as u64);
                problem.add_parameter_block(
                    fkey,
                    &[self.para_feature[feature_index as usize]],
                    Manifold::Euclidean,
                );
                problem.mark_eliminated(fkey);

                let imu_i = track.start_frame;
                let anchor = &track.feature_per_frame[0];
                let pts_i = anchor.point;
                let (vel_i, td_i) = (anchor.velocity, anchor.cur_td);

                for (k_obs, per_frame) in track.feature_per_frame.iter().enumerate() {
                    let imu_j = imu_i + k_obs;
                    if imu_i != imu_j {
                        problem.add_residual_block(
                            Box::new(ProjectionTwoFrameOneCam::new(
                                pts_i,
                                per_frame.point,
                                vel_i,
                                per_frame.velocity,
                                td_i,
                                per_frame.cur_td,
                                self.cfg.focal_length,
                            )),
                            loss,
                            vec![
                                key(KIND_POSE, imu_i as u64),
                                key(KIND_POSE, imu_j as u64),
                                key(KIND_EX_POSE, 0),
                                fkey,
                                key(KIND_TD, 0),
                            ],
                        );
                        visual_count += 1;
                    }
                    if self.cfg.stereo && per_frame.is_stereo() {
                        let pts_j_right = per_frame.point_right.expect("stereo observation");
                        let vel_j_right = per_frame.velocity_right.expect("stereo observation");
                        if imu_i != imu_j {
                            problem.add_residual_block(
                                Box::new(ProjectionTwoFrameTwoCam::new(
                                    pts_i,
                                    pts_j_right,
                                    vel_i,
                                    vel_j_right,
                                    td_i,
                                    per_frame.cur_td,
                                    self.cfg.focal_length,
                                )),
                                loss,
                                vec![
                                    key(KIND_POSE, imu_i as u64),
                                    key(KIND_POSE, imu_j as u64),
                                    key(KIND_EX_POSE, 0),
                                    key(KIND_EX_POSE, 1),
                                    fkey,
                                    key(KIND_TD, 0),
                                ],
                            );
                        } else {
                            problem.add_residual_block(
                                Box::new(ProjectionOneFrameTwoCam::new(
                                    pts_i,
                                    pts_j_right,
                                    vel_i,
                                    vel_j_right,
                                    td_i,
                                    per_frame.cur_td,
                                    self.cfg.focal_length,
                                )),
                                loss,
                                vec![
                                    key(KIND_EX_POSE, 0),
                                    key(KIND_EX_POSE, 1),
                                    fkey,
                                    key(KIND_TD, 0),
                                ],
                            );
                        }
                        visual_count += 1;
                    }
                }
            }
        }
        debug!("visual measurement count: {visual_count}");

        let time_cap = if self.marginalization_flag == MarginalizationFlag::MarginOld {
            self.cfg.solver_time * 4.0 / 5.0
        } else {
            self.cfg.solver_time
        };
        let options = SolverOptions {
            max_iterations: self.cfg.num_iterations,
            max_time: Duration::from_secs_f64(time_cap),
            ..Default::default()
        };
        let summary = problem.solve(&options);
        debug!(
            "solver: {} iterations, cost {:.4e} → {:.4e}",
            summary.iterations, summary.initial_cost, summary.final_cost
        );

        // read the solution back into the packed mirrors
        for i in 0..=self.frame_count {
            let v = problem.parameter(key(KIND_POSE, i as u64)).expect("pose");
            self.para_pose[i].copy_from_slice(v);
            if self.cfg.use_imu {
                let sb = problem
                    .parameter(key(KIND_SPEED_BIAS, i as u64))
                    .expect("speed bias");
                self.para_speed_bias[i].copy_from_slice(sb);
            }
        }
        for c in 0..self.cfg.num_of_cam.min(2) {
            let v = problem
                .parameter(key(KIND_EX_POSE, c as u64))
                .expect("extrinsic");
            self.para_ex_pose[c].copy_from_slice(v);
        }
        self.para_td = problem.parameter(key(KIND_TD, 0)).expect("td")[0];
        for (idx, dep) in self.para_feature.iter_mut().enumerate() {
            if let Some(v) = problem.parameter(key(KIND_FEATURE, idx as u64)) {
                *dep = v[0];
            }
        }
        if self.gnss_ready {
            self.para_yaw = problem.parameter(key(KIND_YAW, 0)).expect("yaw")[0];
            let anc = problem.parameter(key(KIND_ANCHOR, 0)).expect("anchor");
            self.para_anc.copy_from_slice(anc);
            for i in 0..=w {
                for k_sys in 0..4usize {
                    self.para_rcv_dt[i * 4 + k_sys] = problem
                        .parameter(key(KIND_RCV_DT, (i * 4 + k_sys) as u64))
                        .expect("rcv dt")[0];
                }
                self.para_rcv_ddt[i] = problem
                    .parameter(key(KIND_RCV_DDT, i as u64))
                    .expect("rcv ddt")[0];
            }
        }

        // keep the ENU yaw in (-π, π]
        while self.para_yaw > std::f64::consts::PI {
            self.para_yaw -= 2.0 * std::f64::consts::PI;
        }
        while self.para_yaw <= -std::f64::consts::PI {
            self.para_yaw += 2.0 * std::f64::consts::PI;
        }

        self.double2vector();

        if self.frame_count < w {
            return;
        }
        self.marginalize(loss);
    }

    /// Interpolation bracket of a GNSS observation within the window.
    fn obs_interp(&self, i: usize, obs: &GnssObservation) -> (usize, f64) {
        let w = self.window_size();
        let obs_local_ts = obs.time_s - self.diff_t_gnss_local;
        let lower_idx = if self.headers[i] > obs_local_ts {
            if i == 0 { 0 } else { i - 1 }
        } else if i == w {
            w - 1
        } else {
            i
        };
        let lower_ts = self.headers[lower_idx];
        let upper_ts = self.headers[lower_idx + 1];
        let ts_ratio = (upper_ts - obs_local_ts) / (upper_ts - lower_ts);
        (lower_idx, ts_ratio)
    }

    // ── marginalization ───────────────────────────────────────────────

    fn add_to_margin(
        &self,
        info: &mut MarginalizationInfo,
        factor: Box<dyn crate::solver::Factor>,
        loss: Loss,
        keys: Vec<BlockKey>,
        drop_set: Vec<usize>,
    ) {
        let values = keys.iter().map(|k| self.param_value(*k)).collect();
        let manifolds = keys.iter().map(|k| self.param_manifold(*k)).collect();
        info.add_residual_block(factor, loss, keys, values, manifolds, drop_set);
    }

    fn marginalize(&mut self, loss: Loss) {
        let w = self.window_size();
        if self.marginalization_flag == MarginalizationFlag::MarginOld {
            let mut info = MarginalizationInfo::new();
            self.vector2double();

            if let Some(last) = self.last_marginalization.as_ref() {
                if last.valid {
                    let drop_set: Vec<usize> = self
                        .last_marginalization_keys
                        .iter()
                        .enumerate()
                        .filter(|(_, k)| {
                            **k == key(KIND_POSE, 0) || **k == key(KIND_SPEED_BIAS, 0)
                        })
                        .map(|(i, _)| i)
                        .collect();
                    self.add_to_margin(
                        &mut info,
                        Box::new(MarginalizationFactor::new(last.clone())),
                        Loss::Trivial,
                        self.last_marginalization_keys.clone(),
                        drop_set,
                    );
                }
            }

            if self.cfg.use_imu {
                if let Some(pre) = self.pre_integrations[1].as_ref() {
                    if pre.sum_dt < 10.0 {
                        let pre = Arc::new(pre.clone());
                        let keys = vec![
                            key(KIND_POSE, 0),
                            key(KIND_SPEED_BIAS, 0),
                            key(KIND_POSE, 1),
                            key(KIND_SPEED_BIAS, 1),
                        ];
                        let factor: Box<dyn crate::solver::Factor> = if self.cfg.encoder_enable {
                            Box::new(ImuEncoderFactor::new(pre, self.g))
                        } else {
                            Box::new(ImuFactor::new(pre, self.g))
                        };
                        self.add_to_margin(&mut info, factor, Loss::Trivial, keys, vec![0, 1]);
                    }
                }
            }

            if self.gnss_ready {
                for (obs, ephem) in &self.gnss_meas_buf[0].clone() {
                    let (_, ts_ratio) = self.obs_interp(0, obs);
                    let sys_idx = obs.system.index();
                    self.add_to_margin(
                        &mut info,
                        Box::new(GnssPsrDoppFactor::new(
                            obs.clone(),
                            ephem.clone(),
                            self.latest_iono_params.clone(),
                            ts_ratio,
                        )),
                        Loss::Trivial,
                        vec![
                            key(KIND_POSE, 0),
                            key(KIND_SPEED_BIAS, 0),
                            key(KIND_POSE, 1),
                            key(KIND_SPEED_BIAS, 1),
                            key(KIND_RCV_DT, sys_idx as u64),
                            key(KIND_RCV_DDT, 0),
                            key(KIND_YAW, 0),
                            key(KIND_ANCHOR, 0),
                        ],
                        vec![0, 1, 4, 5],
                    );
                }
                let gnss_dt = self.headers[1] - self.headers[0];
                for k_sys in 0..4u64 {
                    self.add_to_margin(
                        &mut info,
                        Box::new(DtDdtFactor::new(gnss_dt)),
                        Loss::Trivial,
                        vec![
                            key(KIND_RCV_DT, k_sys),
                            key(KIND_RCV_DT, 4 + k_sys),
                            key(KIND_RCV_DDT, 0),
                            key(KIND_RCV_DDT, 1),
                        ],
                        vec![0, 2],
                    );
                }
                self.add_to_margin(
                    &mut info,
                    Box::new(DdtSmoothFactor::new(self.cfg.gnss_ddt_weight)),
                    Loss::Trivial,
                    vec![key(KIND_RCV_DDT, 0), key(KIND_RCV_DDT, 1)],
                    vec![0],
                );
            }

            {
                for track in self.f_manager.feature.iter_mut() {
                    track.used_num = track.feature_per_frame.len();
                }
                let mut feature_index: isize = -1;
                for track in self.f_manager.feature.iter() {
                    if track.used_num < 4 {
                        continue;
                    }
                    feature_index += 1;
                    let imu_i = track.start_frame;
                    if imu_i != 0 {
                        continue;
                    }
                    let fkey = key(KIND_FEATURE, feature_index as u64);
                    let anchor = &track.feature_per_frame[0];
                    let pts_i = anchor.point;
                    let (vel_i, td_i) = (anchor.velocity, anchor.cur_td);

                    let mut blocks: Vec<(Box<dyn crate::solver::Factor>, Vec<BlockKey>, Vec<usize>)> =
                        Vec::new();
                    for (k_obs, per_frame) in track.feature_per_frame.iter().enumerate() {
                        let imu_j = imu_i + k_obs;
                        if imu_i != imu_j {
                            blocks.push((
                                Box::new(ProjectionTwoFrameOneCam::new(
                                    pts_i,
                                    per_frame.point,
                                    vel_i,
                                    per_frame.velocity,
                                    td_i,
                                    per_frame.cur_td,
                                    self.cfg.focal_length,
                                )),
                                vec![
                                    key(KIND_POSE, 0),
                                    key(KIND_POSE, imu_j as u64),
                                    key(KIND_EX_POSE, 0),
                                    fkey,
                                    key(KIND_TD, 0),
                                ],
                                vec![0, 3],
                            ));
                        }
                        if self.cfg.stereo && per_frame.is_stereo() {
                            let pts_j_right = per_frame.point_right.expect("stereo observation");
                            let vel_j_right =
                                per_frame.velocity_right.expect("stereo observation");
                            if imu_i != imu_j {
                                blocks.push((
                                    Box::new(ProjectionTwoFrameTwoCam::new(
                                        pts_i,
                                        pts_j_right,
                                        vel_i,
                                        vel_j_right,
                                        td_i,
                                        per_frame.cur_td,
                                        self.cfg.focal_length,
                                    )),
                                    vec![
                                        key(KIND_POSE, 0),
                                        key(KIND_POSE, imu_j as u64),
                                        key(KIND_EX_POSE, 0),
                                        key(KIND_EX_POSE, 1),
                                        fkey,
                                        key(KIND_TD, 0),
                                    ],
                                    vec![0, 4],
                                ));
                            } else {
                                blocks.push((
                                    Box::new(ProjectionOneFrameTwoCam::new(
                                        pts_i,
                                        pts_j_right,
                                        vel_i,
                                        vel_j_right,
                                        td_i,
                                        per_frame.cur_td,
                                        self.cfg.focal_length,
                                    )),
                                    vec![
                                        key(KIND_EX_POSE, 0),
                                        key(KIND_EX_POSE, 1),
                                        fkey,
                                        key(KIND_TD, 0),
                                    ],
                                    vec![2],
                                ));
                            }
                        }
                    }
                    for (factor, keys, drop_set) in blocks {
                        let values = keys.iter().map(|k| self.param_value(*k)).collect();
                        let manifolds = keys.iter().map(|k| self.param_manifold(*k)).collect();
                        info.add_residual_block(factor, loss, keys, values, manifolds, drop_set);
                    }
                }
            }

            info.pre_marginalize();
            info.marginalize();

            let mut addr_shift: BTreeMap<BlockKey, BlockKey> = BTreeMap::new();
            for i in 1..=w as u64 {
                addr_shift.insert(key(KIND_POSE, i), key(KIND_POSE, i - 1));
                if self.cfg.use_imu {
                    addr_shift.insert(key(KIND_SPEED_BIAS, i), key(KIND_SPEED_BIAS, i - 1));
                }
                for k_sys in 0..4u64 {
                    addr_shift.insert(
                        key(KIND_RCV_DT, i * 4 + k_sys),
                        key(KIND_RCV_DT, (i - 1) * 4 + k_sys),
                    );
                }
                addr_shift.insert(key(KIND_RCV_DDT, i), key(KIND_RCV_DDT, i - 1));
            }

            let keys = info.parameter_blocks(&addr_shift);
            self.last_marginalization = Some(Arc::new(info));
            self.last_marginalization_keys = keys;
        } else {
            let references_second_newest = self
                .last_marginalization_keys
                .iter()
                .any(|k| *k == key(KIND_POSE, (w - 1) as u64));
            if self.last_marginalization.is_some() && references_second_newest {
                let mut info = MarginalizationInfo::new();
                self.vector2double();

                if let Some(last) = self.last_marginalization.as_ref() {
                    if last.valid {
                        let mut drop_set = Vec::new();
                        for (i, k) in self.last_marginalization_keys.iter().enumerate() {
                            assert!(*k != key(KIND_SPEED_BIAS, (w - 1) as u64));
                            if *k == key(KIND_POSE, (w - 1) as u64) {
                                drop_set.push(i);
                            }
                        }
                        self.add_to_margin(
                            &mut info,
                            Box::new(MarginalizationFactor::new(last.clone())),
                            Loss::Trivial,
                            self.last_marginalization_keys.clone(),
                            drop_set,
                        );
                    }
                }

                info.pre_marginalize();
                info.marginalize();

                let mut addr_shift: BTreeMap<BlockKey, BlockKey> = BTreeMap::new();
                for i in 0..=w as u64 {
                    if i == (w - 1) as u64 {
                        continue;
                    }
                    let target = if i == w as u64 { i - 1 } else { i };
                    addr_shift.insert(key(KIND_POSE, i), key(KIND_POSE, target));
                    if self.cfg.use_imu {
                        addr_shift.insert(key(KIND_SPEED_BIAS, i), key(KIND_SPEED_BIAS, target));
                    }
                    for k_sys in 0..4u64 {
                        addr_shift.insert(
                            key(KIND_RCV_DT, i * 4 + k_sys),
                            key(KIND_RCV_DT, target * 4 + k_sys),
                        );
                    }
                    addr_shift.insert(key(KIND_RCV_DDT, i), key(KIND_RCV_DDT, target));
                }

                let keys = info.parameter_blocks(&addr_shift);
                self.last_marginalization = Some(Arc::new(info));
                self.last_marginalization_keys = keys;
            }
        }
    }

    // ── window sliding ────────────────────────────────────────────────

    fn slide_window(&mut self) {
        let w = self.window_size();
        if self.marginalization_flag == MarginalizationFlag::MarginOld {
            let t_0 = self.headers[0];
            self.back_r0 = self.rs[0];
            self.back_p0 = self.ps[0];
            if self.frame_count == w {
                for i in 0..w {
                    self.headers.swap(i, i + 1);
                    self.rs.swap(i, i + 1);
                    self.ps.swap(i, i + 1);
                    if self.cfg.use_imu {
                        self.pre_integrations.swap(i, i + 1);
                        self.vs.swap(i, i + 1);
                        self.bas.swap(i, i + 1);
                        self.bgs.swap(i, i + 1);
                    }
                    self.gnss_meas_buf.swap(i, i + 1);
                    for k_sys in 0..4 {
                        self.para_rcv_dt[i * 4 + k_sys] = self.para_rcv_dt[(i + 1) * 4 + k_sys];
                    }
                    self.para_rcv_ddt[i] = self.para_rcv_ddt[i + 1];
                }
                // slot W is re-seeded with the newest state; the duplicated
                // header is overwritten on the next frame push
                self.headers[w] = self.headers[w - 1];
                self.ps[w] = self.ps[w - 1];
                self.rs[w] = self.rs[w - 1];
                self.gnss_meas_buf[w].clear();

                if self.cfg.use_imu {
                    self.vs[w] = self.vs[w - 1];
                    self.bas[w] = self.bas[w - 1];
                    self.bgs[w] = self.bgs[w - 1];
                    self.pre_integrations[w] = Some(self.make_pre_integration(w));
                }

                self.all_image_frame.retain(|(t, _)| *t > t_0);
                self.slide_window_old();
            }
        } else if self.frame_count == w {
            self.headers[w - 1] = self.headers[w];
            self.ps[w - 1] = self.ps[w];
            self.rs[w - 1] = self.rs[w];

            if self.cfg.use_imu {
                if let Some(newest) = self.pre_integrations[w].take() {
                    let (dts, accs, gyrs, encs) = newest.buffered_samples();
                    if let Some(prev) = self.pre_integrations[w - 1].as_mut() {
                        for k in 0..dts.len() {
                            let enc = if self.cfg.encoder_enable {
                                Some(encs[k])
                            } else {
                                None
                            };
                            prev.push_back(dts[k], accs[k], gyrs[k], enc);
                        }
                    }
                }
                self.vs[w - 1] = self.vs[w];
                self.bas[w - 1] = self.bas[w];
                self.bgs[w - 1] = self.bgs[w];

                self.gnss_meas_buf[w - 1] = std::mem::take(&mut self.gnss_meas_buf[w]);
                for k_sys in 0..4 {
                    self.para_rcv_dt[(w - 1) * 4 + k_sys] = self.para_rcv_dt[w * 4 + k_sys];
                }
                self.para_rcv_ddt[w - 1] = self.para_rcv_ddt[w];

                self.pre_integrations[w] = Some(self.make_pre_integration(w));
            }
            self.slide_window_new();
        }
    }

    fn slide_window_new(&mut self) {
        self.f_manager.remove_front(self.frame_count);
    }

    fn slide_window_old(&mut self) {
        let shift_depth = self.solver_flag == SolverFlag::NonLinear;
        if shift_depth {
            let r0 = self.back_r0 * self.ric[0];
            let r1 = self.rs[0] * self.ric[0];
            let p0 = self.back_p0 + self.back_r0 * self.tic[0];
            let p1 = self.ps[0] + self.rs[0] * self.tic[0];
            self.f_manager.remove_back_shift_depth(r0, p0, r1, p1);
        } else {
            self.f_manager.remove_back();
        }
    }

    // ── outlier screening and failure handling ────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn reprojection_error(
        r_i: &Matrix3<f64>,
        p_i: &Vector3<f64>,
        ric_i: &Matrix3<f64>,
        tic_i: &Vector3<f64>,
        r_j: &Matrix3<f64>,
        p_j: &Vector3<f64>,
        ric_j: &Matrix3<f64>,
        tic_j: &Vector3<f64>,
        depth: f64,
        uv_i: &Vector3<f64>,
        uv_j: &Vector3<f64>,
    ) -> f64 {
        let pts_w = r_i * (ric_i * (depth * uv_i) + tic_i) + p_i;
        let pts_cj = ric_j.transpose() * (r_j.transpose() * (pts_w - p_j) - tic_j);
        ((pts_cj.xy() / pts_cj.z) - uv_j.xy()).norm()
    }

    /// Flags landmarks whose average reprojection error exceeds 3 px.
    fn outliers_rejection(&mut self) -> BTreeSet<u64> {
        let mut remove_index = BTreeSet::new();
        for track in self.f_manager.feature.iter_mut() {
            track.used_num = track.feature_per_frame.len();
            if track.used_num < 4 {
                continue;
            }
            let imu_i = track.start_frame;
            let pts_i = track.feature_per_frame[0].point;
            let depth = track.estimated_depth;
            let mut err = 0.0;
            let mut err_cnt = 0usize;

            for (k_obs, per_frame) in track.feature_per_frame.iter().enumerate() {
                let imu_j = imu_i + k_obs;
                if imu_i != imu_j {
                    err += Self::reprojection_error(
                        &self.rs[imu_i], &self.ps[imu_i], &self.ric[0], &self.tic[0],
                        &self.rs[imu_j], &self.ps[imu_j], &self.ric[0], &self.tic[0],
                        depth, &pts_i, &per_frame.point,
                    );
                    err_cnt += 1;
                }
                if self.cfg.stereo && per_frame.is_stereo() {
                    let pts_j_right = per_frame.point_right.expect("stereo observation");
                    err += Self::reprojection_error(
                        &self.rs[imu_i], &self.ps[imu_i], &self.ric[0], &self.tic[0],
                        &self.rs[imu_j], &self.ps[imu_j], &self.ric[1], &self.tic[1],
                        depth, &pts_i, &pts_j_right,
                    );
                    err_cnt += 1;
                }
            }
            if err_cnt > 0 {
                let ave_err = err / err_cnt as f64;
                if ave_err * self.cfg.focal_length > 3.0 {
                    remove_index.insert(track.feature_id);
                }
            }
        }
        remove_index
    }

    /// Bias-norm failure checks, active only when configured.
    pub fn failure_detection(&self) -> bool {
        if !self.cfg.failure_detection {
            return false;
        }
        let w = self.window_size();
        if self.bas[w].norm() > 2.5 {
            info!("big IMU accelerometer bias estimate {:.3}", self.bas[w].norm());
            return true;
        }
        if self.bgs[w].norm() > 1.0 {
            info!("big IMU gyroscope bias estimate {:.3}", self.bgs[w].norm());
            return true;
        }
        false
    }

    // ── outputs ───────────────────────────────────────────────────────

    pub fn solver_is_nonlinear(&self) -> bool {
        self.solver_flag == SolverFlag::NonLinear
    }

    /// Integrated duration of the pre-integration feeding slot `i`.
    pub fn integration_span(&self, i: usize) -> Option<f64> {
        self.pre_integrations[i].as_ref().map(|p| p.sum_dt)
    }

    /// Gated GNSS observations currently held by slot `i`.
    pub fn gnss_observation_count(&self, i: usize) -> usize {
        self.gnss_meas_buf[i].len()
    }

    /// Snapshot for re-seeding the fast predictor.
    pub fn latest_seed(&self) -> LatestSeed {
        let fc = self.frame_count;
        LatestSeed {
            time: self.headers[fc] + self.td,
            p: self.ps[fc],
            q: UnitQuaternion::from_matrix(&self.rs[fc]),
            v: self.vs[fc],
            ba: self.bas[fc],
            bg: self.bgs[fc],
            acc_0: self.acc_0,
            gyr_0: self.gyr_0,
            g: self.g,
        }
    }

    /// Events to publish after one iteration.
    pub fn collect_outputs(&mut self, t: f64) -> Vec<OutputEvent> {
        let w = self.window_size();
        let mut events = Vec::new();
        if self.solver_flag != SolverFlag::NonLinear {
            return events;
        }

        let q_w = UnitQuaternion::from_matrix(&self.rs[w]);
        events.push(OutputEvent::Odometry {
            t,
            position: self.ps[w],
            orientation: q_w,
            velocity: self.vs[w],
        });
        events.push(OutputEvent::KeyPoses {
            t,
            poses: self.key_poses.clone(),
        });
        let cam_p = self.ps[w] + self.rs[w] * self.tic[0];
        let cam_q = UnitQuaternion::from_matrix(&(self.rs[w] * self.ric[0]));
        events.push(OutputEvent::CameraPose {
            t,
            position: cam_p,
            orientation: cam_q,
        });

        let mut points = Vec::new();
        for track in &self.f_manager.feature {
            if track.used_num < 2 || track.estimated_depth <= 0.0 || track.solve_flag != 1 {
                continue;
            }
            let i = track.start_frame;
            let pts_cam = track.feature_per_frame[0].point * track.estimated_depth;
            points.push(self.rs[i] * (self.ric[0] * pts_cam + self.tic[0]) + self.ps[i]);
        }
        events.push(OutputEvent::PointCloud { t, points });

        if self.marginalization_flag == MarginalizationFlag::MarginOld && w >= 2 {
            events.push(OutputEvent::Keyframe {
                t: self.headers[w - 2],
                position: self.ps[w - 2],
                orientation: UnitQuaternion::from_matrix(&self.rs[w - 2]),
            });
        }
        events.push(OutputEvent::Transform {
            t,
            rotation: self.rs[w],
            translation: self.ps[w],
        });
        if self.gnss_ready {
            events.push(OutputEvent::GnssState {
                t,
                ecef_pos: self.ecef_pos,
                enu_pos: self.enu_pos,
                enu_vel: self.enu_vel,
                enu_ypr: self.enu_ypr,
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn core_with_imu() -> EstimatorCore {
        let cfg = Config {
            multiple_thread: false,
            use_imu: true,
            stereo: true,
            num_of_cam: 2,
            ..Default::default()
        };
        EstimatorCore::new(cfg)
    }

    /// Packing then unpacking must be the identity when the optimizer did
    /// not move the first pose.
    #[test]
    fn pack_unpack_round_trip_is_identity() {
        let mut core = core_with_imu();
        let w = core.window_size();
        for i in 0..=w {
            core.ps[i] = Vector3::new(0.1 * i as f64, -0.05 * i as f64, 0.02 * i as f64);
            core.rs[i] = ypr2r(&Vector3::new(3.0 * i as f64, 1.0, -0.5));
            core.vs[i] = Vector3::new(0.5, 0.1 * i as f64, 0.0);
            core.bas[i] = Vector3::new(0.01, -0.02, 0.005);
            core.bgs[i] = Vector3::new(-0.001, 0.002, 0.0005);
        }
        let ps0 = core.ps.clone();
        let rs0 = core.rs.clone();
        let vs0 = core.vs.clone();

        core.vector2double();
        core.double2vector();

        for i in 0..=w {
            assert_relative_eq!(core.ps[i], ps0[i], epsilon = 1e-9);
            assert_relative_eq!(core.vs[i], vs0[i], epsilon = 1e-9);
            assert_relative_eq!(core.rs[i], rs0[i], epsilon = 1e-9);
        }
    }

    /// A solver-introduced yaw drift must be rotated away: the first
    /// frame's position and yaw stay anchored at their pre-solve values
    /// and the rest of the window moves rigidly.
    #[test]
    fn unpack_anchors_first_frame_yaw() {
        let mut core = core_with_imu();
        let w = core.window_size();
        for i in 0..=w {
            core.ps[i] = Vector3::new(0.2 * i as f64, 0.1 * i as f64, 0.0);
            core.rs[i] = ypr2r(&Vector3::new(5.0 * i as f64, 2.0, 1.0));
            core.vs[i] = Vector3::new(1.0, 0.0, 0.0);
        }
        let ps0 = core.ps.clone();
        let rs0 = core.rs.clone();

        core.vector2double();
        // simulate the solver yawing the whole window by 30°
        let yaw_drift = ypr2r(&Vector3::new(30.0, 0.0, 0.0));
        for i in 0..=w {
            let p = Vector3::new(core.para_pose[i][0], core.para_pose[i][1], core.para_pose[i][2]);
            let q = UnitQuaternion::from_quaternion(Quaternion::new(
                core.para_pose[i][6],
                core.para_pose[i][3],
                core.para_pose[i][4],
                core.para_pose[i][5],
            ));
            let p_new = yaw_drift * p;
            let q_new = UnitQuaternion::from_matrix(&(yaw_drift * q.to_rotation_matrix().into_inner()));
            core.para_pose[i] = [p_new.x, p_new.y, p_new.z, q_new.i, q_new.j, q_new.k, q_new.w];
        }
        core.double2vector();

        // anchored: the first frame's position and yaw are unchanged
        assert_relative_eq!(core.ps[0], ps0[0], epsilon = 1e-9);
        assert_relative_eq!(r2ypr(&core.rs[0]).x, r2ypr(&rs0[0]).x, epsilon = 1e-6);
        // and the whole window came back rigidly
        for i in 0..=w {
            assert_relative_eq!(core.ps[i], ps0[i], epsilon = 1e-6);
            assert_relative_eq!(core.rs[i], rs0[i], epsilon = 1e-6);
        }
    }

    /// The GNSS-VI aligner refuses to run until every window frame holds
    /// enough observations.
    #[test]
    fn gnss_alignment_gated_on_observation_count() {
        let mut core = core_with_imu();
        core.solver_flag = SolverFlag::NonLinear;
        for i in 0..=core.window_size() {
            core.vs[i] = Vector3::new(0.5, 0.3, 0.0);
        }
        assert!(!core.gnss_vi_align());
        assert!(!core.gnss_ready);
    }

    /// Failure recovery: out-of-range bias estimates trip the detector and
    /// a reset returns the estimator to the initialization phase.
    #[test]
    fn failure_detection_and_recovery() {
        let cfg = Config {
            multiple_thread: false,
            use_imu: true,
            stereo: true,
            num_of_cam: 2,
            failure_detection: true,
            ..Default::default()
        };
        let mut core = EstimatorCore::new(cfg);
        let w = core.window_size();
        core.solver_flag = SolverFlag::NonLinear;
        core.bas[w] = Vector3::new(3.0, 0.0, 0.0);
        assert!(core.failure_detection());

        core.clear_state();
        core.set_parameter();
        assert_eq!(core.solver_flag, SolverFlag::Initial);
        assert_eq!(core.frame_count, 0);
        assert!(core.bas[w].norm() < 1e-12);
    }

    /// With the detector disabled (the default), oversized biases are
    /// tolerated.
    #[test]
    fn failure_detection_disabled_by_default() {
        let mut core = core_with_imu();
        let w = core.window_size();
        core.bas[w] = Vector3::new(3.0, 0.0, 0.0);
        assert!(!core.failure_detection());
    }
}
