//! Estimator facade: sensor entry points, the measurement dispatcher, and
//! the IMU-rate fast predictor.
//!
//! Three mutexes with a fixed discipline: the buffer mutex guards the
//! sensor queues (held only to push or extract), the process mutex guards
//! the window core for a whole iteration, and the propagate mutex guards
//! the fast predictor's latest state. The buffer mutex is never acquired
//! while the process mutex is held, and the propagate mutex is never
//! nested with either.

pub mod buffers;
pub mod core;
pub mod output;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::features::FeatureFrame;
use crate::geometry::so3::delta_q;
use crate::gnss::{EphemerisPtr, GnssObservation};

use self::buffers::SensorBuffers;
use self::core::{EstimatorCore, LatestSeed};
use self::output::{OutputEvent, OutputSender};

pub use self::core::SolverFlag;
pub use self::output::{output_channel, OutputReceiver};

/// Idle sleep of the dispatcher loop.
const DISPATCH_IDLE: Duration = Duration::from_millis(2);
/// Catch-up wait quantum while sensors lag the current feature frame.
const CATCH_UP_WAIT: Duration = Duration::from_millis(5);

/// Fast-predictor state, advanced on every IMU arrival.
struct LatestState {
    initialized: bool,
    time: f64,
    p: Vector3<f64>,
    q: UnitQuaternion<f64>,
    v: Vector3<f64>,
    ba: Vector3<f64>,
    bg: Vector3<f64>,
    acc_0: Vector3<f64>,
    gyr_0: Vector3<f64>,
    g: Vector3<f64>,
}

impl LatestState {
    fn new() -> Self {
        Self {
            initialized: false,
            time: 0.0,
            p: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            v: Vector3::zeros(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc_0: Vector3::zeros(),
            gyr_0: Vector3::zeros(),
            g: Vector3::zeros(),
        }
    }

    fn seed(&mut self, s: LatestSeed) {
        self.initialized = true;
        self.time = s.time;
        self.p = s.p;
        self.q = s.q;
        self.v = s.v;
        self.ba = s.ba;
        self.bg = s.bg;
        self.acc_0 = s.acc_0;
        self.gyr_0 = s.gyr_0;
        self.g = s.g;
    }

    /// One midpoint step of the IMU-only propagation.
    fn fast_predict_imu(&mut self, t: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        if !self.initialized {
            return;
        }
        let dt = t - self.time;
        if dt <= 0.0 {
            return;
        }
        self.time = t;
        let un_acc_0 = self.q * (self.acc_0 - self.ba) - self.g;
        let un_gyr = 0.5 * (self.gyr_0 + gyr) - self.bg;
        self.q *= delta_q(&(un_gyr * dt));
        let un_acc_1 = self.q * (acc - self.ba) - self.g;
        let un_acc = 0.5 * (un_acc_0 + un_acc_1);
        self.p += dt * self.v + 0.5 * dt * dt * un_acc;
        self.v += dt * un_acc;
        self.acc_0 = acc;
        self.gyr_0 = gyr;
    }
}

struct DispatchTimes {
    prev_time: f64,
}

struct Shared {
    cfg: Config,
    buffers: Mutex<SensorBuffers>,
    buf_cond: Condvar,
    core: Mutex<EstimatorCore>,
    latest: Mutex<LatestState>,
    dispatch: Mutex<DispatchTimes>,
    output: Option<OutputSender>,
    shutdown: AtomicBool,
    nonlinear: AtomicBool,
    /// Runtime sensor toggles, kept in sync with the core's view so the
    /// dispatcher gates on the same configuration.
    use_imu: AtomicBool,
}

impl Shared {
    fn publish(&self, event: OutputEvent) {
        if let Some(tx) = &self.output {
            let _ = tx.send(event);
        }
    }
}

/// Multi-sensor sliding-window odometry estimator.
///
/// Inputs arrive through the `input_*` methods; outputs are published on
/// the optional channel. With `multiple_thread` the dispatcher runs on its
/// own thread, otherwise each feature push processes synchronously.
pub struct Estimator {
    shared: Arc<Shared>,
    process_handle: Option<JoinHandle<()>>,
}

impl Estimator {
    pub fn new(cfg: Config, output: Option<OutputSender>) -> Result<Self> {
        cfg.validate()?;
        let shared = Arc::new(Shared {
            buffers: Mutex::new(SensorBuffers::new()),
            buf_cond: Condvar::new(),
            core: Mutex::new(EstimatorCore::new(cfg.clone())),
            latest: Mutex::new(LatestState::new()),
            dispatch: Mutex::new(DispatchTimes { prev_time: -1.0 }),
            output,
            shutdown: AtomicBool::new(false),
            nonlinear: AtomicBool::new(false),
            use_imu: AtomicBool::new(cfg.use_imu),
            cfg,
        });

        let process_handle = if shared.cfg.multiple_thread {
            let worker = shared.clone();
            Some(thread::spawn(move || {
                while !worker.shutdown.load(Ordering::SeqCst) {
                    if !process_measurements(&worker) {
                        thread::sleep(DISPATCH_IDLE);
                    }
                }
            }))
        } else {
            None
        };

        Ok(Self {
            shared,
            process_handle,
        })
    }

    // ── inputs ────────────────────────────────────────────────────────

    pub fn input_imu(&self, t: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        {
            let mut buffers = self.shared.buffers.lock();
            buffers.push_imu(t, acc, gyr);
        }
        self.shared.buf_cond.notify_all();

        if self.shared.nonlinear.load(Ordering::SeqCst) {
            let mut latest = self.shared.latest.lock();
            latest.fast_predict_imu(t, acc, gyr);
            if latest.initialized {
                self.shared.publish(OutputEvent::FastOdometry {
                    t,
                    position: latest.p,
                    orientation: latest.q,
                    velocity: latest.v,
                });
            }
        }
    }

    /// Feeds one feature-tracker frame. In single-thread mode this call
    /// fully processes the frame before returning.
    pub fn input_feature(&self, t: f64, frame: FeatureFrame) {
        {
            let mut buffers = self.shared.buffers.lock();
            buffers.push_feature(t, frame);
        }
        self.shared.buf_cond.notify_all();
        if !self.shared.cfg.multiple_thread {
            while process_measurements(&self.shared) {}
        }
    }

    /// Wheel speeds in m/s, packed along each wheel frame's forward axis.
    pub fn input_encoder(&self, t: f64, speed_left: f64, speed_right: f64) {
        let mut vel = Vector6::zeros();
        vel[2] = speed_left;
        vel[5] = speed_right;
        {
            let mut buffers = self.shared.buffers.lock();
            buffers.push_encoder(t, vel);
        }
        self.shared.buf_cond.notify_all();
    }

    pub fn input_gnss(&self, t: f64, batch: Vec<GnssObservation>) {
        let mut buffers = self.shared.buffers.lock();
        buffers.push_gnss(t, batch);
    }

    pub fn input_ephem(&self, sat: u32, ephem: EphemerisPtr) {
        self.shared.core.lock().input_ephem(ephem, sat);
    }

    pub fn input_iono_params(&self, _t: f64, params: &[f64]) {
        self.shared.core.lock().input_iono_params(params);
    }

    pub fn input_gnss_time_diff(&self, t_diff: f64) {
        self.shared.core.lock().input_gnss_time_diff(t_diff);
    }

    /// Seeds the first window pose from an external source.
    pub fn init_first_pose(&self, p: Vector3<f64>, r: Matrix3<f64>) {
        self.shared.core.lock().init_first_pose(p, r);
    }

    /// Drops all state and re-enters the initialization phase.
    pub fn restart(&self) {
        info!("estimator restart requested");
        {
            let mut buffers = self.shared.buffers.lock();
            buffers.clear();
        }
        {
            let mut core = self.shared.core.lock();
            core.clear_state();
            core.set_parameter();
        }
        self.shared.nonlinear.store(false, Ordering::SeqCst);
        *self.shared.latest.lock() = LatestState::new();
        self.shared.dispatch.lock().prev_time = -1.0;
    }

    /// Runtime sensor-type change; restarts when the IMU is toggled on.
    pub fn change_sensor_type(&self, use_imu: bool, use_stereo: bool) {
        if !use_imu && !use_stereo {
            warn!("at least two sensors required, ignoring request");
            return;
        }
        let restart = self.shared.core.lock().change_sensor_type(use_imu, use_stereo);
        self.shared.use_imu.store(use_imu, Ordering::SeqCst);
        if restart {
            self.restart();
        }
    }

    // ── introspection ─────────────────────────────────────────────────

    pub fn solver_flag(&self) -> SolverFlag {
        if self.shared.nonlinear.load(Ordering::SeqCst) {
            SolverFlag::NonLinear
        } else {
            SolverFlag::Initial
        }
    }

    /// Pose of the newest window frame.
    pub fn pose_in_world_frame(&self) -> (Matrix3<f64>, Vector3<f64>) {
        let core = self.shared.core.lock();
        let fc = core.frame_count;
        (core.rs[fc], core.ps[fc])
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.buf_cond.notify_all();
        if let Some(handle) = self.process_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Estimator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One dispatcher step: pick the next feature frame, wait for sensor
/// coverage, extract the interval, and run an estimator iteration.
/// Returns `false` when there was nothing to process.
fn process_measurements(shared: &Shared) -> bool {
    let cfg = &shared.cfg;
    let use_imu = shared.use_imu.load(Ordering::SeqCst);
    let td = shared.core.lock().td;
    let prev_time = shared.dispatch.lock().prev_time;

    let mut buffers = shared.buffers.lock();
    let Some(feature_t) = buffers.peek_feature_time() else {
        return false;
    };
    let cur_time = feature_t + td;

    if use_imu {
        let mut wait_logged = false;
        while buffers.latest_imu_time < cur_time {
            if !wait_logged {
                wait_logged = true;
                debug!("waiting for IMU to cover {cur_time:.3}");
            }
            if !cfg.multiple_thread || shared.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            shared.buf_cond.wait_for(&mut buffers, CATCH_UP_WAIT);
        }
    }
    if use_imu && cfg.encoder_enable {
        let mut wait_logged = false;
        while buffers.latest_encoder_time < cur_time {
            if !wait_logged {
                wait_logged = true;
                debug!("waiting for encoder to cover {cur_time:.3}");
            }
            if !cfg.multiple_thread || shared.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            shared.buf_cond.wait_for(&mut buffers, CATCH_UP_WAIT);
        }
    }

    let imu_interval = if use_imu {
        buffers.imu_interval(prev_time, cur_time)
    } else {
        None
    };
    let (feature_t, feature) = buffers.pop_feature().expect("peeked above");
    let enc_interval = if use_imu && cfg.encoder_enable {
        buffers.encoder_interval(prev_time, cur_time)
    } else {
        None
    };
    let gnss_batches = if cfg.gnss_enable {
        buffers.gnss_interval(prev_time, cur_time)
    } else {
        Vec::new()
    };
    drop(buffers);

    let seed = {
        let mut core = shared.core.lock();
        if use_imu {
            if let Some((acc, gyr)) = imu_interval.as_ref() {
                core.process_sensor_interval(
                    acc,
                    gyr,
                    enc_interval.as_deref(),
                    prev_time,
                    cur_time,
                );
            }
        }
        for (_, batch) in &gnss_batches {
            core.process_gnss(batch);
        }
        core.process_image(&feature, feature_t);
        shared
            .nonlinear
            .store(core.solver_is_nonlinear(), Ordering::SeqCst);

        for event in core.collect_outputs(feature_t) {
            shared.publish(event);
        }
        core.solver_is_nonlinear().then(|| core.latest_seed())
    };
    shared.dispatch.lock().prev_time = cur_time;

    // re-seed the fast predictor and replay the buffered IMU tail
    if let Some(seed) = seed {
        let tail = shared.buffers.lock().imu_snapshot();
        let mut latest = shared.latest.lock();
        latest.seed(seed);
        for (t, acc, gyr) in tail {
            if t > seed.time {
                latest.fast_predict_imu(t, acc, gyr);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn single_thread_config() -> Config {
        Config {
            multiple_thread: false,
            stereo: true,
            num_of_cam: 2,
            use_imu: true,
            ..Default::default()
        }
    }

    fn feature_frame(n: usize, shift: f64) -> FeatureFrame {
        (0..n as u64)
            .map(|id| {
                let x = -0.5 + 0.02 * id as f64 + shift;
                let y = -0.3 + 0.013 * id as f64;
                let obs = vec![
                    crate::features::FeatureObservation {
                        camera_id: 0,
                        point: Vector3::new(x, y, 1.0),
                        velocity: Vector2::zeros(),
                    },
                    crate::features::FeatureObservation {
                        camera_id: 1,
                        point: Vector3::new(x - 0.05, y, 1.0),
                        velocity: Vector2::zeros(),
                    },
                ];
                (id, obs)
            })
            .collect()
    }

    #[test]
    fn single_threaded_input_processes_inline() {
        let (tx, rx) = output_channel();
        let est = Estimator::new(single_thread_config(), Some(tx)).unwrap();

        // feed IMU past the first frame time, then a feature frame
        for k in 0..60 {
            let t = k as f64 * 0.005;
            est.input_imu(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());
        }
        est.input_feature(0.1, feature_frame(60, 0.0));

        // frame fully consumed before returning
        assert!(!est.shared.buffers.lock().has_feature());
        // nothing published before initialization completes
        assert!(rx.try_iter().all(|e| matches!(e, OutputEvent::FastOdometry { .. })));
    }

    #[test]
    fn restart_clears_buffers_and_state() {
        let est = Estimator::new(single_thread_config(), None).unwrap();
        for k in 0..30 {
            est.input_imu(k as f64 * 0.005, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());
        }
        est.restart();
        assert!(est.shared.buffers.lock().is_empty());
        assert_eq!(est.solver_flag(), SolverFlag::Initial);
    }

    #[test]
    fn sensor_change_rejects_empty_set() {
        let est = Estimator::new(single_thread_config(), None).unwrap();
        // both off is refused, the estimator keeps running
        est.change_sensor_type(false, false);
        assert_eq!(est.solver_flag(), SolverFlag::Initial);
    }
}
