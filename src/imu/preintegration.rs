//! IMU (and optional wheel-encoder) pre-integration between two window
//! frames.
//!
//! Accumulates raw samples into the relative quantities Δp, Δq, Δv (and,
//! with an encoder, the two wheel-contact displacements Δo_L, Δo_R) via
//! midpoint integration, while jointly propagating the error-state
//! covariance and the first-order Jacobian with respect to the linearized
//! biases. Raw samples stay buffered so `repropagate` can replay them
//! exactly against a new bias linearization point.
//!
//! Error-state layout: `[δp, δθ, δv, δba, δbg]` (15), or
//! `[δp, δθ, δv, δo_L, δo_R, δba, δbg]` (21) with an encoder.

use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3, Vector6};

use crate::geometry::so3::{delta_q as dq, skew};

/// IMU and encoder noise densities (1-sigma).
#[derive(Debug, Clone, Copy)]
pub struct ImuNoise {
    /// Accelerometer measurement noise (m/s²/√Hz).
    pub acc_n: f64,
    /// Gyroscope measurement noise (rad/s/√Hz).
    pub gyr_n: f64,
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub acc_w: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub gyr_w: f64,
    /// Wheel-encoder velocity noise (m/s).
    pub enc_n: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            acc_n: 0.1,
            gyr_n: 0.01,
            acc_w: 1e-3,
            gyr_w: 1e-4,
            enc_n: 0.05,
        }
    }
}

/// Body↔wheel extrinsics for the two encoder contact points.
#[derive(Debug, Clone)]
pub struct EncoderExtrinsics {
    /// Left wheel frame → body rotation.
    pub rio_l: Matrix3<f64>,
    /// Right wheel frame → body rotation.
    pub rio_r: Matrix3<f64>,
    /// Left wheel contact point in the body frame.
    pub tio_l: Vector3<f64>,
    /// Right wheel contact point in the body frame.
    pub tio_r: Vector3<f64>,
}

impl Default for EncoderExtrinsics {
    fn default() -> Self {
        Self {
            rio_l: Matrix3::identity(),
            rio_r: Matrix3::identity(),
            tio_l: Vector3::zeros(),
            tio_r: Vector3::zeros(),
        }
    }
}

/// Error-state offsets shared by the propagation and the factors.
pub const O_P: usize = 0;
pub const O_R: usize = 3;
pub const O_V: usize = 6;
pub const O_OL: usize = 9;
pub const O_OR: usize = 12;

/// Pre-integrated relative motion between two consecutive window frames.
#[derive(Debug, Clone)]
pub struct Preintegration {
    // boundary samples carried across push_back calls
    acc_0: Vector3<f64>,
    gyr_0: Vector3<f64>,
    enc_v_0: Vector6<f64>,

    // construction-time boundary samples, restored by repropagate
    linearized_acc: Vector3<f64>,
    linearized_gyr: Vector3<f64>,
    linearized_enc_v: Vector6<f64>,

    pub linearized_ba: Vector3<f64>,
    pub linearized_bg: Vector3<f64>,

    noise_cfg: ImuNoise,
    encoder: Option<EncoderExtrinsics>,

    /// First-order transition product, `state_dim × state_dim`.
    pub jacobian: DMatrix<f64>,
    /// Propagated error-state covariance, `state_dim × state_dim`.
    pub covariance: DMatrix<f64>,
    noise: DMatrix<f64>,

    pub sum_dt: f64,
    pub delta_p: Vector3<f64>,
    pub delta_q: UnitQuaternion<f64>,
    pub delta_v: Vector3<f64>,
    pub delta_o_l: Vector3<f64>,
    pub delta_o_r: Vector3<f64>,

    dt_buf: Vec<f64>,
    acc_buf: Vec<Vector3<f64>>,
    gyr_buf: Vec<Vector3<f64>>,
    enc_buf: Vec<Vector6<f64>>,
}

impl Preintegration {
    /// IMU-only pre-integration anchored at the given boundary sample and
    /// linearized biases.
    pub fn new(
        acc_0: Vector3<f64>,
        gyr_0: Vector3<f64>,
        ba: Vector3<f64>,
        bg: Vector3<f64>,
        noise: ImuNoise,
    ) -> Self {
        Self::build(acc_0, gyr_0, Vector6::zeros(), ba, bg, noise, None)
    }

    /// IMU+encoder pre-integration; `enc_v_0` packs the left and right
    /// wheel velocity vectors as `[v_L; v_R]`.
    pub fn new_with_encoder(
        acc_0: Vector3<f64>,
        gyr_0: Vector3<f64>,
        enc_v_0: Vector6<f64>,
        ba: Vector3<f64>,
        bg: Vector3<f64>,
        noise: ImuNoise,
        extrinsics: EncoderExtrinsics,
    ) -> Self {
        Self::build(acc_0, gyr_0, enc_v_0, ba, bg, noise, Some(extrinsics))
    }

    fn build(
        acc_0: Vector3<f64>,
        gyr_0: Vector3<f64>,
        enc_v_0: Vector6<f64>,
        ba: Vector3<f64>,
        bg: Vector3<f64>,
        noise_cfg: ImuNoise,
        encoder: Option<EncoderExtrinsics>,
    ) -> Self {
        let dim = if encoder.is_some() { 21 } else { 15 };
        let noise_dim = if encoder.is_some() { 24 } else { 18 };

        let mut noise = DMatrix::zeros(noise_dim, noise_dim);
        let variances: [f64; 8] = [
            noise_cfg.acc_n * noise_cfg.acc_n,
            noise_cfg.gyr_n * noise_cfg.gyr_n,
            noise_cfg.acc_n * noise_cfg.acc_n,
            noise_cfg.gyr_n * noise_cfg.gyr_n,
            noise_cfg.acc_w * noise_cfg.acc_w,
            noise_cfg.gyr_w * noise_cfg.gyr_w,
            noise_cfg.enc_n * noise_cfg.enc_n,
            noise_cfg.enc_n * noise_cfg.enc_n,
        ];
        for (b, var) in variances.iter().enumerate().take(noise_dim / 3) {
            for k in 0..3 {
                noise[(b * 3 + k, b * 3 + k)] = *var;
            }
        }

        let (delta_o_l, delta_o_r) = match &encoder {
            Some(e) => (e.tio_l, e.tio_r),
            None => (Vector3::zeros(), Vector3::zeros()),
        };

        Self {
            acc_0,
            gyr_0,
            enc_v_0,
            linearized_acc: acc_0,
            linearized_gyr: gyr_0,
            linearized_enc_v: enc_v_0,
            linearized_ba: ba,
            linearized_bg: bg,
            noise_cfg,
            encoder,
            jacobian: DMatrix::identity(dim, dim),
            covariance: DMatrix::zeros(dim, dim),
            noise,
            sum_dt: 0.0,
            delta_p: Vector3::zeros(),
            delta_q: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            delta_o_l,
            delta_o_r,
            dt_buf: Vec::new(),
            acc_buf: Vec::new(),
            gyr_buf: Vec::new(),
            enc_buf: Vec::new(),
        }
    }

    /// Error-state dimension: 15, or 21 with an encoder.
    #[inline]
    pub fn state_dim(&self) -> usize {
        if self.encoder.is_some() { 21 } else { 15 }
    }

    #[inline]
    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn extrinsics(&self) -> Option<&EncoderExtrinsics> {
        self.encoder.as_ref()
    }

    /// Column of the accel-bias block in `jacobian`.
    #[inline]
    pub fn o_ba(&self) -> usize {
        if self.encoder.is_some() { 15 } else { 9 }
    }

    /// Column of the gyro-bias block in `jacobian`.
    #[inline]
    pub fn o_bg(&self) -> usize {
        if self.encoder.is_some() { 18 } else { 12 }
    }

    /// Buffers the sample and advances the pre-integrated state by one
    /// midpoint step.
    pub fn push_back(
        &mut self,
        dt: f64,
        acc: Vector3<f64>,
        gyr: Vector3<f64>,
        enc_v: Option<Vector6<f64>>,
    ) {
        let enc_v = enc_v.unwrap_or_else(Vector6::zeros);
        self.dt_buf.push(dt);
        self.acc_buf.push(acc);
        self.gyr_buf.push(gyr);
        self.enc_buf.push(enc_v);
        self.propagate(dt, acc, gyr, enc_v);
    }

    /// Resets the deltas and replays the buffered samples against new
    /// linearization biases. Exact because the raw samples are kept.
    pub fn repropagate(&mut self, ba: Vector3<f64>, bg: Vector3<f64>) {
        self.sum_dt = 0.0;
        self.acc_0 = self.linearized_acc;
        self.gyr_0 = self.linearized_gyr;
        self.enc_v_0 = self.linearized_enc_v;
        self.delta_p = Vector3::zeros();
        self.delta_q = UnitQuaternion::identity();
        self.delta_v = Vector3::zeros();
        (self.delta_o_l, self.delta_o_r) = match &self.encoder {
            Some(e) => (e.tio_l, e.tio_r),
            None => (Vector3::zeros(), Vector3::zeros()),
        };
        self.linearized_ba = ba;
        self.linearized_bg = bg;
        let dim = self.state_dim();
        self.jacobian = DMatrix::identity(dim, dim);
        self.covariance = DMatrix::zeros(dim, dim);

        let dts = std::mem::take(&mut self.dt_buf);
        let accs = std::mem::take(&mut self.acc_buf);
        let gyrs = std::mem::take(&mut self.gyr_buf);
        let encs = std::mem::take(&mut self.enc_buf);
        for i in 0..dts.len() {
            self.propagate(dts[i], accs[i], gyrs[i], encs[i]);
        }
        self.dt_buf = dts;
        self.acc_buf = accs;
        self.gyr_buf = gyrs;
        self.enc_buf = encs;
    }

    fn propagate(&mut self, dt: f64, acc_1: Vector3<f64>, gyr_1: Vector3<f64>, enc_1: Vector6<f64>) {
        self.midpoint_integration(dt, acc_1, gyr_1, enc_1);
        self.sum_dt += dt;
        self.acc_0 = acc_1;
        self.gyr_0 = gyr_1;
        self.enc_v_0 = enc_1;
    }

    fn midpoint_integration(
        &mut self,
        dt: f64,
        acc_1: Vector3<f64>,
        gyr_1: Vector3<f64>,
        enc_1: Vector6<f64>,
    ) {
        let un_acc_0 = self.delta_q * (self.acc_0 - self.linearized_ba);
        let un_gyr = 0.5 * (self.gyr_0 + gyr_1) - self.linearized_bg;
        let result_delta_q = self.delta_q * dq(&(un_gyr * dt));
        let un_acc_1 = result_delta_q * (acc_1 - self.linearized_ba);
        let un_acc = 0.5 * (un_acc_0 + un_acc_1);
        let result_delta_p = self.delta_p + self.delta_v * dt + 0.5 * un_acc * dt * dt;
        let result_delta_v = self.delta_v + un_acc * dt;

        let r0 = self.delta_q.to_rotation_matrix().into_inner();
        let r1 = result_delta_q.to_rotation_matrix().into_inner();
        let a0x = skew(&(self.acc_0 - self.linearized_ba));
        let a1x = skew(&(acc_1 - self.linearized_ba));
        let wx = skew(&un_gyr);
        let i3 = Matrix3::identity();

        let dim = self.state_dim();
        let (o_ba, o_bg) = (self.o_ba(), self.o_bg());

        fn set(m: &mut DMatrix<f64>, r: usize, c: usize, b: Matrix3<f64>) {
            m.view_mut((r, c), (3, 3)).copy_from(&b);
        }

        let mut f = DMatrix::identity(dim, dim);
        set(&mut f, O_P, O_R,
            -0.25 * r0 * a0x * dt * dt + -0.25 * r1 * a1x * (i3 - wx * dt) * dt * dt);
        set(&mut f, O_P, O_V, i3 * dt);
        set(&mut f, O_P, o_ba, -0.25 * (r0 + r1) * dt * dt);
        set(&mut f, O_P, o_bg, 0.25 * r1 * a1x * dt * dt * dt);
        set(&mut f, O_R, O_R, i3 - wx * dt);
        set(&mut f, O_R, o_bg, -i3 * dt);
        set(&mut f, O_V, O_R,
            -0.5 * r0 * a0x * dt + -0.5 * r1 * a1x * (i3 - wx * dt) * dt);
        set(&mut f, O_V, o_ba, -0.5 * (r0 + r1) * dt);
        set(&mut f, O_V, o_bg, 0.5 * r1 * a1x * dt * dt);

        let noise_dim = self.noise.nrows();
        let mut v = DMatrix::zeros(dim, noise_dim);
        set(&mut v, O_P, 0, 0.25 * r0 * dt * dt);
        set(&mut v, O_P, 3, -0.125 * r1 * a1x * dt * dt * dt);
        set(&mut v, O_P, 6, 0.25 * r1 * dt * dt);
        set(&mut v, O_P, 9, -0.125 * r1 * a1x * dt * dt * dt);
        set(&mut v, O_R, 3, 0.5 * i3 * dt);
        set(&mut v, O_R, 9, 0.5 * i3 * dt);
        set(&mut v, O_V, 0, 0.5 * r0 * dt);
        set(&mut v, O_V, 3, -0.25 * r1 * a1x * dt * dt);
        set(&mut v, O_V, 6, 0.5 * r1 * dt);
        set(&mut v, O_V, 9, -0.25 * r1 * a1x * dt * dt);
        set(&mut v, o_ba, 12, i3 * dt);
        set(&mut v, o_bg, 15, i3 * dt);

        if let Some(ext) = self.encoder.clone() {
            let w_l0 = ext.rio_l * self.enc_v_0.fixed_rows::<3>(0).into_owned();
            let w_l1 = ext.rio_l * enc_1.fixed_rows::<3>(0).into_owned();
            let w_r0 = ext.rio_r * self.enc_v_0.fixed_rows::<3>(3).into_owned();
            let w_r1 = ext.rio_r * enc_1.fixed_rows::<3>(3).into_owned();

            self.delta_o_l += 0.5 * (self.delta_q * w_l0 + result_delta_q * w_l1) * dt;
            self.delta_o_r += 0.5 * (self.delta_q * w_r0 + result_delta_q * w_r1) * dt;

            set(&mut f, O_OL, O_R,
                -0.5 * r0 * skew(&w_l0) * dt + -0.5 * r1 * skew(&w_l1) * (i3 - wx * dt) * dt);
            set(&mut f, O_OL, o_bg, 0.5 * r1 * skew(&w_l1) * dt * dt);
            set(&mut f, O_OR, O_R,
                -0.5 * r0 * skew(&w_r0) * dt + -0.5 * r1 * skew(&w_r1) * (i3 - wx * dt) * dt);
            set(&mut f, O_OR, o_bg, 0.5 * r1 * skew(&w_r1) * dt * dt);

            set(&mut v, O_OL, 18, 0.5 * (r0 + r1) * ext.rio_l * dt);
            set(&mut v, O_OR, 21, 0.5 * (r0 + r1) * ext.rio_r * dt);
        }

        self.jacobian = &f * &self.jacobian;
        self.covariance = &f * &self.covariance * f.transpose() + &v * &self.noise * v.transpose();

        self.delta_p = result_delta_p;
        self.delta_q = result_delta_q;
        self.delta_v = result_delta_v;
    }

    /// Residual of the predicted vs actual relative motion after first-order
    /// bias correction. 15 rows, or 21 with the two wheel displacements.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        p_i: &Vector3<f64>,
        q_i: &UnitQuaternion<f64>,
        v_i: &Vector3<f64>,
        ba_i: &Vector3<f64>,
        bg_i: &Vector3<f64>,
        p_j: &Vector3<f64>,
        q_j: &UnitQuaternion<f64>,
        v_j: &Vector3<f64>,
        ba_j: &Vector3<f64>,
        bg_j: &Vector3<f64>,
        g: &Vector3<f64>,
    ) -> DVector<f64> {
        let dim = self.state_dim();
        let (o_ba, o_bg) = (self.o_ba(), self.o_bg());

        let blk = |r: usize, c: usize| -> Matrix3<f64> {
            self.jacobian.fixed_view::<3, 3>(r, c).into_owned()
        };
        let dp_dba = blk(O_P, o_ba);
        let dp_dbg = blk(O_P, o_bg);
        let dq_dbg = blk(O_R, o_bg);
        let dv_dba = blk(O_V, o_ba);
        let dv_dbg = blk(O_V, o_bg);

        let dba = ba_i - self.linearized_ba;
        let dbg = bg_i - self.linearized_bg;

        let corrected_delta_q = self.delta_q * dq(&(dq_dbg * dbg));
        let corrected_delta_v = self.delta_v + dv_dba * dba + dv_dbg * dbg;
        let corrected_delta_p = self.delta_p + dp_dba * dba + dp_dbg * dbg;

        let dt = self.sum_dt;
        let mut residual = DVector::zeros(dim);

        let r_p = q_i.inverse() * (0.5 * g * dt * dt + p_j - p_i - v_i * dt) - corrected_delta_p;
        let q_err = corrected_delta_q.inverse() * (q_i.inverse() * q_j);
        let r_q = 2.0 * q_err.imag();
        let r_v = q_i.inverse() * (g * dt + v_j - v_i) - corrected_delta_v;

        residual.fixed_rows_mut::<3>(O_P).copy_from(&r_p);
        residual.fixed_rows_mut::<3>(O_R).copy_from(&r_q);
        residual.fixed_rows_mut::<3>(O_V).copy_from(&r_v);

        if let Some(ext) = &self.encoder {
            let do_l_dbg = blk(O_OL, o_bg);
            let do_r_dbg = blk(O_OR, o_bg);
            let corrected_o_l = self.delta_o_l + do_l_dbg * dbg;
            let corrected_o_r = self.delta_o_r + do_r_dbg * dbg;
            let r_ol = q_i.inverse() * (p_j + q_j * ext.tio_l - p_i) - corrected_o_l;
            let r_or = q_i.inverse() * (p_j + q_j * ext.tio_r - p_i) - corrected_o_r;
            residual.fixed_rows_mut::<3>(O_OL).copy_from(&r_ol);
            residual.fixed_rows_mut::<3>(O_OR).copy_from(&r_or);
        }

        residual.fixed_rows_mut::<3>(o_ba).copy_from(&(ba_j - ba_i));
        residual.fixed_rows_mut::<3>(o_bg).copy_from(&(bg_j - bg_i));
        residual
    }

    /// Noise densities this pre-integration was built with.
    pub fn noise(&self) -> ImuNoise {
        self.noise_cfg
    }

    /// Raw-sample accessors used when folding a slot into its neighbour.
    pub fn buffered_samples(&self) -> (&[f64], &[Vector3<f64>], &[Vector3<f64>], &[Vector6<f64>]) {
        (&self.dt_buf, &self.acc_buf, &self.gyr_buf, &self.enc_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn noise() -> ImuNoise {
        ImuNoise::default()
    }

    #[test]
    fn static_integration_matches_gravity_model() {
        // a = +g in body frame with zero biases over 5 s at 200 Hz.
        let g = Vector3::new(0.0, 0.0, 9.81);
        let mut pre =
            Preintegration::new(g, Vector3::zeros(), Vector3::zeros(), Vector3::zeros(), noise());
        for _ in 0..1000 {
            pre.push_back(0.005, g, Vector3::zeros(), None);
        }
        assert_relative_eq!(pre.sum_dt, 5.0, epsilon = 1e-9);

        // gravity-frame deltas: Δv = g·t, Δq stays identity
        assert_relative_eq!(pre.delta_v, g * 5.0, epsilon = 1e-6);
        assert!(pre.delta_q.angle() < 1e-6);

        // against two identical static states the residual vanishes
        let p = Vector3::zeros();
        let q = UnitQuaternion::identity();
        let v = Vector3::zeros();
        let b = Vector3::zeros();
        let r = pre.evaluate(&p, &q, &v, &b, &b, &p, &q, &v, &b, &b, &g);
        assert!(r.norm() < 1e-6, "residual norm {}", r.norm());
    }

    #[test]
    fn covariance_is_symmetric_positive() {
        let mut pre = Preintegration::new(
            Vector3::new(0.1, 0.0, 9.8),
            Vector3::new(0.01, 0.02, -0.01),
            Vector3::zeros(),
            Vector3::zeros(),
            noise(),
        );
        for i in 0..200 {
            let acc = Vector3::new(0.1 * (i as f64 * 0.01).sin(), 0.0, 9.8);
            let gyr = Vector3::new(0.01, 0.02, -0.01);
            pre.push_back(0.005, acc, gyr, None);
        }
        for i in 0..15 {
            assert!(pre.covariance[(i, i)] > 0.0);
            for j in 0..15 {
                assert_relative_eq!(
                    pre.covariance[(i, j)],
                    pre.covariance[(j, i)],
                    epsilon = 1e-10
                );
            }
        }
    }

    #[test]
    fn repropagate_at_linearization_point_is_identity() {
        let mut pre = Preintegration::new(
            Vector3::new(0.3, -0.1, 9.7),
            Vector3::new(0.02, -0.03, 0.05),
            Vector3::zeros(),
            Vector3::zeros(),
            noise(),
        );
        for i in 0..100 {
            let acc = Vector3::new(0.3 + 0.01 * i as f64, -0.1, 9.7);
            let gyr = Vector3::new(0.02, -0.03, 0.05);
            pre.push_back(0.005, acc, gyr, None);
        }
        let (p0, q0, v0) = (pre.delta_p, pre.delta_q, pre.delta_v);
        pre.repropagate(Vector3::zeros(), Vector3::zeros());
        assert_relative_eq!(pre.delta_p, p0, epsilon = 1e-8);
        assert_relative_eq!(pre.delta_v, v0, epsilon = 1e-8);
        assert!((pre.delta_q.inverse() * q0).angle() < 1e-8);
    }

    #[test]
    fn encoder_displacement_tracks_wheel_path() {
        // straight line at 1 m/s with wheel frames aligned to the body
        let ext = EncoderExtrinsics {
            rio_l: Matrix3::identity(),
            rio_r: Matrix3::identity(),
            tio_l: Vector3::new(0.0, 0.3, -0.2),
            tio_r: Vector3::new(0.0, -0.3, -0.2),
        };
        let wheel_v = {
            let mut v = Vector6::zeros();
            v[0] = 1.0;
            v[3] = 1.0;
            v
        };
        let mut pre = Preintegration::new_with_encoder(
            Vector3::new(0.0, 0.0, 9.81),
            Vector3::zeros(),
            wheel_v,
            Vector3::zeros(),
            Vector3::zeros(),
            noise(),
            ext.clone(),
        );
        for _ in 0..200 {
            pre.push_back(0.005, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros(), Some(wheel_v));
        }
        // contact point advanced 1 m along body x from its mount position
        assert_relative_eq!(
            pre.delta_o_l,
            ext.tio_l + Vector3::new(1.0, 0.0, 0.0),
            epsilon = 1e-9
        );
        assert_eq!(pre.state_dim(), 21);
    }
}
