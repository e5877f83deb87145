//! Pre-integration residuals between consecutive window frames.
//!
//! Parameter blocks: `pose_i (7)`, `speed_bias_i (9)`, `pose_j (7)`,
//! `speed_bias_j (9)`. Residual dimension 15, or 21 when the
//! pre-integration carries wheel-encoder displacements. Residuals are
//! whitened by the Cholesky square root of the propagated information.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3, Quaternion, UnitQuaternion, Vector3};
use tracing::warn;

use crate::geometry::so3::{delta_q, quat_left, quat_left_vec, quat_right, skew};
use crate::imu::{Preintegration, O_OL, O_OR, O_P, O_R, O_V};
use crate::solver::Factor;

/// Entries beyond this magnitude in the propagated Jacobian trigger a
/// numerical-instability warning; the factor still evaluates and the
/// trust-region loop is left to reject a diverging step.
const JACOBIAN_SANITY_LIMIT: f64 = 1e8;

fn unpack_pose(p: &[f64]) -> (Vector3<f64>, UnitQuaternion<f64>) {
    (
        Vector3::new(p[0], p[1], p[2]),
        UnitQuaternion::from_quaternion(Quaternion::new(p[6], p[3], p[4], p[5])),
    )
}

fn unpack_speed_bias(sb: &[f64]) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    (
        Vector3::new(sb[0], sb[1], sb[2]),
        Vector3::new(sb[3], sb[4], sb[5]),
        Vector3::new(sb[6], sb[7], sb[8]),
    )
}

/// Square root of the information matrix via Cholesky of the covariance
/// inverse. Falls back to identity when the covariance is not yet
/// positive definite (the first few samples of a fresh pre-integration).
fn sqrt_information(pre: &Preintegration) -> DMatrix<f64> {
    let dim = pre.state_dim();
    pre.covariance
        .clone()
        .try_inverse()
        .and_then(|inv| nalgebra::Cholesky::new(0.5 * (&inv + inv.transpose())))
        .map(|c| c.l().transpose())
        .unwrap_or_else(|| DMatrix::identity(dim, dim))
}

fn check_jacobian_sanity(pre: &Preintegration) {
    let max = pre.jacobian.amax();
    if max > JACOBIAN_SANITY_LIMIT {
        warn!("numerically unstable pre-integration, |J|max = {max:.3e}");
    }
}

fn evaluate_imu(
    pre: &Preintegration,
    g: &Vector3<f64>,
    params: &[&[f64]],
    residuals: &mut [f64],
    jacobians: Option<&mut [Option<DMatrix<f64>>]>,
) -> bool {
    let (p_i, q_i) = unpack_pose(params[0]);
    let (v_i, ba_i, bg_i) = unpack_speed_bias(params[1]);
    let (p_j, q_j) = unpack_pose(params[2]);
    let (v_j, ba_j, bg_j) = unpack_speed_bias(params[3]);

    let dim = pre.state_dim();
    let raw = pre.evaluate(&p_i, &q_i, &v_i, &ba_i, &bg_i, &p_j, &q_j, &v_j, &ba_j, &bg_j, g);
    let sqrt_info = sqrt_information(pre);
    let whitened = &sqrt_info * &raw;
    residuals[..dim].copy_from_slice(whitened.as_slice());

    let Some(jacs) = jacobians else {
        return true;
    };
    check_jacobian_sanity(pre);

    let dt = pre.sum_dt;
    let (o_ba, o_bg) = (pre.o_ba(), pre.o_bg());
    let blk = |r: usize, c: usize| -> Matrix3<f64> {
        pre.jacobian.fixed_view::<3, 3>(r, c).into_owned()
    };
    let dp_dba = blk(O_P, o_ba);
    let dp_dbg = blk(O_P, o_bg);
    let dq_dbg = blk(O_R, o_bg);
    let dv_dba = blk(O_V, o_ba);
    let dv_dbg = blk(O_V, o_bg);

    let ri_t = q_i.inverse().to_rotation_matrix().into_inner();
    let corrected_delta_q = pre.delta_q * delta_q(&(dq_dbg * (bg_i - pre.linearized_bg)));
    let i3 = Matrix3::identity();

    let set = |m: &mut DMatrix<f64>, r: usize, c: usize, b: Matrix3<f64>| {
        m.view_mut((r, c), (3, 3)).copy_from(&b);
    };

    if let Some(j) = jacs[0].as_mut() {
        j.fill(0.0);
        set(j, O_P, 0, -ri_t);
        set(j, O_P, 3, skew(&(q_i.inverse() * (0.5 * g * dt * dt + p_j - p_i - v_i * dt))));
        set(j, O_R, 3,
            -((quat_left(&(q_j.inverse() * q_i)) * quat_right(&corrected_delta_q))
                .fixed_view::<3, 3>(1, 1)
                .into_owned()));
        set(j, O_V, 3, skew(&(q_i.inverse() * (g * dt + v_j - v_i))));
        if let Some(ext) = pre.extrinsics() {
            set(j, O_OL, 0, -ri_t);
            set(j, O_OL, 3, skew(&(q_i.inverse() * (p_j + q_j * ext.tio_l - p_i))));
            set(j, O_OR, 0, -ri_t);
            set(j, O_OR, 3, skew(&(q_i.inverse() * (p_j + q_j * ext.tio_r - p_i))));
        }
        *j = &sqrt_info * &*j;
    }

    if let Some(j) = jacs[1].as_mut() {
        j.fill(0.0);
        set(j, O_P, 0, -ri_t * dt);
        set(j, O_P, 3, -dp_dba);
        set(j, O_P, 6, -dp_dbg);
        set(j, O_R, 6,
            -quat_left_vec(&(q_j.inverse() * q_i * pre.delta_q)) * dq_dbg);
        set(j, O_V, 0, -ri_t);
        set(j, O_V, 3, -dv_dba);
        set(j, O_V, 6, -dv_dbg);
        if pre.has_encoder() {
            set(j, O_OL, 6, -blk(O_OL, o_bg));
            set(j, O_OR, 6, -blk(O_OR, o_bg));
        }
        set(j, o_ba, 3, -i3);
        set(j, o_bg, 6, -i3);
        *j = &sqrt_info * &*j;
    }

    if let Some(j) = jacs[2].as_mut() {
        j.fill(0.0);
        set(j, O_P, 0, ri_t);
        set(j, O_R, 3,
            quat_left_vec(&(corrected_delta_q.inverse() * q_i.inverse() * q_j)));
        if let Some(ext) = pre.extrinsics() {
            let rj = q_j.to_rotation_matrix().into_inner();
            set(j, O_OL, 0, ri_t);
            set(j, O_OL, 3, -ri_t * rj * skew(&ext.tio_l));
            set(j, O_OR, 0, ri_t);
            set(j, O_OR, 3, -ri_t * rj * skew(&ext.tio_r));
        }
        *j = &sqrt_info * &*j;
    }

    if let Some(j) = jacs[3].as_mut() {
        j.fill(0.0);
        set(j, O_V, 0, ri_t);
        set(j, o_ba, 3, i3);
        set(j, o_bg, 6, i3);
        *j = &sqrt_info * &*j;
    }

    true
}

/// 15-dim IMU factor.
pub struct ImuFactor {
    pre: Arc<Preintegration>,
    g: Vector3<f64>,
}

impl ImuFactor {
    pub fn new(pre: Arc<Preintegration>, g: Vector3<f64>) -> Self {
        debug_assert!(!pre.has_encoder());
        Self { pre, g }
    }
}

impl Factor for ImuFactor {
    fn num_residuals(&self) -> usize {
        15
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7, 9, 7, 9]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        evaluate_imu(&self.pre, &self.g, params, residuals, jacobians)
    }
}

/// 21-dim IMU+encoder factor adding the two wheel-contact displacements.
pub struct ImuEncoderFactor {
    pre: Arc<Preintegration>,
    g: Vector3<f64>,
}

impl ImuEncoderFactor {
    pub fn new(pre: Arc<Preintegration>, g: Vector3<f64>) -> Self {
        debug_assert!(pre.has_encoder());
        Self { pre, g }
    }
}

impl Factor for ImuEncoderFactor {
    fn num_residuals(&self) -> usize {
        21
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7, 9, 7, 9]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        evaluate_imu(&self.pre, &self.g, params, residuals, jacobians)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::ImuNoise;

    fn pose(p: Vector3<f64>, q: UnitQuaternion<f64>) -> [f64; 7] {
        [p.x, p.y, p.z, q.i, q.j, q.k, q.w]
    }

    fn speed_bias(v: Vector3<f64>) -> [f64; 9] {
        [v.x, v.y, v.z, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
    }

    #[test]
    fn consistent_states_give_zero_residual() {
        let g = Vector3::new(0.0, 0.0, 9.81);
        let mut pre = Preintegration::new(
            g,
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
            ImuNoise::default(),
        );
        for _ in 0..100 {
            pre.push_back(0.005, g, Vector3::zeros(), None);
        }
        let factor = ImuFactor::new(Arc::new(pre), g);

        let pi = pose(Vector3::zeros(), UnitQuaternion::identity());
        let sbi = speed_bias(Vector3::zeros());
        let pj = pose(Vector3::zeros(), UnitQuaternion::identity());
        let sbj = speed_bias(Vector3::zeros());

        let mut r = [0.0; 15];
        assert!(factor.evaluate(&[&pi, &sbi, &pj, &sbj], &mut r, None));
        let norm: f64 = r.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!(norm < 1e-3, "residual norm {}", norm);
    }

    #[test]
    fn jacobian_matches_finite_differences_for_position() {
        let g = Vector3::new(0.0, 0.0, 9.81);
        let mut pre = Preintegration::new(
            Vector3::new(0.1, 0.0, 9.8),
            Vector3::new(0.0, 0.01, 0.0),
            Vector3::zeros(),
            Vector3::zeros(),
            ImuNoise::default(),
        );
        for _ in 0..50 {
            pre.push_back(0.005, Vector3::new(0.1, 0.0, 9.8), Vector3::new(0.0, 0.01, 0.0), None);
        }
        let factor = ImuFactor::new(Arc::new(pre), g);

        let pi = pose(Vector3::new(0.1, 0.2, 0.3), UnitQuaternion::identity());
        let sbi = speed_bias(Vector3::new(0.5, 0.0, 0.0));
        let pj = pose(Vector3::new(0.2, 0.2, 0.3), UnitQuaternion::identity());
        let sbj = speed_bias(Vector3::new(0.5, 0.0, 0.0));

        let mut r0 = [0.0; 15];
        let mut jacs: Vec<Option<DMatrix<f64>>> = vec![
            Some(DMatrix::zeros(15, 7)),
            Some(DMatrix::zeros(15, 9)),
            Some(DMatrix::zeros(15, 7)),
            Some(DMatrix::zeros(15, 9)),
        ];
        factor.evaluate(&[&pi, &sbi, &pj, &sbj], &mut r0, Some(&mut jacs));

        // perturb p_j.x
        let eps = 1e-6;
        let mut pj_pert = pj;
        pj_pert[0] += eps;
        let mut r1 = [0.0; 15];
        factor.evaluate(&[&pi, &sbi, &pj_pert, &sbj], &mut r1, None);

        let j = jacs[2].as_ref().unwrap();
        for row in 0..15 {
            let fd = (r1[row] - r0[row]) / eps;
            assert!(
                (fd - j[(row, 0)]).abs() < 1e-3 * (1.0 + fd.abs()),
                "row {row}: fd {fd} vs analytic {}",
                j[(row, 0)]
            );
        }
    }
}
