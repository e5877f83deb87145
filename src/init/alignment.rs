//! Visual-inertial alignment: gyroscope-bias estimation from SfM
//! rotations, then a linear solve for per-frame velocities, gravity, and
//! metric scale, with gravity refined on its 2-DoF sphere.

use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};
use tracing::{debug, info, warn};

use super::ImageFrame;
use crate::imu::O_R;

/// Solves the gyroscope bias minimizing the rotation pre-integration
/// residuals over consecutive image frames, then re-propagates every
/// pre-integration at the new bias.
pub fn solve_gyroscope_bias(all_image_frame: &mut [ImageFrame], bgs: &mut [Vector3<f64>]) {
    let mut a = Matrix3::<f64>::zeros();
    let mut b = Vector3::<f64>::zeros();

    for k in 1..all_image_frame.len() {
        let (head, tail) = all_image_frame.split_at(k);
        let frame_i = &head[k - 1];
        let frame_j = &tail[0];
        let Some(pre) = frame_j.pre_integration.as_ref() else {
            continue;
        };
        let q_ij = UnitQuaternion::from_matrix(&(frame_i.r.transpose() * frame_j.r));
        let tmp_a = pre
            .jacobian
            .fixed_view::<3, 3>(O_R, pre.o_bg())
            .into_owned();
        let tmp_b: Vector3<f64> = 2.0 * (pre.delta_q.inverse() * q_ij).imag();
        a += tmp_a.transpose() * tmp_a;
        b += tmp_a.transpose() * tmp_b;
    }

    let delta_bg = match nalgebra::Cholesky::new(a) {
        Some(chol) => chol.solve(&b),
        None => {
            warn!("gyroscope bias normal equations degenerate");
            return;
        }
    };
    info!("gyroscope bias initial calibration {:?}", delta_bg.as_slice());

    for bg in bgs.iter_mut() {
        *bg += delta_bg;
    }
    for frame in all_image_frame.iter_mut().skip(1) {
        if let Some(pre) = frame.pre_integration.as_mut() {
            pre.repropagate(Vector3::zeros(), bgs[0]);
        }
    }
}

/// Two orthonormal directions spanning the tangent plane of a gravity
/// direction.
fn tangent_basis(g0: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let a = g0.normalize();
    let tmp = if (a - Vector3::z()).norm() < 1e-6 || (a + Vector3::z()).norm() < 1e-6 {
        Vector3::x()
    } else {
        Vector3::z()
    };
    let b = (tmp - a * a.dot(&tmp)).normalize();
    let c = a.cross(&b);
    (b, c)
}

/// Linear visual-inertial alignment. On success `g` holds the refined
/// gravity in the reference camera frame and the returned vector packs
/// `[v_0 … v_{n-1}, g(3), s]` with the metric scale last.
pub fn linear_alignment(
    all_image_frame: &[ImageFrame],
    tic0: &Vector3<f64>,
    gravity_norm: f64,
    g: &mut Vector3<f64>,
) -> Option<DVector<f64>> {
    let n_frames = all_image_frame.len();
    let n_state = n_frames * 3 + 3 + 1;
    if n_frames < 2 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(n_state, n_state);
    let mut b = DVector::<f64>::zeros(n_state);

    for k in 1..n_frames {
        let frame_i = &all_image_frame[k - 1];
        let frame_j = &all_image_frame[k];
        let Some(pre) = frame_j.pre_integration.as_ref() else {
            continue;
        };
        let dt = pre.sum_dt;
        let ri_t = frame_i.r.transpose();

        let mut tmp_a = DMatrix::<f64>::zeros(6, 10);
        let mut tmp_b = DVector::<f64>::zeros(6);

        tmp_a
            .view_mut((0, 0), (3, 3))
            .copy_from(&(-dt * Matrix3::identity()));
        tmp_a
            .view_mut((0, 6), (3, 3))
            .copy_from(&(ri_t * dt * dt / 2.0));
        tmp_a
            .view_mut((0, 9), (3, 1))
            .copy_from(&(ri_t * (frame_j.t_vec - frame_i.t_vec) / 100.0));
        tmp_b
            .view_mut((0, 0), (3, 1))
            .copy_from(&(pre.delta_p + ri_t * frame_j.r * tic0 - tic0));

        tmp_a
            .view_mut((3, 0), (3, 3))
            .copy_from(&(-Matrix3::identity()));
        tmp_a
            .view_mut((3, 3), (3, 3))
            .copy_from(&(ri_t * frame_j.r));
        tmp_a.view_mut((3, 6), (3, 3)).copy_from(&(ri_t * dt));
        tmp_b.view_mut((3, 0), (3, 1)).copy_from(&pre.delta_v);

        let r_a = tmp_a.transpose() * &tmp_a;
        let r_b = tmp_a.transpose() * &tmp_b;

        let i0 = (k - 1) * 3;
        for r in 0..6 {
            for c in 0..6 {
                a[(i0 + r, i0 + c)] += r_a[(r, c)];
            }
            b[i0 + r] += r_b[r];
            for c in 0..4 {
                a[(i0 + r, n_state - 4 + c)] += r_a[(r, 6 + c)];
                a[(n_state - 4 + c, i0 + r)] += r_a[(6 + c, r)];
            }
        }
        for r in 0..4 {
            for c in 0..4 {
                a[(n_state - 4 + r, n_state - 4 + c)] += r_a[(6 + r, 6 + c)];
            }
            b[n_state - 4 + r] += r_b[6 + r];
        }
    }

    let a_scaled = &a * 1000.0;
    let b_scaled = &b * 1000.0;
    let chol = nalgebra::Cholesky::new(a_scaled)?;
    let mut x = chol.solve(&b_scaled);

    let s = x[n_state - 1] / 100.0;
    debug!("estimated scale {s:.4}");
    *g = Vector3::new(x[n_state - 4], x[n_state - 3], x[n_state - 2]);
    debug!("g norm before refinement {:.4}", g.norm());
    if (g.norm() - gravity_norm).abs() > 1.0 || s < 0.0 {
        return None;
    }

    refine_gravity(all_image_frame, tic0, gravity_norm, g, &mut x)?;
    let s = x[x.len() - 1] / 100.0;
    if s < 0.0 {
        None
    } else {
        Some(x)
    }
}

/// Refines gravity on the sphere of radius `gravity_norm` with two tangent
/// degrees of freedom, re-solving velocities and scale around it.
fn refine_gravity(
    all_image_frame: &[ImageFrame],
    tic0: &Vector3<f64>,
    gravity_norm: f64,
    g: &mut Vector3<f64>,
    x: &mut DVector<f64>,
) -> Option<()> {
    let n_frames = all_image_frame.len();
    let n_state = n_frames * 3 + 2 + 1;

    let mut g0 = g.normalize() * gravity_norm;

    for _ in 0..4 {
        let (lx, ly) = tangent_basis(&g0);
        let mut a = DMatrix::<f64>::zeros(n_state, n_state);
        let mut b = DVector::<f64>::zeros(n_state);

        for k in 1..n_frames {
            let frame_i = &all_image_frame[k - 1];
            let frame_j = &all_image_frame[k];
            let Some(pre) = frame_j.pre_integration.as_ref() else {
                continue;
            };
            let dt = pre.sum_dt;
            let ri_t = frame_i.r.transpose();

            let mut lxly = nalgebra::Matrix3x2::<f64>::zeros();
            lxly.set_column(0, &lx);
            lxly.set_column(1, &ly);

            let mut tmp_a = DMatrix::<f64>::zeros(6, 9);
            let mut tmp_b = DVector::<f64>::zeros(6);

            tmp_a
                .view_mut((0, 0), (3, 3))
                .copy_from(&(-dt * Matrix3::identity()));
            tmp_a
                .view_mut((0, 6), (3, 2))
                .copy_from(&(ri_t * dt * dt / 2.0 * lxly));
            tmp_a
                .view_mut((0, 8), (3, 1))
                .copy_from(&(ri_t * (frame_j.t_vec - frame_i.t_vec) / 100.0));
            tmp_b.view_mut((0, 0), (3, 1)).copy_from(
                &(pre.delta_p + ri_t * frame_j.r * tic0 - tic0 - ri_t * dt * dt / 2.0 * g0),
            );

            tmp_a
                .view_mut((3, 0), (3, 3))
                .copy_from(&(-Matrix3::identity()));
            tmp_a
                .view_mut((3, 3), (3, 3))
                .copy_from(&(ri_t * frame_j.r));
            tmp_a
                .view_mut((3, 6), (3, 2))
                .copy_from(&(ri_t * dt * lxly));
            tmp_b
                .view_mut((3, 0), (3, 1))
                .copy_from(&(pre.delta_v - ri_t * dt * g0));

            let r_a = tmp_a.transpose() * &tmp_a;
            let r_b = tmp_a.transpose() * &tmp_b;

            let i0 = (k - 1) * 3;
            for r in 0..6 {
                for c in 0..6 {
                    a[(i0 + r, i0 + c)] += r_a[(r, c)];
                }
                b[i0 + r] += r_b[r];
                for c in 0..3 {
                    a[(i0 + r, n_state - 3 + c)] += r_a[(r, 6 + c)];
                    a[(n_state - 3 + c, i0 + r)] += r_a[(6 + c, r)];
                }
            }
            for r in 0..3 {
                for c in 0..3 {
                    a[(n_state - 3 + r, n_state - 3 + c)] += r_a[(6 + r, 6 + c)];
                }
                b[n_state - 3 + r] += r_b[6 + r];
            }
        }

        let a_scaled = &a * 1000.0;
        let b_scaled = &b * 1000.0;
        let chol = nalgebra::Cholesky::new(a_scaled)?;
        let sol = chol.solve(&b_scaled);
        let dg = Vector3::from_column_slice(&[sol[n_state - 3], sol[n_state - 2], 0.0]);
        let (lx, ly) = tangent_basis(&g0);
        g0 = (g0 + lx * dg.x + ly * dg.y).normalize() * gravity_norm;
        *x = sol;
    }
    *g = g0;
    Some(())
}

/// Full visual-IMU alignment: gyroscope bias, then the linear solve.
pub fn visual_imu_alignment(
    all_image_frame: &mut [ImageFrame],
    bgs: &mut [Vector3<f64>],
    tic0: &Vector3<f64>,
    gravity_norm: f64,
    g: &mut Vector3<f64>,
) -> Option<DVector<f64>> {
    solve_gyroscope_bias(all_image_frame, bgs);
    linear_alignment(all_image_frame, tic0, gravity_norm, g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{ImuNoise, Preintegration};
    use approx::assert_relative_eq;

    /// Simulates a body accelerating along x under gravity along -z (world),
    /// with visual poses scaled down by 1/s, and checks the recovered
    /// scale and gravity.
    #[test]
    fn recovers_scale_and_gravity() {
        let g_world = Vector3::new(0.0, 0.0, -9.81);
        let accel_body = Vector3::new(0.4, 0.0, 0.0);
        let scale = 2.5;
        let dt = 0.02;
        let steps_per_frame = 10;
        let n_frames = 8;

        let mut frames = Vec::new();
        let mut p = Vector3::zeros();
        let mut v = Vector3::zeros();
        let mut t = 0.0;

        for k in 0..n_frames {
            let mut frame = ImageFrame::new(Default::default(), t);
            frame.r = Matrix3::identity();
            frame.t_vec = p / scale;
            if k > 0 {
                // pre-integration over the previous interval: measured
                // specific force = a_body − g (static attitude)
                let acc_meas = accel_body - g_world;
                let mut pre = Preintegration::new(
                    acc_meas,
                    Vector3::zeros(),
                    Vector3::zeros(),
                    Vector3::zeros(),
                    ImuNoise::default(),
                );
                for _ in 0..steps_per_frame {
                    pre.push_back(dt, acc_meas, Vector3::zeros(), None);
                }
                frame.pre_integration = Some(pre);
            }
            frames.push(frame);

            for _ in 0..steps_per_frame {
                p += v * dt + 0.5 * accel_body * dt * dt;
                v += accel_body * dt;
                t += dt;
            }
        }

        let mut bgs = vec![Vector3::zeros(); n_frames];
        let mut g_est = Vector3::zeros();
        let x = visual_imu_alignment(
            &mut frames,
            &mut bgs,
            &Vector3::zeros(),
            9.81,
            &mut g_est,
        )
        .expect("alignment should succeed");

        let s = x[x.len() - 1] / 100.0;
        assert_relative_eq!(s, scale, epsilon = 0.05);
        // gravity in the (identity-rotation) camera frame is -g_world
        assert_relative_eq!(g_est, -g_world, epsilon = 0.1);
        assert_relative_eq!(g_est.norm(), 9.81, epsilon = 1e-9);
    }
}
