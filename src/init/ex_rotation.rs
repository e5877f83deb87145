//! Online calibration of the camera-IMU extrinsic rotation.
//!
//! Accumulates frame-to-frame camera rotations (from epipolar geometry)
//! and gyro pre-integrated rotations, then solves the hand-eye constraint
//! `q_ric ⊗ q_cam = q_imu ⊗ q_ric` as a growing homogeneous linear
//! system. Calibration is accepted once the null space is well separated.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3};
use tracing::{debug, info};

use crate::geometry::so3::{quat_left, quat_right};
use crate::geometry::solve_relative_rt;

pub struct InitialExRotation {
    frame_count: usize,
    rc: Vec<Matrix3<f64>>,
    rimu: Vec<Matrix3<f64>>,
    window_size: usize,
}

impl InitialExRotation {
    pub fn new(window_size: usize) -> Self {
        Self {
            frame_count: 0,
            rc: Vec::new(),
            rimu: Vec::new(),
            window_size,
        }
    }

    /// Feeds one frame pair; returns the calibrated rotation once the
    /// solution is observable enough.
    pub fn calibrate(
        &mut self,
        corres: &[(Vector3<f64>, Vector3<f64>)],
        delta_q_imu: UnitQuaternion<f64>,
    ) -> Option<Matrix3<f64>> {
        self.frame_count += 1;
        let r_cam = match solve_relative_rt(corres) {
            Some((r, _)) => r,
            None => {
                debug!("extrinsic calibration: relative rotation unavailable");
                Matrix3::identity()
            }
        };
        self.rc.push(r_cam);
        self.rimu.push(delta_q_imu.to_rotation_matrix().into_inner());

        let n = self.rc.len();
        let mut a = DMatrix::<f64>::zeros(4 * n, 4);
        for i in 0..n {
            let q_cam = UnitQuaternion::from_matrix(&self.rc[i]);
            let q_imu = UnitQuaternion::from_matrix(&self.rimu[i]);

            // downweight pairs where camera and gyro disagree strongly
            let angular_distance = (q_cam.inverse() * q_imu).angle().to_degrees();
            let huber = if angular_distance > 5.0 {
                5.0 / angular_distance
            } else {
                1.0
            };

            let block = (quat_right(&q_cam) - quat_left(&q_imu)) * huber;
            a.view_mut((4 * i, 0), (4, 4)).copy_from(&block);
        }

        let mut svd = a.svd(false, true);
        svd.sort_by_singular_values();
        let v_t = svd.v_t.as_ref()?;
        let x = v_t.row(3);
        let q_ric = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            x[0], x[1], x[2], x[3],
        ));

        if self.frame_count >= self.window_size && svd.singular_values[2] > 0.25 {
            let ric = q_ric.to_rotation_matrix().into_inner();
            info!("extrinsic rotation calibrated:\n{ric:.4}");
            Some(ric)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ypr2r;
    use approx::assert_relative_eq;

    /// Synthesizes rotating motion observed through a known extrinsic and
    /// checks the calibration converges to it.
    #[test]
    fn calibrates_known_extrinsic_rotation() {
        let ric_true = ypr2r(&Vector3::new(90.0, 3.0, -2.0));
        let mut calib = InitialExRotation::new(10);

        let points: Vec<Vector3<f64>> = (0..60)
            .map(|i| {
                Vector3::new(
                    -1.5 + 0.3 * (i % 10) as f64,
                    -1.0 + 0.35 * (i / 10) as f64,
                    5.0 + 0.4 * (i % 7) as f64,
                )
            })
            .collect();

        let mut result = None;
        for k in 0..12 {
            // body rotates strongly each frame around varying axes so the
            // null space separates
            let r_body = ypr2r(&Vector3::new(
                12.0 + 1.5 * k as f64,
                8.0 - 1.0 * k as f64,
                5.0,
            ));
            let t_body = Vector3::new(0.1, 0.02, 0.01);
            let r_cam = ric_true.transpose() * r_body * ric_true;
            let t_cam = ric_true.transpose() * t_body;

            let corres: Vec<(Vector3<f64>, Vector3<f64>)> = points
                .iter()
                .map(|p| {
                    let pj = r_cam.transpose() * (p - t_cam);
                    (
                        Vector3::new(p.x / p.z, p.y / p.z, 1.0),
                        Vector3::new(pj.x / pj.z, pj.y / pj.z, 1.0),
                    )
                })
                .collect();

            let q_imu = UnitQuaternion::from_matrix(&r_body);
            if let Some(ric) = calib.calibrate(&corres, q_imu) {
                result = Some(ric);
            }
        }

        let ric = result.expect("calibration should converge");
        // rotation is recovered up to sign of the quaternion
        let err = (ric.transpose() * ric_true - Matrix3::identity()).norm();
        assert_relative_eq!(err, 0.0, epsilon = 1e-3);
    }
}
