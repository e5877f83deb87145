//! Reprojection residuals with online time-offset compensation.
//!
//! All three variants reproject a landmark owned (as inverse depth) by its
//! anchor observation into a second view. Per-feature normalized-plane
//! velocities shift both observations by the current `td` estimate so the
//! factor stays consistent while the time offset is refined.

use nalgebra::{DMatrix, Matrix2, Matrix3, Quaternion, SMatrix, UnitQuaternion, Vector2, Vector3};

use crate::geometry::so3::skew;
use crate::solver::Factor;

fn unpack_pose(p: &[f64]) -> (Vector3<f64>, UnitQuaternion<f64>) {
    (
        Vector3::new(p[0], p[1], p[2]),
        UnitQuaternion::from_quaternion(Quaternion::new(p[6], p[3], p[4], p[5])),
    )
}

/// Shared observation data of a projection residual.
struct Observation {
    pts_i: Vector3<f64>,
    pts_j: Vector3<f64>,
    velocity_i: Vector3<f64>,
    velocity_j: Vector3<f64>,
    td_i: f64,
    td_j: f64,
    sqrt_info: Matrix2<f64>,
}

impl Observation {
    #[allow(clippy::too_many_arguments)]
    fn new(
        pts_i: Vector3<f64>,
        pts_j: Vector3<f64>,
        velocity_i: Vector2<f64>,
        velocity_j: Vector2<f64>,
        td_i: f64,
        td_j: f64,
        focal_length: f64,
    ) -> Self {
        Self {
            pts_i,
            pts_j,
            velocity_i: Vector3::new(velocity_i.x, velocity_i.y, 0.0),
            velocity_j: Vector3::new(velocity_j.x, velocity_j.y, 0.0),
            td_i,
            td_j,
            sqrt_info: Matrix2::identity() * (focal_length / 1.5),
        }
    }

    fn shifted(&self, td: f64) -> (Vector3<f64>, Vector3<f64>) {
        (
            self.pts_i - (td - self.td_i) * self.velocity_i,
            self.pts_j - (td - self.td_j) * self.velocity_j,
        )
    }
}

/// `∂(x/z, y/z)/∂(x,y,z)` pre-multiplied by the information square root.
fn reduce(sqrt_info: &Matrix2<f64>, pts: &Vector3<f64>) -> SMatrix<f64, 2, 3> {
    let inv_z = 1.0 / pts.z;
    let r = SMatrix::<f64, 2, 3>::new(
        inv_z, 0.0, -pts.x * inv_z * inv_z,
        0.0, inv_z, -pts.y * inv_z * inv_z,
    );
    sqrt_info * r
}

fn write_residual(residuals: &mut [f64], r: &Vector2<f64>) {
    residuals[0] = r.x;
    residuals[1] = r.y;
}

fn set3(m: &mut DMatrix<f64>, c: usize, b: &SMatrix<f64, 2, 3>) {
    m.view_mut((0, c), (2, 3)).copy_from(b);
}

/// Landmark anchored in frame `i`, re-observed by the same camera in frame
/// `j`. Blocks: `pose_i (7)`, `pose_j (7)`, `ex_pose (7)`, `inv_depth (1)`,
/// `td (1)`.
pub struct ProjectionTwoFrameOneCam {
    obs: Observation,
}

impl ProjectionTwoFrameOneCam {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pts_i: Vector3<f64>,
        pts_j: Vector3<f64>,
        velocity_i: Vector2<f64>,
        velocity_j: Vector2<f64>,
        td_i: f64,
        td_j: f64,
        focal_length: f64,
    ) -> Self {
        Self {
            obs: Observation::new(pts_i, pts_j, velocity_i, velocity_j, td_i, td_j, focal_length),
        }
    }
}

impl Factor for ProjectionTwoFrameOneCam {
    fn num_residuals(&self) -> usize {
        2
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7, 7, 7, 1, 1]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        let (p_i, q_i) = unpack_pose(params[0]);
        let (p_j, q_j) = unpack_pose(params[1]);
        let (tic, qic) = unpack_pose(params[2]);
        let inv_dep_i = params[3][0];
        let td = params[4][0];

        let (pts_i_td, pts_j_td) = self.obs.shifted(td);
        let pts_camera_i = pts_i_td / inv_dep_i;
        let pts_imu_i = qic * pts_camera_i + tic;
        let pts_w = q_i * pts_imu_i + p_i;
        let pts_imu_j = q_j.inverse() * (pts_w - p_j);
        let pts_camera_j = qic.inverse() * (pts_imu_j - tic);

        let r = self.obs.sqrt_info
            * (pts_camera_j.xy() / pts_camera_j.z - pts_j_td.xy());
        write_residual(residuals, &r);

        let Some(jacs) = jacobians else { return true };

        let red = reduce(&self.obs.sqrt_info, &pts_camera_j);
        let ri = q_i.to_rotation_matrix().into_inner();
        let rj = q_j.to_rotation_matrix().into_inner();
        let ric = qic.to_rotation_matrix().into_inner();
        let ric_t = ric.transpose();
        let rj_t = rj.transpose();

        if let Some(j) = jacs[0].as_mut() {
            j.fill(0.0);
            set3(j, 0, &(red * (ric_t * rj_t)));
            set3(j, 3, &(red * (ric_t * rj_t * ri * -skew(&pts_imu_i))));
        }
        if let Some(j) = jacs[1].as_mut() {
            j.fill(0.0);
            set3(j, 0, &(red * (-ric_t * rj_t)));
            set3(j, 3, &(red * (ric_t * skew(&pts_imu_j))));
        }
        if let Some(j) = jacs[2].as_mut() {
            j.fill(0.0);
            let tmp_r = ric_t * rj_t * ri * ric;
            set3(j, 0, &(red * (ric_t * (rj_t * ri - Matrix3::identity()))));
            let rot = -tmp_r * skew(&pts_camera_i)
                + skew(&(tmp_r * pts_camera_i))
                + skew(&(ric_t * (rj_t * (ri * tic + p_i - p_j) - tic)));
            set3(j, 3, &(red * rot));
        }
        if let Some(j) = jacs[3].as_mut() {
            let col = red * (ric_t * rj_t * ri * ric * pts_i_td) * (-1.0 / (inv_dep_i * inv_dep_i));
            j[(0, 0)] = col.x;
            j[(1, 0)] = col.y;
        }
        if let Some(j) = jacs[4].as_mut() {
            let col = red * (ric_t * rj_t * ri * ric * self.obs.velocity_i) / inv_dep_i * -1.0
                + self.obs.sqrt_info * self.obs.velocity_j.xy();
            j[(0, 0)] = col.x;
            j[(1, 0)] = col.y;
        }
        true
    }
}

/// Landmark anchored in the left camera of frame `i`, observed by the
/// right camera of frame `j`. Blocks: `pose_i`, `pose_j`, `ex_pose_0`,
/// `ex_pose_1`, `inv_depth`, `td`.
pub struct ProjectionTwoFrameTwoCam {
    obs: Observation,
}

impl ProjectionTwoFrameTwoCam {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pts_i: Vector3<f64>,
        pts_j: Vector3<f64>,
        velocity_i: Vector2<f64>,
        velocity_j: Vector2<f64>,
        td_i: f64,
        td_j: f64,
        focal_length: f64,
    ) -> Self {
        Self {
            obs: Observation::new(pts_i, pts_j, velocity_i, velocity_j, td_i, td_j, focal_length),
        }
    }
}

impl Factor for ProjectionTwoFrameTwoCam {
    fn num_residuals(&self) -> usize {
        2
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7, 7, 7, 7, 1, 1]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        let (p_i, q_i) = unpack_pose(params[0]);
        let (p_j, q_j) = unpack_pose(params[1]);
        let (tic0, qic0) = unpack_pose(params[2]);
        let (tic1, qic1) = unpack_pose(params[3]);
        let inv_dep_i = params[4][0];
        let td = params[5][0];

        let (pts_i_td, pts_j_td) = self.obs.shifted(td);
        let pts_camera_i = pts_i_td / inv_dep_i;
        let pts_imu_i = qic0 * pts_camera_i + tic0;
        let pts_w = q_i * pts_imu_i + p_i;
        let pts_imu_j = q_j.inverse() * (pts_w - p_j);
        let pts_camera_j = qic1.inverse() * (pts_imu_j - tic1);

        let r = self.obs.sqrt_info
            * (pts_camera_j.xy() / pts_camera_j.z - pts_j_td.xy());
        write_residual(residuals, &r);

        let Some(jacs) = jacobians else { return true };

        let red = reduce(&self.obs.sqrt_info, &pts_camera_j);
        let ri = q_i.to_rotation_matrix().into_inner();
        let rj = q_j.to_rotation_matrix().into_inner();
        let ric0 = qic0.to_rotation_matrix().into_inner();
        let ric1_t = qic1.to_rotation_matrix().into_inner().transpose();
        let rj_t = rj.transpose();

        if let Some(j) = jacs[0].as_mut() {
            j.fill(0.0);
            set3(j, 0, &(red * (ric1_t * rj_t)));
            set3(j, 3, &(red * (ric1_t * rj_t * ri * -skew(&pts_imu_i))));
        }
        if let Some(j) = jacs[1].as_mut() {
            j.fill(0.0);
            set3(j, 0, &(red * (-ric1_t * rj_t)));
            set3(j, 3, &(red * (ric1_t * skew(&pts_imu_j))));
        }
        if let Some(j) = jacs[2].as_mut() {
            // anchor extrinsic
            j.fill(0.0);
            set3(j, 0, &(red * (ric1_t * rj_t * ri)));
            set3(j, 3, &(red * (ric1_t * rj_t * ri * ric0 * -skew(&pts_camera_i))));
        }
        if let Some(j) = jacs[3].as_mut() {
            // target extrinsic
            j.fill(0.0);
            set3(j, 0, &(red * -ric1_t));
            set3(j, 3, &(red * skew(&pts_camera_j)));
        }
        if let Some(j) = jacs[4].as_mut() {
            let col =
                red * (ric1_t * rj_t * ri * ric0 * pts_i_td) * (-1.0 / (inv_dep_i * inv_dep_i));
            j[(0, 0)] = col.x;
            j[(1, 0)] = col.y;
        }
        if let Some(j) = jacs[5].as_mut() {
            let col = red * (ric1_t * rj_t * ri * ric0 * self.obs.velocity_i) / inv_dep_i * -1.0
                + self.obs.sqrt_info * self.obs.velocity_j.xy();
            j[(0, 0)] = col.x;
            j[(1, 0)] = col.y;
        }
        true
    }
}

/// Stereo observation within a single temporal frame; the body pose drops
/// out. Blocks: `ex_pose_0`, `ex_pose_1`, `inv_depth`, `td`.
pub struct ProjectionOneFrameTwoCam {
    obs: Observation,
}

impl ProjectionOneFrameTwoCam {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pts_i: Vector3<f64>,
        pts_j: Vector3<f64>,
        velocity_i: Vector2<f64>,
        velocity_j: Vector2<f64>,
        td_i: f64,
        td_j: f64,
        focal_length: f64,
    ) -> Self {
        Self {
            obs: Observation::new(pts_i, pts_j, velocity_i, velocity_j, td_i, td_j, focal_length),
        }
    }
}

impl Factor for ProjectionOneFrameTwoCam {
    fn num_residuals(&self) -> usize {
        2
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7, 7, 1, 1]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        let (tic0, qic0) = unpack_pose(params[0]);
        let (tic1, qic1) = unpack_pose(params[1]);
        let inv_dep_i = params[2][0];
        let td = params[3][0];

        let (pts_i_td, pts_j_td) = self.obs.shifted(td);
        let pts_camera_i = pts_i_td / inv_dep_i;
        let pts_imu = qic0 * pts_camera_i + tic0;
        let pts_camera_j = qic1.inverse() * (pts_imu - tic1);

        let r = self.obs.sqrt_info
            * (pts_camera_j.xy() / pts_camera_j.z - pts_j_td.xy());
        write_residual(residuals, &r);

        let Some(jacs) = jacobians else { return true };

        let red = reduce(&self.obs.sqrt_info, &pts_camera_j);
        let ric0 = qic0.to_rotation_matrix().into_inner();
        let ric1_t = qic1.to_rotation_matrix().into_inner().transpose();

        if let Some(j) = jacs[0].as_mut() {
            j.fill(0.0);
            set3(j, 0, &(red * ric1_t));
            set3(j, 3, &(red * (ric1_t * ric0 * -skew(&pts_camera_i))));
        }
        if let Some(j) = jacs[1].as_mut() {
            j.fill(0.0);
            set3(j, 0, &(red * -ric1_t));
            set3(j, 3, &(red * skew(&pts_camera_j)));
        }
        if let Some(j) = jacs[2].as_mut() {
            let col = red * (ric1_t * ric0 * pts_i_td) * (-1.0 / (inv_dep_i * inv_dep_i));
            j[(0, 0)] = col.x;
            j[(1, 0)] = col.y;
        }
        if let Some(j) = jacs[3].as_mut() {
            let col = red * (ric1_t * ric0 * self.obs.velocity_i) / inv_dep_i * -1.0
                + self.obs.sqrt_info * self.obs.velocity_j.xy();
            j[(0, 0)] = col.x;
            j[(1, 0)] = col.y;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose7(p: Vector3<f64>, q: UnitQuaternion<f64>) -> [f64; 7] {
        [p.x, p.y, p.z, q.i, q.j, q.k, q.w]
    }

    #[test]
    fn perfect_reprojection_has_zero_residual() {
        // landmark at depth 4 on the anchor ray, frame j shifted in x
        let depth = 4.0;
        let pts_i = Vector3::new(0.2, -0.1, 1.0);
        let p_world = pts_i * depth;
        let p_j = Vector3::new(0.5, 0.0, 0.0);
        let local_j = p_world - p_j;
        let pts_j = Vector3::new(local_j.x / local_j.z, local_j.y / local_j.z, 1.0);

        let factor = ProjectionTwoFrameOneCam::new(
            pts_i,
            pts_j,
            Vector2::zeros(),
            Vector2::zeros(),
            0.0,
            0.0,
            460.0,
        );

        let pose_i = pose7(Vector3::zeros(), UnitQuaternion::identity());
        let pose_j = pose7(p_j, UnitQuaternion::identity());
        let ex = pose7(Vector3::zeros(), UnitQuaternion::identity());
        let inv_depth = [1.0 / depth];
        let td = [0.0];

        let mut r = [0.0; 2];
        assert!(factor.evaluate(&[&pose_i, &pose_j, &ex, &inv_depth, &td], &mut r, None));
        assert!(r[0].abs() < 1e-9 && r[1].abs() < 1e-9, "residual {:?}", r);
    }

    #[test]
    fn depth_jacobian_matches_finite_differences() {
        let pts_i = Vector3::new(0.1, 0.05, 1.0);
        let p_world = pts_i * 6.0;
        let p_j = Vector3::new(0.3, -0.1, 0.0);
        let local_j = p_world - p_j;
        let pts_j = Vector3::new(local_j.x / local_j.z, local_j.y / local_j.z, 1.0);

        let factor = ProjectionTwoFrameOneCam::new(
            pts_i,
            pts_j,
            Vector2::zeros(),
            Vector2::zeros(),
            0.0,
            0.0,
            460.0,
        );

        let pose_i = pose7(Vector3::zeros(), UnitQuaternion::identity());
        let pose_j = pose7(p_j, UnitQuaternion::identity());
        let ex = pose7(Vector3::zeros(), UnitQuaternion::identity());
        let inv_depth = [1.0 / 5.5]; // deliberately off
        let td = [0.0];

        let mut r0 = [0.0; 2];
        let mut jacs: Vec<Option<DMatrix<f64>>> = vec![
            Some(DMatrix::zeros(2, 7)),
            Some(DMatrix::zeros(2, 7)),
            Some(DMatrix::zeros(2, 7)),
            Some(DMatrix::zeros(2, 1)),
            Some(DMatrix::zeros(2, 1)),
        ];
        factor.evaluate(&[&pose_i, &pose_j, &ex, &inv_depth, &td], &mut r0, Some(&mut jacs));

        let eps = 1e-8;
        let inv_depth_pert = [inv_depth[0] + eps];
        let mut r1 = [0.0; 2];
        factor.evaluate(&[&pose_i, &pose_j, &ex, &inv_depth_pert, &td], &mut r1, None);

        let j = jacs[3].as_ref().unwrap();
        for row in 0..2 {
            let fd = (r1[row] - r0[row]) / eps;
            assert!(
                (fd - j[(row, 0)]).abs() < 1e-3 * (1.0 + fd.abs()),
                "row {row}: fd {fd} vs {}",
                j[(row, 0)]
            );
        }
    }

    #[test]
    fn stereo_same_frame_residual_vanishes_at_truth() {
        let depth = 3.0;
        let pts_i = Vector3::new(-0.15, 0.08, 1.0);
        let p_cam0 = pts_i * depth;
        let tic1 = Vector3::new(0.1, 0.0, 0.0); // stereo baseline
        let p_cam1 = p_cam0 - tic1;
        let pts_j = Vector3::new(p_cam1.x / p_cam1.z, p_cam1.y / p_cam1.z, 1.0);

        let factor = ProjectionOneFrameTwoCam::new(
            pts_i,
            pts_j,
            Vector2::zeros(),
            Vector2::zeros(),
            0.0,
            0.0,
            460.0,
        );

        let ex0 = pose7(Vector3::zeros(), UnitQuaternion::identity());
        let ex1 = pose7(tic1, UnitQuaternion::identity());
        let inv_depth = [1.0 / depth];
        let td = [0.0];
        let mut r = [0.0; 2];
        factor.evaluate(&[&ex0, &ex1, &inv_depth, &td], &mut r, None);
        assert!(r[0].abs() < 1e-9 && r[1].abs() < 1e-9);
    }
}
