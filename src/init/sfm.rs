//! Pure-visual structure-from-motion over the window frames.
//!
//! Starting from the relative pose between a chosen reference frame `l`
//! and the newest frame, triangulates shared structure, chains PnP through
//! the remaining frames, and refines everything with a bundle adjustment
//! in the solver's pose-manifold problem.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, Matrix3, Quaternion, SMatrix, UnitQuaternion, Vector2, Vector3};
use tracing::debug;

use crate::geometry::{solve_pnp, triangulate_point};
use crate::solver::{BlockKey, Factor, Loss, Manifold, Problem, SolverOptions};

/// A feature track prepared for SfM: observations are
/// `(window frame index, normalized point)`.
pub struct SfmFeature {
    pub id: u64,
    pub observations: Vec<(usize, Vector2<f64>)>,
    pub state: bool,
    pub position: Vector3<f64>,
}

impl SfmFeature {
    pub fn new(id: u64, observations: Vec<(usize, Vector2<f64>)>) -> Self {
        Self {
            id,
            observations,
            state: false,
            position: Vector3::zeros(),
        }
    }

    fn observation_in(&self, frame: usize) -> Option<Vector2<f64>> {
        self.observations
            .iter()
            .find(|(f, _)| *f == frame)
            .map(|(_, p)| *p)
    }
}

/// World→camera pose used during construction.
#[derive(Clone, Copy)]
struct CamPose {
    r: Matrix3<f64>,
    t: Vector3<f64>,
}

impl CamPose {
    fn projection(&self) -> nalgebra::Matrix3x4<f64> {
        let mut m = nalgebra::Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.r);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.t);
        m
    }
}

/// Reprojection residual of the SfM bundle adjustment. Blocks:
/// world→camera pose `[t, q]` (7) and the world point (3).
struct SfmReprojection {
    obs: Vector2<f64>,
}

impl Factor for SfmReprojection {
    fn num_residuals(&self) -> usize {
        2
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7, 3]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        let t = Vector3::new(params[0][0], params[0][1], params[0][2]);
        let q = UnitQuaternion::from_quaternion(Quaternion::new(
            params[0][6], params[0][3], params[0][4], params[0][5],
        ));
        let p_w = Vector3::new(params[1][0], params[1][1], params[1][2]);

        let p_c = q * p_w + t;
        if p_c.z <= 1e-6 {
            residuals[0] = 0.0;
            residuals[1] = 0.0;
            if let Some(jacs) = jacobians {
                for j in jacs.iter_mut().flatten() {
                    j.fill(0.0);
                }
            }
            return true;
        }
        let inv_z = 1.0 / p_c.z;
        residuals[0] = p_c.x * inv_z - self.obs.x;
        residuals[1] = p_c.y * inv_z - self.obs.y;

        let Some(jacs) = jacobians else { return true };
        let d_proj = SMatrix::<f64, 2, 3>::new(
            inv_z, 0.0, -p_c.x * inv_z * inv_z,
            0.0, inv_z, -p_c.y * inv_z * inv_z,
        );
        let r = q.to_rotation_matrix().into_inner();
        if let Some(j) = jacs[0].as_mut() {
            j.fill(0.0);
            let d_t = d_proj;
            let d_theta = d_proj * (-r * crate::geometry::skew(&p_w));
            j.view_mut((0, 0), (2, 3)).copy_from(&d_t);
            j.view_mut((0, 3), (2, 3)).copy_from(&d_theta);
        }
        if let Some(j) = jacs[1].as_mut() {
            let d_p = d_proj * r;
            j.view_mut((0, 0), (2, 3)).copy_from(&d_p);
        }
        true
    }
}

/// Anchors the newest frame's translation to fix the monocular scale
/// gauge during the bundle adjustment.
struct TranslationPrior {
    target: Vector3<f64>,
    weight: f64,
}

impl Factor for TranslationPrior {
    fn num_residuals(&self) -> usize {
        3
    }
    fn param_block_sizes(&self) -> Vec<usize> {
        vec![7]
    }
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [Option<DMatrix<f64>>]>,
    ) -> bool {
        for i in 0..3 {
            residuals[i] = self.weight * (params[0][i] - self.target[i]);
        }
        if let Some(jacs) = jacobians {
            if let Some(j) = jacs[0].as_mut() {
                j.fill(0.0);
                for i in 0..3 {
                    j[(i, i)] = self.weight;
                }
            }
        }
        true
    }
}

/// Result of a successful SfM pass: camera-in-reference poses for every
/// window frame and the triangulated landmark positions.
pub struct SfmResult {
    pub rotations: Vec<UnitQuaternion<f64>>,
    pub translations: Vec<Vector3<f64>>,
    pub tracked_points: BTreeMap<u64, Vector3<f64>>,
}

pub struct GlobalSfm;

impl GlobalSfm {
    /// Reconstructs all `frame_num` window frames given the relative pose
    /// of the newest frame expressed in frame `l`.
    pub fn construct(
        frame_num: usize,
        l: usize,
        relative_r: &Matrix3<f64>,
        relative_t: &Vector3<f64>,
        features: &mut [SfmFeature],
    ) -> Option<SfmResult> {
        let newest = frame_num - 1;

        // world→camera poses, with frame l as the reference frame
        let mut poses = vec![
            CamPose {
                r: Matrix3::identity(),
                t: Vector3::zeros(),
            };
            frame_num
        ];
        poses[l] = CamPose {
            r: Matrix3::identity(),
            t: Vector3::zeros(),
        };
        poses[newest] = CamPose {
            r: relative_r.transpose(),
            t: -relative_r.transpose() * relative_t,
        };

        // forward chain: l → newest
        for i in l..newest {
            if i > l {
                let mut r = poses[i - 1].r;
                let mut t = poses[i - 1].t;
                if !Self::solve_frame_by_pnp(&mut r, &mut t, i, features) {
                    debug!("SfM PnP failed at frame {i}");
                    return None;
                }
                poses[i] = CamPose { r, t };
            }
            Self::triangulate_two_frames(i, &poses[i], newest, &poses[newest], features);
        }
        for i in (l + 1)..newest {
            let pose_l = poses[l];
            Self::triangulate_two_frames(l, &pose_l, i, &poses[i], features);
        }
        // backward chain: l → 0
        for i in (0..l).rev() {
            let mut r = poses[i + 1].r;
            let mut t = poses[i + 1].t;
            if !Self::solve_frame_by_pnp(&mut r, &mut t, i, features) {
                debug!("SfM PnP failed at frame {i}");
                return None;
            }
            poses[i] = CamPose { r, t };
            let pose_l = poses[l];
            Self::triangulate_two_frames(i, &poses[i], l, &pose_l, features);
        }
        // remaining structure from any two observing frames
        for f in features.iter_mut() {
            if f.state || f.observations.len() < 2 {
                continue;
            }
            let (f0, p0) = f.observations[0];
            let (f1, p1) = *f.observations.last().expect("nonempty");
            f.position = triangulate_point(
                &poses[f0].projection(),
                &poses[f1].projection(),
                &p0,
                &p1,
            );
            f.state = true;
        }

        Self::bundle_adjust(frame_num, l, newest, &mut poses, features);

        let mut rotations = Vec::with_capacity(frame_num);
        let mut translations = Vec::with_capacity(frame_num);
        for pose in &poses {
            // invert back to camera-in-reference
            let r_wc = pose.r.transpose();
            rotations.push(UnitQuaternion::from_matrix(&r_wc));
            translations.push(-r_wc * pose.t);
        }
        let mut tracked_points = BTreeMap::new();
        for f in features.iter() {
            if f.state {
                tracked_points.insert(f.id, f.position);
            }
        }
        Some(SfmResult {
            rotations,
            translations,
            tracked_points,
        })
    }

    fn solve_frame_by_pnp(
        r: &mut Matrix3<f64>,
        t: &mut Vector3<f64>,
        frame: usize,
        features: &[SfmFeature],
    ) -> bool {
        let mut pts3d = Vec::new();
        let mut pts2d = Vec::new();
        for f in features {
            if !f.state {
                continue;
            }
            if let Some(obs) = f.observation_in(frame) {
                pts3d.push(f.position);
                pts2d.push(obs);
            }
        }
        if pts3d.len() < 15 {
            debug!("unstable SfM tracking, only {} points", pts3d.len());
            return false;
        }
        solve_pnp(&pts3d, &pts2d, r, t)
    }

    fn triangulate_two_frames(
        frame0: usize,
        pose0: &CamPose,
        frame1: usize,
        pose1: &CamPose,
        features: &mut [SfmFeature],
    ) {
        debug_assert_ne!(frame0, frame1);
        for f in features.iter_mut() {
            if f.state {
                continue;
            }
            let (Some(p0), Some(p1)) = (f.observation_in(frame0), f.observation_in(frame1))
            else {
                continue;
            };
            f.position = triangulate_point(&pose0.projection(), &pose1.projection(), &p0, &p1);
            f.state = true;
        }
    }

    /// Pose + point bundle adjustment in the pure-visual domain.
    fn bundle_adjust(
        frame_num: usize,
        l: usize,
        newest: usize,
        poses: &mut [CamPose],
        features: &mut [SfmFeature],
    ) {
        let mut problem = Problem::new();
        let pose_key = |i: usize| BlockKey(i as u64);
        let point_key = |j: usize| BlockKey(10_000 + j as u64);

        for (i, pose) in poses.iter().enumerate() {
            let q = UnitQuaternion::from_matrix(&pose.r);
            let vals = [
                pose.t.x, pose.t.y, pose.t.z, q.i, q.j, q.k, q.w,
            ];
            problem.add_parameter_block(pose_key(i), &vals, Manifold::Pose);
            if i == l {
                problem.set_parameter_block_constant(pose_key(i));
            }
        }
        // gauge: keep the newest frame's translation near its epipolar value
        problem.add_residual_block(
            Box::new(TranslationPrior {
                target: poses[newest].t,
                weight: 1e3,
            }),
            Loss::Trivial,
            vec![pose_key(newest)],
        );

        for (j, f) in features.iter().enumerate() {
            if !f.state {
                continue;
            }
            problem.add_parameter_block(
                point_key(j),
                &[f.position.x, f.position.y, f.position.z],
                Manifold::Euclidean,
            );
            for (frame, obs) in &f.observations {
                problem.add_residual_block(
                    Box::new(SfmReprojection { obs: *obs }),
                    Loss::Huber(2.0 / 460.0),
                    vec![pose_key(*frame), point_key(j)],
                );
            }
        }

        let options = SolverOptions {
            max_iterations: 20,
            max_time: std::time::Duration::from_millis(200),
            ..Default::default()
        };
        let summary = problem.solve(&options);
        debug!(
            "SfM BA: {} iterations, cost {:.3e} → {:.3e}",
            summary.iterations, summary.initial_cost, summary.final_cost
        );

        for (i, pose) in poses.iter_mut().enumerate() {
            let v = problem.parameter(pose_key(i)).expect("pose block");
            pose.t = Vector3::new(v[0], v[1], v[2]);
            pose.r = UnitQuaternion::from_quaternion(Quaternion::new(v[6], v[3], v[4], v[5]))
                .to_rotation_matrix()
                .into_inner();
        }
        for (j, f) in features.iter_mut().enumerate() {
            if !f.state {
                continue;
            }
            if let Some(v) = problem.parameter(point_key(j)) {
                f.position = Vector3::new(v[0], v[1], v[2]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ypr2r;
    use approx::assert_relative_eq;

    /// Synthesizes a five-frame translating camera over a point grid and
    /// checks the reconstruction against ground truth.
    #[test]
    fn reconstructs_translating_sequence() {
        let frame_num = 5;
        let mut gt_poses = Vec::new();
        for i in 0..frame_num {
            let r = ypr2r(&Vector3::new(1.5 * i as f64, 0.0, 0.0));
            let t = Vector3::new(0.2 * i as f64, 0.01 * i as f64, 0.0);
            gt_poses.push((r, t)); // camera-in-world
        }

        let mut points = Vec::new();
        for gx in 0..8 {
            for gy in 0..6 {
                points.push(Vector3::new(
                    -1.2 + 0.35 * gx as f64,
                    -1.0 + 0.4 * gy as f64,
                    4.0 + 0.3 * ((gx * gy) % 5) as f64,
                ));
            }
        }

        let mut features = Vec::new();
        for (id, p) in points.iter().enumerate() {
            let mut obs = Vec::new();
            for (i, (r, t)) in gt_poses.iter().enumerate() {
                let local = r.transpose() * (p - t);
                obs.push((i, Vector2::new(local.x / local.z, local.y / local.z)));
            }
            features.push(SfmFeature::new(id as u64, obs));
        }

        // relative pose of the newest frame in frame l = 0
        let l = 0;
        let (r_l, t_l) = gt_poses[l];
        let (r_n, t_n) = gt_poses[frame_num - 1];
        let relative_r = r_l.transpose() * r_n;
        let relative_t = r_l.transpose() * (t_n - t_l);

        let result = GlobalSfm::construct(frame_num, l, &relative_r, &relative_t, &mut features)
            .expect("SfM should succeed");

        for i in 0..frame_num {
            let expected_t = gt_poses[l].0.transpose() * (gt_poses[i].1 - gt_poses[l].1);
            assert_relative_eq!(result.translations[i], expected_t, epsilon = 1e-3);
        }
        assert!(result.tracked_points.len() >= 40);
    }
}
