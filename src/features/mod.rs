//! Per-landmark observation tracks across the sliding window, the
//! parallax-based keyframe oracle, triangulation, and eviction handling.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Vector2, Vector3};
use tracing::debug;

/// Depth assigned when triangulation fails or produces a point behind the
/// camera.
pub const INIT_DEPTH: f64 = 5.0;
/// Depth floor below which a triangulation is considered degenerate.
const MIN_DEPTH: f64 = 0.1;

/// One camera's observation of a feature in one frame, on the normalized
/// image plane.
#[derive(Debug, Clone)]
pub struct FeatureObservation {
    pub camera_id: usize,
    /// Normalized coordinates `(x, y, 1)`.
    pub point: Vector3<f64>,
    /// Normalized-plane velocity used for time-offset compensation.
    pub velocity: Vector2<f64>,
}

/// All observations of all features in a single frame, keyed by feature id.
pub type FeatureFrame = BTreeMap<u64, Vec<FeatureObservation>>;

/// A feature's observation in one window frame (left camera, and the right
/// camera when the stereo match survived).
#[derive(Debug, Clone)]
pub struct FeaturePerFrame {
    pub point: Vector3<f64>,
    pub velocity: Vector2<f64>,
    pub cur_td: f64,
    pub point_right: Option<Vector3<f64>>,
    pub velocity_right: Option<Vector2<f64>>,
}

impl FeaturePerFrame {
    pub fn is_stereo(&self) -> bool {
        self.point_right.is_some()
    }
}

/// A landmark: contiguous observations starting at `start_frame`, with the
/// inverse depth owned by that frame.
#[derive(Debug, Clone)]
pub struct FeaturePerId {
    pub feature_id: u64,
    pub start_frame: usize,
    pub feature_per_frame: Vec<FeaturePerFrame>,
    pub used_num: usize,
    pub estimated_depth: f64,
    /// 0 = unsolved, 1 = solved, 2 = solved to an invalid depth.
    pub solve_flag: u8,
}

impl FeaturePerId {
    fn new(feature_id: u64, start_frame: usize) -> Self {
        Self {
            feature_id,
            start_frame,
            feature_per_frame: Vec::new(),
            used_num: 0,
            estimated_depth: -1.0,
            solve_flag: 0,
        }
    }

    pub fn end_frame(&self) -> usize {
        self.start_frame + self.feature_per_frame.len() - 1
    }
}

/// Marginalization decision produced by the keyframe oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginalizationFlag {
    /// Previous frame is a keyframe: evict the oldest frame.
    MarginOld,
    /// Previous frame is redundant: evict the second-newest frame.
    MarginSecondNew,
}

/// Feature store and keyframe oracle for the sliding window.
pub struct FeatureManager {
    pub feature: Vec<FeaturePerId>,
    pub last_track_num: usize,
    pub last_average_parallax: f64,
    pub new_feature_num: usize,
    pub long_track_num: usize,
    /// Parallax threshold on the normalized plane (pixels / focal).
    min_parallax: f64,
    window_size: usize,
}

impl FeatureManager {
    pub fn new(min_parallax: f64, window_size: usize) -> Self {
        Self {
            feature: Vec::new(),
            last_track_num: 0,
            last_average_parallax: 0.0,
            new_feature_num: 0,
            long_track_num: 0,
            min_parallax,
            window_size,
        }
    }

    pub fn clear_state(&mut self) {
        self.feature.clear();
        self.last_track_num = 0;
        self.last_average_parallax = 0.0;
        self.new_feature_num = 0;
        self.long_track_num = 0;
    }

    /// Number of landmarks eligible for the optimization problem.
    pub fn feature_count(&mut self) -> usize {
        let mut cnt = 0;
        for it in &mut self.feature {
            it.used_num = it.feature_per_frame.len();
            if it.used_num >= 4 {
                cnt += 1;
            }
        }
        cnt
    }

    /// Appends one frame's observations and decides whether the *previous*
    /// frame is a keyframe. Returns `MarginOld` for a keyframe decision.
    pub fn add_feature_check_parallax(
        &mut self,
        frame_count: usize,
        image: &FeatureFrame,
        td: f64,
    ) -> MarginalizationFlag {
        let mut parallax_sum = 0.0;
        let mut parallax_num = 0usize;
        self.last_track_num = 0;
        self.new_feature_num = 0;
        self.long_track_num = 0;

        for (&feature_id, obs) in image {
            let left = obs.iter().find(|o| o.camera_id == 0);
            let Some(left) = left else { continue };
            let right = obs.iter().find(|o| o.camera_id == 1);

            let per_frame = FeaturePerFrame {
                point: left.point,
                velocity: left.velocity,
                cur_td: td,
                point_right: right.map(|r| r.point),
                velocity_right: right.map(|r| r.velocity),
            };

            match self.feature.iter_mut().find(|f| f.feature_id == feature_id) {
                Some(track) => {
                    track.feature_per_frame.push(per_frame);
                    self.last_track_num += 1;
                    if track.feature_per_frame.len() >= 4 {
                        self.long_track_num += 1;
                    }
                }
                None => {
                    let mut track = FeaturePerId::new(feature_id, frame_count);
                    track.feature_per_frame.push(per_frame);
                    self.feature.push(track);
                    self.new_feature_num += 1;
                }
            }
        }

        if frame_count < 2
            || self.last_track_num < 20
            || self.long_track_num < 40
            || self.new_feature_num > self.last_track_num / 2
        {
            return MarginalizationFlag::MarginOld;
        }

        for it in &self.feature {
            if it.start_frame + 2 <= frame_count && it.end_frame() + 1 >= frame_count {
                parallax_sum += Self::compensated_parallax(it, frame_count);
                parallax_num += 1;
            }
        }

        if parallax_num == 0 {
            MarginalizationFlag::MarginOld
        } else {
            self.last_average_parallax = parallax_sum / parallax_num as f64;
            debug!(
                "parallax {:.4} over {} tracks",
                self.last_average_parallax, parallax_num
            );
            if self.last_average_parallax >= self.min_parallax {
                MarginalizationFlag::MarginOld
            } else {
                MarginalizationFlag::MarginSecondNew
            }
        }
    }

    /// Normalized-plane displacement of a track between the second- and
    /// third-newest frames.
    fn compensated_parallax(it: &FeaturePerId, frame_count: usize) -> f64 {
        let frame_i = &it.feature_per_frame[frame_count - 2 - it.start_frame];
        let frame_j = &it.feature_per_frame[frame_count - 1 - it.start_frame];
        let du = frame_i.point.x - frame_j.point.x;
        let dv = frame_i.point.y - frame_j.point.y;
        (du * du + dv * dv).sqrt().max(0.0)
    }

    /// Matched normalized-plane pairs visible in both frames `l` and `r`.
    pub fn get_corresponding(&self, l: usize, r: usize) -> Vec<(Vector3<f64>, Vector3<f64>)> {
        let mut corres = Vec::new();
        for it in &self.feature {
            if it.start_frame <= l && it.end_frame() >= r {
                let a = it.feature_per_frame[l - it.start_frame].point;
                let b = it.feature_per_frame[r - it.start_frame].point;
                corres.push((a, b));
            }
        }
        corres
    }

    /// Inverse depths of the solvable landmarks, in store order.
    pub fn get_depth_vector(&mut self) -> Vec<f64> {
        let mut dep = Vec::new();
        for it in &mut self.feature {
            it.used_num = it.feature_per_frame.len();
            if it.used_num >= 4 {
                dep.push(1.0 / it.estimated_depth);
            }
        }
        dep
    }

    /// Writes solved inverse depths back and flags non-positive results.
    pub fn set_depth(&mut self, dep: &[f64]) {
        let mut idx = 0;
        for it in &mut self.feature {
            it.used_num = it.feature_per_frame.len();
            if it.used_num < 4 {
                continue;
            }
            it.estimated_depth = 1.0 / dep[idx];
            idx += 1;
            it.solve_flag = if it.estimated_depth < 0.0 { 2 } else { 1 };
        }
    }

    pub fn clear_depth(&mut self) {
        for it in &mut self.feature {
            it.estimated_depth = -1.0;
        }
    }

    /// Removes landmarks whose last solve produced an invalid depth.
    pub fn remove_failures(&mut self) {
        self.feature.retain(|f| f.solve_flag != 2);
    }

    /// Removes the flagged landmark ids.
    pub fn remove_outlier(&mut self, ids: &std::collections::BTreeSet<u64>) {
        self.feature.retain(|f| !ids.contains(&f.feature_id));
    }

    /// Bootstraps the newest frame's pose from 3D↔2D matches of
    /// already-triangulated landmarks. Used when the IMU is absent.
    pub fn init_frame_pose_by_pnp(
        &mut self,
        frame_count: usize,
        ps: &mut [Vector3<f64>],
        rs: &mut [Matrix3<f64>],
        tic: &[Vector3<f64>],
        ric: &[Matrix3<f64>],
    ) {
        if frame_count == 0 {
            return;
        }
        let mut pts3d = Vec::new();
        let mut pts2d = Vec::new();
        for it in &self.feature {
            if it.estimated_depth <= 0.0 {
                continue;
            }
            if it.start_frame <= frame_count && it.end_frame() >= frame_count {
                let obs = &it.feature_per_frame[frame_count - it.start_frame];
                let anchor = &it.feature_per_frame[0];
                let pts_cam = anchor.point * it.estimated_depth;
                let pts_world =
                    rs[it.start_frame] * (ric[0] * pts_cam + tic[0]) + ps[it.start_frame];
                pts3d.push(pts_world);
                pts2d.push(obs.point.xy());
            }
        }

        // seed from the propagated pose of the newest frame
        let mut r_cam = rs[frame_count] * ric[0];
        let mut t_cam = rs[frame_count] * tic[0] + ps[frame_count];
        if crate::geometry::solve_pose_by_pnp(&pts3d, &pts2d, &mut r_cam, &mut t_cam) {
            rs[frame_count] = r_cam * ric[0].transpose();
            ps[frame_count] = -(rs[frame_count] * tic[0]) + t_cam;
        } else {
            debug!("frame pose PnP failed, keeping propagated pose");
        }
    }

    /// Triangulates every landmark lacking a valid depth from all of its
    /// observing views (stereo pairs contribute both cameras).
    pub fn triangulate(
        &mut self,
        _frame_count: usize,
        ps: &[Vector3<f64>],
        rs: &[Matrix3<f64>],
        tic: &[Vector3<f64>],
        ric: &[Matrix3<f64>],
    ) {
        for it in &mut self.feature {
            if it.estimated_depth > 0.0 {
                continue;
            }

            let mut poses = Vec::new();
            let mut points = Vec::new();
            for (k, obs) in it.feature_per_frame.iter().enumerate() {
                let frame = it.start_frame + k;
                let t0 = ps[frame] + rs[frame] * tic[0];
                let r0 = rs[frame] * ric[0];
                poses.push(crate::geometry::world_to_camera(&r0, &t0));
                points.push(obs.point.xy());
                if let Some(pr) = obs.point_right {
                    let t1 = ps[frame] + rs[frame] * tic[1];
                    let r1 = rs[frame] * ric[1];
                    poses.push(crate::geometry::world_to_camera(&r1, &t1));
                    points.push(pr.xy());
                }
            }
            if poses.len() < 2 {
                continue;
            }

            let Some(pt_world) = crate::geometry::triangulate_point_multiview(&poses, &points)
            else {
                continue;
            };
            // depth in the anchor camera
            let anchor = it.start_frame;
            let cam_r = rs[anchor] * ric[0];
            let cam_t = ps[anchor] + rs[anchor] * tic[0];
            let local = cam_r.transpose() * (pt_world - cam_t);
            it.estimated_depth = if local.z > MIN_DEPTH { local.z } else { INIT_DEPTH };
        }
    }

    /// Eviction of the oldest frame with depth transfer to the landmark's
    /// next observing frame (keyframe case).
    ///
    /// `(marg_r, marg_p)` is the evicted camera pose, `(new_r, new_p)` the
    /// camera pose of the new oldest frame.
    pub fn remove_back_shift_depth(
        &mut self,
        marg_r: Matrix3<f64>,
        marg_p: Vector3<f64>,
        new_r: Matrix3<f64>,
        new_p: Vector3<f64>,
    ) {
        self.feature.retain_mut(|it| {
            if it.start_frame != 0 {
                it.start_frame -= 1;
                return true;
            }
            let uv_i = it.feature_per_frame[0].point;
            it.feature_per_frame.remove(0);
            if it.feature_per_frame.len() < 2 {
                return false;
            }
            let pts_i = uv_i * it.estimated_depth;
            let w_pts = marg_r * pts_i + marg_p;
            let pts_j = new_r.transpose() * (w_pts - new_p);
            it.estimated_depth = if pts_j.z > 0.0 { pts_j.z } else { INIT_DEPTH };
            true
        });
    }

    /// Eviction of the oldest frame without depth transfer (used before
    /// the estimator leaves its initialization phase).
    pub fn remove_back(&mut self) {
        self.feature.retain_mut(|it| {
            if it.start_frame != 0 {
                it.start_frame -= 1;
                true
            } else {
                if !it.feature_per_frame.is_empty() {
                    it.feature_per_frame.remove(0);
                }
                !it.feature_per_frame.is_empty()
            }
        });
    }

    /// Splices out the second-newest frame's observations (non-keyframe
    /// eviction). `frame_count` is the newest slot index.
    pub fn remove_front(&mut self, frame_count: usize) {
        let window_size = self.window_size;
        self.feature.retain_mut(|it| {
            if it.start_frame == frame_count {
                it.start_frame -= 1;
                return true;
            }
            if it.end_frame() < frame_count - 1 {
                return true;
            }
            let j = window_size - 1 - it.start_frame;
            it.feature_per_frame.remove(j);
            !it.feature_per_frame.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(x: f64, y: f64) -> Vec<FeatureObservation> {
        vec![FeatureObservation {
            camera_id: 0,
            point: Vector3::new(x, y, 1.0),
            velocity: Vector2::zeros(),
        }]
    }

    fn frame_with_shift(n: usize, shift: f64) -> FeatureFrame {
        (0..n as u64).map(|id| (id, obs(0.01 * id as f64 + shift, 0.0))).collect()
    }

    #[test]
    fn large_parallax_declares_keyframe() {
        let mut fm = FeatureManager::new(10.0 / 460.0, 10);
        // 50 features tracked over four frames, 0.08 shift per frame
        // (≈37 px at focal 460, well past the threshold)
        for fc in 0..4 {
            let flag = fm.add_feature_check_parallax(fc, &frame_with_shift(50, 0.08 * fc as f64), 0.0);
            if fc == 3 {
                assert_eq!(flag, MarginalizationFlag::MarginOld);
                assert!(fm.last_average_parallax > 10.0 / 460.0);
            }
        }
    }

    #[test]
    fn tiny_parallax_margins_second_newest() {
        let mut fm = FeatureManager::new(10.0 / 460.0, 10);
        for fc in 0..4 {
            let frame = frame_with_shift(60, 1e-5 * fc as f64);
            let flag = fm.add_feature_check_parallax(fc, &frame, 0.0);
            // tracks reach length ≥ 4 at fc = 3, enabling the parallax test
            if fc == 3 {
                assert_eq!(flag, MarginalizationFlag::MarginSecondNew);
            }
        }
    }

    #[test]
    fn few_tracks_force_keyframe() {
        let mut fm = FeatureManager::new(10.0 / 460.0, 10);
        fm.add_feature_check_parallax(0, &frame_with_shift(10, 0.0), 0.0);
        fm.add_feature_check_parallax(1, &frame_with_shift(10, 0.0), 0.0);
        let flag = fm.add_feature_check_parallax(2, &frame_with_shift(10, 0.0), 0.0);
        assert_eq!(flag, MarginalizationFlag::MarginOld);
    }

    #[test]
    fn depth_transfer_matches_projection() {
        let mut fm = FeatureManager::new(10.0 / 460.0, 10);
        // landmark anchored at frame 0 with depth 5, observed in frames 0..2
        let ray0 = Vector3::new(0.1, -0.05, 1.0);
        let mut track = FeaturePerId::new(7, 0);
        for _ in 0..3 {
            track.feature_per_frame.push(FeaturePerFrame {
                point: ray0,
                velocity: Vector2::zeros(),
                cur_td: 0.0,
                point_right: None,
                velocity_right: None,
            });
        }
        track.estimated_depth = 5.0;
        fm.feature.push(track);

        let r0 = Matrix3::identity();
        let p0 = Vector3::zeros();
        let r1 = crate::geometry::ypr2r(&Vector3::new(5.0, 0.0, 0.0));
        let p1 = Vector3::new(0.4, 0.1, 0.0);

        fm.remove_back_shift_depth(r0, p0, r1, p1);

        let expected = (r1.transpose() * (ray0 * 5.0 - p1)).z;
        assert!((fm.feature[0].estimated_depth - expected).abs() < 1e-9);
        assert_eq!(fm.feature[0].start_frame, 0);
        assert_eq!(fm.feature[0].feature_per_frame.len(), 2);
    }

    #[test]
    fn triangulation_recovers_depth() {
        let mut fm = FeatureManager::new(10.0 / 460.0, 10);
        let p_world = Vector3::new(0.4, -0.2, 6.0);

        let mut ps = vec![Vector3::zeros(); 3];
        let rs = vec![Matrix3::identity(); 3];
        for (i, p) in ps.iter_mut().enumerate() {
            *p = Vector3::new(0.25 * i as f64, 0.0, 0.0);
        }
        let tic = [Vector3::zeros(), Vector3::zeros()];
        let ric = [Matrix3::identity(), Matrix3::identity()];

        let mut track = FeaturePerId::new(1, 0);
        for i in 0..3 {
            let local = rs[i].transpose() * (p_world - ps[i]);
            track.feature_per_frame.push(FeaturePerFrame {
                point: Vector3::new(local.x / local.z, local.y / local.z, 1.0),
                velocity: Vector2::zeros(),
                cur_td: 0.0,
                point_right: None,
                velocity_right: None,
            });
        }
        fm.feature.push(track);

        fm.triangulate(2, &ps, &rs, &tic, &ric);
        assert!((fm.feature[0].estimated_depth - 6.0).abs() < 1e-6);
    }

    #[test]
    fn remove_front_splices_second_newest() {
        let mut fm = FeatureManager::new(10.0 / 460.0, 10);
        let mut track = FeaturePerId::new(3, 8);
        for _ in 0..3 {
            // observed at frames 8, 9, 10
            track.feature_per_frame.push(FeaturePerFrame {
                point: Vector3::z(),
                velocity: Vector2::zeros(),
                cur_td: 0.0,
                point_right: None,
                velocity_right: None,
            });
        }
        fm.feature.push(track);

        fm.remove_front(10);
        // the observation at slot 9 (window_size - 1) is gone
        assert_eq!(fm.feature[0].feature_per_frame.len(), 2);
        assert_eq!(fm.feature[0].start_frame, 8);
    }
}
