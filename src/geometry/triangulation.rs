//! Linear (DLT) triangulation on normalized image coordinates.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Vector2, Vector3, Vector4};

/// Stacks one view's two DLT rows into `a` at row offset `row`.
///
/// `pose` is the world→camera projection `[R | t]` and `point` the
/// normalized observation `(x, y)`.
fn fill_dlt_rows(a: &mut DMatrix<f64>, row: usize, pose: &Matrix3x4<f64>, point: &Vector2<f64>) {
    let r0 = pose.row(0);
    let r1 = pose.row(1);
    let r2 = pose.row(2);
    for c in 0..4 {
        a[(row, c)] = point.x * r2[c] - r0[c];
        a[(row + 1, c)] = point.y * r2[c] - r1[c];
    }
}

/// Triangulates a single point from two views.
///
/// Returns the homogeneous solution dehomogenized to a 3-vector. The caller
/// is responsible for cheirality and depth checks.
pub fn triangulate_point(
    pose0: &Matrix3x4<f64>,
    pose1: &Matrix3x4<f64>,
    point0: &Vector2<f64>,
    point1: &Vector2<f64>,
) -> Vector3<f64> {
    let mut a = DMatrix::zeros(4, 4);
    fill_dlt_rows(&mut a, 0, pose0, point0);
    fill_dlt_rows(&mut a, 2, pose1, point1);
    smallest_singular_vector(&a)
}

/// Triangulates a point from an arbitrary set of views (two rows each).
///
/// Used by the feature manager where every observing frame, including the
/// right camera of stereo pairs, contributes a projection.
pub fn triangulate_point_multiview(
    poses: &[Matrix3x4<f64>],
    points: &[Vector2<f64>],
) -> Option<Vector3<f64>> {
    debug_assert_eq!(poses.len(), points.len());
    if poses.len() < 2 {
        return None;
    }
    let mut a = DMatrix::zeros(2 * poses.len(), 4);
    for (i, (pose, point)) in poses.iter().zip(points.iter()).enumerate() {
        fill_dlt_rows(&mut a, 2 * i, pose, point);
    }
    Some(smallest_singular_vector(&a))
}

fn smallest_singular_vector(a: &DMatrix<f64>) -> Vector3<f64> {
    let mut svd = a.clone().svd(false, true);
    svd.sort_by_singular_values();
    let v_t = svd.v_t.expect("SVD with V requested");
    let last = v_t.row(v_t.nrows() - 1);
    let h = Vector4::new(last[0], last[1], last[2], last[3]);
    Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w)
}

/// Builds the world→camera projection `[R_cw | t_cw]` from a camera pose
/// `(R_wc, t_wc)` given in the world frame.
pub fn world_to_camera(r_wc: &Matrix3<f64>, t_wc: &Vector3<f64>) -> Matrix3x4<f64> {
    let r_cw = r_wc.transpose();
    let t_cw = -r_cw * t_wc;
    let mut pose = Matrix3x4::zeros();
    pose.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_cw);
    pose.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_cw);
    pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    #[test]
    fn two_view_recovers_known_point() {
        let p_world = Vector3::new(0.5, -0.3, 4.0);

        let pose0 = world_to_camera(&Matrix3::identity(), &Vector3::zeros());
        let pose1 = world_to_camera(&Matrix3::identity(), &Vector3::new(0.2, 0.0, 0.0));

        let obs = |pose: &Matrix3x4<f64>| {
            let pc = pose * Vector4::new(p_world.x, p_world.y, p_world.z, 1.0);
            Vector2::new(pc.x / pc.z, pc.y / pc.z)
        };

        let est = triangulate_point(&pose0, &pose1, &obs(&pose0), &obs(&pose1));
        assert_relative_eq!(est, p_world, epsilon = 1e-9);
    }

    #[test]
    fn multiview_uses_all_observations() {
        let p_world = Vector3::new(-1.0, 0.8, 6.0);
        let baselines = [0.0, 0.11, 0.2, 0.35];

        let mut poses = Vec::new();
        let mut points = Vec::new();
        for b in baselines {
            let pose = world_to_camera(&Matrix3::identity(), &Vector3::new(b, 0.0, 0.0));
            let pc = pose * Vector4::new(p_world.x, p_world.y, p_world.z, 1.0);
            poses.push(pose);
            points.push(Vector2::new(pc.x / pc.z, pc.y / pc.z));
        }

        let est = triangulate_point_multiview(&poses, &points).unwrap();
        assert_relative_eq!(est, p_world, epsilon = 1e-9);
    }
}
