//! Iterative PnP on normalized image coordinates.
//!
//! Gauss-Newton refinement of a world→camera pose from 3D↔2D
//! correspondences, seeded by the caller's pose prediction. Observations
//! here are already on the normalized plane, so no intrinsics are involved.

use nalgebra::{Matrix3, Matrix6, SMatrix, Vector2, Vector3, Vector6};
use tracing::debug;

use super::so3::{delta_q, skew};

const MAX_ITERATIONS: usize = 10;
const MIN_POINTS: usize = 6;

/// Refines `(r_cw, t_cw)` so that `π(r_cw · p + t_cw)` matches the
/// normalized observations. Returns `false` when there are too few points
/// or the normal equations degenerate.
pub fn solve_pnp(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    r_cw: &mut Matrix3<f64>,
    t_cw: &mut Vector3<f64>,
) -> bool {
    debug_assert_eq!(points3d.len(), points2d.len());
    if points3d.len() < MIN_POINTS {
        debug!("pnp: only {} correspondences", points3d.len());
        return false;
    }

    for _ in 0..MAX_ITERATIONS {
        let mut h = Matrix6::<f64>::zeros();
        let mut b = Vector6::<f64>::zeros();

        for (pw, uv) in points3d.iter().zip(points2d.iter()) {
            let pc = *r_cw * pw + *t_cw;
            if pc.z <= 1e-6 {
                continue;
            }
            let inv_z = 1.0 / pc.z;
            let residual = Vector2::new(pc.x * inv_z - uv.x, pc.y * inv_z - uv.y);

            let d_proj = SMatrix::<f64, 2, 3>::new(
                inv_z, 0.0, -pc.x * inv_z * inv_z,
                0.0, inv_z, -pc.y * inv_z * inv_z,
            );
            // pc = R p + t; perturbation R ← R·exp([θ]×), t ← t + δt
            let mut d_pc = SMatrix::<f64, 3, 6>::zeros();
            d_pc.fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(-*r_cw * skew(pw)));
            d_pc.fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&Matrix3::identity());

            let j = d_proj * d_pc;
            h += j.transpose() * j;
            b -= j.transpose() * residual;
        }

        let Some(chol) = nalgebra::Cholesky::new(h) else {
            debug!("pnp: degenerate normal equations");
            return false;
        };
        let dx = chol.solve(&b);

        let d_theta = Vector3::new(dx[0], dx[1], dx[2]);
        let d_t = Vector3::new(dx[3], dx[4], dx[5]);
        *r_cw *= delta_q(&(2.0 * d_theta)).to_rotation_matrix().into_inner();
        *t_cw += d_t;

        if dx.norm() < 1e-10 {
            break;
        }
    }
    true
}

/// Convenience wrapper operating on a camera-in-world pose `(r_wc, t_wc)`,
/// the convention used by the window arrays.
pub fn solve_pose_by_pnp(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    r_wc: &mut Matrix3<f64>,
    t_wc: &mut Vector3<f64>,
) -> bool {
    let mut r_cw = r_wc.transpose();
    let mut t_cw = -r_cw * *t_wc;
    if !solve_pnp(points3d, points2d, &mut r_cw, &mut t_cw) {
        return false;
    }
    *r_wc = r_cw.transpose();
    *t_wc = -*r_wc * t_cw;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::ypr2r;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_pose_from_noiseless_correspondences() {
        let r_true = ypr2r(&Vector3::new(12.0, -4.0, 3.0));
        let t_true = Vector3::new(0.3, -0.1, 0.5);

        let mut points3d = Vec::new();
        let mut points2d = Vec::new();
        for i in 0..20 {
            let p = Vector3::new(
                -1.0 + 0.1 * i as f64,
                0.5 - 0.07 * i as f64,
                4.0 + 0.2 * (i % 5) as f64,
            );
            let pc = r_true * p + t_true;
            points3d.push(p);
            points2d.push(Vector2::new(pc.x / pc.z, pc.y / pc.z));
        }

        let mut r = r_true * ypr2r(&Vector3::new(2.0, -1.0, 1.0));
        let mut t = t_true + Vector3::new(0.05, -0.04, 0.08);
        assert!(solve_pnp(&points3d, &points2d, &mut r, &mut t));

        assert_relative_eq!(r, r_true, epsilon = 1e-6);
        assert_relative_eq!(t, t_true, epsilon = 1e-6);
    }

    #[test]
    fn rejects_underdetermined_input() {
        let mut r = Matrix3::identity();
        let mut t = Vector3::zeros();
        let p3 = vec![Vector3::new(0.0, 0.0, 5.0); 3];
        let p2 = vec![Vector2::zeros(); 3];
        assert!(!solve_pnp(&p3, &p2, &mut r, &mut t));
    }
}
