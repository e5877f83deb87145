//! Essential-matrix estimation between two frames of normalized
//! correspondences: eight-point RANSAC, decomposition, and a cheirality
//! vote to pick the physical motion hypothesis.

use nalgebra::{Matrix3, Vector2, Vector3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::triangulation::{triangulate_point, world_to_camera};

/// Epipolar inlier threshold on the normalized plane, the pixel threshold
/// of the tracker divided by the nominal focal length.
const RANSAC_THRESHOLD: f64 = 0.3 / 460.0;
const RANSAC_ITERATIONS: usize = 200;
/// Minimum positive-depth triangulations for an accepted hypothesis.
const MIN_CHEIRALITY_INLIERS: usize = 12;

/// Estimates the relative pose of frame `j` expressed in frame `i`
/// (`R = R_i_j`, `t = t_i_j`) from normalized-plane correspondences.
///
/// Returns `None` when RANSAC finds no consensus or no decomposition
/// passes the cheirality vote.
pub fn solve_relative_rt(
    corres: &[(Vector3<f64>, Vector3<f64>)],
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    if corres.len() < 15 {
        return None;
    }

    let pts_i: Vec<Vector2<f64>> = corres.iter().map(|c| c.0.xy()).collect();
    let pts_j: Vec<Vector2<f64>> = corres.iter().map(|c| c.1.xy()).collect();

    let (essential, inlier_mask) = ransac_essential(&pts_i, &pts_j)?;
    let inliers: Vec<usize> = (0..corres.len()).filter(|&k| inlier_mask[k]).collect();
    if inliers.len() < MIN_CHEIRALITY_INLIERS {
        debug!("relative pose: only {} epipolar inliers", inliers.len());
        return None;
    }

    let (r_ji, t_ji, votes) = decompose_with_cheirality(&essential, &pts_i, &pts_j, &inliers)?;
    if votes < MIN_CHEIRALITY_INLIERS {
        debug!("relative pose: cheirality vote too weak ({votes})");
        return None;
    }

    // x_j = R_ji x_i + t_ji  →  pose of camera j seen from camera i
    let r_ij = r_ji.transpose();
    let t_ij = -r_ij * t_ji;
    Some((r_ij, t_ij))
}

fn ransac_essential(
    pts_i: &[Vector2<f64>],
    pts_j: &[Vector2<f64>],
) -> Option<(Matrix3<f64>, Vec<bool>)> {
    let n = pts_i.len();
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut best_mask = vec![false; n];
    let mut best_count = 0usize;
    let mut best_e = Matrix3::zeros();

    for _ in 0..RANSAC_ITERATIONS {
        let mut sample = [0usize; 8];
        for s in sample.iter_mut() {
            *s = rng.gen_range(0..n);
        }
        let Some(e) = eight_point(&sample, pts_i, pts_j) else {
            continue;
        };

        let mut count = 0;
        let mut mask = vec![false; n];
        for k in 0..n {
            if sampson_error(&e, &pts_i[k], &pts_j[k]) < RANSAC_THRESHOLD {
                mask[k] = true;
                count += 1;
            }
        }
        if count > best_count {
            best_count = count;
            best_mask = mask;
            best_e = e;
        }
    }

    if best_count < 8 {
        return None;
    }

    // refit on the consensus set
    let inliers: Vec<usize> = (0..n).filter(|&k| best_mask[k]).collect();
    if let Some(e) = eight_point(&inliers, pts_i, pts_j) {
        best_e = e;
        for k in 0..n {
            best_mask[k] = sampson_error(&best_e, &pts_i[k], &pts_j[k]) < RANSAC_THRESHOLD;
        }
    }
    Some((best_e, best_mask))
}

/// Linear eight-point solve with the rank-2 constraint enforced.
fn eight_point(
    indices: &[usize],
    pts_i: &[Vector2<f64>],
    pts_j: &[Vector2<f64>],
) -> Option<Matrix3<f64>> {
    if indices.len() < 8 {
        return None;
    }
    let mut a = nalgebra::DMatrix::zeros(indices.len(), 9);
    for (row, &k) in indices.iter().enumerate() {
        let (x1, y1) = (pts_i[k].x, pts_i[k].y);
        let (x2, y2) = (pts_j[k].x, pts_j[k].y);
        // x_j^T E x_i = 0, unknowns row-major
        let coeffs = [
            x2 * x1, x2 * y1, x2,
            y2 * x1, y2 * y1, y2,
            x1, y1, 1.0,
        ];
        for (c, v) in coeffs.iter().enumerate() {
            a[(row, c)] = *v;
        }
    }
    let mut svd = a.svd(false, true);
    svd.sort_by_singular_values();
    let v_t = svd.v_t?;
    let f = v_t.row(v_t.nrows() - 1);
    let e_raw = Matrix3::new(
        f[0], f[1], f[2],
        f[3], f[4], f[5],
        f[6], f[7], f[8],
    );

    // project onto the essential manifold: equal leading singular values
    let mut svd_e = e_raw.svd(true, true);
    svd_e.sort_by_singular_values();
    let u = svd_e.u?;
    let v_t = svd_e.v_t?;
    let s = nalgebra::Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0));
    Some(u * s * v_t)
}

fn sampson_error(e: &Matrix3<f64>, p_i: &Vector2<f64>, p_j: &Vector2<f64>) -> f64 {
    let x1 = Vector3::new(p_i.x, p_i.y, 1.0);
    let x2 = Vector3::new(p_j.x, p_j.y, 1.0);
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let x2tex1 = x2.dot(&ex1);
    let denom = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if denom <= 0.0 {
        return f64::MAX;
    }
    (x2tex1 * x2tex1 / denom).sqrt()
}

/// Tries the four `(R, t)` decompositions and returns the one placing the
/// most triangulated inliers in front of both cameras.
fn decompose_with_cheirality(
    e: &Matrix3<f64>,
    pts_i: &[Vector2<f64>],
    pts_j: &[Vector2<f64>],
    inliers: &[usize],
) -> Option<(Matrix3<f64>, Vector3<f64>, usize)> {
    let mut svd = e.svd(true, true);
    svd.sort_by_singular_values();
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(
        0.0, -1.0, 0.0,
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
    );
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    let mut best: Option<(Matrix3<f64>, Vector3<f64>, usize)> = None;
    for (r, t) in [(r1, t), (r1, -t), (r2, t), (r2, -t)] {
        let votes = count_positive_depths(&r, &t, pts_i, pts_j, inliers);
        if best.as_ref().map_or(true, |b| votes > b.2) {
            best = Some((r, t, votes));
        }
    }
    best
}

fn count_positive_depths(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    pts_i: &[Vector2<f64>],
    pts_j: &[Vector2<f64>],
    inliers: &[usize],
) -> usize {
    // camera i at origin; camera j pose in world = (Rᵀ, -Rᵀ t)
    let pose_i = world_to_camera(&Matrix3::identity(), &Vector3::zeros());
    let r_wc_j = r.transpose();
    let t_wc_j = -r.transpose() * t;
    let pose_j = world_to_camera(&r_wc_j, &t_wc_j);

    let mut votes = 0;
    for &k in inliers {
        let p = triangulate_point(&pose_i, &pose_j, &pts_i[k], &pts_j[k]);
        let depth_i = p.z;
        let depth_j = (r * p + t).z;
        if depth_i > 0.0 && depth_j > 0.0 {
            votes += 1;
        }
    }
    votes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::ypr2r;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_relative_motion() {
        // camera j translated and yawed relative to camera i
        let r_ij = ypr2r(&Vector3::new(8.0, 2.0, -1.0));
        let t_ij = Vector3::new(0.5, 0.05, 0.1);

        let mut corres = Vec::new();
        for gx in 0..6 {
            for gy in 0..5 {
                let p = Vector3::new(
                    -1.5 + 0.6 * gx as f64,
                    -1.0 + 0.5 * gy as f64,
                    5.0 + 0.3 * ((gx + gy) % 4) as f64,
                );
                let pj = r_ij.transpose() * (p - t_ij);
                corres.push((
                    Vector3::new(p.x / p.z, p.y / p.z, 1.0),
                    Vector3::new(pj.x / pj.z, pj.y / pj.z, 1.0),
                ));
            }
        }

        let (r, t) = solve_relative_rt(&corres).expect("relative pose");
        assert_relative_eq!(r, r_ij, epsilon = 1e-6);
        // translation is up to scale
        assert_relative_eq!(t.normalize(), t_ij.normalize(), epsilon = 1e-6);
    }

    #[test]
    fn refuses_without_enough_correspondences() {
        let corres = vec![(Vector3::z(), Vector3::z()); 10];
        assert!(solve_relative_rt(&corres).is_none());
    }
}
