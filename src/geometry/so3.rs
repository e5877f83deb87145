//! SO(3) helpers shared by pre-integration, residual Jacobians, and the
//! window yaw-anchoring step.
//!
//! Quaternions follow the Hamilton convention; tangent increments are
//! applied on the right, `q ⊗ δq(θ)` with `δq(θ) ≈ [1, θ/2]`.

use nalgebra::{Matrix3, Matrix4, Quaternion, UnitQuaternion, Vector3};

/// Constructs the skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Small-angle quaternion `δq(θ) = [1, θ/2]`, normalized.
///
/// This is the increment used by midpoint integration and by the pose
/// manifold update; for the sample rates involved the first-order form is
/// exact to well below sensor noise.
#[inline]
pub fn delta_q(theta: &Vector3<f64>) -> UnitQuaternion<f64> {
    let half = 0.5 * theta;
    UnitQuaternion::from_quaternion(Quaternion::new(1.0, half.x, half.y, half.z))
}

/// Left-multiplication matrix `L(q)` such that `L(q) · p.coords4 = (q ⊗ p).coords4`
/// with coefficient order `[w, x, y, z]`.
pub fn quat_left(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let w = q.w;
    let v = q.imag();
    let mut m = Matrix4::zeros();
    m[(0, 0)] = w;
    m.fixed_view_mut::<1, 3>(0, 1).copy_from(&(-v).transpose());
    m.fixed_view_mut::<3, 1>(1, 0).copy_from(&v);
    m.fixed_view_mut::<3, 3>(1, 1)
        .copy_from(&(Matrix3::identity() * w + skew(&v)));
    m
}

/// Right-multiplication matrix `R(p)` such that `R(p) · q.coords4 = (q ⊗ p).coords4`.
pub fn quat_right(p: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let w = p.w;
    let v = p.imag();
    let mut m = Matrix4::zeros();
    m[(0, 0)] = w;
    m.fixed_view_mut::<1, 3>(0, 1).copy_from(&(-v).transpose());
    m.fixed_view_mut::<3, 1>(1, 0).copy_from(&v);
    m.fixed_view_mut::<3, 3>(1, 1)
        .copy_from(&(Matrix3::identity() * w - skew(&v)));
    m
}

/// Bottom-right 3×3 block of `quat_left(q)`, the part acting on vector
/// components. Used by the rotation-residual Jacobians.
#[inline]
pub fn quat_left_vec(q: &UnitQuaternion<f64>) -> Matrix3<f64> {
    Matrix3::identity() * q.w + skew(&q.imag())
}

/// Bottom-right 3×3 block of `quat_right(p)`.
#[inline]
pub fn quat_right_vec(p: &UnitQuaternion<f64>) -> Matrix3<f64> {
    Matrix3::identity() * p.w - skew(&p.imag())
}

/// Flips a quaternion into the `w ≥ 0` half-sphere.
#[inline]
pub fn positify(q: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    if q.w >= 0.0 {
        *q
    } else {
        UnitQuaternion::from_quaternion(Quaternion::new(-q.w, -q.i, -q.j, -q.k))
    }
}

/// Rotation matrix → yaw/pitch/roll in **degrees** (Z-Y-X convention).
pub fn r2ypr(r: &Matrix3<f64>) -> Vector3<f64> {
    let n = r.column(0);
    let o = r.column(1);
    let a = r.column(2);

    let y = n[1].atan2(n[0]);
    let p = (-n[2]).atan2(n[0] * y.cos() + n[1] * y.sin());
    let r_ = (a[0] * y.sin() - a[1] * y.cos()).atan2(-o[0] * y.sin() + o[1] * y.cos());

    Vector3::new(y, p, r_) / std::f64::consts::PI * 180.0
}

/// Yaw/pitch/roll in **degrees** → rotation matrix (Z-Y-X convention).
pub fn ypr2r(ypr: &Vector3<f64>) -> Matrix3<f64> {
    let y = ypr.x / 180.0 * std::f64::consts::PI;
    let p = ypr.y / 180.0 * std::f64::consts::PI;
    let r = ypr.z / 180.0 * std::f64::consts::PI;

    let rz = Matrix3::new(
        y.cos(), -y.sin(), 0.0,
        y.sin(), y.cos(), 0.0,
        0.0, 0.0, 1.0,
    );
    let ry = Matrix3::new(
        p.cos(), 0.0, p.sin(),
        0.0, 1.0, 0.0,
        -p.sin(), 0.0, p.cos(),
    );
    let rx = Matrix3::new(
        1.0, 0.0, 0.0,
        0.0, r.cos(), -r.sin(),
        0.0, r.sin(), r.cos(),
    );
    rz * ry * rx
}

/// Rotation aligning a measured gravity direction with `+z`, with yaw
/// removed so the resulting world frame has zero heading.
pub fn g2r(g: &Vector3<f64>) -> Matrix3<f64> {
    let ng1 = g.normalize();
    let ng2 = Vector3::z();
    let r0 = UnitQuaternion::rotation_between(&ng1, &ng2)
        .unwrap_or_else(UnitQuaternion::identity)
        .to_rotation_matrix()
        .into_inner();
    let yaw = r2ypr(&r0).x;
    ypr2r(&Vector3::new(-yaw, 0.0, 0.0)) * r0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn skew_matches_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);
        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn quat_left_right_reproduce_product() {
        let q = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3);
        let p = UnitQuaternion::from_euler_angles(-0.4, 0.5, 0.1);
        let qp = q * p;

        let p4 = nalgebra::Vector4::new(p.w, p.i, p.j, p.k);
        let q4 = nalgebra::Vector4::new(q.w, q.i, q.j, q.k);

        let via_left = quat_left(&q) * p4;
        let via_right = quat_right(&p) * q4;
        let expected = nalgebra::Vector4::new(qp.w, qp.i, qp.j, qp.k);

        assert_relative_eq!(via_left, expected, epsilon = 1e-12);
        assert_relative_eq!(via_right, expected, epsilon = 1e-12);
    }

    #[test]
    fn ypr_round_trip() {
        let ypr = Vector3::new(33.0, -12.0, 7.5);
        let r = ypr2r(&ypr);
        assert_relative_eq!(r2ypr(&r), ypr, epsilon = 1e-9);
    }

    #[test]
    fn g2r_aligns_gravity_with_z() {
        let g = Vector3::new(0.3, -0.2, 9.75);
        let r0 = g2r(&g);
        let aligned = r0 * g.normalize();
        assert_relative_eq!(aligned, Vector3::z(), epsilon = 1e-9);
        // yaw removed
        assert_relative_eq!(r2ypr(&r0).x, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn delta_q_small_angle() {
        let theta = Vector3::new(1e-4, -2e-4, 3e-4);
        let dq = delta_q(&theta);
        let exact = UnitQuaternion::from_scaled_axis(theta);
        assert_relative_eq!(dq.angle(), exact.angle(), epsilon = 1e-10);
    }
}
