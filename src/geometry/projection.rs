//! Pinhole projection and its derivatives.
//!
//! The residual used throughout the crate is
//! `project(K, R·X + t) − observed`, measured in pixels.

use nalgebra::{Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3};

use super::so3::skew;
use super::SE3;

/// Project a camera-frame point through the intrinsic matrix.
#[inline]
pub fn project(k: &Matrix3<f64>, p_cam: &Vector3<f64>) -> Vector2<f64> {
    let q = k * p_cam;
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Map normalized image coordinates to pixels.
#[inline]
pub fn to_pixel(k: &Matrix3<f64>, normalized: &Vector2<f64>) -> Vector2<f64> {
    project(k, &normalized.push(1.0))
}

/// Reprojection residual of a world point observed at `observed` (pixels).
#[inline]
pub fn reprojection_residual(
    k: &Matrix3<f64>,
    pose: &SE3,
    point: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Vector2<f64> {
    project(k, &pose.transform_point(point)) - observed
}

/// ∂project/∂p_cam (2×3) for a general upper-triangular K.
pub fn projection_jacobian(k: &Matrix3<f64>, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
    let q = k * p_cam;
    let inv_z = 1.0 / q.z;
    let inv_z2 = inv_z * inv_z;

    let d_pi = Matrix2x3::new(
        inv_z, 0.0, -q.x * inv_z2,
        0.0, inv_z, -q.y * inv_z2,
    );
    d_pi * k
}

/// Jacobians of the reprojection residual.
///
/// Returns `(J_pose, J_point)` where the pose block is taken with respect to
/// the left increment `[δω, δt]` and the point block with respect to the
/// world position.
///
/// ```text
/// J_pose  = ∂π/∂p_c · [ −[R X]× | I ]
/// J_point = ∂π/∂p_c · R
/// ```
pub fn reprojection_jacobians(
    k: &Matrix3<f64>,
    pose: &SE3,
    point: &Vector3<f64>,
) -> (Matrix2x6<f64>, Matrix2x3<f64>) {
    let r = pose.rotation_matrix();
    let rotated = r * point;
    let p_cam = rotated + pose.translation;
    let d_pi = projection_jacobian(k, &p_cam);

    let mut j_pose = Matrix2x6::zeros();
    j_pose
        .fixed_view_mut::<2, 3>(0, 0)
        .copy_from(&(d_pi * -skew(&rotated)));
    j_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_pi);

    (j_pose, d_pi * r)
}
