//! SO(3) utilities for rotation perturbations.
//!
//! Poses are updated on the left, `R ← exp(δω)·R`, so the bundle adjuster
//! only needs [`skew`]. The Levenberg-Marquardt backend parameterizes
//! rotations absolutely by axis-angle and therefore also needs the Jacobian
//! of the exponential map.

use nalgebra::{Matrix3, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Inverse of [`skew`]: reads `(m21, m02, m10)`.
#[inline]
pub fn vee(m: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(m[(2, 1)], m[(0, 2)], m[(1, 0)])
}

/// Rotation matrix `exp([ω]×)` via Rodrigues' formula.
pub fn exp(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let k = skew(omega);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + k + 0.5 * k * k;
    }

    let theta_sq = theta * theta;
    Matrix3::identity() + (theta.sin() / theta) * k + ((1.0 - theta.cos()) / theta_sq) * k * k
}

/// Computes the right Jacobian Jr(φ) of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// For small angles (|φ| < ε):
/// ```text
/// Jr(φ) ≈ I - 0.5 [φ]×
/// ```
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / theta_cu) * skew_phi_sq
}

/// Left Jacobian Jl(φ) = Jr(-φ).
///
/// Satisfies `exp(φ + δ) ≈ exp(Jl(φ) δ) · exp(φ)` for small δ, which gives
/// `∂(exp(φ) X)/∂φ = -[exp(φ) X]× Jl(φ)`.
pub fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    right_jacobian(&(-phi))
}
