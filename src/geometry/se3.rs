//! SE(3) rigid transforms.
//!
//! Keyframe poses map world coordinates into the camera frame:
//! `X_c = R·X_w + t`.

use nalgebra::{Matrix3, Matrix3x4, Rotation3, UnitQuaternion, Vector3, Vector6};

use super::so3;

/// Rigid body transform: rotation followed by translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    ///
    /// The matrix is re-orthonormalized, so slightly drifted rotations from
    /// linear solvers are accepted.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from an axis-angle vector and translation.
    pub fn from_axis_angle(omega: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(*omega),
            translation,
        }
    }

    /// Axis-angle vector of the rotation.
    pub fn axis_angle(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// `[R | t]` as a 3×4 matrix.
    pub fn matrix3x4(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.set_column(3, &self.translation);
        m
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Inverse transform.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition `self ∘ other`: applies `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Camera center in world coordinates, `-Rᵀ t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Apply a `[δω, δt]` increment: `R ← exp(δω)·R`, `t ← t + δt`.
    pub fn perturbed(&self, delta: &Vector6<f64>) -> Self {
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let rotation = Rotation3::from_matrix_unchecked(so3::exp(&omega));
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rotation) * self.rotation,
            translation: self.translation + Vector3::new(delta[3], delta[4], delta[5]),
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::from_axis_angle(&Vector3::new(0.1, -0.3, 0.2), Vector3::new(0.5, -1.0, 2.0))
    }

    #[test]
    fn test_inverse_round_trip() {
        let pose = sample_pose();
        let p = Vector3::new(1.0, 2.0, 3.0);

        let back = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_applies_right_operand_first() {
        let a = sample_pose();
        let b = SE3::from_axis_angle(&Vector3::new(0.0, 0.4, 0.0), Vector3::new(-1.0, 0.0, 0.3));
        let p = Vector3::new(-0.7, 0.2, 4.0);

        let expected = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(a.compose(&b).transform_point(&p), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_camera_center_maps_to_origin() {
        let pose = sample_pose();
        let center = pose.camera_center();

        assert_relative_eq!(pose.transform_point(&center), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_matrix3x4_matches_transform() {
        let pose = sample_pose();
        let p = Vector3::new(0.3, 0.1, -2.0);

        let projected = pose.matrix3x4() * p.push(1.0);
        assert_relative_eq!(projected, pose.transform_point(&p), epsilon = 1e-12);
    }

    #[test]
    fn test_perturbed_left_multiplies_rotation() {
        let pose = sample_pose();
        let delta = Vector6::new(0.01, 0.02, -0.03, 0.1, 0.0, -0.1);
        let updated = pose.perturbed(&delta);

        let expected_r = so3::exp(&Vector3::new(0.01, 0.02, -0.03)) * pose.rotation_matrix();
        assert_relative_eq!(updated.rotation_matrix(), expected_r, epsilon = 1e-12);
        assert_relative_eq!(
            updated.translation,
            pose.translation + Vector3::new(0.1, 0.0, -0.1),
            epsilon = 1e-15
        );
    }
}
