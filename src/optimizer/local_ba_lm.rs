//! Local Bundle Adjustment using the `levenberg-marquardt` crate.
//!
//! Solves the same problem as the Gauss-Newton backend in
//! [`super::local_ba`], selected with `BaBackend::LevenbergMarquardt`.
//!
//! # Parameterization
//!
//! Rotations are stored absolutely as axis-angle vectors `ω`. The derivative
//! of `R(ω)·X` is taken through the SO(3) left Jacobian:
//!
//! ```text
//! ∂(R(ω) X)/∂ω = −[R X]× · J_l(ω)
//! ```
//!
//! Robust weights are evaluated once at the initial parameters and each
//! residual row is scaled by `√w`.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Owned, Vector3};

use crate::geometry::projection::{projection_jacobian, reprojection_residual};
use crate::geometry::{so3, SE3};

use super::local_ba::{LocalBAConfig, LocalBAResult, Termination};
use super::problem::{total_error, BaObservation, BundleState};
use super::robust::Robustifier;

/// Least-squares view of a bundle adjustment problem.
struct BundleProblem<'a> {
    k: Matrix3<f64>,
    observations: &'a [BaObservation],
    /// `√w` per observation, frozen at the start.
    sqrt_weights: Vec<f64>,
    /// Poses `[0, fixed)` are constants.
    fixed: usize,
    state: BundleState,
}

impl<'a> BundleProblem<'a> {
    fn num_optimized_poses(&self) -> usize {
        self.state.poses.len() - self.fixed
    }

    /// Column of pose `pose_index` in the parameter vector.
    fn pose_column(&self, pose_index: usize) -> Option<usize> {
        (pose_index >= self.fixed).then(|| 6 * (pose_index - self.fixed))
    }

    fn point_column(&self, point_index: usize) -> usize {
        6 * self.num_optimized_poses() + 3 * point_index
    }

    fn num_params(&self) -> usize {
        6 * self.num_optimized_poses() + 3 * self.state.points.len()
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, Dyn> for BundleProblem<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        let optimized = self.num_optimized_poses();
        for i in 0..optimized {
            let base = 6 * i;
            let omega = Vector3::new(params[base], params[base + 1], params[base + 2]);
            let t = Vector3::new(params[base + 3], params[base + 4], params[base + 5]);
            self.state.poses[self.fixed + i] = SE3::from_axis_angle(&omega, t);
        }
        for j in 0..self.state.points.len() {
            let base = self.point_column(j);
            self.state.points[j] = Vector3::new(params[base], params[base + 1], params[base + 2]);
        }
    }

    fn params(&self) -> DVector<f64> {
        let mut params = DVector::zeros(self.num_params());
        for i in 0..self.num_optimized_poses() {
            let pose = &self.state.poses[self.fixed + i];
            params.fixed_rows_mut::<3>(6 * i).copy_from(&pose.axis_angle());
            params.fixed_rows_mut::<3>(6 * i + 3).copy_from(&pose.translation);
        }
        for (j, point) in self.state.points.iter().enumerate() {
            params.fixed_rows_mut::<3>(self.point_column(j)).copy_from(point);
        }
        params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(2 * self.observations.len());
        for (row, (obs, &sw)) in self.observations.iter().zip(&self.sqrt_weights).enumerate() {
            let r = reprojection_residual(
                &self.k,
                &self.state.poses[obs.pose_index],
                &self.state.points[obs.point_index],
                &obs.keypoint,
            );
            residuals.fixed_rows_mut::<2>(2 * row).copy_from(&(r * sw));
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(2 * self.observations.len(), self.num_params());
        for (row, (obs, &sw)) in self.observations.iter().zip(&self.sqrt_weights).enumerate() {
            let pose = &self.state.poses[obs.pose_index];
            let point = &self.state.points[obs.point_index];
            let r = pose.rotation_matrix();
            let rotated = r * point;
            let d_pi = projection_jacobian(&self.k, &(rotated + pose.translation)) * sw;

            if let Some(col) = self.pose_column(obs.pose_index) {
                let d_omega = -so3::skew(&rotated) * so3::left_jacobian(&pose.axis_angle());
                jacobian
                    .fixed_view_mut::<2, 3>(2 * row, col)
                    .copy_from(&(d_pi * d_omega));
                jacobian.fixed_view_mut::<2, 3>(2 * row, col + 3).copy_from(&d_pi);
            }
            let col = self.point_column(obs.point_index);
            jacobian.fixed_view_mut::<2, 3>(2 * row, col).copy_from(&(d_pi * r));
        }
        Some(jacobian)
    }
}

/// Optimize `state` with Levenberg-Marquardt.
///
/// The result is kept only if the robustified error did not grow; otherwise
/// `state` is left as it was and the termination is `ErrorIncreased`.
pub fn optimize_lm(
    k: &Matrix3<f64>,
    state: &mut BundleState,
    observations: &[BaObservation],
    config: &LocalBAConfig,
    robustifier: &dyn Robustifier,
) -> LocalBAResult {
    let initial_error = total_error(k, state, observations, robustifier);
    let mut result = LocalBAResult {
        iterations: 0,
        initial_error,
        final_error: initial_error,
        num_keyframes: state.poses.len(),
        num_map_points: state.points.len(),
        num_observations: observations.len(),
        termination: Termination::Converged,
    };
    if initial_error <= 0.0 {
        return result;
    }

    let sqrt_weights = observations
        .iter()
        .map(|obs| {
            let r = reprojection_residual(
                k,
                &state.poses[obs.pose_index],
                &state.points[obs.point_index],
                &obs.keypoint,
            );
            robustifier.weight(r.norm_squared()).max(0.0).sqrt()
        })
        .collect();

    let problem = BundleProblem {
        k: *k,
        observations,
        sqrt_weights,
        fixed: usize::from(config.fix_first_pose && !state.poses.is_empty()),
        state: state.clone(),
    };

    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(config.max_iterations.max(1))
        .with_ftol(config.convergence_threshold.max(f64::EPSILON))
        .minimize(problem);

    result.iterations = report.number_of_evaluations;
    let final_error = total_error(k, &problem.state, observations, robustifier);
    if !final_error.is_finite() || final_error > initial_error {
        result.termination = Termination::ErrorIncreased;
        return result;
    }

    result.termination = match report.termination {
        ref reason if reason.was_successful() => Termination::Converged,
        TerminationReason::LostPatience => Termination::MaxIterations,
        _ => Termination::Singular,
    };
    result.final_error = final_error;
    *state = problem.state;
    result
}
