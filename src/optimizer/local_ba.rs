//! Local Bundle Adjustment over the active keyframe window.
//!
//! Jointly refines the poses of the active keyframes and the positions of the
//! points they observe by minimizing the robustified reprojection error
//!
//! ```text
//! E = Σ ρ(‖π(K, R_i X_j + t_i) − u_ij‖²)
//! ```
//!
//! The default backend is Gauss-Newton with IRLS weights. The normal
//! equations are reduced with the Schur complement over the block-diagonal
//! point part, solved for the pose increments, and the point increments are
//! recovered by back-substitution. A step is accepted only if it strictly
//! lowers `E`; otherwise the solver stops with the pre-step parameters.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6x3, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::projection::to_pixel;

use super::local_ba_lm;
use super::problem::{linearize, total_error, BaObservation, BundleState, IndexConverter};
use super::robust::{RobustLoss, Robustifier};

/// Which solver runs the optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaBackend {
    #[default]
    GaussNewton,
    LevenbergMarquardt,
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Relative decrease fell below the convergence threshold.
    Converged,
    /// The last step did not lower the error and was discarded.
    ErrorIncreased,
    /// The iteration cap was reached.
    MaxIterations,
    /// The reduced system could not be solved.
    Singular,
}

/// Result of local bundle adjustment.
#[derive(Debug, Clone)]
pub struct LocalBAResult {
    /// Number of accepted steps.
    pub iterations: usize,
    /// Initial total robustified error.
    pub initial_error: f64,
    /// Final total robustified error.
    pub final_error: f64,
    /// Number of keyframes in the problem (fixed ones included).
    pub num_keyframes: usize,
    /// Number of map points optimized.
    pub num_map_points: usize,
    /// Number of observations (edges).
    pub num_observations: usize,
    pub termination: Termination,
}

/// Configuration for local BA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBAConfig {
    /// Hard cap on solver iterations.
    pub max_iterations: usize,
    /// Stop once the relative error decrease of an accepted step is below this.
    pub convergence_threshold: f64,
    /// Relative diagonal damping of the normal equations.
    pub damping: f64,
    /// Hold the oldest keyframe fixed to anchor the gauge.
    pub fix_first_pose: bool,
    /// Points seen by fewer active keyframes are left out of the problem.
    pub min_point_observations: usize,
    /// Compute Jacobian blocks on the rayon thread pool.
    pub parallel: bool,
    pub robust_loss: RobustLoss,
    pub backend: BaBackend,
}

impl Default for LocalBAConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            convergence_threshold: 1e-10,
            damping: 1e-6,
            fix_first_pose: true,
            min_point_observations: 2,
            parallel: true,
            robust_loss: RobustLoss::Squared,
            backend: BaBackend::GaussNewton,
        }
    }
}

/// Absolute floor added to every damped diagonal entry.
const MIN_DIAGONAL: f64 = 1e-12;

/// Pose and point increments of one Gauss-Newton step.
struct Step {
    poses: Vec<Vector6<f64>>,
    points: Vec<Vector3<f64>>,
}

/// Number of leading poses held constant.
fn num_fixed_poses(state: &BundleState, config: &LocalBAConfig) -> usize {
    usize::from(config.fix_first_pose && !state.poses.is_empty())
}

/// Build and solve the Schur-reduced normal equations at `state`.
fn solve_step(
    k: &Matrix3<f64>,
    state: &BundleState,
    observations: &[BaObservation],
    config: &LocalBAConfig,
    robustifier: &dyn Robustifier,
) -> Option<Step> {
    let fixed = num_fixed_poses(state, config);
    let m = state.poses.len() - fixed;
    let n = state.points.len();

    let blocks = linearize(k, state, observations, config.parallel);

    let mut h_pp = DMatrix::<f64>::zeros(6 * m, 6 * m);
    let mut b_p = DVector::<f64>::zeros(6 * m);
    let mut h_ll = vec![Matrix3::<f64>::zeros(); n];
    let mut b_l = vec![Vector3::<f64>::zeros(); n];
    // Per point: (optimized pose slot, H_pl block).
    let mut h_pl: Vec<Vec<(usize, Matrix6x3<f64>)>> = vec![Vec::new(); n];

    for (obs, block) in observations.iter().zip(&blocks) {
        let w = robustifier.weight(block.residual.norm_squared());
        let j = obs.point_index;
        let jl_t = block.j_point.transpose();

        h_ll[j] += jl_t * block.j_point * w;
        b_l[j] -= jl_t * block.residual * w;

        if obs.pose_index < fixed {
            continue;
        }
        let i = obs.pose_index - fixed;
        let jp_t = block.j_pose.transpose();

        let mut h_block = h_pp.fixed_view_mut::<6, 6>(6 * i, 6 * i);
        h_block += jp_t * block.j_pose * w;
        let mut b_block = b_p.fixed_rows_mut::<6>(6 * i);
        b_block -= jp_t * block.residual * w;
        h_pl[j].push((i, jp_t * block.j_point * w));
    }

    for d in 0..6 * m {
        h_pp[(d, d)] += config.damping * h_pp[(d, d)] + MIN_DIAGONAL;
    }

    // S = H_pp − Σ_j H_pl H_ll⁻¹ H_lp,  b_s = b_p − Σ_j H_pl H_ll⁻¹ b_l
    let mut s = h_pp;
    let mut b_s = b_p;
    let mut h_ll_inv = Vec::with_capacity(n);
    for j in 0..n {
        let mut damped = h_ll[j];
        for d in 0..3 {
            damped[(d, d)] += config.damping * damped[(d, d)] + MIN_DIAGONAL;
        }
        let Some(inv) = damped.try_inverse() else {
            h_ll_inv.push(None);
            continue;
        };

        for &(a, w_a) in &h_pl[j] {
            let w_a_inv = w_a * inv;
            let mut b_block = b_s.fixed_rows_mut::<6>(6 * a);
            b_block -= w_a_inv * b_l[j];
            for &(b, w_b) in &h_pl[j] {
                let mut s_block = s.fixed_view_mut::<6, 6>(6 * a, 6 * b);
                s_block -= w_a_inv * w_b.transpose();
            }
        }
        h_ll_inv.push(Some(inv));
    }

    let delta_p = if m == 0 {
        DVector::zeros(0)
    } else {
        match s.clone().cholesky() {
            Some(chol) => chol.solve(&b_s),
            None => s.lu().solve(&b_s)?,
        }
    };
    if delta_p.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut poses = vec![Vector6::zeros(); state.poses.len()];
    for i in 0..m {
        poses[fixed + i] = delta_p.fixed_rows::<6>(6 * i).into_owned();
    }

    let points = (0..n)
        .map(|j| match h_ll_inv[j] {
            Some(inv) => {
                let mut rhs = b_l[j];
                for &(a, w_a) in &h_pl[j] {
                    rhs -= w_a.transpose() * delta_p.fixed_rows::<6>(6 * a);
                }
                inv * rhs
            }
            None => Vector3::zeros(),
        })
        .collect();

    Some(Step { poses, points })
}

fn apply_step(state: &BundleState, step: &Step) -> BundleState {
    BundleState {
        poses: state
            .poses
            .iter()
            .zip(&step.poses)
            .map(|(pose, delta)| pose.perturbed(delta))
            .collect(),
        points: state
            .points
            .iter()
            .zip(&step.points)
            .map(|(p, delta)| p + delta)
            .collect(),
    }
}

/// Gauss-Newton with monotone step acceptance.
///
/// `state` is replaced only by parameters that strictly lowered the error, so
/// the final error never exceeds the initial one.
pub fn gauss_newton(
    k: &Matrix3<f64>,
    state: &mut BundleState,
    observations: &[BaObservation],
    config: &LocalBAConfig,
    robustifier: &dyn Robustifier,
) -> LocalBAResult {
    let initial_error = total_error(k, state, observations, robustifier);
    let mut error = initial_error;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    if error <= 0.0 {
        termination = Termination::Converged;
    } else {
        for _ in 0..config.max_iterations {
            let Some(step) = solve_step(k, state, observations, config, robustifier) else {
                termination = Termination::Singular;
                break;
            };

            let candidate = apply_step(state, &step);
            let candidate_error = total_error(k, &candidate, observations, robustifier);
            if candidate_error.is_nan() || candidate_error >= error {
                termination = Termination::ErrorIncreased;
                break;
            }

            let relative_decrease = (error - candidate_error) / error;
            *state = candidate;
            error = candidate_error;
            iterations += 1;

            if relative_decrease < config.convergence_threshold {
                termination = Termination::Converged;
                break;
            }
        }
    }

    LocalBAResult {
        iterations,
        initial_error,
        final_error: error,
        num_keyframes: state.poses.len(),
        num_map_points: state.points.len(),
        num_observations: observations.len(),
        termination,
    }
}

/// Optimize `state` with the configured backend.
pub fn optimize(
    k: &Matrix3<f64>,
    state: &mut BundleState,
    observations: &[BaObservation],
    config: &LocalBAConfig,
    robustifier: &dyn Robustifier,
) -> LocalBAResult {
    match config.backend {
        BaBackend::GaussNewton => gauss_newton(k, state, observations, config, robustifier),
        BaBackend::LevenbergMarquardt => {
            local_ba_lm::optimize_lm(k, state, observations, config, robustifier)
        }
    }
}

/// Collect the BA problem spanned by `active` keyframes.
///
/// Pose indices follow the order of `active` (oldest first); points seen by
/// fewer than `min_point_observations` active keyframes are skipped.
pub fn build_problem(
    map: &Map,
    active: &[KeyFrameId],
    k: &Matrix3<f64>,
    config: &LocalBAConfig,
) -> (IndexConverter, BundleState) {
    let mut counts: HashMap<MapPointId, usize> = HashMap::new();
    for kf in active.iter().filter_map(|&id| map.get_keyframe(id)) {
        for (_, point_id) in kf.correspondence.iter() {
            *counts.entry(point_id).or_insert(0) += 1;
        }
    }

    let mut converter = IndexConverter::new();
    for kf in active.iter().filter_map(|&id| map.get_keyframe(id)) {
        for (index, point_id) in kf.correspondence.iter() {
            if counts.get(&point_id).copied().unwrap_or(0) < config.min_point_observations {
                continue;
            }
            if map.get_map_point(point_id).is_none() {
                continue;
            }
            if let Some(keypoint) = kf.keypoint(index) {
                converter.add(kf.id, point_id, to_pixel(k, keypoint));
            }
        }
    }

    let poses = converter
        .keyframe_ids()
        .iter()
        .filter_map(|&id| map.get_keyframe(id).map(|kf| kf.pose.clone()))
        .collect();
    let points = converter
        .point_ids()
        .iter()
        .filter_map(|&id| map.get_map_point(id).map(|mp| mp.position))
        .collect();

    (converter, BundleState { poses, points })
}

/// Run local bundle adjustment over the active keyframes and write the
/// refined poses and points back into the map.
///
/// Returns `None` when the window yields no observations.
pub fn local_bundle_adjustment(
    map: &mut Map,
    active: &[KeyFrameId],
    k: &Matrix3<f64>,
    config: &LocalBAConfig,
    robustifier: &dyn Robustifier,
) -> Option<LocalBAResult> {
    let (converter, mut state) = build_problem(map, active, k, config);
    if converter.observations().is_empty() {
        return None;
    }

    let result = optimize(k, &mut state, converter.observations(), config, robustifier);

    for (&kf_id, pose) in converter.keyframe_ids().iter().zip(state.poses) {
        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.pose = pose;
        }
    }
    for (&mp_id, position) in converter.point_ids().iter().zip(state.points) {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = position;
        }
    }

    debug!(
        keyframes = result.num_keyframes,
        points = result.num_map_points,
        observations = result.num_observations,
        iterations = result.iterations,
        initial_error = result.initial_error,
        final_error = result.final_error,
        termination = ?result.termination,
        "local BA finished"
    );

    Some(result)
}
