//! PnP (Perspective-n-Point): P3P hypotheses inside RANSAC, a linear DLT
//! refit on the consensus set, then Gauss-Newton refinement of the
//! reprojection error on the inliers.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix6, Rotation3, UnitQuaternion, Vector2, Vector3, Vector6};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VoError;

use super::p3p::solve_p3p;
use super::projection::{reprojection_jacobians, reprojection_residual};
use super::triangulate::solve_homogeneous;
use super::SE3;

/// Minimum correspondences for the linear solver.
pub const MIN_DLT_POINTS: usize = 6;

/// RANSAC sample: three pairs for P3P and one to choose among its solutions.
pub const MIN_RANSAC_POINTS: usize = 4;

/// RANSAC and refinement settings for PnP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PnpConfig {
    /// Upper bound on RANSAC hypotheses.
    pub max_iterations: usize,
    /// Inlier threshold on the reprojection error (pixels).
    pub reprojection_threshold: f64,
    /// Desired probability of drawing at least one clean sample.
    pub confidence: f64,
    /// Gauss-Newton iterations on the final inlier set.
    pub refine_iterations: usize,
    /// Seed of the sampling RNG, for reproducible runs.
    pub seed: u64,
}

impl Default for PnpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            reprojection_threshold: 8.0,
            confidence: 0.99,
            refine_iterations: 10,
            seed: 0,
        }
    }
}

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated camera pose (world to camera).
    pub pose: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    /// Reprojection error per correspondence (in pixels).
    pub reproj_errors: Vec<f64>,
}

impl PnPResult {
    pub fn num_inliers(&self) -> usize {
        self.inlier_mask.iter().filter(|&&b| b).count()
    }
}

/// Linear PnP on all given correspondences.
///
/// Needs the points to span 3D: on a planar scene the system is rank
/// deficient and the result is meaningless. Image points are pixels; they are mapped through `K⁻¹` and the 2n×12
/// system for `[R | t]` is solved in normalized coordinates. The overall sign
/// is chosen so that `det(R) > 0`, the scale from the mean row norm, and the
/// rotation block is projected onto SO(3).
pub fn solve_pnp_dlt(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    k: &Matrix3<f64>,
) -> Result<SE3, VoError> {
    let n = points3d.len().min(points2d.len());
    if n < MIN_DLT_POINTS {
        return Err(VoError::InsufficientInliers {
            found: n,
            required: MIN_DLT_POINTS,
        });
    }
    let k_inv = k
        .try_inverse()
        .ok_or(VoError::Degenerate("camera matrix is not invertible"))?;

    let mut a = DMatrix::zeros(2 * n, 12);
    for (i, (pw, pi)) in points3d.iter().zip(points2d).take(n).enumerate() {
        let xn = k_inv * pi.push(1.0);
        let (u, v) = (xn.x / xn.z, xn.y / xn.z);
        let (r0, r1) = (2 * i, 2 * i + 1);

        for (j, c) in [pw.x, pw.y, pw.z, 1.0].iter().enumerate() {
            a[(r0, j)] = *c;
            a[(r0, 8 + j)] = -u * c;
            a[(r1, 4 + j)] = *c;
            a[(r1, 8 + j)] = -v * c;
        }
    }

    let p_vec = solve_homogeneous(&a)?;
    let mut p = Matrix3x4::from_row_slice(p_vec.as_slice());

    let mut m = p.fixed_view::<3, 3>(0, 0).into_owned();
    if m.determinant() < 0.0 {
        p = -p;
        m = -m;
    }

    let scale = (m.row(0).norm() + m.row(1).norm() + m.row(2).norm()) / 3.0;
    if scale <= f64::EPSILON {
        return Err(VoError::Degenerate("PnP solution has vanishing scale"));
    }

    let svd = (m / scale).svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(VoError::Degenerate("SVD failed in PnP DLT")),
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    let t = p.column(3) / scale;

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    Ok(SE3::new(rotation, t))
}

fn reprojection_errors(
    pose: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    k: &Matrix3<f64>,
) -> Vec<f64> {
    points3d
        .iter()
        .zip(points2d)
        .map(|(pw, pi)| {
            if pose.transform_point(pw).z <= 0.0 {
                f64::INFINITY
            } else {
                reprojection_residual(k, pose, pw, pi).norm()
            }
        })
        .collect()
}

fn squared_error_sum(
    pose: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    k: &Matrix3<f64>,
) -> f64 {
    reprojection_errors(pose, points3d, points2d, k)
        .iter()
        .map(|e| e * e)
        .sum()
}

/// Minimal-sample hypothesis: P3P on the first three pairs, disambiguated by
/// the reprojection error of the fourth.
fn p3p_hypothesis(
    world: &[Vector3<f64>; MIN_RANSAC_POINTS],
    image: &[Vector2<f64>; MIN_RANSAC_POINTS],
    k_inv: &Matrix3<f64>,
    k: &Matrix3<f64>,
) -> Option<SE3> {
    let bearings = [0, 1, 2].map(|i| (k_inv * image[i].push(1.0)).normalize());
    let check = |pose: &SE3| {
        if pose.transform_point(&world[3]).z <= 0.0 {
            f64::INFINITY
        } else {
            reprojection_residual(k, pose, &world[3], &image[3]).norm()
        }
    };

    solve_p3p(&[world[0], world[1], world[2]], &bearings)
        .into_iter()
        .map(|pose| (check(&pose), pose))
        .filter(|(error, _)| error.is_finite())
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, pose)| pose)
}

/// Number of hypotheses needed to reach `confidence` at the given inlier ratio.
fn required_iterations(inlier_ratio: f64, confidence: f64, max_iterations: usize) -> usize {
    let p_clean = inlier_ratio.powi(MIN_RANSAC_POINTS as i32);
    if p_clean >= 1.0 - f64::EPSILON {
        return 1;
    }
    if p_clean <= f64::EPSILON {
        return max_iterations;
    }
    let n = (1.0 - confidence).ln() / (1.0 - p_clean).ln();
    (n.ceil() as usize).clamp(1, max_iterations)
}

/// Robust PnP: P3P hypotheses on random minimal samples, then Gauss-Newton
/// refinement on the best consensus set.
///
/// The refinement starts from the DLT refit of the inliers when that explains
/// them better than the hypothesis, which it does not on planar scenes.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    k: &Matrix3<f64>,
    config: &PnpConfig,
) -> Result<PnPResult, VoError> {
    let n = points3d.len().min(points2d.len());
    if n < MIN_RANSAC_POINTS {
        return Err(VoError::InsufficientInliers {
            found: n,
            required: MIN_RANSAC_POINTS,
        });
    }
    let points3d = &points3d[..n];
    let points2d = &points2d[..n];
    let k_inv = k
        .try_inverse()
        .ok_or(VoError::Degenerate("camera matrix is not invertible"))?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(SE3, usize)> = None;
    let mut needed = config.max_iterations.max(1);
    let mut iteration = 0;

    while iteration < needed {
        iteration += 1;

        let sample = rand::seq::index::sample(&mut rng, n, MIN_RANSAC_POINTS).into_vec();
        let world = [0, 1, 2, 3].map(|j| points3d[sample[j]]);
        let image = [0, 1, 2, 3].map(|j| points2d[sample[j]]);
        let Some(pose) = p3p_hypothesis(&world, &image, &k_inv, k) else {
            continue;
        };

        let count = reprojection_errors(&pose, points3d, points2d, k)
            .iter()
            .filter(|&&e| e < config.reprojection_threshold)
            .count();

        if best.as_ref().map_or(true, |(_, c)| count > *c) {
            best = Some((pose, count));
            needed = needed.min(required_iterations(
                count as f64 / n as f64,
                config.confidence,
                config.max_iterations,
            ));
        }
    }

    let (hypothesis, _) = best.ok_or(VoError::InsufficientInliers {
        found: 0,
        required: MIN_RANSAC_POINTS,
    })?;

    let mask: Vec<bool> = reprojection_errors(&hypothesis, points3d, points2d, k)
        .iter()
        .map(|&e| e < config.reprojection_threshold)
        .collect();
    let (world, image): (Vec<_>, Vec<_>) = mask
        .iter()
        .enumerate()
        .filter(|(_, &inlier)| inlier)
        .map(|(i, _)| (points3d[i], points2d[i]))
        .unzip();

    let start = match solve_pnp_dlt(&world, &image, k) {
        Ok(refit)
            if squared_error_sum(&refit, &world, &image, k)
                < squared_error_sum(&hypothesis, &world, &image, k) =>
        {
            refit
        }
        _ => hypothesis,
    };
    let pose = refine_pose(&start, &world, &image, k, config.refine_iterations);

    let reproj_errors = reprojection_errors(&pose, points3d, points2d, k);
    let inlier_mask: Vec<bool> = reproj_errors
        .iter()
        .map(|&e| e < config.reprojection_threshold)
        .collect();

    debug!(
        hypotheses = iteration,
        correspondences = n,
        inliers = inlier_mask.iter().filter(|&&b| b).count(),
        "PnP RANSAC finished"
    );

    Ok(PnPResult {
        pose,
        inlier_mask,
        reproj_errors,
    })
}

/// Gauss-Newton refinement of a pose against fixed 3D points.
///
/// Steps that do not lower the squared reprojection error are rejected and
/// end the refinement.
pub fn refine_pose(
    initial: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    k: &Matrix3<f64>,
    max_iterations: usize,
) -> SE3 {
    let cost = |pose: &SE3| -> f64 {
        points3d
            .iter()
            .zip(points2d)
            .map(|(pw, pi)| reprojection_residual(k, pose, pw, pi).norm_squared())
            .sum()
    };

    let mut pose = initial.clone();
    let mut error = cost(&pose);

    for _ in 0..max_iterations {
        let mut h = Matrix6::zeros();
        let mut b = Vector6::zeros();
        for (pw, pi) in points3d.iter().zip(points2d) {
            let r = reprojection_residual(k, &pose, pw, pi);
            let (j, _) = reprojection_jacobians(k, &pose, pw);
            h += j.transpose() * j;
            b -= j.transpose() * r;
        }

        let Some(delta) = h.cholesky().map(|c| c.solve(&b)) else {
            break;
        };
        let candidate = pose.perturbed(&delta);
        let candidate_error = cost(&candidate);
        if !(candidate_error < error) {
            break;
        }
        pose = candidate;
        error = candidate_error;
    }

    pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::projection::project;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn scene(pose: &SE3, n: usize, seed: u64) -> (Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
        let k = intrinsics();
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let pw = Vector3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(5.0..10.0),
                );
                let uv = project(&k, &pose.transform_point(&pw));
                (pw, uv)
            })
            .unzip()
    }

    fn true_pose() -> SE3 {
        SE3::from_axis_angle(&Vector3::new(0.05, -0.1, 0.02), Vector3::new(0.3, -0.1, 0.2))
    }

    #[test]
    fn test_dlt_recovers_exact_pose() {
        let pose = true_pose();
        let (pw, uv) = scene(&pose, 12, 1);

        let est = solve_pnp_dlt(&pw, &uv, &intrinsics()).unwrap();
        assert_relative_eq!(est.rotation_matrix(), pose.rotation_matrix(), epsilon = 1e-6);
        assert_relative_eq!(est.translation, pose.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_dlt_needs_six_points() {
        let pose = true_pose();
        let (pw, uv) = scene(&pose, 5, 2);

        let err = solve_pnp_dlt(&pw, &uv, &intrinsics()).unwrap_err();
        assert!(matches!(err, VoError::InsufficientInliers { found: 5, .. }));
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let pose = true_pose();
        let (pw, mut uv) = scene(&pose, 60, 3);
        for p in uv.iter_mut().take(12) {
            *p += Vector2::new(80.0, -60.0);
        }

        let result = solve_pnp_ransac(&pw, &uv, &intrinsics(), &PnpConfig::default()).unwrap();
        assert_eq!(result.num_inliers(), 48);
        assert!(result.inlier_mask[..12].iter().all(|&b| !b));
        assert_relative_eq!(result.pose.translation, pose.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_ransac_handles_planar_scene() {
        let k = intrinsics();
        let pose = true_pose();
        let mut rng = StdRng::seed_from_u64(5);
        let (pw, mut uv): (Vec<_>, Vec<_>) = (0..200)
            .map(|_| {
                let pw = Vector3::new(rng.gen_range(-3.0..3.0), rng.gen_range(-2.0..2.0), 6.0);
                (pw, project(&k, &pose.transform_point(&pw)))
            })
            .unzip();
        for p in uv.iter_mut().take(20) {
            *p += Vector2::new(-50.0, 70.0);
        }

        let result = solve_pnp_ransac(&pw, &uv, &k, &PnpConfig::default()).unwrap();
        assert_eq!(result.num_inliers(), 180);
        assert!(result.inlier_mask[..20].iter().all(|&b| !b));
        assert_relative_eq!(result.pose.rotation_matrix(), pose.rotation_matrix(), epsilon = 1e-6);
        assert_relative_eq!(result.pose.translation, pose.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_ransac_needs_four_points() {
        let pose = true_pose();
        let (pw, uv) = scene(&pose, 3, 6);

        let err = solve_pnp_ransac(&pw, &uv, &intrinsics(), &PnpConfig::default()).unwrap_err();
        assert_eq!(err, VoError::InsufficientInliers { found: 3, required: 4 });
    }

    #[test]
    fn test_refine_reduces_error_from_perturbed_start() {
        let k = intrinsics();
        let pose = true_pose();
        let (pw, uv) = scene(&pose, 30, 4);
        let start = pose.perturbed(&Vector6::new(0.01, -0.01, 0.005, 0.05, 0.02, -0.03));

        let refined = refine_pose(&start, &pw, &uv, &k, 20);
        assert_relative_eq!(refined.translation, pose.translation, epsilon = 1e-6);
    }
}
