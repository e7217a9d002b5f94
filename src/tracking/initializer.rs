//! Two-view initialization from epipolar geometry.
//!
//! Estimates the fundamental matrix from matched pixels, lifts it to the
//! essential matrix, and picks the one decomposition that puts every
//! triangulated point in front of both cameras. The first view is the
//! reference frame and the translation has unit norm.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VoError;
use crate::geometry::epipolar::{
    estimate_fundamental, extract_pose_candidates, fundamental_conditioning,
    fundamental_to_essential, PoseCandidate,
};
use crate::geometry::{triangulate_points, SE3};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializerConfig {
    /// Smallest accepted median angle (radians) between the two viewing
    /// rays of the triangulated points. Below it the baseline is too short
    /// for the translation to be observable.
    pub min_median_parallax: f64,
    /// Smallest accepted second-smallest/largest singular value ratio of the
    /// eight-point system. Below it the epipolar geometry is not unique.
    pub min_conditioning: f64,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            min_median_parallax: 1.0_f64.to_radians(),
            min_conditioning: 1e-8,
        }
    }
}

/// Relative pose of the second view and the structure it implies.
#[derive(Debug, Clone)]
pub struct TwoViewResult {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// One point per input pair, in the first camera's frame.
    pub points: Vec<Vector3<f64>>,
}

impl TwoViewResult {
    /// Pose of the second view as a world-to-camera transform.
    pub fn pose(&self) -> SE3 {
        SE3::from_rt(self.rotation, self.translation)
    }
}

/// Triangulate all pairs for one candidate.
///
/// Returns the points only if every pair triangulates strictly in front of
/// both cameras.
pub fn structure_from_candidate(
    candidate: &PoseCandidate,
    keypoints0: &[Vector2<f64>],
    keypoints1: &[Vector2<f64>],
    k: &Matrix3<f64>,
) -> Option<Vec<Vector3<f64>>> {
    let pose0 = SE3::identity();
    let pose1 = SE3::from_rt(candidate.rotation, candidate.translation);

    triangulate_points(&pose0, &pose1, k, keypoints0, keypoints1)
        .into_iter()
        .map(|tri| tri.filter(|t| t.in_front(0.0)).map(|t| t.position))
        .collect()
}

/// Median angle between the rays from both camera centers to `points`
/// (first camera at the origin).
pub fn median_parallax(candidate: &PoseCandidate, points: &[Vector3<f64>]) -> f64 {
    let center1 = -(candidate.rotation.transpose() * candidate.translation);
    let mut angles: Vec<f64> = points
        .iter()
        .map(|p| {
            let ray1 = p - center1;
            let cos = p.dot(&ray1) / (p.norm() * ray1.norm());
            cos.clamp(-1.0, 1.0).acos()
        })
        .collect();
    if angles.is_empty() {
        return 0.0;
    }
    angles.sort_by(f64::total_cmp);
    angles[angles.len() / 2]
}

/// Recover the relative pose and structure of two views.
///
/// `keypoints0[i]` and `keypoints1[i]` are the pixel coordinates of the i-th
/// matched pair. Fails with [`VoError::InsufficientInliers`] for fewer than
/// eight pairs and with [`VoError::AmbiguousInitialization`] unless exactly
/// one of the four candidates passes the cheirality check. Pairs that leave
/// the eight-point system rank deficient (pure rotation, a dominant plane)
/// and winners whose median parallax is below `config.min_median_parallax`
/// are rejected as [`VoError::Degenerate`].
pub fn initialize_two_view(
    keypoints0: &[Vector2<f64>],
    keypoints1: &[Vector2<f64>],
    k: &Matrix3<f64>,
    config: &InitializerConfig,
) -> Result<TwoViewResult, VoError> {
    let conditioning = fundamental_conditioning(keypoints0, keypoints1)?;
    if conditioning < config.min_conditioning {
        return Err(VoError::Degenerate(
            "correspondences do not determine a unique epipolar geometry",
        ));
    }

    let f = estimate_fundamental(keypoints0, keypoints1)?;
    let e = fundamental_to_essential(&f, k, k);
    let candidates = extract_pose_candidates(&e)?;

    let valid: Vec<(PoseCandidate, Vec<Vector3<f64>>)> = candidates
        .iter()
        .filter_map(|c| structure_from_candidate(c, keypoints0, keypoints1, k).map(|pts| (*c, pts)))
        .collect();

    debug!(pairs = keypoints0.len(), valid = valid.len(), "two-view cheirality check");

    let (candidate, points) = match <[_; 1]>::try_from(valid) {
        Ok([winner]) => winner,
        Err(valid) => return Err(VoError::AmbiguousInitialization { valid: valid.len() }),
    };

    let parallax = median_parallax(&candidate, &points);
    debug!(median_parallax_deg = parallax.to_degrees(), "two-view parallax");
    if !(parallax >= config.min_median_parallax) {
        return Err(VoError::Degenerate("two-view baseline too short for initialization"));
    }

    Ok(TwoViewResult {
        rotation: candidate.rotation,
        translation: candidate.translation,
        points,
    })
}
