//! Pose estimation of a new keyframe against existing structure.
//!
//! Collects 2D-3D pairs from the matches whose source keypoint is already
//! bound to a map point, then solves PnP with RANSAC.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::{Map, MapPointId};
use crate::error::VoError;
use crate::geometry::projection::to_pixel;
use crate::geometry::{solve_pnp_ransac, PnpConfig, SE3};
use crate::local_mapping::triangulation::SourceMatches;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseEstimationConfig {
    /// Minimum 2D-3D pairs before attempting PnP.
    pub min_correspondences: usize,
    /// Minimum RANSAC inliers for the pose to be accepted.
    pub min_inliers: usize,
    pub pnp: PnpConfig,
}

impl Default for PoseEstimationConfig {
    fn default() -> Self {
        Self {
            min_correspondences: 6,
            min_inliers: 10,
            pnp: PnpConfig::default(),
        }
    }
}

/// Accepted pose of a new keyframe.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    pub pose: SE3,
    pub num_correspondences: usize,
    pub num_inliers: usize,
}

/// 2D-3D correspondences gathered from all sources.
///
/// Returns `(point ids, new-keyframe keypoint indices)`. A keypoint of the
/// new keyframe contributes once, through the first source that maps it.
pub fn collect_correspondences(map: &Map, sources: &[SourceMatches]) -> (Vec<MapPointId>, Vec<usize>) {
    let mut point_ids = Vec::new();
    let mut indices = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for src in sources {
        let Some(kf) = map.get_keyframe(src.keyframe_id) else {
            continue;
        };
        let (ids, idx) = kf.correspondence.indices_for_matches(&src.matches);
        for (id, i) in ids.into_iter().zip(idx) {
            if seen.insert(i) {
                point_ids.push(id);
                indices.push(i);
            }
        }
    }

    (point_ids, indices)
}

/// Estimate the world-to-camera pose of a keyframe with normalized
/// `keypoints`, matched to active keyframes through `sources`.
pub fn estimate_pose(
    map: &Map,
    sources: &[SourceMatches],
    keypoints: &[Vector2<f64>],
    k: &Matrix3<f64>,
    config: &PoseEstimationConfig,
) -> Result<PoseEstimate, VoError> {
    let (point_ids, indices) = collect_correspondences(map, sources);

    let (points3d, points2d): (Vec<Vector3<f64>>, Vec<Vector2<f64>>) = point_ids
        .iter()
        .zip(&indices)
        .filter_map(|(id, &i)| {
            let position = map.get_map_point(*id)?.position;
            let keypoint = keypoints.get(i)?;
            Some((position, to_pixel(k, keypoint)))
        })
        .unzip();

    let required = config.min_correspondences.max(crate::geometry::pnp::MIN_RANSAC_POINTS);
    if points3d.len() < required {
        return Err(VoError::InsufficientInliers {
            found: points3d.len(),
            required,
        });
    }

    let result = solve_pnp_ransac(&points3d, &points2d, k, &config.pnp)?;
    let num_inliers = result.num_inliers();
    debug!(
        correspondences = points3d.len(),
        inliers = num_inliers,
        "pose estimation"
    );

    if num_inliers < config.min_inliers {
        return Err(VoError::InsufficientInliers {
            found: num_inliers,
            required: config.min_inliers,
        });
    }

    Ok(PoseEstimate {
        pose: result.pose,
        num_correspondences: points3d.len(),
        num_inliers,
    })
}
