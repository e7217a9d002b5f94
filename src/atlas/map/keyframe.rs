//! KeyFrame - a posed image whose keypoints anchor map points.

use nalgebra::{Vector2, Vector3};

use crate::geometry::SE3;
use crate::tracking::frame::Features;

use super::correspondence::Correspondence;
use super::types::{KeyFrameId, MapPointId};

/// A keyframe of the reconstruction.
///
/// Keyframes are never deleted; leaving the active window only excludes them
/// from further matching and optimization.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    /// Unique identifier for this KeyFrame.
    pub id: KeyFrameId,

    /// Pose: transform from world to camera (T_cw).
    /// To transform a point from world to camera: p_cam = pose.transform_point(p_world)
    pub pose: SE3,

    /// Normalized, undistorted keypoints with their descriptors and colors.
    pub features: Features,

    /// Keypoint index ↔ MapPoint bindings.
    pub correspondence: Correspondence,
}

impl KeyFrame {
    pub fn new(id: KeyFrameId, pose: SE3, features: Features) -> Self {
        Self {
            id,
            pose,
            features,
            correspondence: Correspondence::new(),
        }
    }

    pub fn num_keypoints(&self) -> usize {
        self.features.len()
    }

    /// Normalized coordinates of keypoint `index`.
    pub fn keypoint(&self, index: usize) -> Option<&Vector2<f64>> {
        self.features.keypoints.get(index)
    }

    /// MapPoint observed at keypoint `index`, if any.
    pub fn get_map_point(&self, index: usize) -> Option<MapPointId> {
        self.correspondence.point_for(index)
    }

    /// Number of keypoints bound to a map point.
    pub fn num_map_points(&self) -> usize {
        self.correspondence.len()
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.camera_center()
    }
}
