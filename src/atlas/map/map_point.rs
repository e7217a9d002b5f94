//! MapPoint - a triangulated 3D landmark.

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point.
#[derive(Debug, Clone, PartialEq)]
pub struct MapPoint {
    /// Unique identifier for this MapPoint.
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// RGB sampled at the keypoint that created the point.
    pub color: Option<[u8; 3]>,

    /// KeyFrame whose insertion created this MapPoint.
    pub first_kf_id: KeyFrameId,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        color: Option<[u8; 3]>,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            color,
            first_kf_id,
        }
    }

    /// Color scaled to `[0, 1]`; black when no sample was taken.
    pub fn normalized_color(&self) -> [f64; 3] {
        match self.color {
            Some([r, g, b]) => [r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0],
            None => [0.0; 3],
        }
    }
}
