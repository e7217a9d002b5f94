//! Bundle adjustment problem layout.
//!
//! [`IndexConverter`] compacts keyframe and point ids into dense parameter
//! indices (first-seen order) and records one [`BaObservation`] per
//! keypoint-point binding. [`BundleState`] holds the parameter values the
//! solvers update.

use std::collections::HashMap;

use nalgebra::{Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3};
use rayon::prelude::*;

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::geometry::projection::{reprojection_jacobians, reprojection_residual};
use crate::geometry::SE3;

use super::robust::Robustifier;

/// One observation of a point by a pose, in dense indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaObservation {
    pub pose_index: usize,
    pub point_index: usize,
    /// Observed keypoint in pixels.
    pub keypoint: Vector2<f64>,
}

/// Dense re-indexing of the keyframes and points taking part in BA.
#[derive(Debug, Clone, Default)]
pub struct IndexConverter {
    keyframe_ids: Vec<KeyFrameId>,
    keyframe_index: HashMap<KeyFrameId, usize>,
    point_ids: Vec<MapPointId>,
    point_index: HashMap<MapPointId, usize>,
    observations: Vec<BaObservation>,
}

impl IndexConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_keyframe(&mut self, kf_id: KeyFrameId) -> usize {
        if let Some(&index) = self.keyframe_index.get(&kf_id) {
            return index;
        }
        let index = self.keyframe_ids.len();
        self.keyframe_ids.push(kf_id);
        self.keyframe_index.insert(kf_id, index);
        index
    }

    fn add_point(&mut self, point_id: MapPointId) -> usize {
        if let Some(&index) = self.point_index.get(&point_id) {
            return index;
        }
        let index = self.point_ids.len();
        self.point_ids.push(point_id);
        self.point_index.insert(point_id, index);
        index
    }

    /// Record that `kf_id` observes `point_id` at `keypoint` (pixels).
    pub fn add(&mut self, kf_id: KeyFrameId, point_id: MapPointId, keypoint: Vector2<f64>) {
        let pose_index = self.add_keyframe(kf_id);
        let point_index = self.add_point(point_id);
        self.observations.push(BaObservation {
            pose_index,
            point_index,
            keypoint,
        });
    }

    pub fn observations(&self) -> &[BaObservation] {
        &self.observations
    }

    /// Keyframe id of each pose index.
    pub fn keyframe_ids(&self) -> &[KeyFrameId] {
        &self.keyframe_ids
    }

    /// Point id of each point index.
    pub fn point_ids(&self) -> &[MapPointId] {
        &self.point_ids
    }

    pub fn pose_index_of(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.keyframe_index.get(&kf_id).copied()
    }

    pub fn point_index_of(&self, point_id: MapPointId) -> Option<usize> {
        self.point_index.get(&point_id).copied()
    }
}

/// Parameter values of a bundle adjustment problem.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleState {
    pub poses: Vec<SE3>,
    pub points: Vec<Vector3<f64>>,
}

/// Linearization of one observation.
#[derive(Debug, Clone, Copy)]
pub struct ObservationBlock {
    pub residual: Vector2<f64>,
    pub j_pose: Matrix2x6<f64>,
    pub j_point: Matrix2x3<f64>,
}

fn linearize_one(k: &Matrix3<f64>, state: &BundleState, obs: &BaObservation) -> ObservationBlock {
    let pose = &state.poses[obs.pose_index];
    let point = &state.points[obs.point_index];
    let (j_pose, j_point) = reprojection_jacobians(k, pose, point);
    ObservationBlock {
        residual: reprojection_residual(k, pose, point, &obs.keypoint),
        j_pose,
        j_point,
    }
}

/// Residuals and Jacobian blocks of every observation, in observation order.
pub fn linearize(
    k: &Matrix3<f64>,
    state: &BundleState,
    observations: &[BaObservation],
    parallel: bool,
) -> Vec<ObservationBlock> {
    if parallel {
        observations
            .par_iter()
            .map(|obs| linearize_one(k, state, obs))
            .collect()
    } else {
        observations
            .iter()
            .map(|obs| linearize_one(k, state, obs))
            .collect()
    }
}

/// Total robustified reprojection error `Σ ρ(‖r‖²)`.
pub fn total_error(
    k: &Matrix3<f64>,
    state: &BundleState,
    observations: &[BaObservation],
    robustifier: &dyn Robustifier,
) -> f64 {
    observations
        .iter()
        .map(|obs| {
            let r = reprojection_residual(
                k,
                &state.poses[obs.pose_index],
                &state.points[obs.point_index],
                &obs.keypoint,
            );
            robustifier.rho(r.norm_squared())
        })
        .sum()
}
