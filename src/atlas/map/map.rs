//! Map - Container for KeyFrames and MapPoints.
//!
//! Storage is an arena: keyframes and points live in dense vectors in
//! insertion order, addressed through id → slot indices. Nothing is ever
//! removed, so slots stay valid for the lifetime of the map.
//!
//! The map also acts as the correspondence store: every keyframe-scoped
//! correspondence operation goes through it by [`KeyFrameId`].

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::tracking::frame::Features;

use super::correspondence::Correspondence;
use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId, PointIdGenerator};

/// The reconstruction: keyframes, map points and their bindings.
#[derive(Debug, Clone, Default)]
pub struct Map {
    keyframes: Vec<KeyFrame>,
    keyframe_slots: HashMap<KeyFrameId, usize>,

    map_points: Vec<MapPoint>,
    map_point_slots: HashMap<MapPointId, usize>,

    /// Counter for generating unique KeyFrame IDs.
    next_kf_id: u64,

    /// Source of MapPoint IDs.
    point_ids: PointIdGenerator,
}

impl Map {
    /// Create a new empty Map.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    /// Id the next inserted keyframe will receive.
    pub fn next_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.next_kf_id)
    }

    /// Scratch copy of the point id counter.
    ///
    /// Ids drawn from it become reserved once it is passed back through
    /// [`commit_point_ids`](Self::commit_point_ids).
    pub fn point_id_generator(&self) -> PointIdGenerator {
        self.point_ids.clone()
    }

    pub fn commit_point_ids(&mut self, generator: PointIdGenerator) {
        if generator.issued() > self.point_ids.issued() {
            self.point_ids = generator;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a keyframe with the next id and an empty correspondence map.
    pub fn create_keyframe(&mut self, pose: SE3, features: Features) -> KeyFrameId {
        let id = self.next_keyframe_id();
        self.next_kf_id += 1;
        self.keyframe_slots.insert(id, self.keyframes.len());
        self.keyframes.push(KeyFrame::new(id, pose, features));
        id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframe_slots.get(&id).map(|&slot| &self.keyframes[slot])
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        let slot = *self.keyframe_slots.get(&id)?;
        self.keyframes.get_mut(slot)
    }

    /// All keyframes in id order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.iter()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a point under an id drawn from this map's generator.
    ///
    /// Re-inserting an existing id overwrites its position and color.
    pub fn add_map_point(&mut self, mp: MapPoint) {
        if let Some(&slot) = self.map_point_slots.get(&mp.id) {
            self.map_points[slot] = mp;
            return;
        }
        self.map_point_slots.insert(mp.id, self.map_points.len());
        self.map_points.push(mp);
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_point_slots.get(&id).map(|&slot| &self.map_points[slot])
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        let slot = *self.map_point_slots.get(&id)?;
        self.map_points.get_mut(slot)
    }

    /// All map points in creation order.
    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.iter()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Correspondences
    // ─────────────────────────────────────────────────────────────────────────

    /// Bind keypoint `feature_idx` of `kf_id` to `mp_id`.
    ///
    /// Returns false if either the keyframe or the point is unknown.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        if !self.map_point_slots.contains_key(&mp_id) {
            return false;
        }
        match self.get_keyframe_mut(kf_id) {
            Some(kf) => {
                kf.correspondence.set(feature_idx, mp_id);
                true
            }
            None => false,
        }
    }

    pub fn point_for(&self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        self.get_keyframe(kf_id)?.correspondence.point_for(feature_idx)
    }

    pub fn is_associated(&self, kf_id: KeyFrameId, feature_idx: usize) -> bool {
        self.point_for(kf_id, feature_idx).is_some()
    }

    /// Merge `other` into the correspondence map of `kf_id`.
    pub fn merge_correspondence(&mut self, kf_id: KeyFrameId, other: &Correspondence) -> bool {
        match self.get_keyframe_mut(kf_id) {
            Some(kf) => {
                kf.correspondence.merge_from(other);
                true
            }
            None => false,
        }
    }

    /// Indices of `kf_id` that still lack a point; unknown keyframes need
    /// triangulation everywhere.
    pub fn triangulation_required(&self, kf_id: KeyFrameId, feature_indices: &[usize]) -> Vec<bool> {
        match self.get_keyframe(kf_id) {
            Some(kf) => kf.correspondence.triangulation_required(feature_indices),
            None => vec![true; feature_indices.len()],
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Export
    // ─────────────────────────────────────────────────────────────────────────

    /// Positions and `[0, 1]` colors of every point.
    pub fn export_points(&self) -> (Vec<Vector3<f64>>, Vec<[f64; 3]>) {
        self.map_points
            .iter()
            .map(|mp| (mp.position, mp.normalized_color()))
            .unzip()
    }

    /// Poses of every keyframe, ordered by id.
    pub fn export_poses(&self) -> Vec<SE3> {
        let mut keyframes: Vec<&KeyFrame> = self.keyframes.iter().collect();
        keyframes.sort_by_key(|kf| kf.id);
        keyframes.into_iter().map(|kf| kf.pose.clone()).collect()
    }
}
