//! Keypoint ↔ MapPoint correspondence maps.
//!
//! Each keyframe owns one [`Correspondence`]: a bijection between indices of
//! its keypoints and the ids of the map points they observe. A keypoint is
//! bound to at most one point and a point to at most one keypoint of the
//! same keyframe.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::error::VoError;
use crate::tracking::matching::Match;

use super::types::MapPointId;

/// Bijective keypoint-index ↔ MapPointId map of a single keyframe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correspondence {
    point_by_keypoint: BTreeMap<usize, MapPointId>,
    keypoint_by_point: HashMap<MapPointId, usize>,
}

impl Correspondence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(keypoint index, point id)` pairs; later pairs win.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (usize, MapPointId)>,
    {
        let mut map = Self::new();
        for (index, point_id) in pairs {
            map.set(index, point_id);
        }
        map
    }

    /// Bind `keypoint_index` to `point_id`.
    ///
    /// Any previous binding of either side is dropped first so the map stays
    /// bijective.
    pub fn set(&mut self, keypoint_index: usize, point_id: MapPointId) {
        if let Some(old_point) = self.point_by_keypoint.remove(&keypoint_index) {
            self.keypoint_by_point.remove(&old_point);
        }
        if let Some(old_index) = self.keypoint_by_point.remove(&point_id) {
            self.point_by_keypoint.remove(&old_index);
        }
        self.point_by_keypoint.insert(keypoint_index, point_id);
        self.keypoint_by_point.insert(point_id, keypoint_index);
    }

    /// Drop the binding of a keypoint, returning the point it referred to.
    pub fn remove_keypoint(&mut self, keypoint_index: usize) -> Option<MapPointId> {
        let point_id = self.point_by_keypoint.remove(&keypoint_index)?;
        self.keypoint_by_point.remove(&point_id);
        Some(point_id)
    }

    pub fn point_for(&self, keypoint_index: usize) -> Option<MapPointId> {
        self.point_by_keypoint.get(&keypoint_index).copied()
    }

    pub fn keypoint_for(&self, point_id: MapPointId) -> Option<usize> {
        self.keypoint_by_point.get(&point_id).copied()
    }

    pub fn exists(&self, keypoint_index: usize) -> bool {
        self.point_by_keypoint.contains_key(&keypoint_index)
    }

    pub fn contains_point(&self, point_id: MapPointId) -> bool {
        self.keypoint_by_point.contains_key(&point_id)
    }

    pub fn len(&self) -> usize {
        self.point_by_keypoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_by_keypoint.is_empty()
    }

    /// Bindings in ascending keypoint order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.point_by_keypoint.iter().map(|(&i, &p)| (i, p))
    }

    /// Union with `other`; entries of `other` win on collisions.
    pub fn merge(&self, other: &Correspondence) -> Correspondence {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// In-place form of [`merge`](Self::merge).
    pub fn merge_from(&mut self, other: &Correspondence) {
        for (index, point_id) in other.iter() {
            self.set(index, point_id);
        }
    }

    /// For each index, whether it still lacks a point.
    pub fn triangulation_required(&self, keypoint_indices: &[usize]) -> Vec<bool> {
        keypoint_indices.iter().map(|&i| !self.exists(i)).collect()
    }

    /// For each index, whether it already has a point to copy.
    pub fn copy_required(&self, keypoint_indices: &[usize]) -> Vec<bool> {
        keypoint_indices.iter().map(|&i| self.exists(i)).collect()
    }

    pub fn point_ids_for(&self, keypoint_indices: &[usize]) -> Vec<Option<MapPointId>> {
        keypoint_indices.iter().map(|&i| self.point_for(i)).collect()
    }

    /// Split matches whose first index has a point into
    /// `(point ids, second indices)`.
    pub fn indices_for_matches(&self, matches: &[Match]) -> (Vec<MapPointId>, Vec<usize>) {
        matches
            .iter()
            .filter_map(|&(index_a, index_b)| self.point_for(index_a).map(|p| (p, index_b)))
            .unzip()
    }
}

/// Check that a matched pair does not tie two different existing points
/// together.
///
/// Pairs where either side is unbound are consistent. A conflict is logged
/// and returned; neither map is modified.
pub fn check_match_consistency(
    map_a: &Correspondence,
    map_b: &Correspondence,
    index_a: usize,
    index_b: usize,
) -> Result<(), VoError> {
    match (map_a.point_for(index_a), map_b.point_for(index_b)) {
        (Some(point_a), Some(point_b)) if point_a != point_b => {
            warn!(
                index_a,
                index_b,
                %point_a,
                %point_b,
                "matched keypoints are bound to different map points"
            );
            Err(VoError::InconsistentCorrespondence {
                index_a,
                index_b,
                point_a,
                point_b,
            })
        }
        _ => Ok(()),
    }
}

/// Build the pair of maps that registers freshly created points.
///
/// `point_ids[i]` is the point triangulated from `matches[i]`.
pub fn subscribe(point_ids: &[MapPointId], matches: &[Match]) -> (Correspondence, Correspondence) {
    let map_a = Correspondence::from_pairs(
        point_ids.iter().zip(matches).map(|(&p, &(index_a, _))| (index_a, p)),
    );
    let map_b = Correspondence::from_pairs(
        point_ids.iter().zip(matches).map(|(&p, &(_, index_b))| (index_b, p)),
    );
    (map_a, map_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(id: u64) -> MapPointId {
        MapPointId::new(id)
    }

    fn is_bijective(map: &Correspondence) -> bool {
        map.iter()
            .all(|(index, point)| map.keypoint_for(point) == Some(index))
            && map.keypoint_by_point.len() == map.point_by_keypoint.len()
    }

    #[test]
    fn test_set_rebinds_both_sides() {
        let mut map = Correspondence::new();
        map.set(0, mp(10));
        map.set(1, mp(11));

        // Point 10 moves to keypoint 1, evicting point 11.
        map.set(1, mp(10));
        assert_eq!(map.point_for(0), None);
        assert_eq!(map.point_for(1), Some(mp(10)));
        assert!(!map.contains_point(mp(11)));
        assert_eq!(map.len(), 1);
        assert!(is_bijective(&map));
    }

    #[test]
    fn test_random_set_sequence_stays_bijective() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(8);
        let mut map = Correspondence::new();
        // Reference model: the pairs that must survive, in no particular order.
        let mut expected: Vec<(usize, MapPointId)> = Vec::new();

        for _ in 0..1000 {
            let index = rng.gen_range(0..16);
            if rng.gen_bool(0.1) {
                let removed = map.remove_keypoint(index);
                let position = expected.iter().position(|&(i, _)| i == index);
                assert_eq!(removed, position.map(|pos| expected.swap_remove(pos).1));
            } else {
                let point = mp(rng.gen_range(0..16));
                map.set(index, point);
                expected.retain(|&(i, p)| i != index && p != point);
                expected.push((index, point));
                assert_eq!(map.point_for(index), Some(point));
                assert_eq!(map.keypoint_for(point), Some(index));
            }

            assert!(is_bijective(&map));
            assert_eq!(map.len(), expected.len());
            assert!(expected.iter().all(|&(i, p)| map.point_for(i) == Some(p)));
        }
    }

    #[test]
    fn test_merge_later_wins_and_stays_bijective() {
        let a = Correspondence::from_pairs([(0, mp(1)), (1, mp(2)), (2, mp(3))]);
        let b = Correspondence::from_pairs([(1, mp(7)), (5, mp(3))]);

        let merged = a.merge(&b);
        assert_eq!(merged.point_for(0), Some(mp(1)));
        assert_eq!(merged.point_for(1), Some(mp(7)));
        assert_eq!(merged.point_for(2), None);
        assert_eq!(merged.point_for(5), Some(mp(3)));
        assert!(is_bijective(&merged));
    }

    #[test]
    fn test_required_masks() {
        let map = Correspondence::from_pairs([(0, mp(0)), (3, mp(1))]);

        assert_eq!(map.triangulation_required(&[0, 1, 2, 3]), vec![false, true, true, false]);
        assert_eq!(map.copy_required(&[0, 1, 2, 3]), vec![true, false, false, true]);
        assert_eq!(map.point_ids_for(&[3, 4]), vec![Some(mp(1)), None]);
    }

    #[test]
    fn test_indices_for_matches() {
        let map = Correspondence::from_pairs([(2, mp(20)), (4, mp(40))]);
        let matches = vec![(0, 9), (2, 7), (4, 1), (5, 3)];

        let (points, indices) = map.indices_for_matches(&matches);
        assert_eq!(points, vec![mp(20), mp(40)]);
        assert_eq!(indices, vec![7, 1]);
    }

    #[test]
    fn test_consistency_check() {
        let a = Correspondence::from_pairs([(0, mp(1)), (1, mp(2))]);
        let b = Correspondence::from_pairs([(5, mp(1)), (6, mp(3))]);

        assert!(check_match_consistency(&a, &b, 0, 5).is_ok());
        assert!(check_match_consistency(&a, &b, 1, 7).is_ok());
        assert_eq!(
            check_match_consistency(&a, &b, 1, 6),
            Err(VoError::InconsistentCorrespondence {
                index_a: 1,
                index_b: 6,
                point_a: mp(2),
                point_b: mp(3),
            })
        );
    }

    #[test]
    fn test_subscribe_registers_both_sides() {
        let (a, b) = subscribe(&[mp(4), mp(5)], &[(1, 8), (3, 2)]);

        assert_eq!(a.point_for(1), Some(mp(4)));
        assert_eq!(a.point_for(3), Some(mp(5)));
        assert_eq!(b.point_for(8), Some(mp(4)));
        assert_eq!(b.point_for(2), Some(mp(5)));
    }
}
