//! Incremental triangulation for a newly posed keyframe.
//!
//! For every active keyframe matched against the new one:
//! 1. Matches whose source keypoint already has a point copy that point id
//!    into the new keyframe's correspondence map
//! 2. The remaining matches are triangulated with the DLT using both poses
//! 3. Points in front of both cameras get fresh ids and are registered in
//!    both correspondence maps
//!
//! Nothing is written to the map here: the caller commits the output.

use std::collections::HashSet;

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::atlas::map::{
    check_match_consistency, Correspondence, KeyFrameId, Map, MapPointId, PointIdGenerator,
};
use crate::geometry::{triangulate_points, SE3};
use crate::tracking::matching::Match;

/// Configuration for incremental triangulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Points must be strictly deeper than this in both views.
    pub min_depth: f64,
    /// Minimum parallax angle in radians between the two viewing rays.
    pub min_parallax: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            min_depth: 0.0,
            min_parallax: 0.0,
        }
    }
}

/// Matches between one active keyframe (first index) and the new keyframe
/// (second index).
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMatches {
    pub keyframe_id: KeyFrameId,
    pub matches: Vec<Match>,
}

/// A point created by triangulation, not yet inserted in the map.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPoint {
    pub id: MapPointId,
    pub position: Vector3<f64>,
    /// Keypoint of the new keyframe the point was triangulated from.
    pub keypoint_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriangulationStats {
    pub num_copied: usize,
    pub num_triangulated: usize,
    pub num_rejected: usize,
    pub num_inconsistent: usize,
}

/// Everything the caller must commit after triangulation.
#[derive(Debug, Clone, Default)]
pub struct TriangulationOutput {
    pub new_points: Vec<NewPoint>,
    /// New bindings per source keyframe.
    pub source_maps: Vec<(KeyFrameId, Correspondence)>,
    /// Bindings of the new keyframe, copied and created.
    pub new_map: Correspondence,
    pub stats: TriangulationStats,
}

/// First-seen-wins deduplication.
///
/// A keypoint of the new keyframe is kept only in the first source that
/// matched it, and within a source each source keypoint is used once.
pub fn dedup_matches(sources: &[SourceMatches]) -> Vec<SourceMatches> {
    split_first_seen(sources)
        .into_iter()
        .map(|(kept, _)| kept)
        .collect()
}

/// [`dedup_matches`] that also returns, per source, the matches it dropped.
fn split_first_seen(sources: &[SourceMatches]) -> Vec<(SourceMatches, Vec<Match>)> {
    let mut seen_new: HashSet<usize> = HashSet::new();
    sources
        .iter()
        .map(|src| {
            let mut seen_source: HashSet<usize> = HashSet::new();
            let (kept, dropped): (Vec<Match>, Vec<Match>) =
                src.matches.iter().copied().partition(|&(a, b)| {
                    if seen_new.contains(&b) || seen_source.contains(&a) {
                        return false;
                    }
                    seen_new.insert(b);
                    seen_source.insert(a);
                    true
                });
            let kept = SourceMatches {
                keyframe_id: src.keyframe_id,
                matches: kept,
            };
            (kept, dropped)
        })
        .collect()
}

/// Split matches into `(triangulated, untriangulated)` by whether the source
/// keypoint already has a point.
pub fn separate(source_map: &Correspondence, matches: &[Match]) -> (Vec<Match>, Vec<Match>) {
    matches
        .iter()
        .copied()
        .partition(|&(a, _)| source_map.exists(a))
}

fn parallax(pose0: &SE3, pose1: &SE3, point: &Vector3<f64>) -> f64 {
    let ray0 = point - pose0.camera_center();
    let ray1 = point - pose1.camera_center();
    let cos = ray0.dot(&ray1) / (ray0.norm() * ray1.norm());
    cos.clamp(-1.0, 1.0).acos()
}

/// Copy existing points and triangulate new ones for the new keyframe.
///
/// `new_keypoints` are the normalized keypoints of the new keyframe and
/// `ids` supplies fresh point ids.
pub fn triangulate_new_keyframe(
    map: &Map,
    sources: &[SourceMatches],
    new_pose: &SE3,
    new_keypoints: &[Vector2<f64>],
    ids: &mut PointIdGenerator,
    config: &TriangulationConfig,
) -> TriangulationOutput {
    let mut output = TriangulationOutput::default();
    let identity = Matrix3::identity();

    let split = split_first_seen(sources);
    for (src, _) in &split {
        if src.matches.is_empty() {
            continue;
        }
        let Some(kf0) = map.get_keyframe(src.keyframe_id) else {
            continue;
        };

        let (triangulated, untriangulated) = separate(&kf0.correspondence, &src.matches);

        for &(a, b) in &triangulated {
            let Some(point_id) = kf0.correspondence.point_for(a) else {
                continue;
            };
            // The point may already be bound to another keypoint of the new
            // keyframe through an earlier source.
            if let Some(other) = output.new_map.keypoint_for(point_id) {
                if other != b {
                    warn!(
                        keyframe = %src.keyframe_id,
                        point = %point_id,
                        bound_keypoint = other,
                        keypoint = b,
                        "point already bound to another keypoint of the new keyframe"
                    );
                    output.stats.num_inconsistent += 1;
                    continue;
                }
            }
            output.new_map.set(b, point_id);
            output.stats.num_copied += 1;
        }

        if untriangulated.is_empty() {
            continue;
        }

        let kp0: Vec<_> = untriangulated
            .iter()
            .filter_map(|&(a, _)| kf0.keypoint(a).copied())
            .collect();
        let kp1: Vec<_> = untriangulated
            .iter()
            .filter_map(|&(_, b)| new_keypoints.get(b).copied())
            .collect();
        if kp0.len() != untriangulated.len() || kp1.len() != untriangulated.len() {
            warn!(keyframe = %src.keyframe_id, "matches reference keypoints out of range");
            continue;
        }

        let results = triangulate_points(&kf0.pose, new_pose, &identity, &kp0, &kp1);
        let mut source_map = Correspondence::new();
        for (&(a, b), tri) in untriangulated.iter().zip(results) {
            let accepted = tri.filter(|t| {
                t.in_front(config.min_depth)
                    && parallax(&kf0.pose, new_pose, &t.position) >= config.min_parallax
            });
            let Some(t) = accepted else {
                output.stats.num_rejected += 1;
                continue;
            };

            let id = ids.generate();
            source_map.set(a, id);
            output.new_map.set(b, id);
            output.new_points.push(NewPoint {
                id,
                position: t.position,
                keypoint_index: b,
            });
            output.stats.num_triangulated += 1;
        }

        if !source_map.is_empty() {
            output.source_maps.push((src.keyframe_id, source_map));
        }
    }

    // Matches lost to first-seen-wins must still agree with the binding the
    // winning match gave their new keypoint.
    for (src, dropped) in &split {
        let Some(kf0) = map.get_keyframe(src.keyframe_id) else {
            continue;
        };
        for &(a, b) in dropped {
            if check_match_consistency(&kf0.correspondence, &output.new_map, a, b).is_err() {
                output.stats.num_inconsistent += 1;
            }
        }
    }

    debug!(
        copied = output.stats.num_copied,
        triangulated = output.stats.num_triangulated,
        rejected = output.stats.num_rejected,
        inconsistent = output.stats.num_inconsistent,
        "incremental triangulation"
    );

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::MapPoint;
    use crate::geometry::projection::project;
    use crate::tracking::frame::Features;
    use approx::assert_relative_eq;

    fn normalized(pose: &SE3, p: &Vector3<f64>) -> Vector2<f64> {
        project(&Matrix3::identity(), &pose.transform_point(p))
    }

    fn features(keypoints: Vec<Vector2<f64>>) -> Features {
        let n = keypoints.len();
        Features::new(keypoints, vec![Vec::new(); n])
    }

    fn scene() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(1.0, -0.5, 6.0),
            Vector3::new(-1.0, 0.5, 4.0),
            Vector3::new(0.5, 1.0, 7.0),
        ]
    }

    #[test]
    fn test_dedup_first_seen_wins() {
        let sources = vec![
            SourceMatches { keyframe_id: KeyFrameId::new(0), matches: vec![(0, 5), (1, 6), (2, 6)] },
            SourceMatches { keyframe_id: KeyFrameId::new(1), matches: vec![(3, 5), (4, 7), (4, 8)] },
        ];

        let deduped = dedup_matches(&sources);
        assert_eq!(deduped[0].matches, vec![(0, 5), (1, 6)]);
        assert_eq!(deduped[1].matches, vec![(4, 7)]);
    }

    #[test]
    fn test_separate_by_source_map() {
        let map = Correspondence::from_pairs([(1, MapPointId::new(9))]);
        let (done, todo) = separate(&map, &[(0, 3), (1, 4), (2, 5)]);

        assert_eq!(done, vec![(1, 4)]);
        assert_eq!(todo, vec![(0, 3), (2, 5)]);
    }

    #[test]
    fn test_copies_existing_and_triangulates_new() {
        let points = scene();
        let pose0 = SE3::identity();
        let pose1 = SE3::from_axis_angle(&Vector3::new(0.0, 0.05, 0.0), Vector3::new(-0.5, 0.0, 0.0));

        let mut map = Map::new();
        let kf0 = map.create_keyframe(
            pose0.clone(),
            features(points.iter().map(|p| normalized(&pose0, p)).collect()),
        );
        let mut ids = map.point_id_generator();
        let existing = ids.generate();
        map.add_map_point(MapPoint::new(existing, points[0], None, kf0));
        map.commit_point_ids(ids);
        map.associate(kf0, 0, existing);

        // The new keyframe lists the same points in reverse order.
        let kp1: Vec<_> = points.iter().rev().map(|p| normalized(&pose1, p)).collect();
        let sources = vec![SourceMatches {
            keyframe_id: kf0,
            matches: vec![(0, 3), (1, 2), (2, 1), (3, 0)],
        }];

        let mut ids = map.point_id_generator();
        let output = triangulate_new_keyframe(
            &map,
            &sources,
            &pose1,
            &kp1,
            &mut ids,
            &TriangulationConfig::default(),
        );

        assert_eq!(output.stats.num_copied, 1);
        assert_eq!(output.stats.num_triangulated, 3);
        assert_eq!(output.new_map.point_for(3), Some(existing));
        assert_eq!(output.new_map.len(), 4);

        let (src_id, src_map) = &output.source_maps[0];
        assert_eq!(*src_id, kf0);
        for new_point in &output.new_points {
            let a = src_map.keypoint_for(new_point.id).unwrap();
            assert_eq!(output.new_map.point_for(new_point.keypoint_index), Some(new_point.id));
            assert_relative_eq!(new_point.position, points[a], epsilon = 1e-8);
        }
        assert_eq!(ids.issued(), 4);
    }

    #[test]
    fn test_rejects_points_behind_camera() {
        let pose0 = SE3::identity();
        let pose1 = SE3::from_axis_angle(&Vector3::zeros(), Vector3::new(-0.5, 0.0, 0.0));
        let behind = Vector3::new(0.2, 0.1, -5.0);

        let mut map = Map::new();
        let kf0 = map.create_keyframe(pose0.clone(), features(vec![normalized(&pose0, &behind)]));
        let sources = vec![SourceMatches { keyframe_id: kf0, matches: vec![(0, 0)] }];

        let mut ids = map.point_id_generator();
        let output = triangulate_new_keyframe(
            &map,
            &sources,
            &pose1,
            &[normalized(&pose1, &behind)],
            &mut ids,
            &TriangulationConfig::default(),
        );

        assert!(output.new_points.is_empty());
        assert!(output.source_maps.is_empty());
        assert_eq!(output.stats.num_rejected, 1);
        assert_eq!(ids.issued(), 0);
    }

    #[test]
    fn test_conflicting_copies_are_reported_not_overwritten() {
        let pose = SE3::identity();
        let mut map = Map::new();
        let kf0 = map.create_keyframe(pose.clone(), features(vec![Vector2::zeros(); 2]));
        let kf1 = map.create_keyframe(pose.clone(), features(vec![Vector2::zeros(); 2]));
        let mut ids = map.point_id_generator();
        let shared = ids.generate();
        map.add_map_point(MapPoint::new(shared, Vector3::z(), None, kf0));
        map.commit_point_ids(ids);
        map.associate(kf0, 0, shared);
        map.associate(kf1, 1, shared);

        // Both sources claim the shared point, through different new keypoints.
        let sources = vec![
            SourceMatches { keyframe_id: kf0, matches: vec![(0, 4)] },
            SourceMatches { keyframe_id: kf1, matches: vec![(1, 5)] },
        ];
        let mut ids = map.point_id_generator();
        let output = triangulate_new_keyframe(
            &map,
            &sources,
            &pose,
            &[Vector2::zeros(); 6],
            &mut ids,
            &TriangulationConfig::default(),
        );

        assert_eq!(output.new_map.point_for(4), Some(shared));
        assert_eq!(output.new_map.point_for(5), None);
        assert_eq!(output.stats.num_copied, 1);
        assert_eq!(output.stats.num_inconsistent, 1);
    }

    #[test]
    fn test_dropped_match_to_a_different_point_is_reported() {
        let pose = SE3::identity();
        let mut map = Map::new();
        let kf0 = map.create_keyframe(pose.clone(), features(vec![Vector2::zeros(); 1]));
        let kf1 = map.create_keyframe(pose.clone(), features(vec![Vector2::zeros(); 1]));
        let mut ids = map.point_id_generator();
        let x = ids.generate();
        let y = ids.generate();
        map.add_map_point(MapPoint::new(x, Vector3::z(), None, kf0));
        map.add_map_point(MapPoint::new(y, -Vector3::z(), None, kf1));
        map.commit_point_ids(ids);
        map.associate(kf0, 0, x);
        map.associate(kf1, 0, y);

        // New keypoint 4 is matched to X through kf0 and to Y through kf1.
        let sources = vec![
            SourceMatches { keyframe_id: kf0, matches: vec![(0, 4)] },
            SourceMatches { keyframe_id: kf1, matches: vec![(0, 4)] },
        ];
        let mut ids = map.point_id_generator();
        let output = triangulate_new_keyframe(
            &map,
            &sources,
            &pose,
            &[Vector2::zeros(); 5],
            &mut ids,
            &TriangulationConfig::default(),
        );

        assert_eq!(output.new_map.point_for(4), Some(x));
        assert!(!output.new_map.contains_point(y));
        assert_eq!(output.stats.num_copied, 1);
        assert_eq!(output.stats.num_inconsistent, 1);
    }

    #[test]
    fn test_dropped_match_to_the_same_point_is_silent() {
        let pose = SE3::identity();
        let mut map = Map::new();
        let kf0 = map.create_keyframe(pose.clone(), features(vec![Vector2::zeros(); 1]));
        let kf1 = map.create_keyframe(pose.clone(), features(vec![Vector2::zeros(); 2]));
        let mut ids = map.point_id_generator();
        let x = ids.generate();
        map.add_map_point(MapPoint::new(x, Vector3::z(), None, kf0));
        map.commit_point_ids(ids);
        map.associate(kf0, 0, x);
        map.associate(kf1, 1, x);

        let sources = vec![
            SourceMatches { keyframe_id: kf0, matches: vec![(0, 2)] },
            SourceMatches { keyframe_id: kf1, matches: vec![(1, 2)] },
        ];
        let mut ids = map.point_id_generator();
        let output = triangulate_new_keyframe(
            &map,
            &sources,
            &pose,
            &[Vector2::zeros(); 3],
            &mut ids,
            &TriangulationConfig::default(),
        );

        assert_eq!(output.new_map.point_for(2), Some(x));
        assert_eq!(output.stats.num_inconsistent, 0);
    }

    #[test]
    fn test_empty_matches_are_a_no_op() {
        let mut map = Map::new();
        let kf0 = map.create_keyframe(SE3::identity(), features(Vec::new()));
        let mut ids = map.point_id_generator();
        let output = triangulate_new_keyframe(
            &map,
            &[SourceMatches { keyframe_id: kf0, matches: Vec::new() }],
            &SE3::identity(),
            &[],
            &mut ids,
            &TriangulationConfig::default(),
        );

        assert!(output.new_map.is_empty());
        assert_eq!(output.stats, TriangulationStats::default());
    }
}
