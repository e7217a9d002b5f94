//! Visual odometry engine - main entry point.
//!
//! `VisualOdometry` owns the map and the active keyframe window and turns
//! every accepted image into a keyframe:
//!
//! ```text
//! extract → undistort → match active keyframes → drop weak pairs
//!   ├─ one active keyframe:  two-view initialization
//!   └─ otherwise:            PnP pose → triangulation
//! → commit → local BA (window ≥ min_window_for_ba) → evict
//! ```
//!
//! Everything up to the commit runs against an immutable view of the map, so
//! a rejected image leaves the engine exactly as it was.

use std::time::Instant;

use nalgebra::{Matrix3, Vector2, Vector3};
use tracing::{debug, info, warn};

use crate::atlas::map::{
    subscribe, Correspondence, KeyFrameId, Map, MapPoint, MapPointId, PointIdGenerator,
};
use crate::atlas::window::KeyframeWindow;
use crate::error::{ConfigError, VoError};
use crate::geometry::projection::to_pixel;
use crate::geometry::SE3;
use crate::local_mapping::triangulation::{
    dedup_matches, triangulate_new_keyframe, NewPoint, SourceMatches, TriangulationStats,
};
use crate::optimizer::{local_bundle_adjustment, Robustifier};
use crate::tracking::frame::{CameraModel, FeatureExtractor, Features};
use crate::tracking::initializer::initialize_two_view;
use crate::tracking::matching::Matcher;
use crate::tracking::pose_estimation::estimate_pose;
use crate::tracking::result::{InsertionMetrics, InsertionReport, TimingStats};
use crate::tracking::TrackingState;

use super::config::EngineConfig;

/// Value returned by [`VisualOdometry::add_or_sentinel`] for rejected images.
pub const REJECTED: i64 = -1;

/// Pose and structure computed for a new keyframe, not yet in the map.
struct Staged {
    pose: SE3,
    new_points: Vec<NewPoint>,
    source_maps: Vec<(KeyFrameId, Correspondence)>,
    new_map: Correspondence,
    ids: PointIdGenerator,
    stats: TriangulationStats,
    n_pnp_correspondences: usize,
    n_pnp_inliers: usize,
    /// Spent triangulating against the sources, included in the staging time.
    triangulate_ms: f64,
}

/// Incremental monocular visual odometry.
pub struct VisualOdometry<E, C, M> {
    extractor: E,
    camera: C,
    matcher: M,
    config: EngineConfig,
    robustifier: Box<dyn Robustifier>,

    map: Map,
    window: KeyframeWindow,
    state: TrackingState,
    last_report: Option<InsertionReport>,
}

impl<E, C, M> VisualOdometry<E, C, M>
where
    E: FeatureExtractor,
    C: CameraModel,
    M: Matcher,
{
    /// Create an empty engine. Fails if `config` does not validate.
    pub fn new(extractor: E, camera: C, matcher: M, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let robustifier = config.local_ba.robust_loss.build();
        let window = KeyframeWindow::new(config.max_active_keyframes);
        Ok(Self {
            extractor,
            camera,
            matcher,
            config,
            robustifier,
            map: Map::new(),
            window,
            state: TrackingState::NotInitialized,
            last_report: None,
        })
    }

    /// Insert an image as a new keyframe.
    ///
    /// On error nothing is modified: the map, the window, the id counters
    /// and the last report all stay as they were.
    pub fn add(&mut self, image: &E::Image) -> Result<KeyFrameId, VoError> {
        let t_start = Instant::now();
        let mut timing = TimingStats::zero();
        let mut metrics = InsertionMetrics::default();

        // Step 1: Extract and undistort
        let raw = self.extractor.extract(image);
        metrics.n_features = raw.len();
        if let Err(err) = raw.check_lengths() {
            warn!(%err, "image rejected");
            return Err(err);
        }
        if raw.len() < self.config.min_keypoints {
            let err = VoError::InsufficientFeatures {
                found: raw.len(),
                required: self.config.min_keypoints,
            };
            warn!(%err, "image rejected");
            return Err(err);
        }
        let features = Features {
            keypoints: self.camera.undistort(&raw.keypoints),
            descriptors: raw.descriptors,
            colors: raw.colors,
        };
        let k = self.camera.matrix();

        // Step 2: The very first keyframe anchors the world frame
        if self.window.is_empty() {
            let staged = Staged {
                pose: SE3::identity(),
                new_points: Vec::new(),
                source_maps: Vec::new(),
                new_map: Correspondence::new(),
                ids: self.map.point_id_generator(),
                stats: TriangulationStats::default(),
                n_pnp_correspondences: 0,
                n_pnp_inliers: 0,
                triangulate_ms: 0.0,
            };
            return Ok(self.commit(staged, features, &k, metrics, timing, t_start));
        }

        // Step 3: Match against every active keyframe
        let t_match = Instant::now();
        let sources = self.match_active(&features);
        timing.match_ms = t_match.elapsed().as_secs_f64() * 1000.0;

        let kept: Vec<SourceMatches> = sources
            .iter()
            .filter(|src| src.matches.len() >= self.config.min_matches)
            .cloned()
            .collect();
        if kept.is_empty() {
            let best = sources.iter().map(|s| s.matches.len()).max().unwrap_or(0);
            let err = VoError::InsufficientInliers {
                found: best,
                required: self.config.min_matches,
            };
            warn!(%err, active = self.window.len(), "no active keyframe overlaps the image");
            return Err(err);
        }
        metrics.n_matched_keyframes = kept.len();
        metrics.n_matches = kept.iter().map(|s| s.matches.len()).sum();

        // Step 4: Pose and structure
        let t_pose = Instant::now();
        let staged = if self.window.len() == 1 {
            self.stage_initialization(&kept[0], &features, &k)
        } else {
            self.stage_tracking(&kept, &features, &k)
        };
        let staged = staged.map_err(|err| {
            warn!(%err, "image rejected");
            err
        })?;
        timing.triangulate_ms = staged.triangulate_ms;
        timing.pose_ms = t_pose.elapsed().as_secs_f64() * 1000.0 - staged.triangulate_ms;

        metrics.n_pnp_correspondences = staged.n_pnp_correspondences;
        metrics.n_pnp_inliers = staged.n_pnp_inliers;
        Ok(self.commit(staged, features, &k, metrics, timing, t_start))
    }

    /// [`add`](Self::add) with the error collapsed to [`REJECTED`].
    pub fn add_or_sentinel(&mut self, image: &E::Image) -> i64 {
        match self.add(image) {
            Ok(id) => i64::try_from(id.0).unwrap_or(REJECTED),
            Err(_) => REJECTED,
        }
    }

    fn match_active(&self, features: &Features) -> Vec<SourceMatches> {
        self.window
            .iter()
            .filter_map(|kf_id| {
                let kf = self.map.get_keyframe(kf_id)?;
                let matches = self.matcher.match_features(&kf.features, features);
                debug!(keyframe = %kf_id, matches = matches.len(), "matched active keyframe");
                Some(SourceMatches {
                    keyframe_id: kf_id,
                    matches,
                })
            })
            .collect()
    }

    /// Two-view initialization against the single active keyframe.
    fn stage_initialization(
        &self,
        source: &SourceMatches,
        features: &Features,
        k: &Matrix3<f64>,
    ) -> Result<Staged, VoError> {
        let kf0 = self
            .map
            .get_keyframe(source.keyframe_id)
            .ok_or(VoError::Degenerate("active keyframe missing from map"))?;

        let matches: Vec<(usize, usize)> = dedup_matches(std::slice::from_ref(source))
            .into_iter()
            .flat_map(|src| src.matches)
            .filter(|&(a, b)| a < kf0.num_keypoints() && b < features.len())
            .collect();

        let (kp0, kp1): (Vec<Vector2<f64>>, Vec<Vector2<f64>>) = matches
            .iter()
            .filter_map(|&(a, b)| {
                let p0 = kf0.keypoint(a)?;
                let p1 = features.keypoints.get(b)?;
                Some((to_pixel(k, p0), to_pixel(k, p1)))
            })
            .unzip();

        let two_view = initialize_two_view(&kp0, &kp1, k, &self.config.initialization)?;

        // Relative pose and points are expressed in the first camera's frame.
        let pose = two_view.pose().compose(&kf0.pose);
        let to_world = kf0.pose.inverse();

        let mut ids = self.map.point_id_generator();
        let point_ids: Vec<MapPointId> = two_view.points.iter().map(|_| ids.generate()).collect();
        let new_points = point_ids
            .iter()
            .zip(&two_view.points)
            .zip(&matches)
            .map(|((&id, p), &(_, b))| NewPoint {
                id,
                position: to_world.transform_point(p),
                keypoint_index: b,
            })
            .collect::<Vec<_>>();
        let (source_map, new_map) = subscribe(&point_ids, &matches);

        info!(
            points = new_points.len(),
            baseline = two_view.translation.norm(),
            "two-view initialization"
        );

        Ok(Staged {
            pose,
            stats: TriangulationStats {
                num_triangulated: new_points.len(),
                ..TriangulationStats::default()
            },
            new_points,
            source_maps: vec![(source.keyframe_id, source_map)],
            new_map,
            ids,
            n_pnp_correspondences: 0,
            n_pnp_inliers: 0,
            triangulate_ms: 0.0,
        })
    }

    /// PnP against existing structure, then triangulation with every source.
    fn stage_tracking(
        &self,
        sources: &[SourceMatches],
        features: &Features,
        k: &Matrix3<f64>,
    ) -> Result<Staged, VoError> {
        let estimate = estimate_pose(&self.map, sources, &features.keypoints, k, &self.config.pose)?;

        let t_triangulate = Instant::now();
        let mut ids = self.map.point_id_generator();
        let output = triangulate_new_keyframe(
            &self.map,
            sources,
            &estimate.pose,
            &features.keypoints,
            &mut ids,
            &self.config.triangulation,
        );

        Ok(Staged {
            pose: estimate.pose,
            new_points: output.new_points,
            source_maps: output.source_maps,
            new_map: output.new_map,
            ids,
            stats: output.stats,
            n_pnp_correspondences: estimate.num_correspondences,
            n_pnp_inliers: estimate.num_inliers,
            triangulate_ms: t_triangulate.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Apply a staged insertion; nothing here can fail.
    fn commit(
        &mut self,
        staged: Staged,
        features: Features,
        k: &Matrix3<f64>,
        mut metrics: InsertionMetrics,
        mut timing: TimingStats,
        t_start: Instant,
    ) -> KeyFrameId {
        let colors: Vec<Option<[u8; 3]>> = staged
            .new_points
            .iter()
            .map(|np| features.color(np.keypoint_index))
            .collect();

        let kf_id = self.map.create_keyframe(staged.pose, features);
        for (np, color) in staged.new_points.iter().zip(colors) {
            self.map
                .add_map_point(MapPoint::new(np.id, np.position, color, kf_id));
        }
        self.map.commit_point_ids(staged.ids);
        for (source_id, source_map) in &staged.source_maps {
            self.map.merge_correspondence(*source_id, source_map);
        }
        self.map.merge_correspondence(kf_id, &staged.new_map);
        self.window.insert(kf_id);
        metrics.n_new_points = staged.new_points.len();

        // Local BA over the window, before eviction
        let t_ba = Instant::now();
        let bundle_adjustment = if self.window.len() >= self.config.min_window_for_ba {
            local_bundle_adjustment(
                &mut self.map,
                &self.window.active(),
                k,
                &self.config.local_ba,
                self.robustifier.as_ref(),
            )
        } else {
            None
        };
        timing.ba_ms = t_ba.elapsed().as_secs_f64() * 1000.0;

        let evicted = self.window.try_evict();

        self.state = match self.map.num_keyframes() {
            0 => TrackingState::NotInitialized,
            1 => TrackingState::Initializing,
            _ => TrackingState::Ok,
        };
        timing.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        info!(
            keyframe = %kf_id,
            state = ?self.state,
            new_points = metrics.n_new_points,
            copied = staged.stats.num_copied,
            map_points = self.map.num_map_points(),
            evicted = evicted.len(),
            total_ms = timing.total_ms,
            "keyframe inserted"
        );

        self.last_report = Some(InsertionReport {
            keyframe_id: kf_id,
            state: self.state,
            metrics,
            triangulation: staged.stats,
            bundle_adjustment,
            evicted,
            timing,
        });
        kf_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Export and accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Positions of every point and their colors in `[0, 1]`.
    pub fn export_points(&self) -> (Vec<Vector3<f64>>, Vec<[f64; 3]>) {
        self.map.export_points()
    }

    /// World-to-camera poses of every keyframe, ordered by id.
    pub fn export_poses(&self) -> Vec<SE3> {
        self.map.export_poses()
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn window(&self) -> &KeyframeWindow {
        &self.window
    }

    pub fn num_keyframes(&self) -> usize {
        self.map.num_keyframes()
    }

    pub fn num_map_points(&self) -> usize {
        self.map.num_map_points()
    }

    /// Statistics of the last successful insertion.
    pub fn last_report(&self) -> Option<&InsertionReport> {
        self.last_report.as_ref()
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
