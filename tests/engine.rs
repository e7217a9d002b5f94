//! End-to-end insertion of a synthetic image sequence.

use approx::assert_relative_eq;
use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mono_vslam::geometry::projection::project;
use mono_vslam::tracking::TrackingState;
use mono_vslam::{
    CameraModel, EngineConfig, FeatureExtractor, Features, IdentifierMatcher, KeyFrameId,
    PinholeCamera, VisualOdometry, VoError, SE3,
};

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 480.0;

/// A synthetic "image": where the camera is and how its descriptors are tagged.
struct Shot {
    pose: SE3,
    /// Added to every point identifier; a non-zero offset breaks all matches.
    id_offset: u64,
    /// Descriptors dropped from the end of the extractor output.
    missing_descriptors: usize,
}

/// Projects a fixed point cloud and tags each keypoint with its point index.
struct SyntheticExtractor {
    points: Vec<Vector3<f64>>,
    camera: PinholeCamera,
}

impl FeatureExtractor for SyntheticExtractor {
    type Image = Shot;

    fn extract(&self, shot: &Shot) -> Features {
        let k = self.camera.matrix();
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut colors = Vec::new();
        for (i, p) in self.points.iter().enumerate() {
            let p_cam = shot.pose.transform_point(p);
            if p_cam.z < 0.1 {
                continue;
            }
            let uv = project(&k, &p_cam);
            if uv.x < 0.0 || uv.x >= WIDTH || uv.y < 0.0 || uv.y >= HEIGHT {
                continue;
            }
            let mut descriptor = vec![0u8; 32];
            descriptor[..8].copy_from_slice(&(i as u64 + shot.id_offset).to_le_bytes());
            keypoints.push(uv);
            descriptors.push(descriptor);
            colors.push([(i % 256) as u8, 128, 255]);
        }
        descriptors.truncate(descriptors.len().saturating_sub(shot.missing_descriptors));
        Features::new(keypoints, descriptors).with_colors(colors)
    }
}

fn camera() -> PinholeCamera {
    PinholeCamera::new(500.0, 500.0, 320.0, 240.0)
}

fn scene() -> Vec<Vector3<f64>> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..200)
        .map(|_| {
            Vector3::new(
                rng.gen_range(-3.0..6.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(4.0..9.0),
            )
        })
        .collect()
}

/// Camera `i` sits at `x = 0.3 i` looking down +z.
fn shot(i: usize) -> Shot {
    let center = Vector3::new(0.3 * i as f64, 0.0, 0.0);
    Shot {
        pose: SE3::new(nalgebra::UnitQuaternion::identity(), -center),
        id_offset: 0,
        missing_descriptors: 0,
    }
}

fn engine(max_active_keyframes: usize) -> VisualOdometry<SyntheticExtractor, PinholeCamera, IdentifierMatcher> {
    let config = EngineConfig {
        max_active_keyframes,
        min_matches: 30,
        ..EngineConfig::default()
    };
    let extractor = SyntheticExtractor {
        points: scene(),
        camera: camera(),
    };
    VisualOdometry::new(extractor, camera(), IdentifierMatcher, config).unwrap()
}

/// Largest pixel reprojection error over every binding in the map.
fn max_reprojection_error<E, C, M>(vo: &VisualOdometry<E, C, M>) -> f64
where
    E: FeatureExtractor,
    C: CameraModel,
    M: mono_vslam::Matcher,
{
    let k = camera().matrix();
    let mut worst: f64 = 0.0;
    for kf in vo.map().keyframes() {
        for (index, point_id) in kf.correspondence.iter() {
            let point = vo.map().get_map_point(point_id).unwrap();
            let observed = k * kf.keypoint(index).unwrap().push(1.0);
            let observed = Vector2::new(observed.x / observed.z, observed.y / observed.z);
            let predicted = project(&k, &kf.pose.transform_point(&point.position));
            worst = worst.max((predicted - observed).norm());
        }
    }
    worst
}

#[test]
fn test_sequence_reconstructs_trajectory() {
    let mut vo = engine(3);

    for i in 0..6 {
        let id = vo.add(&shot(i)).unwrap();
        assert_eq!(id, KeyFrameId::new(i as u64));
        assert!(vo.window().len() <= 3);
    }

    assert_eq!(vo.state(), TrackingState::Ok);
    assert_eq!(vo.num_keyframes(), 6);
    assert_eq!(vo.window().active(), vec![KeyFrameId(3), KeyFrameId(4), KeyFrameId(5)]);

    let poses = vo.export_poses();
    assert_eq!(poses.len(), 6);
    assert_eq!(poses[0], SE3::identity());

    // Two-view initialization fixes the scale to a unit first baseline.
    for (i, pose) in poses.iter().enumerate() {
        let center = pose.camera_center();
        assert_relative_eq!(center, Vector3::new(i as f64, 0.0, 0.0), epsilon = 1e-3);
    }

    let (points, colors) = vo.export_points();
    assert_eq!(points.len(), vo.num_map_points());
    assert_eq!(colors.len(), points.len());
    assert!(points.len() > 50);
    assert!(colors.iter().flatten().all(|c| (0.0..=1.0).contains(c)));

    assert!(max_reprojection_error(&vo) < 0.5);
}

#[test]
fn test_reports_describe_each_insertion() {
    let mut vo = engine(4);
    assert!(vo.last_report().is_none());

    vo.add(&shot(0)).unwrap();
    let report = vo.last_report().unwrap();
    assert_eq!(report.state, TrackingState::Initializing);
    assert_eq!(report.metrics.n_new_points, 0);

    vo.add(&shot(1)).unwrap();
    let report = vo.last_report().unwrap();
    assert_eq!(report.state, TrackingState::Ok);
    assert!(report.metrics.n_new_points >= 30);
    assert!(report.bundle_adjustment.is_none());

    vo.add(&shot(2)).unwrap();
    let report = vo.last_report().unwrap();
    assert!(report.metrics.n_pnp_inliers >= 10);
    assert!(report.triangulation.num_copied > 0);
    assert!(report.timing.triangulate_ms > 0.0);
    assert!(report.timing.total_ms >= report.timing.triangulate_ms + report.timing.ba_ms);
    let ba = report.bundle_adjustment.as_ref().unwrap();
    assert!(ba.final_error <= ba.initial_error);
    assert!(report.evicted.is_empty());
}

#[test]
fn test_rejections_leave_state_untouched() {
    let mut vo = engine(3);
    for i in 0..3 {
        vo.add(&shot(i)).unwrap();
    }

    let poses = vo.export_poses();
    let (points, _) = vo.export_points();
    let active = vo.window().active();
    let issued = vo.map().point_id_generator().issued();

    // Looking away from the scene: nothing to extract.
    let mut away = shot(3);
    away.pose = SE3::from_axis_angle(&Vector3::new(0.0, std::f64::consts::PI, 0.0), Vector3::zeros());
    assert!(matches!(vo.add(&away), Err(VoError::InsufficientFeatures { found: 0, .. })));

    // Plenty of features, none of them known.
    let stranger = Shot {
        id_offset: 10_000,
        ..shot(3)
    };
    assert!(matches!(vo.add(&stranger), Err(VoError::InsufficientInliers { found: 0, .. })));
    assert_eq!(vo.add_or_sentinel(&stranger), -1);

    // Keypoints without a descriptor each.
    let malformed = Shot {
        missing_descriptors: 1,
        ..shot(3)
    };
    assert!(matches!(
        vo.add(&malformed),
        Err(VoError::MalformedFeatures { field: "descriptors", .. })
    ));

    assert_eq!(vo.export_poses(), poses);
    assert_eq!(vo.export_points().0, points);
    assert_eq!(vo.window().active(), active);
    assert_eq!(vo.map().point_id_generator().issued(), issued);
    assert_eq!(vo.last_report().unwrap().keyframe_id, KeyFrameId(2));

    // The sequence resumes where it stopped.
    assert_eq!(vo.add_or_sentinel(&shot(3)), 3);
}

#[test]
fn test_levenberg_marquardt_backend() {
    let mut config = EngineConfig::from_toml_str(
        r#"
        max_active_keyframes = 4
        min_matches = 30

        [local_ba]
        backend = "levenberg_marquardt"
        robust_loss = { kind = "cauchy", scale = 4.0 }
        "#,
    )
    .unwrap();
    config.local_ba.parallel = false;

    let extractor = SyntheticExtractor {
        points: scene(),
        camera: camera(),
    };
    let mut vo = VisualOdometry::new(extractor, camera(), IdentifierMatcher, config).unwrap();
    for i in 0..5 {
        vo.add(&shot(i)).unwrap();
    }

    assert_eq!(vo.num_keyframes(), 5);
    assert!(max_reprojection_error(&vo) < 0.5);
}

#[test]
fn test_rotation_only_second_image_does_not_initialize() {
    let mut vo = engine(4);
    vo.add(&shot(0)).unwrap();

    let rotated = Shot {
        pose: SE3::from_axis_angle(&Vector3::new(0.0, 0.05, 0.0), Vector3::zeros()),
        ..shot(0)
    };
    assert!(matches!(vo.add(&rotated), Err(VoError::Degenerate(_))));
    assert_eq!(vo.num_keyframes(), 1);
    assert_eq!(vo.num_map_points(), 0);
    assert_eq!(vo.state(), TrackingState::Initializing);

    // A translated image still initializes afterwards.
    assert_eq!(vo.add(&shot(1)).unwrap(), KeyFrameId(1));
    assert!(vo.num_map_points() > 30);
}
