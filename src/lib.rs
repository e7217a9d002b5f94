//! Incremental monocular visual odometry.
//!
//! Images enter through [`VisualOdometry::add`]; each accepted image becomes
//! a keyframe with a world-to-camera pose, and matched keypoints grow a
//! sparse point cloud. Local bundle adjustment keeps the most recent
//! keyframes consistent.
//!
//! Feature extraction, camera undistortion and descriptor matching are
//! supplied by the caller through [`FeatureExtractor`], [`CameraModel`] and
//! [`Matcher`].

pub mod atlas;
pub mod error;
pub mod geometry;
pub mod local_mapping;
pub mod optimizer;
pub mod system;
pub mod tracking;

pub use atlas::map::{KeyFrameId, MapPointId};
pub use error::{ConfigError, VoError};
pub use geometry::SE3;
pub use system::{EngineConfig, VisualOdometry};
pub use tracking::frame::{CameraModel, FeatureExtractor, Features, PinholeCamera};
pub use tracking::matching::{HammingMatcher, IdentifierMatcher, Matcher};
