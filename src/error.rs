//! Error types for the reconstruction engine.
//!
//! Every rejection surfaced by [`VisualOdometry::add`](crate::system::VisualOdometry::add)
//! is a [`VoError`]. A rejected image leaves the engine state untouched.

use thiserror::Error;

use crate::atlas::map::MapPointId;

/// Reasons a keyframe insertion (or one of its stages) can fail.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoError {
    /// The image produced too few keypoints to be useful.
    #[error("insufficient features: found {found}, need at least {required}")]
    InsufficientFeatures { found: usize, required: usize },

    /// Too few usable matches or 2D-3D correspondences survived.
    #[error("insufficient inliers: found {found}, need at least {required}")]
    InsufficientInliers { found: usize, required: usize },

    /// The cheirality check did not single out exactly one relative pose.
    #[error("ambiguous two-view initialization: {valid} of 4 pose candidates put every point in front of both cameras")]
    AmbiguousInitialization { valid: usize },

    /// A matched keypoint pair refers to two different existing map points.
    #[error("keypoints {index_a} and {index_b} are matched but bound to different map points ({point_a} vs {point_b})")]
    InconsistentCorrespondence {
        index_a: usize,
        index_b: usize,
        point_a: MapPointId,
        point_b: MapPointId,
    },

    /// The extractor returned per-keypoint arrays of different lengths.
    #[error("malformed features: {keypoints} keypoints but {found} {field}")]
    MalformedFeatures {
        keypoints: usize,
        field: &'static str,
        found: usize,
    },

    /// A linear solve or decomposition had no usable solution.
    #[error("degenerate configuration: {0}")]
    Degenerate(&'static str),
}

/// Errors raised while loading an engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_counts() {
        let err = VoError::InsufficientInliers {
            found: 3,
            required: 6,
        };
        assert_eq!(
            err.to_string(),
            "insufficient inliers: found 3, need at least 6"
        );

        let err = VoError::InconsistentCorrespondence {
            index_a: 4,
            index_b: 9,
            point_a: MapPointId::new(1),
            point_b: MapPointId::new(2),
        };
        assert!(err.to_string().contains("MP1 vs MP2"));
    }
}
