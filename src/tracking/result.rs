//! Per-insertion diagnostics.
//!
//! These types describe what happened while inserting a single image:
//! - the resulting keyframe and engine state
//! - correspondence counts at each stage
//! - bundle adjustment outcome and window eviction
//! - timing information for profiling

use crate::atlas::map::KeyFrameId;
use crate::local_mapping::triangulation::TriangulationStats;
use crate::optimizer::LocalBAResult;
use crate::tracking::TrackingState;

/// Summary of one successful insertion.
#[derive(Debug, Clone)]
pub struct InsertionReport {
    pub keyframe_id: KeyFrameId,
    pub state: TrackingState,
    pub metrics: InsertionMetrics,
    pub triangulation: TriangulationStats,
    /// Present when the window was large enough to run local BA.
    pub bundle_adjustment: Option<LocalBAResult>,
    pub evicted: Vec<KeyFrameId>,
    pub timing: TimingStats,
}

/// Scalar counts useful for debugging insertion quality.
#[derive(Debug, Clone, Default)]
pub struct InsertionMetrics {
    pub n_features: usize,
    /// Active keyframes that passed the match-count filter.
    pub n_matched_keyframes: usize,
    pub n_matches: usize,
    pub n_pnp_correspondences: usize,
    pub n_pnp_inliers: usize,
    pub n_new_points: usize,
}

/// Timing breakdown for an insertion.
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub match_ms: f64,
    pub pose_ms: f64,
    pub triangulate_ms: f64,
    pub ba_ms: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self::default()
    }
}
