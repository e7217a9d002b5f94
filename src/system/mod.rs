//! Engine orchestration.
//!
//! [`VisualOdometry`] drives a single insertion from raw image to committed
//! keyframe; [`EngineConfig`] aggregates the per-component settings.

pub mod config;
mod vo_system;

pub use config::EngineConfig;
pub use vo_system::{VisualOdometry, REJECTED};
