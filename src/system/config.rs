//! Engine configuration.
//!
//! Every component carries its own config struct with defaults; this module
//! aggregates them and loads the result from TOML. Missing tables and keys
//! fall back to their defaults.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::local_mapping::triangulation::TriangulationConfig;
use crate::optimizer::{LocalBAConfig, RobustLoss};
use crate::tracking::initializer::InitializerConfig;
use crate::tracking::pose_estimation::PoseEstimationConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Images with fewer keypoints are rejected.
    pub min_keypoints: usize,
    /// Active keyframes with fewer matches against the new image are ignored.
    pub min_matches: usize,
    /// Capacity of the active keyframe window.
    pub max_active_keyframes: usize,
    /// Local BA runs once the window holds at least this many keyframes.
    pub min_window_for_ba: usize,
    pub initialization: InitializerConfig,
    pub pose: PoseEstimationConfig,
    pub triangulation: TriangulationConfig,
    pub local_ba: LocalBAConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_keypoints: 8,
            min_matches: 60,
            max_active_keyframes: 8,
            min_window_for_ba: 3,
            initialization: InitializerConfig::default(),
            pose: PoseEstimationConfig::default(),
            triangulation: TriangulationConfig::default(),
            local_ba: LocalBAConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load config from {:?}", path))
    }

    /// Check values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_keyframes < 2 {
            return Err(invalid(
                "max_active_keyframes",
                format!("must be at least 2, got {}", self.max_active_keyframes),
            ));
        }
        if self.min_keypoints == 0 {
            return Err(invalid("min_keypoints", "must be positive"));
        }
        if self.min_window_for_ba < 2 {
            return Err(invalid(
                "min_window_for_ba",
                format!("must be at least 2, got {}", self.min_window_for_ba),
            ));
        }

        let init = &self.initialization;
        if init.min_median_parallax < 0.0 || init.min_conditioning < 0.0 {
            return Err(invalid("initialization", "thresholds must be non-negative"));
        }

        let pnp = &self.pose.pnp;
        if !(pnp.confidence > 0.0 && pnp.confidence < 1.0) {
            return Err(invalid("pose.pnp.confidence", "must lie in (0, 1)"));
        }
        if pnp.reprojection_threshold <= 0.0 {
            return Err(invalid("pose.pnp.reprojection_threshold", "must be positive"));
        }

        let ba = &self.local_ba;
        if ba.damping < 0.0 || ba.convergence_threshold < 0.0 {
            return Err(invalid("local_ba", "damping and convergence_threshold must be non-negative"));
        }
        match ba.robust_loss {
            RobustLoss::Huber { threshold } if threshold <= 0.0 => {
                Err(invalid("local_ba.robust_loss.threshold", "must be positive"))
            }
            RobustLoss::Cauchy { scale } if scale <= 0.0 => {
                Err(invalid("local_ba.robust_loss.scale", "must be positive"))
            }
            _ => Ok(()),
        }
    }
}
