//! Optimization module for Bundle Adjustment.
//!
//! Implements sliding-window local bundle adjustment over keyframe poses and
//! map point positions:
//! - Gauss-Newton with Schur complement (default backend)
//! - Levenberg-Marquardt via the `levenberg-marquardt` crate
//! - Robust kernels for IRLS weighting

pub mod local_ba;
pub mod local_ba_lm;
pub mod problem;
pub mod robust;

pub use local_ba::{
    build_problem, local_bundle_adjustment, optimize, BaBackend, LocalBAConfig, LocalBAResult,
    Termination,
};
pub use problem::{BaObservation, BundleState, IndexConverter};
pub use robust::{CauchyLoss, HuberLoss, RobustLoss, Robustifier, SquaredLoss};
