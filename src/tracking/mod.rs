//! Tracking: turns a new image into a posed keyframe.
//!
//! - Feature and camera contracts consumed from the outside
//! - Descriptor matching against active keyframes
//! - Two-view initialization from epipolar geometry
//! - PnP pose estimation against existing structure

pub mod frame;
pub mod initializer;
pub mod matching;
pub mod pose_estimation;
pub mod result;
pub mod state;

pub use state::TrackingState;
