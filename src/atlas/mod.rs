//! Atlas module - the reconstruction state.
//!
//! - [`map`] - keyframes, map points and correspondences
//! - [`window`] - the sliding window of active keyframes

pub mod map;
pub mod window;

pub use map::{Correspondence, KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
pub use window::KeyframeWindow;
