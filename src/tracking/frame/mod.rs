//! Frame-level inputs: camera model and extracted features.

pub mod camera;
pub mod features;

pub use camera::{CameraModel, PinholeCamera};
pub use features::{Descriptor, FeatureExtractor, Features};
