//! Map module - reconstruction data structures.
//!
//! - [`KeyFrame`] - posed keyframes with their keypoints and correspondence map
//! - [`MapPoint`] - triangulated 3D landmarks
//! - [`Correspondence`] - bijective keypoint ↔ point binding of one keyframe
//! - [`Map`] - arena container and keyframe-scoped correspondence store
//!
//! # Example
//!
//! ```ignore
//! use mono_vslam::atlas::map::{Map, MapPoint};
//!
//! let mut map = Map::new();
//! let kf_id = map.create_keyframe(pose, features);
//!
//! let mut ids = map.point_id_generator();
//! let mp_id = ids.generate();
//! map.add_map_point(MapPoint::new(mp_id, position, None, kf_id));
//! map.commit_point_ids(ids);
//!
//! map.associate(kf_id, feature_idx, mp_id);
//! ```

pub mod correspondence;
pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use correspondence::{check_match_consistency, subscribe, Correspondence};
pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId, PointIdGenerator};
