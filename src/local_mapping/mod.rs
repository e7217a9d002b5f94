//! Local mapping: grows the structure around each new keyframe.
//!
//! Copies existing points seen again by the new keyframe and triangulates
//! the matches that have no point yet.

pub mod triangulation;

pub use triangulation::{triangulate_new_keyframe, TriangulationConfig, TriangulationOutput};
