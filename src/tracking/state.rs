//! Engine state machine.

/// Stage of the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No keyframe yet.
    #[default]
    NotInitialized,
    /// One keyframe; the next accepted image runs two-view initialization.
    Initializing,
    /// Structure exists; new keyframes are posed by PnP.
    Ok,
}
