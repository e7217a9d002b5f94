//! Identifier types for keyframes and map points.

/// Unique identifier for a KeyFrame within a Map.
///
/// Assigned sequentially at insertion and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// Create a new KeyFrameId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint within a Map.
///
/// Drawn from a [`PointIdGenerator`]; never reset or reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

impl MapPointId {
    /// Create a new MapPointId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

/// Monotonic source of fresh [`MapPointId`]s.
///
/// Cloning yields an independent cursor: an insertion draws ids from a
/// clone and hands it back only once it commits, so a rejected insertion
/// leaves the map's counter untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointIdGenerator {
    next: u64,
}

impl PointIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next id.
    pub fn generate(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next);
        self.next += 1;
        id
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.next
    }
}
