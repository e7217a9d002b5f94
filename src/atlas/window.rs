//! Sliding window of active keyframes.
//!
//! New keyframes are matched against, and bundle-adjusted with, only the
//! active keyframes. Eviction drops the oldest entries first.

use std::collections::VecDeque;

use tracing::debug;

use super::map::KeyFrameId;

/// Ordered set of active keyframes with a capacity.
#[derive(Debug, Clone)]
pub struct KeyframeWindow {
    active: VecDeque<KeyFrameId>,
    capacity: usize,
}

impl KeyframeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append a keyframe as the newest active one.
    ///
    /// The window may temporarily exceed its capacity until
    /// [`try_evict`](Self::try_evict) runs.
    pub fn insert(&mut self, id: KeyFrameId) {
        self.active.push_back(id);
    }

    /// Drop the oldest keyframes until the window fits its capacity.
    pub fn try_evict(&mut self) -> Vec<KeyFrameId> {
        let mut evicted = Vec::new();
        while self.active.len() > self.capacity {
            if let Some(id) = self.active.pop_front() {
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), active = self.active.len(), "window evicted keyframes");
        }
        evicted
    }

    /// Active keyframes, oldest first.
    pub fn active(&self) -> Vec<KeyFrameId> {
        self.active.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.active.iter().copied()
    }

    pub fn oldest(&self) -> Option<KeyFrameId> {
        self.active.front().copied()
    }

    pub fn newest(&self) -> Option<KeyFrameId> {
        self.active.back().copied()
    }

    pub fn contains(&self, id: KeyFrameId) -> bool {
        self.active.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_first() {
        let mut window = KeyframeWindow::new(3);
        for i in 0..5 {
            window.insert(KeyFrameId::new(i));
        }

        let evicted = window.try_evict();
        assert_eq!(evicted, vec![KeyFrameId::new(0), KeyFrameId::new(1)]);
        assert_eq!(
            window.active(),
            vec![KeyFrameId::new(2), KeyFrameId::new(3), KeyFrameId::new(4)]
        );
        assert_eq!(window.oldest(), Some(KeyFrameId::new(2)));
        assert_eq!(window.newest(), Some(KeyFrameId::new(4)));
    }

    #[test]
    fn test_never_exceeds_capacity_after_evict() {
        let mut window = KeyframeWindow::new(2);
        for i in 0..10 {
            window.insert(KeyFrameId::new(i));
            window.try_evict();
            assert!(window.len() <= window.capacity());
            assert!(window.contains(KeyFrameId::new(i)));
        }
        assert!(!window.contains(KeyFrameId::new(7)));
    }

    #[test]
    fn test_no_eviction_below_capacity() {
        let mut window = KeyframeWindow::new(4);
        window.insert(KeyFrameId::new(0));
        assert!(window.try_evict().is_empty());
        assert_eq!(window.len(), 1);
    }
}
