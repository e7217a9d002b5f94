//! Keypoint matching between a new frame and an active keyframe.
//!
//! Matchers compare descriptors only; geometry enters through the optional
//! epipolar filter. A [`Match`] pairs an index of the first feature set with
//! an index of the second.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::epipolar::{estimate_fundamental, sampson_distance, MIN_EIGHT_POINT_PAIRS};
use crate::tracking::frame::{Descriptor, Features};

/// `(index in first feature set, index in second feature set)`.
pub type Match = (usize, usize);

/// Descriptor matcher consumed by the engine.
pub trait Matcher {
    fn match_features(&self, a: &Features, b: &Features) -> Vec<Match>;
}

/// Pair up positions holding equal values, in order of the first sequence.
///
/// ```
/// use mono_vslam::tracking::matching::match_point_indices;
///
/// let matches = match_point_indices(&[1, 0, 2, 4, 5, 6], &[9, 1, 2, 3, 4, 5]);
/// assert_eq!(matches, vec![(0, 1), (2, 2), (3, 4), (4, 5)]);
/// ```
pub fn match_point_indices<T: PartialEq>(a: &[T], b: &[T]) -> Vec<Match> {
    let mut matches = Vec::new();
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            if x == y {
                matches.push((i, j));
            }
        }
    }
    matches
}

/// Number of differing bits between two binary descriptors.
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

// ─────────────────────────────────────────────────────────────────────────────
// Epipolar outlier filter
// ─────────────────────────────────────────────────────────────────────────────

/// RANSAC over the eight-point fundamental estimate, scoring pairs by Sampson
/// distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpipolarFilter {
    pub max_iterations: usize,
    /// Sampson distance threshold in squared input units.
    pub threshold: f64,
    pub seed: u64,
}

impl Default for EpipolarFilter {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            threshold: 1e-6, // normalized coordinates, ~(0.5 px / 500 px)²
            seed: 0,
        }
    }
}

impl EpipolarFilter {
    /// Keep the matches consistent with the best-supported epipolar geometry.
    ///
    /// Fewer than eight matches cannot be tested and are returned unchanged.
    pub fn filter(
        &self,
        keypoints_a: &[Vector2<f64>],
        keypoints_b: &[Vector2<f64>],
        matches: &[Match],
    ) -> Vec<Match> {
        if matches.len() < MIN_EIGHT_POINT_PAIRS {
            return matches.to_vec();
        }

        let pa: Vec<_> = matches.iter().map(|&(a, _)| keypoints_a[a]).collect();
        let pb: Vec<_> = matches.iter().map(|&(_, b)| keypoints_b[b]).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best_mask: Option<Vec<bool>> = None;
        let mut best_count = 0;

        for _ in 0..self.max_iterations {
            let sample = rand::seq::index::sample(&mut rng, matches.len(), MIN_EIGHT_POINT_PAIRS);
            let sa: Vec<_> = sample.iter().map(|i| pa[i]).collect();
            let sb: Vec<_> = sample.iter().map(|i| pb[i]).collect();
            let Ok(f) = estimate_fundamental(&sa, &sb) else {
                continue;
            };

            let mask: Vec<bool> = pa
                .iter()
                .zip(&pb)
                .map(|(x0, x1)| sampson_distance(&f, x0, x1) < self.threshold)
                .collect();
            let count = mask.iter().filter(|&&b| b).count();
            if count > best_count {
                best_count = count;
                best_mask = Some(mask);
            }
        }

        match best_mask {
            Some(mask) => matches
                .iter()
                .zip(mask)
                .filter_map(|(&m, keep)| keep.then_some(m))
                .collect(),
            None => Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Matchers
// ─────────────────────────────────────────────────────────────────────────────

/// Brute-force Hamming matcher with optional cross-check and epipolar
/// filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HammingMatcher {
    /// Largest accepted descriptor distance.
    pub max_distance: u32,
    /// Keep only mutual nearest neighbours.
    pub cross_check: bool,
    pub epipolar_filter: Option<EpipolarFilter>,
}

impl Default for HammingMatcher {
    fn default() -> Self {
        Self {
            max_distance: 64,
            cross_check: true,
            epipolar_filter: Some(EpipolarFilter::default()),
        }
    }
}

impl HammingMatcher {
    fn nearest(query: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, u32)> {
        candidates
            .iter()
            .enumerate()
            .map(|(i, d)| (i, hamming_distance(query, d)))
            .min_by_key(|&(_, dist)| dist)
    }
}

impl Matcher for HammingMatcher {
    fn match_features(&self, a: &Features, b: &Features) -> Vec<Match> {
        let mut matches = Vec::new();
        for (i, da) in a.descriptors.iter().enumerate() {
            let Some((j, dist)) = Self::nearest(da, &b.descriptors) else {
                continue;
            };
            if dist > self.max_distance {
                continue;
            }
            if self.cross_check {
                let back = Self::nearest(&b.descriptors[j], &a.descriptors);
                if back.map(|(k, _)| k) != Some(i) {
                    continue;
                }
            }
            matches.push((i, j));
        }

        let raw = matches.len();
        if let Some(filter) = &self.epipolar_filter {
            matches = filter.filter(&a.keypoints, &b.keypoints, &matches);
        }
        debug!(raw, kept = matches.len(), "hamming matching");
        matches
    }
}

/// Matches descriptors that are byte-for-byte identical.
///
/// Intended for inputs whose descriptors are identifiers, such as synthetic
/// scenes or pre-tracked features.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierMatcher;

impl Matcher for IdentifierMatcher {
    fn match_features(&self, a: &Features, b: &Features) -> Vec<Match> {
        match_point_indices(&a.descriptors, &b.descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::projection::project;
    use crate::geometry::SE3;
    use nalgebra::{Matrix3, Vector3};
    use rand::Rng;

    #[test]
    fn test_match_point_indices() {
        let matches = match_point_indices(&[1, 0, 2, 4, 5, 6], &[9, 1, 2, 3, 4, 5]);
        assert_eq!(matches, vec![(0, 1), (2, 2), (3, 4), (4, 5)]);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(&vec![0b1010_1010, 0xff], &vec![0b1010_1011, 0x0f]), 5);
    }

    #[test]
    fn test_cross_check_drops_non_mutual() {
        let a = Features::new(vec![Vector2::zeros(); 2], vec![vec![0b0000_0000], vec![0b0000_0001]]);
        let b = Features::new(vec![Vector2::zeros(); 1], vec![vec![0b0000_0001]]);
        let matcher = HammingMatcher {
            epipolar_filter: None,
            ..HammingMatcher::default()
        };

        assert_eq!(matcher.match_features(&a, &b), vec![(1, 0)]);
    }

    #[test]
    fn test_identifier_matcher() {
        let a = Features::new(vec![Vector2::zeros(); 3], vec![vec![1], vec![2], vec![3]]);
        let b = Features::new(vec![Vector2::zeros(); 2], vec![vec![3], vec![1]]);

        assert_eq!(IdentifierMatcher.match_features(&a, &b), vec![(0, 1), (2, 0)]);
    }

    #[test]
    fn test_epipolar_filter_removes_outliers() {
        let k = Matrix3::identity();
        let pose1 = SE3::from_axis_angle(&Vector3::new(0.0, 0.05, 0.0), Vector3::new(-0.5, 0.0, 0.0));
        let mut rng = StdRng::seed_from_u64(11);
        let mut kp_a = Vec::new();
        let mut kp_b = Vec::new();
        for _ in 0..50 {
            let p = Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(4.0..8.0),
            );
            kp_a.push(project(&k, &p));
            kp_b.push(project(&k, &pose1.transform_point(&p)));
        }
        // Corrupt the first five pairs perpendicular to the baseline.
        for p in kp_b.iter_mut().take(5) {
            p.y += 0.1;
        }
        let matches: Vec<Match> = (0..50).map(|i| (i, i)).collect();

        let kept = EpipolarFilter::default().filter(&kp_a, &kp_b, &matches);
        assert_eq!(kept, (5..50).map(|i| (i, i)).collect::<Vec<_>>());
    }
}
