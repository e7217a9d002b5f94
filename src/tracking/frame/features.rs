//! Feature containers and the extractor contract.

use nalgebra::Vector2;

use crate::error::VoError;

/// Opaque binary descriptor.
pub type Descriptor = Vec<u8>;

/// Keypoints with their descriptors and optional color samples.
///
/// Straight out of a [`FeatureExtractor`] the keypoints are pixels; once
/// stored in a keyframe they are normalized image coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    pub keypoints: Vec<Vector2<f64>>,
    pub descriptors: Vec<Descriptor>,
    /// RGB sample at each keypoint, if the extractor has access to color.
    pub colors: Option<Vec<[u8; 3]>>,
}

impl Features {
    pub fn new(keypoints: Vec<Vector2<f64>>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            keypoints,
            descriptors,
            colors: None,
        }
    }

    pub fn with_colors(mut self, colors: Vec<[u8; 3]>) -> Self {
        self.colors = Some(colors);
        self
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Fails unless descriptors (and colors, when present) pair up one to one
    /// with the keypoints.
    pub fn check_lengths(&self) -> Result<(), VoError> {
        let keypoints = self.keypoints.len();
        if self.descriptors.len() != keypoints {
            return Err(VoError::MalformedFeatures {
                keypoints,
                field: "descriptors",
                found: self.descriptors.len(),
            });
        }
        match &self.colors {
            Some(colors) if colors.len() != keypoints => Err(VoError::MalformedFeatures {
                keypoints,
                field: "colors",
                found: colors.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Color sample of keypoint `index`, if any.
    pub fn color(&self, index: usize) -> Option<[u8; 3]> {
        self.colors.as_ref().and_then(|c| c.get(index).copied())
    }
}

/// Keypoint detector and descriptor.
pub trait FeatureExtractor {
    type Image: ?Sized;

    fn extract(&self, image: &Self::Image) -> Features;
}
