//! Camera models.
//!
//! The engine only consumes the forward contract: undistort pixel keypoints
//! into normalized image coordinates and expose the intrinsic matrix used for
//! pixel-space residuals.

use nalgebra::{Matrix3, Vector2};
use serde::{Deserialize, Serialize};

/// Camera model consumed by the engine.
pub trait CameraModel {
    /// Map pixel keypoints to normalized, undistorted image coordinates.
    fn undistort(&self, keypoints: &[Vector2<f64>]) -> Vec<Vector2<f64>>;

    /// Intrinsic matrix `K`.
    fn matrix(&self) -> Matrix3<f64>;
}

/// Distortion-free pinhole intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
        }
    }

    /// Normalized coordinates of a single pixel.
    pub fn normalize(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        Vector2::new(x, y)
    }

    /// Pixel coordinates of a normalized point.
    pub fn denormalize(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * normalized.x + self.skew * normalized.y + self.cx,
            self.fy * normalized.y + self.cy,
        )
    }
}

impl CameraModel for PinholeCamera {
    fn undistort(&self, keypoints: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
        keypoints.iter().map(|p| self.normalize(p)).collect()
    }

    fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }
}
