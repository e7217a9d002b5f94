//! Linear (DLT) triangulation and the homogeneous least-squares solver
//! shared by the epipolar and PnP estimators.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};

use crate::error::VoError;

use super::SE3;

/// Below this the homogeneous coordinate is treated as a point at infinity.
const MIN_HOMOGENEOUS_W: f64 = 1e-12;

/// Solve `A x = 0` for a unit vector `x` in the least-squares sense.
///
/// Takes the right singular vector of the smallest singular value. Matrices
/// with fewer rows than columns are zero-padded to square first so that the
/// full right singular basis is available.
pub fn solve_homogeneous(a: &DMatrix<f64>) -> Result<DVector<f64>, VoError> {
    let (rows, cols) = a.shape();
    if cols == 0 {
        return Err(VoError::Degenerate("empty linear system"));
    }

    let padded;
    let a = if rows < cols {
        let mut m = DMatrix::zeros(cols, cols);
        m.view_mut((0, 0), (rows, cols)).copy_from(a);
        padded = m;
        &padded
    } else {
        a
    };

    let svd = a.clone().svd(false, true);
    let v_t = svd
        .v_t
        .ok_or(VoError::Degenerate("SVD did not produce right singular vectors"))?;

    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|(_, x), (_, y)| x.total_cmp(y))
        .ok_or(VoError::Degenerate("SVD produced no singular values"))?;

    Ok(v_t.row(min_idx).transpose())
}

/// `K·[R | t]`.
pub fn projection_matrix(k: &Matrix3<f64>, pose: &SE3) -> Matrix3x4<f64> {
    k * pose.matrix3x4()
}

/// A triangulated point with its depth in both views.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangulatedPoint {
    pub position: Vector3<f64>,
    pub depth0: f64,
    pub depth1: f64,
}

impl TriangulatedPoint {
    /// True when the point lies strictly in front of both cameras.
    pub fn in_front(&self, min_depth: f64) -> bool {
        self.depth0 > min_depth && self.depth1 > min_depth
    }
}

/// Triangulate one observation pair with the four-row DLT system.
///
/// Depth in each view is the third row of its projection matrix applied to
/// the homogeneous point.
pub fn triangulate_point(
    p0: &Matrix3x4<f64>,
    p1: &Matrix3x4<f64>,
    x0: &Vector2<f64>,
    x1: &Vector2<f64>,
) -> Result<TriangulatedPoint, VoError> {
    let mut a = Matrix4::zeros();
    a.set_row(0, &(x0.x * p0.row(2) - p0.row(0)));
    a.set_row(1, &(x0.y * p0.row(2) - p0.row(1)));
    a.set_row(2, &(x1.x * p1.row(2) - p1.row(0)));
    a.set_row(3, &(x1.y * p1.row(2) - p1.row(1)));

    let x = solve_homogeneous(&DMatrix::from_iterator(4, 4, a.iter().copied()))?;
    if x[3].abs() < MIN_HOMOGENEOUS_W {
        return Err(VoError::Degenerate("triangulated point at infinity"));
    }

    let position = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    let homogeneous = position.push(1.0);
    Ok(TriangulatedPoint {
        position,
        depth0: p0.row(2).dot(&homogeneous.transpose()),
        depth1: p1.row(2).dot(&homogeneous.transpose()),
    })
}

/// Triangulate every pair observed by two posed views.
///
/// Keypoints are in the coordinate system implied by `k` (pixels with the
/// camera matrix, or normalized coordinates with the identity). Pairs whose
/// linear system is degenerate come back as `None`.
pub fn triangulate_points(
    pose0: &SE3,
    pose1: &SE3,
    k: &Matrix3<f64>,
    keypoints0: &[Vector2<f64>],
    keypoints1: &[Vector2<f64>],
) -> Vec<Option<TriangulatedPoint>> {
    let p0 = projection_matrix(k, pose0);
    let p1 = projection_matrix(k, pose1);

    keypoints0
        .iter()
        .zip(keypoints1)
        .map(|(x0, x1)| triangulate_point(&p0, &p1, x0, x1).ok())
        .collect()
}
