//! Epipolar geometry: fundamental/essential estimation and decomposition.
//!
//! Correspondence convention: `x1ᵀ F x0 = 0`, where `x0` lies in the first
//! (reference) view and `x1` in the second.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

use crate::error::VoError;

use super::so3::vee;
use super::triangulate::solve_homogeneous;

/// Minimum number of pairs for the linear eight-point algorithm.
pub const MIN_EIGHT_POINT_PAIRS: usize = 8;

/// Hartley normalization: translate to the centroid, scale to mean
/// distance √2. Returns the transform `T` such that `x̂ = T x`.
fn hartley_transform(points: &[Vector2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    Matrix3::new(
        scale, 0.0, -scale * centroid.x,
        0.0, scale, -scale * centroid.y,
        0.0, 0.0, 1.0,
    )
}

#[inline]
fn apply(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let q = t * p.push(1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Design matrix of the eight-point system over Hartley-normalized pairs,
/// together with the two normalizing transforms.
fn normalized_design_matrix(
    keypoints0: &[Vector2<f64>],
    keypoints1: &[Vector2<f64>],
) -> (DMatrix<f64>, Matrix3<f64>, Matrix3<f64>) {
    let n = keypoints0.len().min(keypoints1.len());
    let t0 = hartley_transform(&keypoints0[..n]);
    let t1 = hartley_transform(&keypoints1[..n]);

    let mut a = DMatrix::zeros(n, 9);
    for i in 0..n {
        let xa = apply(&t0, &keypoints0[i]);
        let xb = apply(&t1, &keypoints1[i]);
        let row = [
            xb.x * xa.x, xb.x * xa.y, xb.x,
            xb.y * xa.x, xb.y * xa.y, xb.y,
            xa.x, xa.y, 1.0,
        ];
        for (j, v) in row.iter().enumerate() {
            a[(i, j)] = *v;
        }
    }
    (a, t0, t1)
}

/// Ratio of the second-smallest to the largest singular value of the
/// eight-point design matrix (zero-padded to 9 rows).
///
/// Near zero the system has more than one null vector and `F` is not
/// determined, as for a pure rotation or a planar scene.
pub fn fundamental_conditioning(
    keypoints0: &[Vector2<f64>],
    keypoints1: &[Vector2<f64>],
) -> Result<f64, VoError> {
    let n = keypoints0.len().min(keypoints1.len());
    if n < MIN_EIGHT_POINT_PAIRS {
        return Err(VoError::InsufficientInliers {
            found: n,
            required: MIN_EIGHT_POINT_PAIRS,
        });
    }
    let (a, _, _) = normalized_design_matrix(&keypoints0[..n], &keypoints1[..n]);
    let mut sigma: Vec<f64> = a.singular_values().iter().copied().collect();
    sigma.resize(9, 0.0);
    sigma.sort_by(|x, y| y.total_cmp(x));
    if sigma[0] <= 0.0 {
        return Ok(0.0);
    }
    Ok(sigma[7] / sigma[0])
}

/// Eight-point estimate of the fundamental matrix.
///
/// Inputs are Hartley-normalized, the null vector of the 9-column design
/// matrix is reshaped row-major, rank 2 is enforced and the normalization
/// is undone. Requires at least eight pairs.
pub fn estimate_fundamental(
    keypoints0: &[Vector2<f64>],
    keypoints1: &[Vector2<f64>],
) -> Result<Matrix3<f64>, VoError> {
    let n = keypoints0.len().min(keypoints1.len());
    if n < MIN_EIGHT_POINT_PAIRS {
        return Err(VoError::InsufficientInliers {
            found: n,
            required: MIN_EIGHT_POINT_PAIRS,
        });
    }

    let (a, t0, t1) = normalized_design_matrix(&keypoints0[..n], &keypoints1[..n]);

    let f = solve_homogeneous(&a)?;
    let f_hat = Matrix3::from_row_slice(f.as_slice());

    let svd = f_hat.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(VoError::Degenerate("SVD of the fundamental matrix failed")),
    };
    let mut sigma = svd.singular_values;
    let (min_idx, _) = sigma.argmin();
    sigma[min_idx] = 0.0;
    let f_rank2 = u * Matrix3::from_diagonal(&sigma) * v_t;

    Ok(t1.transpose() * f_rank2 * t0)
}

/// `E = K1ᵀ F K0`.
pub fn fundamental_to_essential(
    f: &Matrix3<f64>,
    k0: &Matrix3<f64>,
    k1: &Matrix3<f64>,
) -> Matrix3<f64> {
    k1.transpose() * f * k0
}

/// One of the four `(R, t)` decompositions of an essential matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseCandidate {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

/// SVD of a 3×3 matrix with singular values sorted in descending order.
fn sorted_svd3(m: &Matrix3<f64>) -> Result<(Matrix3<f64>, Matrix3<f64>), VoError> {
    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(VoError::Degenerate("SVD of the essential matrix failed")),
    };

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

    let mut u_sorted = Matrix3::zeros();
    let mut v_t_sorted = Matrix3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        u_sorted.set_column(dst, &u.column(src));
        v_t_sorted.set_row(dst, &v_t.row(src));
    }
    Ok((u_sorted, v_t_sorted))
}

/// Decompose an essential matrix into its four pose candidates.
///
/// With `W = [[0,-1,0],[1,0,0],[0,0,1]]` and `det(U) = det(Vᵀ) = +1`:
/// rotations `U W Vᵀ` and `U Wᵀ Vᵀ`, translations `±vee(−U W diag(1,1,0) Uᵀ)`.
/// Candidates are ordered (R1,t), (R1,−t), (R2,t), (R2,−t).
pub fn extract_pose_candidates(e: &Matrix3<f64>) -> Result<[PoseCandidate; 4], VoError> {
    let (mut u, mut v_t) = sorted_svd3(e)?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    let w = Matrix3::new(
        0.0, -1.0, 0.0,
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
    );
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;

    let s = -u * w * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * u.transpose();
    let t = vee(&s);

    Ok([
        PoseCandidate { rotation: r1, translation: t },
        PoseCandidate { rotation: r1, translation: -t },
        PoseCandidate { rotation: r2, translation: t },
        PoseCandidate { rotation: r2, translation: -t },
    ])
}

/// First-order geometric error of a pair under `F` (squared units of the
/// input coordinates).
pub fn sampson_distance(f: &Matrix3<f64>, x0: &Vector2<f64>, x1: &Vector2<f64>) -> f64 {
    let p0 = x0.push(1.0);
    let p1 = x1.push(1.0);
    let fx0 = f * p0;
    let ftx1 = f.transpose() * p1;
    let numerator = p1.dot(&fx0);
    let denominator = fx0.x * fx0.x + fx0.y * fx0.y + ftx1.x * ftx1.x + ftx1.y * ftx1.y;

    if denominator <= f64::EPSILON {
        return f64::INFINITY;
    }
    numerator * numerator / denominator
}
