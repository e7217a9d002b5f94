//! Minimal absolute pose from three 2D-3D pairs (P3P).
//!
//! Lambda Twist formulation: the three distance constraints on the unknown
//! depths `Λ = (λ0, λ1, λ2)` give two homogeneous quadrics `D1`, `D2`. A real
//! root `γ` of `det(D1 + γ·D2) = 0` makes the pencil member degenerate, so it
//! splits into two planes through the origin. Intersecting each plane with
//! `D1` (or `D2`) leaves a quadratic in one unknown. At most four poses come
//! out; a fourth pair is needed to pick one.

use nalgebra::{Matrix3, Vector3};

use super::SE3;

/// Relative threshold under which a polynomial coefficient counts as zero.
const COEFF_EPS: f64 = 1e-12;

/// Real roots of `a·x² + b·x + c`, degrading to the linear case.
fn real_quadratic_roots(a: f64, b: f64, c: f64) -> Vec<f64> {
    let scale = a.abs().max(b.abs()).max(c.abs());
    if scale == 0.0 {
        return Vec::new();
    }
    if a.abs() <= COEFF_EPS * scale {
        return if b.abs() > COEFF_EPS * scale {
            vec![-c / b]
        } else {
            Vec::new()
        };
    }

    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return Vec::new();
    }
    let q = -0.5 * (b + b.signum() * disc.sqrt());
    if q == 0.0 {
        return vec![0.0];
    }
    vec![q / a, c / q]
}

/// Real roots of `c3·x³ + c2·x² + c1·x + c0`, polished with Newton steps.
fn real_cubic_roots(c3: f64, c2: f64, c1: f64, c0: f64) -> Vec<f64> {
    let scale = c3.abs().max(c2.abs()).max(c1.abs()).max(c0.abs());
    if scale == 0.0 {
        return Vec::new();
    }
    if c3.abs() <= COEFF_EPS * scale {
        return real_quadratic_roots(c2, c1, c0);
    }

    let (a, b, c) = (c2 / c3, c1 / c3, c0 / c3);
    // Depressed cubic t³ + p·t + q with x = t - a/3.
    let p = b - a * a / 3.0;
    let q = 2.0 * a * a * a / 27.0 - a * b / 3.0 + c;
    let disc = (q / 2.0).powi(2) + (p / 3.0).powi(3);

    let shifted: Vec<f64> = if disc > 0.0 {
        let s = disc.sqrt();
        vec![(-q / 2.0 + s).cbrt() + (-q / 2.0 - s).cbrt()]
    } else if p >= 0.0 {
        vec![0.0]
    } else {
        let m = 2.0 * (-p / 3.0).sqrt();
        let arg = ((3.0 * q) / (2.0 * p) * (-3.0 / p).sqrt()).clamp(-1.0, 1.0);
        let theta = arg.acos() / 3.0;
        (0..3)
            .map(|k| m * (theta - 2.0 * std::f64::consts::PI * k as f64 / 3.0).cos())
            .collect()
    };

    shifted
        .into_iter()
        .map(|t| {
            let mut x = t - a / 3.0;
            for _ in 0..2 {
                let f = ((x + a) * x + b) * x + c;
                let df = (3.0 * x + 2.0 * a) * x + b;
                if df.abs() > f64::EPSILON {
                    x -= f / df;
                }
            }
            x
        })
        .collect()
}

fn adjugate(m: &Matrix3<f64>) -> Matrix3<f64> {
    let c0: Vector3<f64> = m.column(0).into_owned();
    let c1: Vector3<f64> = m.column(1).into_owned();
    let c2: Vector3<f64> = m.column(2).into_owned();
    Matrix3::from_rows(&[
        c1.cross(&c2).transpose(),
        c2.cross(&c0).transpose(),
        c0.cross(&c1).transpose(),
    ])
}

/// Quadric of `|λi·yi - λj·yj|²` in the depths.
fn distance_quadric(i: usize, j: usize, cos_ij: f64) -> Matrix3<f64> {
    let mut m = Matrix3::zeros();
    m[(i, i)] = 1.0;
    m[(j, j)] = 1.0;
    m[(i, j)] = -cos_ij;
    m[(j, i)] = -cos_ij;
    m
}

/// Depth directions on the plane `n·Λ = 0` that lie on the cone of `d1`/`d2`.
fn plane_cone_intersections(n: &Vector3<f64>, d1: &Matrix3<f64>, d2: &Matrix3<f64>) -> Vec<Vector3<f64>> {
    let norm = n.norm();
    if norm <= f64::EPSILON {
        return Vec::new();
    }
    let n = n / norm;

    let mut axis = Vector3::zeros();
    axis[n.iamin()] = 1.0;
    let u = n.cross(&axis).normalize();
    let v = n.cross(&u);

    // On the plane both quadrics vanish together; use the better scaled one.
    let restrict = |d: &Matrix3<f64>| (v.dot(&(d * v)), 2.0 * u.dot(&(d * v)), u.dot(&(d * u)));
    let max_abs = |(a, b, c): (f64, f64, f64)| a.abs().max(b.abs()).max(c.abs());
    let (q1, q2) = (restrict(d1), restrict(d2));
    let (a, b, c) = if max_abs(q1) >= max_abs(q2) { q1 } else { q2 };

    let mut directions: Vec<Vector3<f64>> = real_quadratic_roots(a, b, c)
        .into_iter()
        .map(|tau| u + v * tau)
        .collect();
    if a.abs() <= COEFF_EPS * max_abs((a, b, c)) {
        directions.push(v);
    }
    directions
}

/// Poses (world to camera) that map `world[i]` onto the ray `bearings[i]`.
///
/// `bearings` are unit vectors in the camera frame. Returns every solution
/// found, up to four distinct ones (repeats are possible when several roots
/// of the cubic split the pencil), and none for collinear points.
pub fn solve_p3p(world: &[Vector3<f64>; 3], bearings: &[Vector3<f64>; 3]) -> Vec<SE3> {
    let [x0, x1, x2] = world;
    let [y0, y1, y2] = bearings;

    let dx1 = x1 - x0;
    let dx2 = x2 - x0;
    let Some(world_frame_inv) = Matrix3::from_columns(&[dx1, dx2, dx1.cross(&dx2)]).try_inverse() else {
        return Vec::new();
    };

    let a01 = dx1.norm_squared();
    let a02 = dx2.norm_squared();
    let a12 = (x2 - x1).norm_squared();
    let m01 = distance_quadric(0, 1, y0.dot(y1));
    let m02 = distance_quadric(0, 2, y0.dot(y2));
    let m12 = distance_quadric(1, 2, y1.dot(y2));

    // Λᵀ·D·Λ = 0 for the true depths.
    let d1 = m01 * a12 - m12 * a01;
    let d2 = m02 * a12 - m12 * a02;

    let (adj1, adj2) = (adjugate(&d1), adjugate(&d2));
    let c3 = d2.determinant();
    let c2 = (d1 * adj2).trace();
    let c1 = (adj1 * d2).trace();
    let c0 = d1.determinant();

    let mut degenerate: Vec<Matrix3<f64>> = real_cubic_roots(c3, c2, c1, c0)
        .into_iter()
        .map(|gamma| d1 + d2 * gamma)
        .collect();
    if c3.abs() <= COEFF_EPS * c0.abs().max(c1.abs()).max(c2.abs()) {
        degenerate.push(d2);
    }

    let mut poses = Vec::new();
    for d0 in degenerate {
        let eig = d0.symmetric_eigen();
        let null = eig.eigenvalues.iamin();
        let (i, j) = match null {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        let (si, sj) = (eig.eigenvalues[i], eig.eigenvalues[j]);
        if si * sj >= 0.0 {
            continue;
        }
        let s = (-sj / si).sqrt();
        let ei: Vector3<f64> = eig.eigenvectors.column(i).into_owned();
        let ej: Vector3<f64> = eig.eigenvectors.column(j).into_owned();

        for n in [ei - ej * s, ei + ej * s] {
            for mut depth in plane_cone_intersections(&n, &d1, &d2) {
                if depth.x < 0.0 {
                    depth = -depth;
                }
                if depth.min() <= 0.0 {
                    continue;
                }

                let p = [y0 * depth.x, y1 * depth.y, y2 * depth.z];
                let spread =
                    (p[0] - p[1]).norm_squared() + (p[0] - p[2]).norm_squared() + (p[1] - p[2]).norm_squared();
                if spread <= f64::EPSILON {
                    continue;
                }
                let scale = ((a01 + a02 + a12) / spread).sqrt();
                let p = p.map(|pi| pi * scale);

                let dp1 = p[1] - p[0];
                let dp2 = p[2] - p[0];
                let camera_frame = Matrix3::from_columns(&[dp1, dp2, dp1.cross(&dp2)]);
                let rotation = camera_frame * world_frame_inv;
                let translation = p[0] - rotation * x0;
                poses.push(SE3::from_rt(rotation, translation));
            }
        }
    }
    poses
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_cubic_roots() {
        // (x - 1)(x + 2)(x - 3)
        let mut roots = real_cubic_roots(1.0, -2.0, -5.0, 6.0);
        roots.sort_by(f64::total_cmp);
        assert_eq!(roots.len(), 3);
        assert_relative_eq!(roots[0], -2.0, epsilon = 1e-12);
        assert_relative_eq!(roots[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(roots[2], 3.0, epsilon = 1e-12);

        // (x - 2)(x² + 1)
        let roots = real_cubic_roots(1.0, -2.0, 1.0, -2.0);
        assert_eq!(roots.len(), 1);
        assert_relative_eq!(roots[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_recovers_pose_from_three_points() {
        let mut rng = StdRng::seed_from_u64(17);

        for _ in 0..20 {
            let omega = Vector3::new(
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
            );
            let t = Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
            let pose = SE3::from_axis_angle(&omega, t);

            let camera_points: [Vector3<f64>; 3] = std::array::from_fn(|_| {
                Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0), rng.gen_range(4.0..8.0))
            });
            let inverse = pose.inverse();
            let world = camera_points.map(|p| inverse.transform_point(&p));
            let bearings = camera_points.map(|p| p.normalize());

            let poses = solve_p3p(&world, &bearings);
            assert!(!poses.is_empty());

            // Every solution explains the three rays.
            for candidate in &poses {
                for (x, y) in world.iter().zip(&bearings) {
                    assert_relative_eq!(candidate.transform_point(x).normalize(), *y, epsilon = 1e-6);
                }
            }

            let found = poses.iter().any(|candidate| {
                (candidate.rotation_matrix() - pose.rotation_matrix()).norm() < 1e-6
                    && (candidate.translation - pose.translation).norm() < 1e-6
            });
            assert!(found);
        }
    }

    #[test]
    fn test_collinear_points_have_no_solution() {
        let world = [
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(1.0, 0.0, 5.0),
            Vector3::new(2.0, 0.0, 5.0),
        ];
        let bearings = world.map(|p| p.normalize());
        assert!(solve_p3p(&world, &bearings).is_empty());
    }
}
