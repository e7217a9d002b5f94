//! Geometry: rigid transforms, projection, epipolar geometry,
//! triangulation and PnP (P3P minimal solver plus DLT).

pub mod epipolar;
pub mod p3p;
pub mod pnp;
pub mod projection;
pub mod se3;
pub mod so3;
pub mod triangulate;

pub use pnp::{solve_pnp_ransac, PnPResult, PnpConfig};
pub use se3::SE3;
pub use triangulate::{triangulate_points, TriangulatedPoint};
