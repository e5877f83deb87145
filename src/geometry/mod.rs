//! Geometry utilities: SO(3) helpers, triangulation, PnP, epipolar solving.

pub mod epipolar;
pub mod pnp;
pub mod so3;
pub mod triangulation;

pub use epipolar::solve_relative_rt;
pub use pnp::{solve_pnp, solve_pose_by_pnp};
pub use so3::{delta_q, g2r, positify, quat_left, quat_left_vec, quat_right, quat_right_vec, r2ypr, skew, ypr2r};
pub use triangulation::{triangulate_point, triangulate_point_multiview, world_to_camera};
