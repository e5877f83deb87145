//! Sliding-window visual-inertial-GNSS odometry.
//!
//! Fuses camera features, inertial measurements, optional wheel-encoder
//! velocities, and optional GNSS pseudorange/Doppler observations into a
//! 6-DoF pose trajectory with metric scale, gravity alignment, and (when
//! GNSS is available) a global ECEF anchor.

pub mod config;
pub mod estimator;
pub mod factors;
pub mod features;
pub mod geometry;
pub mod gnss;
pub mod imu;
pub mod init;
pub mod solver;

pub use config::Config;
pub use estimator::{output_channel, Estimator, OutputReceiver, SolverFlag};
