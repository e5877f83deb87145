//! Typed measurement residuals with analytic Jacobians, consumed by the
//! solver through the [`crate::solver::Factor`] interface.

pub mod gnss;
pub mod imu;
pub mod projection;

pub use gnss::{DdtSmoothFactor, DtDdtFactor, GnssPsrDoppFactor};
pub use imu::{ImuEncoderFactor, ImuFactor};
pub use projection::{ProjectionOneFrameTwoCam, ProjectionTwoFrameOneCam, ProjectionTwoFrameTwoCam};
