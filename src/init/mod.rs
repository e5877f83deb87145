//! Two-stage initialization: visual SfM with visual-IMU alignment for
//! metric scale and gravity, and the independent GNSS-VI aligner for the
//! ECEF anchor and receiver clock states.

pub mod alignment;
pub mod ex_rotation;
pub mod gnss_align;
pub mod sfm;

use nalgebra::{Matrix3, Vector3};

use crate::features::FeatureFrame;
use crate::imu::Preintegration;

pub use alignment::{linear_alignment, solve_gyroscope_bias, visual_imu_alignment};
pub use ex_rotation::InitialExRotation;
pub use gnss_align::{FrameObservations, GnssAlignment, GnssViInitializer};
pub use sfm::{GlobalSfm, SfmFeature, SfmResult};

/// A frame retained between startup and initialization: its feature
/// observations, SfM pose, and the temporary pre-integration from the
/// previous image frame.
pub struct ImageFrame {
    pub points: FeatureFrame,
    pub t: f64,
    pub r: Matrix3<f64>,
    pub t_vec: Vector3<f64>,
    pub pre_integration: Option<Preintegration>,
    pub is_key_frame: bool,
}

impl ImageFrame {
    pub fn new(points: FeatureFrame, t: f64) -> Self {
        Self {
            points,
            t,
            r: Matrix3::identity(),
            t_vec: Vector3::zeros(),
            pre_integration: None,
            is_key_frame: false,
        }
    }
}
