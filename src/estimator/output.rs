//! Output events published by the estimator.
//!
//! Consumers subscribe with a channel; every event is emitted while the
//! process mutex is held so readers observe atomic window updates.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// One published estimator output.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Window-rate odometry of the newest frame after a solve.
    Odometry {
        t: f64,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
        velocity: Vector3<f64>,
    },
    /// IMU-rate odometry from the fast predictor.
    FastOdometry {
        t: f64,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
        velocity: Vector3<f64>,
    },
    /// Positions of all window frames.
    KeyPoses { t: f64, poses: Vec<Vector3<f64>> },
    /// Camera pose of the newest keyframe (body pose composed with the
    /// left extrinsic).
    CameraPose {
        t: f64,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
    },
    /// Landmarks with solved depths, in world coordinates.
    PointCloud { t: f64, points: Vec<Vector3<f64>> },
    /// Landmarks whose anchor was just marginalized out.
    MarginCloud { t: f64, points: Vec<Vector3<f64>> },
    /// Keyframe pose emitted when the second-newest frame is retained.
    Keyframe {
        t: f64,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
    },
    /// World→body transform for downstream frame trees.
    Transform {
        t: f64,
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
    },
    /// Global state once the GNSS anchor is aligned.
    GnssState {
        t: f64,
        ecef_pos: Vector3<f64>,
        enu_pos: Vector3<f64>,
        enu_vel: Vector3<f64>,
        enu_ypr: Vector3<f64>,
    },
}

pub type OutputSender = crossbeam_channel::Sender<OutputEvent>;
pub type OutputReceiver = crossbeam_channel::Receiver<OutputEvent>;

/// Creates the unbounded publish channel.
pub fn output_channel() -> (OutputSender, OutputReceiver) {
    crossbeam_channel::unbounded()
}
