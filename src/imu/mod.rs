//! Inertial measurement handling: noise model and pre-integration.

pub mod preintegration;

pub use preintegration::{EncoderExtrinsics, ImuNoise, Preintegration, O_OL, O_OR, O_P, O_R, O_V};
