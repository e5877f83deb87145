//! GNSS measurement interface.
//!
//! Ephemeris decoding is an external concern: the estimator only consumes
//! the [`Ephemeris`] trait, which yields a satellite's ECEF state at a
//! transmit time. Observations arrive pre-decoded as
//! [`GnssObservation`] batches per receiver epoch.

pub mod geo;

use std::sync::Arc;

use nalgebra::Vector3;

pub use geo::{ecef2geo, ecef2rotation, klobuchar_iono_delay, saastamoinen_tropo_delay, sat_azel};
pub use geo::{EARTH_OMEGA, GPS_L1_FREQ, LIGHT_SPEED};

/// Constellation of a tracked satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SatSystem {
    Gps,
    Glonass,
    Galileo,
    Beidou,
}

impl SatSystem {
    /// Index into the per-system receiver clock-bias array.
    pub fn index(&self) -> usize {
        match self {
            SatSystem::Gps => 0,
            SatSystem::Glonass => 1,
            SatSystem::Galileo => 2,
            SatSystem::Beidou => 3,
        }
    }
}

/// Satellite position, velocity, and clock state at a transmit epoch, all
/// in ECEF.
#[derive(Debug, Clone, Copy)]
pub struct SatelliteState {
    pub pos: Vector3<f64>,
    pub vel: Vector3<f64>,
    /// Satellite clock bias (seconds), group delay already applied.
    pub clock_bias: f64,
    /// Satellite clock drift (s/s).
    pub clock_drift: f64,
}

/// Broadcast ephemeris abstraction; decoding lives outside this crate.
pub trait Ephemeris: Send + Sync {
    fn system(&self) -> SatSystem;
    /// Time of ephemeris in GNSS seconds, used for best-match selection.
    fn toe_s(&self) -> f64;
    /// Satellite state at the given transmit time (GNSS seconds).
    fn satellite_state(&self, transmit_time_s: f64) -> SatelliteState;
}

pub type EphemerisPtr = Arc<dyn Ephemeris>;

/// One satellite's L1 observation at a receiver epoch.
#[derive(Debug, Clone)]
pub struct GnssObservation {
    pub sat: u32,
    pub system: SatSystem,
    /// Receiver epoch in the GNSS timebase (seconds).
    pub time_s: f64,
    /// Pseudorange (meters) and its standard deviation.
    pub psr: f64,
    pub psr_std: f64,
    /// Doppler (Hz, positive closing) and its standard deviation.
    pub dopp: f64,
    pub dopp_std: f64,
    /// Carrier-to-noise density (dB-Hz).
    pub snr: f64,
    /// Carrier frequency of the observation (Hz).
    pub freq_hz: f64,
}

impl GnssObservation {
    /// Carrier wavelength (meters).
    pub fn wavelength(&self) -> f64 {
        LIGHT_SPEED / self.freq_hz
    }
}

/// Resolves the satellite state for an observation: the transmit epoch is
/// the receiver epoch minus signal flight time and satellite clock bias.
pub fn satellite_state_for(obs: &GnssObservation, ephem: &EphemerisPtr) -> SatelliteState {
    let coarse_tx = obs.time_s - obs.psr / LIGHT_SPEED;
    let first = ephem.satellite_state(coarse_tx);
    ephem.satellite_state(coarse_tx - first.clock_bias)
}

/// Klobuchar broadcast parameters (8 coefficients) with their reference
/// epoch.
#[derive(Debug, Clone)]
pub struct IonoParams {
    pub params: Vec<f64>,
    pub ref_time_s: f64,
}

impl IonoParams {
    pub fn new(params: Vec<f64>, ref_time_s: f64) -> Self {
        Self { params, ref_time_s }
    }
}
