//! Geodesy and atmospheric corrections for GNSS processing.
//!
//! ECEF↔geodetic conversion, the local ENU rotation, satellite
//! azimuth/elevation, the Klobuchar ionospheric model, and the
//! Saastamoinen tropospheric model.

use nalgebra::{Matrix3, Vector3};

/// Speed of light (m/s).
pub const LIGHT_SPEED: f64 = 299_792_458.0;
/// Earth rotation rate (rad/s), WGS-84.
pub const EARTH_OMEGA: f64 = 7.292_115_146_7e-5;
/// GPS L1 carrier frequency (Hz).
pub const GPS_L1_FREQ: f64 = 1_575.42e6;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_E2: f64 = 6.694_379_990_14e-3;

/// ECEF → geodetic `(lat, lon, height)` in radians/meters.
pub fn ecef2geo(p: &Vector3<f64>) -> Vector3<f64> {
    let lon = p.y.atan2(p.x);
    let r = (p.x * p.x + p.y * p.y).sqrt();
    let mut lat = p.z.atan2(r * (1.0 - WGS84_E2));
    let mut h = 0.0;
    for _ in 0..5 {
        let sin_lat = lat.sin();
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        h = r / lat.cos() - n;
        lat = p.z.atan2(r * (1.0 - WGS84_E2 * n / (n + h)));
    }
    Vector3::new(lat, lon, h)
}

/// Rotation from the local ENU frame at `anchor` (ECEF) to ECEF.
pub fn ecef2rotation(anchor: &Vector3<f64>) -> Matrix3<f64> {
    let geo = ecef2geo(anchor);
    let (sin_lat, cos_lat) = geo.x.sin_cos();
    let (sin_lon, cos_lon) = geo.y.sin_cos();
    // columns: east, north, up expressed in ECEF
    Matrix3::new(
        -sin_lon, -sin_lat * cos_lon, cos_lat * cos_lon,
        cos_lon, -sin_lat * sin_lon, cos_lat * sin_lon,
        0.0, cos_lat, sin_lat,
    )
}

/// Azimuth/elevation (radians) of a satellite seen from `receiver`, both
/// in ECEF. Returns `(azimuth, elevation)`.
pub fn sat_azel(receiver: &Vector3<f64>, sat: &Vector3<f64>) -> (f64, f64) {
    if receiver.norm() < 1.0 {
        // undefined at the geocenter; treat as zenith
        return (0.0, std::f64::consts::FRAC_PI_2);
    }
    let r_enu = ecef2rotation(receiver);
    let los = r_enu.transpose() * (sat - receiver);
    let az = los.x.atan2(los.y);
    let el = (los.z / los.norm()).asin();
    (if az < 0.0 { az + 2.0 * std::f64::consts::PI } else { az }, el)
}

/// Klobuchar broadcast ionospheric delay (meters) at GPS time-of-day
/// `t_gps_s`, for the given receiver geodetic position and satellite
/// azimuth/elevation. `params` holds the 8 broadcast α/β coefficients.
pub fn klobuchar_iono_delay(
    t_gps_s: f64,
    lat: f64,
    lon: f64,
    az: f64,
    el: f64,
    params: &[f64],
) -> f64 {
    if params.len() < 8 {
        return 0.0;
    }
    let pi = std::f64::consts::PI;
    // earth-centered angle and ionospheric pierce point (semicircles)
    let psi = 0.0137 / (el / pi + 0.11) - 0.022;
    let mut phi_i = lat / pi + psi * az.cos();
    phi_i = phi_i.clamp(-0.416, 0.416);
    let lambda_i = lon / pi + psi * az.sin() / (phi_i * pi).cos();
    let phi_m = phi_i + 0.064 * ((lambda_i - 1.617) * pi).cos();

    let mut t = 43_200.0 * lambda_i + t_gps_s;
    t = t.rem_euclid(86_400.0);

    let slant = 1.0 + 16.0 * (0.53 - el / pi).powi(3);

    let amp = (params[0] + phi_m * (params[1] + phi_m * (params[2] + phi_m * params[3]))).max(0.0);
    let per = (params[4] + phi_m * (params[5] + phi_m * (params[6] + phi_m * params[7])))
        .max(72_000.0);

    let x = 2.0 * pi * (t - 50_400.0) / per;
    let delay = if x.abs() < 1.57 {
        slant * (5e-9 + amp * (1.0 - x * x / 2.0 + x.powi(4) / 24.0))
    } else {
        slant * 5e-9
    };
    delay * LIGHT_SPEED
}

/// Saastamoinen tropospheric delay (meters) from elevation (radians),
/// ellipsoidal height (meters), and relative humidity `[0, 1]`.
pub fn saastamoinen_tropo_delay(height: f64, el: f64, humidity: f64) -> f64 {
    if el <= 0.0 {
        return 0.0;
    }
    let h = height.clamp(0.0, 11_000.0);
    let pressure = 1013.25 * (1.0 - 2.2557e-5 * h).powf(5.2568);
    let temperature = 15.0 - 6.5e-3 * h + 273.15;
    let e = 6.108 * humidity
        * ((17.15 * temperature - 4684.0) / (temperature - 38.45)).exp();

    let z = std::f64::consts::FRAC_PI_2 - el;
    0.002277 / z.cos()
        * (pressure + (1255.0 / temperature + 0.05) * e - z.tan().powi(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// ECEF of a point on the equator at the prime meridian.
    fn equator_point() -> Vector3<f64> {
        Vector3::new(WGS84_A, 0.0, 0.0)
    }

    #[test]
    fn geo_round_trip_on_equator() {
        let geo = ecef2geo(&equator_point());
        assert_relative_eq!(geo.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(geo.y, 0.0, epsilon = 1e-9);
        assert!(geo.z.abs() < 1e-3);
    }

    #[test]
    fn enu_rotation_is_orthonormal() {
        let r = ecef2rotation(&Vector3::new(-2_700_000.0, 4_500_000.0, 3_600_000.0));
        assert_relative_eq!(r.transpose() * r, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn zenith_satellite_has_high_elevation() {
        let rcv = equator_point();
        let sat = rcv * 4.0; // straight up
        let (_, el) = sat_azel(&rcv, &sat);
        assert_relative_eq!(el, std::f64::consts::FRAC_PI_2, epsilon = 1e-6);
    }

    #[test]
    fn tropo_grows_toward_horizon() {
        let zenith = saastamoinen_tropo_delay(100.0, std::f64::consts::FRAC_PI_2, 0.5);
        let low = saastamoinen_tropo_delay(100.0, 0.3, 0.5);
        assert!(zenith > 2.0 && zenith < 3.0, "zenith delay {zenith}");
        assert!(low > zenith);
    }

    #[test]
    fn iono_delay_is_bounded_and_positive() {
        let params = [
            1.1176e-8, 1.4901e-8, -5.9605e-8, -1.1921e-7,
            9.8304e4, 1.3107e5, -6.5536e4, -5.2429e5,
        ];
        let d = klobuchar_iono_delay(36_000.0, 0.6, 2.0, 1.0, 0.9, &params);
        assert!(d > 0.0 && d < 30.0, "iono delay {d}");
    }
}
