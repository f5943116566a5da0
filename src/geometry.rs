//! Spherical geometry on the celestial sphere. All angles are in degrees unless noted.

use std::ops::RangeInclusive;

use nalgebra::Vector3;

/// Height of a declination zone.
pub const ZONE_HEIGHT: f64 = 1.0;

/// Smallest `cos(decl)` used when widening ra ranges, so the poles do not divide by zero.
const MIN_COS_DECL: f64 = 1e-9;

/// Declination zone of a position.
pub fn zone(decl: f64) -> i32 {
    (decl / ZONE_HEIGHT).floor() as i32
}

/// Zones a search circle of `radius` around `decl` can touch.
pub fn zone_range(decl: f64, radius: f64) -> RangeInclusive<i32> {
    zone(decl - radius)..=zone(decl + radius)
}

/// Half-width in ra of a small circle of radius `theta` centred at `decl`.
///
/// Capped at 180, which means the whole ra circle.
pub fn alpha(theta: f64, decl: f64) -> f64 {
    let cos = decl.to_radians().cos().abs().max(MIN_COS_DECL);
    (theta / cos).min(180.)
}

/// Normalise ra into `[0, 360)`.
pub fn wrap_ra(ra: f64) -> f64 {
    let wrapped = ra.rem_euclid(360.);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360. { 0. } else { wrapped }
}

/// Signed ra difference `ra1 - ra2` in `[-180, 180)`.
pub fn delta_ra(ra1: f64, ra2: f64) -> f64 {
    (ra1 - ra2 + 180.).rem_euclid(360.) - 180.
}

/// Inclusive ra intervals within `[0, 360)` covering `ra ± half_width`.
pub(crate) fn ra_intervals(ra: f64, half_width: f64) -> Vec<(f64, f64)> {
    if half_width >= 180. {
        return vec![(0., 360.)];
    }
    let lo = ra - half_width;
    let hi = ra + half_width;
    if lo < 0. {
        vec![(lo + 360., 360.), (0., hi)]
    } else if hi >= 360. {
        vec![(lo, 360.), (0., hi - 360.)]
    } else {
        vec![(lo, hi)]
    }
}

/// Unit vector of `(ra, decl)`.
pub fn radec_to_xyz(ra: f64, decl: f64) -> Vector3<f64> {
    let (rasin, racos) = ra.to_radians().sin_cos();
    let (decsin, deccos) = decl.to_radians().sin_cos();
    Vector3::new(deccos * racos, deccos * rasin, decsin)
}

/// Angular distance in arcsec between two unit vectors, via the chord length.
pub fn angular_distance_arcsec(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let half_chord = ((a - b).norm() / 2.).min(1.);
    3600. * (2. * half_chord.asin()).to_degrees()
}

/// Squared chord length subtending `theta` degrees.
pub(crate) fn chord_sq(theta: f64) -> f64 {
    let chord = 2. * (theta.to_radians() / 2.).sin();
    chord * chord
}
