//! Great-circle distance between two coordinate pairs.

use std::f64::consts::PI;

/// Earth radius in meters.
const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

#[inline]
fn hsin(theta: f64) -> f64 {
    (theta / 2.0).sin().powi(2)
}

/// Haversine distance in meters between two points given in degrees.
///
/// NaN inputs propagate to a NaN result; there are no error cases.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let la1 = lat1 * PI / 180.0;
    let lo1 = lon1 * PI / 180.0;
    let la2 = lat2 * PI / 180.0;
    let lo2 = lon2 * PI / 180.0;

    let h = hsin(la2 - la1) + la1.cos() * la2.cos() * hsin(lo2 - lo1);

    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}
