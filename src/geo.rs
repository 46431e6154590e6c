//! WGS84 helpers for reference-position diagnostics.

const WGS84_SEMI_MAJOR: f64 = 6_378_137.0;
const WGS84_FLATTENING: f64 = 1.0 / 298.257_223_563;

/// Mean earth radius used by the haversine ground distance.
const EARTH_RADIUS: f64 = 6_371_000.0;

fn eccentricity_squared() -> f64 {
    2.0 * WGS84_FLATTENING - WGS84_FLATTENING * WGS84_FLATTENING
}

/// Converts earth-centered, earth-fixed meters to geodetic latitude and
/// longitude in degrees plus ellipsoidal height in meters. Latitude and
/// height are mutually dependent, so the latitude is refined iteratively;
/// a handful of rounds converges far below correction-level precision.
pub fn ecef_to_lla(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    let e2 = eccentricity_squared();

    let lon = y.atan2(x);
    let p = (x * x + y * y).sqrt();
    let mut lat = z.atan2(p * (1.0 - e2));
    let mut alt = 0.0;

    for _ in 0..5 {
        let n = WGS84_SEMI_MAJOR / (1.0 - e2 * lat.sin() * lat.sin()).sqrt();
        alt = p / lat.cos() - n;
        lat = z.atan2(p * (1.0 - e2 * n / (n + alt)));
    }

    let n = WGS84_SEMI_MAJOR / (1.0 - e2 * lat.sin() * lat.sin()).sqrt();
    alt = p / lat.cos() - n;

    (lat.to_degrees(), lon.to_degrees(), alt)
}

/// The forward conversion: geodetic degrees and ellipsoidal height to
/// ECEF meters.
pub fn lla_to_ecef(latitude: f64, longitude: f64, altitude: f64) -> (f64, f64, f64) {
    let e2 = eccentricity_squared();
    let lat = latitude.to_radians();
    let lon = longitude.to_radians();

    let n = WGS84_SEMI_MAJOR / (1.0 - e2 * lat.sin() * lat.sin()).sqrt();

    (
        (n + altitude) * lat.cos() * lon.cos(),
        (n + altitude) * lat.cos() * lon.sin(),
        (n * (1.0 - e2) + altitude) * lat.sin(),
    )
}

/// Ground distance in meters between two positions in degrees.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS * a.sqrt().atan2((1.0 - a).sqrt())
}
