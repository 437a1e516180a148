//! Geographic utilities: distances, degree conversions, bounds and centers.

use crate::{Bounds, GeoPoint};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Meters per degree of latitude.
pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Great-circle distance between two points in meters.
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Latitude span in degrees covering `meters`.
pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE_LAT
}

/// Longitude span in degrees covering `meters` at the given latitude.
///
/// The cosine is clamped near the poles so the span stays finite.
pub fn meters_to_lng_degrees(meters: f64, latitude: f64) -> f64 {
    let cos = latitude.to_radians().cos().abs().max(0.01);
    meters / (METERS_PER_DEGREE_LAT * cos)
}

/// Bounds of a set of points; a zero box at the origin when empty.
pub fn compute_bounds(points: &[GeoPoint]) -> Bounds {
    Bounds::from_points(points).unwrap_or(Bounds {
        min_lat: 0.0,
        max_lat: 0.0,
        min_lng: 0.0,
        max_lng: 0.0,
    })
}

/// Arithmetic mean of a set of points; the origin when empty.
pub fn compute_center(points: &[GeoPoint]) -> GeoPoint {
    if points.is_empty() {
        return GeoPoint::new(0.0, 0.0);
    }
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.latitude).sum::<f64>() / n;
    let lng = points.iter().map(|p| p.longitude).sum::<f64>() / n;
    GeoPoint::new(lat, lng)
}

/// Check whether two boxes intersect (touching edges count).
pub fn bounds_overlap(a: &Bounds, b: &Bounds) -> bool {
    a.min_lat <= b.max_lat && a.max_lat >= b.min_lat && a.min_lng <= b.max_lng && a.max_lng >= b.min_lng
}
