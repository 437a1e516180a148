//! Tests for geo_utils module

use firetrack::geo_utils::*;
use firetrack::{Bounds, GeoPoint};

fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() < epsilon
}

#[test]
fn test_haversine_distance_same_point() {
    let p = GeoPoint::new(-33.4489, -70.6693);
    assert_eq!(haversine_distance(&p, &p), 0.0);
}

#[test]
fn test_haversine_distance_known_value() {
    // Santiago to Concepción is approximately 435 km
    let santiago = GeoPoint::new(-33.4489, -70.6693);
    let concepcion = GeoPoint::new(-36.8270, -73.0503);
    let dist = haversine_distance(&santiago, &concepcion);
    assert!(approx_eq(dist, 435_000.0, 10_000.0), "got {dist}");
}

#[test]
fn test_degree_conversions() {
    assert!(approx_eq(meters_to_lat_degrees(111_320.0), 1.0, 1e-9));
    // Longitude degrees widen away from the equator
    assert!(meters_to_lng_degrees(1000.0, -60.0) > meters_to_lng_degrees(1000.0, 0.0));
    assert!(approx_eq(
        meters_to_lng_degrees(1000.0, -60.0),
        2.0 * meters_to_lat_degrees(1000.0),
        1e-9
    ));
    // Clamped near the poles
    assert!(meters_to_lng_degrees(1000.0, 90.0).is_finite());
}

#[test]
fn test_compute_bounds() {
    let points = vec![
        GeoPoint::new(-37.10, -72.60),
        GeoPoint::new(-37.00, -72.40),
        GeoPoint::new(-37.05, -72.50),
    ];
    let bounds = compute_bounds(&points);
    assert_eq!(bounds.min_lat, -37.10);
    assert_eq!(bounds.max_lat, -37.00);
    assert_eq!(bounds.min_lng, -72.60);
    assert_eq!(bounds.max_lng, -72.40);
    assert_eq!(compute_bounds(&[]).min_lat, 0.0);
}

#[test]
fn test_compute_center() {
    let points = vec![GeoPoint::new(-37.0, -72.0), GeoPoint::new(-38.0, -73.0)];
    let center = compute_center(&points);
    assert!(approx_eq(center.latitude, -37.5, 1e-12));
    assert!(approx_eq(center.longitude, -72.5, 1e-12));
    assert_eq!(compute_center(&[]), GeoPoint::new(0.0, 0.0));
}

#[test]
fn test_bounds_overlap() {
    let a = Bounds {
        min_lat: -37.0,
        max_lat: -36.0,
        min_lng: -73.0,
        max_lng: -72.0,
    };
    let touching = Bounds {
        min_lat: -36.0,
        max_lat: -35.0,
        min_lng: -72.0,
        max_lng: -71.0,
    };
    let apart = Bounds {
        min_lat: -34.0,
        max_lat: -33.0,
        min_lng: -73.0,
        max_lng: -72.0,
    };
    assert!(bounds_overlap(&a, &touching));
    assert!(!bounds_overlap(&a, &apart));
}

#[test]
fn test_expand_meters_contains_points_within_radius() {
    let center = GeoPoint::new(-37.0, -72.5);
    let bbox = Bounds::from_point(&center).expand_meters(10_000.0);
    assert!(bbox.contains(&center));
    // 9 km east and north fit, 11 km do not
    let east_9km = GeoPoint::new(-37.0, -72.5 + meters_to_lng_degrees(9_000.0, -37.0));
    let north_11km = GeoPoint::new(-37.0 + meters_to_lat_degrees(11_000.0), -72.5);
    assert!(bbox.contains(&east_9km));
    assert!(!bbox.contains(&north_11km));
    assert!(approx_eq(bbox.center().latitude, center.latitude, 1e-9));
    assert!(approx_eq(bbox.center().longitude, center.longitude, 1e-9));
}

#[test]
fn test_geo_point_validity() {
    assert!(GeoPoint::new(-37.0, -72.5).is_valid());
    assert!(!GeoPoint::new(-91.0, 0.0).is_valid());
    assert!(!GeoPoint::new(0.0, 181.0).is_valid());
    assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
}
