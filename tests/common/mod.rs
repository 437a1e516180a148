//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use firetrack::{FireStore, NewClusteringVersion, NewDetection};

/// Base instant for every scenario.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
}

pub fn hours(h: i64) -> DateTime<Utc> {
    t0() + Duration::hours(h)
}

/// Longitude offset in degrees for `km` east at latitude -37.
pub fn km_east(km: f64) -> f64 {
    km * 1000.0 / (111_320.0 * (37.0_f64).to_radians().cos())
}

/// Latitude offset in degrees for `km` north.
pub fn km_north(km: f64) -> f64 {
    km * 1000.0 / 111_320.0
}

pub const LAT: f64 = -37.0;
pub const LNG: f64 = -72.5;

/// Store with an active version: 1 km, 3 points, 24 h.
pub fn seed_version<S: FireStore + ?Sized>(store: &mut S) {
    store
        .insert_clustering_version(NewClusteringVersion::new(1.0, 3, 24.0), t0() - Duration::days(30))
        .unwrap();
}

/// `n` detections ~11 m and 10 minutes apart, starting at `start`.
pub fn burst(lat: f64, lng: f64, start: DateTime<Utc>, n: usize) -> Vec<NewDetection> {
    (0..n)
        .map(|i| {
            NewDetection::new(
                start + Duration::minutes(10 * i as i64),
                lat + i as f64 * 0.0001,
                lng,
                20.0 + i as f64,
                85.0,
            )
            .with_province("Biobío")
        })
        .collect()
}

pub fn insert_burst<S: FireStore + ?Sized>(
    store: &mut S,
    lat: f64,
    lng: f64,
    start: DateTime<Utc>,
    n: usize,
) -> Vec<i64> {
    store.insert_detections(&burst(lat, lng, start, n)).unwrap()
}
