//! Tests for ST-DBSCAN clustering

use chrono::{DateTime, Duration, TimeZone, Utc};
use firetrack::GeoPoint;
use firetrack::clustering::st_dbscan::{
    NOISE, SpatioTemporalPoint, StDbscanParams, cluster_members, neighbourhoods, noise_members,
    st_dbscan, st_distance,
};

#[derive(Debug, Clone)]
struct Hotspot {
    lat: f64,
    lng: f64,
    at: DateTime<Utc>,
}

impl SpatioTemporalPoint for Hotspot {
    fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.at
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap()
}

fn hotspot(lat: f64, lng: f64, minutes: i64) -> Hotspot {
    Hotspot {
        lat,
        lng,
        at: t0() + Duration::minutes(minutes),
    }
}

fn params() -> StDbscanParams {
    StDbscanParams {
        eps_meters: 1_000.0,
        temporal_window_seconds: 24.0 * 3600.0,
        min_points: 3,
    }
}

#[test]
fn test_empty_input() {
    let points: Vec<Hotspot> = Vec::new();
    assert!(st_dbscan(&points, &params()).is_empty());
}

#[test]
fn test_two_separate_fires() {
    let mut points = Vec::new();
    for i in 0..4 {
        points.push(hotspot(-36.0 + i as f64 * 0.001, -72.0, i * 15));
    }
    for i in 0..3 {
        points.push(hotspot(-36.5 + i as f64 * 0.001, -72.0, 60 + i * 15));
    }

    let labels = st_dbscan(&points, &params());
    assert_eq!(labels, vec![0, 0, 0, 0, 1, 1, 1]);
    assert_eq!(cluster_members(&labels), vec![vec![0, 1, 2, 3], vec![4, 5, 6]]);
    assert!(noise_members(&labels).is_empty());
}

#[test]
fn test_too_few_points_is_noise() {
    let points = vec![hotspot(-36.0, -72.0, 0), hotspot(-36.0005, -72.0, 10)];
    let labels = st_dbscan(&points, &params());
    assert_eq!(labels, vec![NOISE, NOISE]);
    assert_eq!(noise_members(&labels), vec![0, 1]);
}

#[test]
fn test_same_place_different_days_do_not_cluster() {
    // Three co-located hotspots, each two days apart
    let points = vec![
        hotspot(-36.0, -72.0, 0),
        hotspot(-36.0, -72.0, 2 * 24 * 60),
        hotspot(-36.0, -72.0, 4 * 24 * 60),
    ];
    assert_eq!(st_dbscan(&points, &params()), vec![NOISE; 3]);
}

#[test]
fn test_time_gap_scales_into_meters() {
    let a = hotspot(-36.0, -72.0, 0);
    let b = hotspot(-36.0, -72.0, 6 * 60);
    // 6h of a 24h window with 1km eps reads as 250 m
    let d = st_distance(&a, &b, &params());
    assert!((d - 250.0).abs() < 1e-6, "got {d}");

    // Spatial term dominates once it is larger
    let c = hotspot(-36.005, -72.0, 6 * 60);
    let d = st_distance(&a, &c, &params());
    assert!(d > 500.0 && d < 600.0, "got {d}");
}

#[test]
fn test_chain_of_core_points_forms_one_cluster() {
    // 800 m steps: each point only reaches its direct neighbours
    let step = 800.0 / 111_320.0;
    let points: Vec<Hotspot> = (0..8)
        .map(|i| hotspot(-36.0 + i as f64 * step, -72.0, i * 5))
        .collect();

    let labels = st_dbscan(&points, &params());
    // The ends have only two neighbours but are reached from a core point
    assert!(labels.iter().all(|&l| l == 0), "got {labels:?}");
}

#[test]
fn test_neighbourhood_includes_self() {
    let points = vec![hotspot(-36.0, -72.0, 0), hotspot(-37.0, -72.0, 0)];
    let neighbours = neighbourhoods(&points, &params());
    assert_eq!(neighbours, vec![vec![0], vec![1]]);
}

#[test]
fn test_labels_do_not_depend_on_parallelism_order() {
    let points: Vec<Hotspot> = (0..200)
        .map(|i| {
            let fire = (i % 5) as f64;
            hotspot(-35.0 - fire * 0.2 + (i / 5) as f64 * 0.00005, -71.0, (i / 5) as i64)
        })
        .collect();

    let first = st_dbscan(&points, &params());
    let second = st_dbscan(&points, &params());
    assert_eq!(first, second);
    assert_eq!(cluster_members(&first).len(), 5);
}
