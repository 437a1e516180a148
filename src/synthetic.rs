//! Synthetic hotspot generator for stress testing and benchmarking.
//!
//! Generates detection sets with known fires (dense, drifting hotspot
//! clusters) scattered over isolated background detections, so clustering
//! results can be checked against ground truth.
//!
//! Feature-gated behind `synthetic`, not included in production builds.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use firetrack::GeoPoint;
//! use firetrack::synthetic::{FireConfig, SyntheticScenario};
//!
//! let scenario = SyntheticScenario {
//!     origin: GeoPoint::new(-37.0, -72.5),
//!     start: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
//!     fires: vec![FireConfig::new(0.0, 0.0, 0.0, 12.0, 25)],
//!     background_count: 10,
//!     background_radius_km: 60.0,
//!     span_hours: 72.0,
//!     seed: 42,
//! };
//!
//! let dataset = scenario.generate();
//! assert_eq!(dataset.detections.len(), 35);
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

use crate::geo_utils::{meters_to_lat_degrees, meters_to_lng_degrees};
use crate::{GeoPoint, NewDetection};

// ============================================================================
// Types
// ============================================================================

/// One simulated fire.
#[derive(Debug, Clone)]
pub struct FireConfig {
    /// Ignition point, kilometres north of the scenario origin.
    pub north_km: f64,
    /// Ignition point, kilometres east of the scenario origin.
    pub east_km: f64,
    /// Hours after the scenario start.
    pub start_offset_hours: f64,
    pub duration_hours: f64,
    pub detection_count: usize,
    /// Gaussian sigma of hotspot positions around the front, in meters.
    pub spread_meters: f64,
    /// Front drift speed in meters per hour.
    pub drift_meters_per_hour: f64,
    /// Drift heading in radians (0 = north).
    pub drift_heading: f64,
    /// Upper bound of sampled FRP (MW).
    pub max_frp: f64,
    pub province: Option<String>,
}

impl FireConfig {
    pub fn new(
        north_km: f64,
        east_km: f64,
        start_offset_hours: f64,
        duration_hours: f64,
        detection_count: usize,
    ) -> Self {
        Self {
            north_km,
            east_km,
            start_offset_hours,
            duration_hours,
            detection_count,
            spread_meters: 150.0,
            drift_meters_per_hour: 0.0,
            drift_heading: 0.0,
            max_frp: 80.0,
            province: None,
        }
    }

    pub fn drifting(mut self, meters_per_hour: f64, heading: f64) -> Self {
        self.drift_meters_per_hour = meters_per_hour;
        self.drift_heading = heading;
        self
    }

    pub fn in_province(mut self, province: impl Into<String>) -> Self {
        self.province = Some(province.into());
        self
    }
}

/// A reproducible detection set.
#[derive(Debug, Clone)]
pub struct SyntheticScenario {
    pub origin: GeoPoint,
    pub start: DateTime<Utc>,
    pub fires: Vec<FireConfig>,
    /// Isolated detections spread uniformly over the area and time span.
    pub background_count: usize,
    pub background_radius_km: f64,
    pub span_hours: f64,
    /// RNG seed for deterministic reproduction.
    pub seed: u64,
}

/// Generated detections plus ground truth.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    /// Detections ordered by time.
    pub detections: Vec<NewDetection>,
    /// Index into `SyntheticScenario::fires` per detection; `None` for
    /// background.
    pub fire_labels: Vec<Option<usize>>,
    pub metadata: DatasetMetadata,
}

#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    pub fire_count: usize,
    pub fire_detections: usize,
    pub background_detections: usize,
    pub first_detection: Option<DateTime<Utc>>,
    pub last_detection: Option<DateTime<Utc>>,
}

// ============================================================================
// Helpers
// ============================================================================

fn offset_point(origin: &GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
    GeoPoint::new(
        origin.latitude + meters_to_lat_degrees(north_m),
        origin.longitude + meters_to_lng_degrees(east_m, origin.latitude),
    )
}

/// Standard normal pair via Box-Muller.
fn gaussian_pair(rng: &mut StdRng) -> (f64, f64) {
    let u1: f64 = rng.gen_range(0.0001..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    let r = (-2.0 * u1.ln()).sqrt();
    (r * (2.0 * PI * u2).cos(), r * (2.0 * PI * u2).sin())
}

fn offset_time(start: DateTime<Utc>, hours: f64) -> DateTime<Utc> {
    start + Duration::milliseconds((hours * 3_600_000.0) as i64)
}

fn fire_detections(
    origin: &GeoPoint,
    start: DateTime<Utc>,
    fire: &FireConfig,
    rng: &mut StdRng,
) -> Vec<NewDetection> {
    let ignition = offset_point(origin, fire.north_km * 1000.0, fire.east_km * 1000.0);

    (0..fire.detection_count)
        .map(|_| {
            let hours_in = rng.gen_range(0.0..fire.duration_hours.max(0.01));
            let drift = fire.drift_meters_per_hour * hours_in;
            let front = offset_point(
                &ignition,
                drift * fire.drift_heading.cos(),
                drift * fire.drift_heading.sin(),
            );

            let (zn, ze) = gaussian_pair(rng);
            let position = offset_point(&front, zn * fire.spread_meters, ze * fire.spread_meters);

            let mut detection = NewDetection::new(
                offset_time(start, fire.start_offset_hours + hours_in),
                position.latitude,
                position.longitude,
                rng.gen_range(1.0..fire.max_frp.max(1.5)),
                rng.gen_range(60.0..100.0),
            );
            detection.province = fire.province.clone();
            detection
        })
        .collect()
}

fn background_detections(scenario: &SyntheticScenario, rng: &mut StdRng) -> Vec<NewDetection> {
    (0..scenario.background_count)
        .map(|_| {
            // Uniform over the disc
            let r = scenario.background_radius_km * 1000.0 * rng.gen_range(0.0_f64..1.0).sqrt();
            let theta = rng.gen_range(0.0..(2.0 * PI));
            let position = offset_point(&scenario.origin, r * theta.cos(), r * theta.sin());

            NewDetection::new(
                offset_time(scenario.start, rng.gen_range(0.0..scenario.span_hours.max(0.01))),
                position.latitude,
                position.longitude,
                rng.gen_range(0.5..15.0),
                rng.gen_range(30.0..95.0),
            )
        })
        .collect()
}

// ============================================================================
// Scenario Implementation
// ============================================================================

impl SyntheticScenario {
    /// Generate the dataset for this scenario.
    pub fn generate(&self) -> SyntheticDataset {
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut labelled: Vec<(NewDetection, Option<usize>)> = Vec::new();
        for (idx, fire) in self.fires.iter().enumerate() {
            labelled.extend(
                fire_detections(&self.origin, self.start, fire, &mut rng)
                    .into_iter()
                    .map(|d| (d, Some(idx))),
            );
        }
        let fire_detections = labelled.len();

        labelled.extend(
            background_detections(self, &mut rng)
                .into_iter()
                .map(|d| (d, None)),
        );

        labelled.sort_by_key(|(d, _)| d.detected_at);

        let (detections, fire_labels): (Vec<NewDetection>, Vec<Option<usize>>) =
            labelled.into_iter().unzip();

        let metadata = DatasetMetadata {
            fire_count: self.fires.len(),
            fire_detections,
            background_detections: detections.len() - fire_detections,
            first_detection: detections.first().map(|d| d.detected_at),
            last_detection: detections.last().map(|d| d.detected_at),
        };

        SyntheticDataset {
            detections,
            fire_labels,
            metadata,
        }
    }
}

// ============================================================================
// Preset Scenarios
// ============================================================================

/// Biobío region, central-south Chile.
const BIOBIO: GeoPoint = GeoPoint {
    latitude: -37.3,
    longitude: -72.4,
};

fn scenario_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

impl SyntheticScenario {
    /// One stationary fire, no background. Baseline.
    pub fn single_fire() -> Self {
        Self {
            origin: BIOBIO,
            start: scenario_start(),
            fires: vec![FireConfig::new(0.0, 0.0, 0.0, 12.0, 30).in_province("Biobío")],
            background_count: 0,
            background_radius_km: 0.0,
            span_hours: 12.0,
            seed: 42,
        }
    }

    /// Four separate fires over three days with sparse background noise.
    pub fn fire_season() -> Self {
        Self {
            origin: BIOBIO,
            start: scenario_start(),
            fires: vec![
                FireConfig::new(0.0, 0.0, 0.0, 18.0, 40).in_province("Biobío"),
                FireConfig::new(35.0, -20.0, 6.0, 30.0, 60)
                    .drifting(60.0, PI / 4.0)
                    .in_province("Ñuble"),
                FireConfig::new(-40.0, 25.0, 24.0, 12.0, 25).in_province("Araucanía"),
                FireConfig::new(10.0, 45.0, 48.0, 20.0, 35).in_province("Biobío"),
            ],
            background_count: 40,
            background_radius_km: 80.0,
            span_hours: 72.0,
            seed: 43,
        }
    }

    /// A front crossing several kilometres over two days.
    pub fn spreading_front() -> Self {
        Self {
            origin: BIOBIO,
            start: scenario_start(),
            fires: vec![FireConfig::new(0.0, 0.0, 0.0, 48.0, 120).drifting(120.0, PI / 2.0)],
            background_count: 0,
            background_radius_km: 0.0,
            span_hours: 48.0,
            seed: 44,
        }
    }

    /// Only isolated detections: everything should end up as noise.
    pub fn background_only(count: usize) -> Self {
        Self {
            origin: BIOBIO,
            start: scenario_start(),
            fires: Vec::new(),
            background_count: count,
            background_radius_km: 200.0,
            span_hours: 240.0,
            seed: count as u64 * 7919,
        }
    }

    /// `fire_count` fires of `detections_per_fire` each on a 25 km grid.
    pub fn with_fire_count(fire_count: usize, detections_per_fire: usize) -> Self {
        let side = (fire_count as f64).sqrt().ceil().max(1.0) as usize;
        let fires = (0..fire_count)
            .map(|i| {
                let row = (i / side) as f64;
                let col = (i % side) as f64;
                FireConfig::new(row * 25.0, col * 25.0, (i % 5) as f64 * 6.0, 24.0, detections_per_fire)
            })
            .collect();

        Self {
            origin: BIOBIO,
            start: scenario_start(),
            fires,
            background_count: fire_count * 2,
            background_radius_km: side as f64 * 25.0,
            span_hours: 72.0,
            seed: fire_count as u64 * 1000 + detections_per_fire as u64,
        }
    }
}
