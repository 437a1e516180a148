//! # firetrack
//!
//! Spatio-temporal clustering of satellite hotspot detections.
//!
//! This library provides:
//! - ST-DBSCAN clustering of raw detections into fire events
//! - Episode tracking across days/weeks, including merge resolution
//! - A recomputed-from-scratch episode status state machine
//! - Environment-aware parameter resolution
//! - In-memory and SQLite-backed stores behind one repository trait
//!
//! ## Features
//!
//! - **`parallel`** - Parallel neighbour search with rayon
//! - **`persistence`** - SQLite store (`SqliteStore`) and the `firetrack-cli` binary
//! - **`synthetic`** - Seeded hotspot scenario generator for tests and benchmarks
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use firetrack::{
//!     ClusteringEngine, Environment, FireStore, InMemoryStore, NewClusteringVersion,
//!     NewDetection, RunOptions,
//! };
//!
//! let mut store = InMemoryStore::new();
//! let t0 = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
//! store
//!     .insert_clustering_version(NewClusteringVersion::new(1.0, 3, 24.0), t0)
//!     .unwrap();
//!
//! let detections: Vec<NewDetection> = (0..3)
//!     .map(|i| NewDetection::new(t0 + Duration::minutes(i * 20), -33.45, -70.66, 40.0, 85.0))
//!     .collect();
//! store.insert_detections(&detections).unwrap();
//!
//! let engine = ClusteringEngine::new(Environment::Development);
//! let options = RunOptions::days_back(7, t0 + Duration::hours(1));
//! let report = engine.run(&mut store, &options, t0 + Duration::hours(1)).unwrap();
//! assert_eq!(report.detections.events_created, 1);
//! assert_eq!(report.episodes_created, 1);
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{FireTrackError, OptionExt, Result};

// Geographic utilities (distance, bounds, center calculations)
pub mod geo_utils;

// Canonical parameters and clustering version resolution
pub mod config;
pub use config::{Environment, FlowConfig, ParameterSource};

// Repository trait and in-memory implementation
pub mod store;
pub use store::{CandidateQuery, FireStore, InMemoryStore, with_transaction};

// Detection and episode clustering stages
pub mod clustering;
pub use clustering::{
    Assignment, AssignmentOutcome, DetectionClusterer, DetectionRunStats, EpisodeClusterer,
    EpisodeLifecycleManager, EpisodeMetrics, RunContext, StDbscanParams, st_dbscan,
};

// Scheduled batch pass
pub mod engine;
pub use engine::{ClusteringEngine, RunLease, RunOptions, RunReport};

// SQLite-backed store
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// Seeded hotspot scenarios for tests and benchmarks
#[cfg(feature = "synthetic")]
pub mod synthetic;

// ============================================================================
// Geometry
// ============================================================================

/// A WGS84 coordinate.
///
/// # Example
/// ```
/// use firetrack::GeoPoint;
/// let point = GeoPoint::new(-33.45, -70.66); // Santiago
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Degenerate bounds around a single point.
    pub fn from_point(point: &GeoPoint) -> Self {
        Self {
            min_lat: point.latitude,
            max_lat: point.latitude,
            min_lng: point.longitude,
            max_lng: point.longitude,
        }
    }

    /// Create bounds from points. Returns `None` for an empty slice.
    pub fn from_points(points: &[GeoPoint]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bounds = Self::from_point(first);
        for p in rest {
            bounds.min_lat = bounds.min_lat.min(p.latitude);
            bounds.max_lat = bounds.max_lat.max(p.latitude);
            bounds.min_lng = bounds.min_lng.min(p.longitude);
            bounds.max_lng = bounds.max_lng.max(p.longitude);
        }
        Some(bounds)
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Grow the box by a distance in meters on every side.
    pub fn expand_meters(&self, meters: f64) -> Self {
        let mid_lat = (self.min_lat + self.max_lat) / 2.0;
        let dlat = geo_utils::meters_to_lat_degrees(meters);
        let dlng = geo_utils::meters_to_lng_degrees(meters, mid_lat);
        Self {
            min_lat: (self.min_lat - dlat).max(-90.0),
            max_lat: (self.max_lat + dlat).min(90.0),
            min_lng: self.min_lng - dlng,
            max_lng: self.max_lng + dlng,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Lifecycle status of a fire event.
///
/// `Controlled` is only ever set by an external collaborator (field reports);
/// the clusterer creates events as `Active` and ages them from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Active,
    Monitoring,
    Controlled,
    Extinct,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Monitoring => "monitoring",
            EventStatus::Controlled => "controlled",
            EventStatus::Extinct => "extinct",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = FireTrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(EventStatus::Active),
            "monitoring" => Ok(EventStatus::Monitoring),
            "controlled" => Ok(EventStatus::Controlled),
            "extinct" => Ok(EventStatus::Extinct),
            other => Err(FireTrackError::UnknownVariant {
                kind: "event status",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a fire episode. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Active,
    Monitoring,
    Extinct,
    Closed,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Active => "active",
            EpisodeStatus::Monitoring => "monitoring",
            EpisodeStatus::Extinct => "extinct",
            EpisodeStatus::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EpisodeStatus::Closed)
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeStatus {
    type Err = FireTrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(EpisodeStatus::Active),
            "monitoring" => Ok(EpisodeStatus::Monitoring),
            "extinct" => Ok(EpisodeStatus::Extinct),
            "closed" => Ok(EpisodeStatus::Closed),
            other => Err(FireTrackError::UnknownVariant {
                kind: "episode status",
                value: other.to_string(),
            }),
        }
    }
}

/// Why two episodes were merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    SpatialOverlap,
    TemporalContinuity,
    ManualMerge,
    AlgorithmUpdate,
}

impl MergeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeReason::SpatialOverlap => "spatial_overlap",
            MergeReason::TemporalContinuity => "temporal_continuity",
            MergeReason::ManualMerge => "manual_merge",
            MergeReason::AlgorithmUpdate => "algorithm_update",
        }
    }
}

impl fmt::Display for MergeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeReason {
    type Err = FireTrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spatial_overlap" => Ok(MergeReason::SpatialOverlap),
            "temporal_continuity" => Ok(MergeReason::TemporalContinuity),
            "manual_merge" => Ok(MergeReason::ManualMerge),
            "algorithm_update" => Ok(MergeReason::AlgorithmUpdate),
            other => Err(FireTrackError::UnknownVariant {
                kind: "merge reason",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Detections
// ============================================================================

/// A single satellite hotspot pixel.
///
/// Immutable once ingested; the clusterer only ever sets `is_processed`
/// and `fire_event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: i64,
    pub detected_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Fire radiative power in MW
    pub fire_radiative_power: f64,
    /// Sensor confidence, 0-100
    pub confidence: f64,
    /// Administrative region stamped by ingestion, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    pub is_processed: bool,
    pub fire_event_id: Option<i64>,
}

impl Detection {
    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// A detection as delivered by the ingestion feed, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDetection {
    pub detected_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub fire_radiative_power: f64,
    pub confidence: f64,
    #[serde(default)]
    pub province: Option<String>,
}

impl NewDetection {
    pub fn new(
        detected_at: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
        fire_radiative_power: f64,
        confidence: f64,
    ) -> Self {
        Self {
            detected_at,
            latitude,
            longitude,
            fire_radiative_power,
            confidence,
            province: None,
        }
    }

    pub fn with_province(mut self, province: impl Into<String>) -> Self {
        self.province = Some(province.into());
        self
    }
}

// ============================================================================
// Fire Events
// ============================================================================

/// A spatio-temporal cluster of detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEvent {
    pub id: i64,
    pub centroid: GeoPoint,
    /// Earliest member detection
    pub start_date: DateTime<Utc>,
    /// Latest member detection
    pub end_date: DateTime<Utc>,
    pub total_detections: u32,
    pub avg_frp: f64,
    pub max_frp: f64,
    pub sum_frp: f64,
    pub avg_confidence: f64,
    pub is_significant: bool,
    pub status: EventStatus,
    pub h3_index: Option<String>,
    /// Most frequent member province
    pub province: Option<String>,
    pub estimated_area_hectares: f64,
    pub clustering_version_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Aggregates for a new event, computed by the detection clusterer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFireEvent {
    pub centroid: GeoPoint,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_detections: u32,
    pub avg_frp: f64,
    pub max_frp: f64,
    pub sum_frp: f64,
    pub avg_confidence: f64,
    pub is_significant: bool,
    pub status: EventStatus,
    pub h3_index: Option<String>,
    pub province: Option<String>,
    pub estimated_area_hectares: f64,
    pub clustering_version_id: i64,
}

impl NewFireEvent {
    pub fn into_event(self, id: i64, created_at: DateTime<Utc>) -> FireEvent {
        FireEvent {
            id,
            centroid: self.centroid,
            start_date: self.start_date,
            end_date: self.end_date,
            total_detections: self.total_detections,
            avg_frp: self.avg_frp,
            max_frp: self.max_frp,
            sum_frp: self.sum_frp,
            avg_confidence: self.avg_confidence,
            is_significant: self.is_significant,
            status: self.status,
            h3_index: self.h3_index,
            province: self.province,
            estimated_area_hectares: self.estimated_area_hectares,
            clustering_version_id: self.clustering_version_id,
            created_at,
        }
    }
}

// ============================================================================
// Fire Episodes
// ============================================================================

/// A longer-lived aggregate over one or more fire events.
///
/// Every metric here is a pure recomputation over the currently linked
/// events, see [`EpisodeLifecycleManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEpisode {
    pub id: i64,
    pub status: EpisodeStatus,
    pub start_date: DateTime<Utc>,
    /// `None` while the episode is open
    pub end_date: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub centroid: GeoPoint,
    pub bbox: Bounds,
    pub provinces: Vec<String>,
    pub event_count: u32,
    pub detection_count: u32,
    pub frp_sum: f64,
    pub frp_max: f64,
    pub estimated_area_hectares: f64,
    pub gee_candidate: bool,
    pub gee_priority: Option<i64>,
    pub clustering_version_id: i64,
    pub requires_recalculation: bool,
    /// Owned by the imagery collaborator; never written here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slides_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FireEpisode {
    /// The `[start, last_seen]` activity interval.
    pub fn active_interval(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start_date, self.last_seen_at)
    }
}

/// Seed values for an episode created from a single event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEpisode {
    pub start_date: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub centroid: GeoPoint,
    pub bbox: Bounds,
    pub provinces: Vec<String>,
    pub event_count: u32,
    pub detection_count: u32,
    pub frp_sum: f64,
    pub frp_max: f64,
    pub estimated_area_hectares: f64,
    pub clustering_version_id: i64,
}

impl NewEpisode {
    pub fn seeded_from(event: &FireEvent, clustering_version_id: i64) -> Self {
        Self {
            start_date: event.start_date,
            last_seen_at: event.end_date,
            centroid: event.centroid,
            bbox: Bounds::from_point(&event.centroid),
            provinces: event.province.iter().cloned().collect(),
            event_count: 1,
            detection_count: event.total_detections,
            frp_sum: event.sum_frp,
            frp_max: event.max_frp,
            estimated_area_hectares: event.estimated_area_hectares,
            clustering_version_id,
        }
    }

    /// New episodes start active and flagged for recomputation.
    pub fn into_episode(self, id: i64, now: DateTime<Utc>) -> FireEpisode {
        FireEpisode {
            id,
            status: EpisodeStatus::Active,
            start_date: self.start_date,
            end_date: None,
            last_seen_at: self.last_seen_at,
            centroid: self.centroid,
            bbox: self.bbox,
            provinces: self.provinces,
            event_count: self.event_count,
            detection_count: self.detection_count,
            frp_sum: self.frp_sum,
            frp_max: self.frp_max,
            estimated_area_hectares: self.estimated_area_hectares,
            gee_candidate: false,
            gee_priority: None,
            clustering_version_id: self.clustering_version_id,
            requires_recalculation: true,
            slides_data: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Link row: an event belongs to an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeEventLink {
    pub episode_id: i64,
    pub event_id: i64,
}

/// Append-only audit record of an episode merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMerger {
    /// Assigned by the store; 0 before insertion
    pub id: i64,
    pub absorbed_episode_id: i64,
    pub absorbing_episode_id: i64,
    pub reason: MergeReason,
    pub merged_by_version_id: i64,
    pub notes: Option<String>,
    pub merged_at: DateTime<Utc>,
}

impl EpisodeMerger {
    /// Build an unsaved merge record. An episode cannot absorb itself.
    pub fn new(
        absorbed_episode_id: i64,
        absorbing_episode_id: i64,
        reason: MergeReason,
        merged_by_version_id: i64,
        notes: Option<String>,
        merged_at: DateTime<Utc>,
    ) -> Result<Self> {
        if absorbed_episode_id == absorbing_episode_id {
            return Err(FireTrackError::InvalidMerge {
                episode_id: absorbed_episode_id,
            });
        }
        Ok(Self {
            id: 0,
            absorbed_episode_id,
            absorbing_episode_id,
            reason,
            merged_by_version_id,
            notes,
            merged_at,
        })
    }
}

// ============================================================================
// Clustering Versions
// ============================================================================

/// Versioned parameter snapshot governing both clustering stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringVersion {
    pub id: i64,
    /// Spatial epsilon for detection clustering
    pub epsilon_km: f64,
    pub min_points: u32,
    pub temporal_window_hours: f64,
    pub algorithm: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ClusteringVersion {
    pub fn epsilon_meters(&self) -> f64 {
        self.epsilon_km * 1000.0
    }

    pub fn temporal_window_seconds(&self) -> f64 {
        self.temporal_window_hours * 3600.0
    }

    /// Reject parameter sets the clusterer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon_km.is_finite() && self.epsilon_km > 0.0) {
            return Err(FireTrackError::Config {
                key: "clustering_version.epsilon_km".to_string(),
                reason: format!("must be positive, got {}", self.epsilon_km),
            });
        }
        if self.min_points == 0 {
            return Err(FireTrackError::Config {
                key: "clustering_version.min_points".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.temporal_window_hours.is_finite() && self.temporal_window_hours > 0.0) {
            return Err(FireTrackError::Config {
                key: "clustering_version.temporal_window_hours".to_string(),
                reason: format!("must be positive, got {}", self.temporal_window_hours),
            });
        }
        Ok(())
    }
}

/// Parameters for a clustering version about to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewClusteringVersion {
    pub epsilon_km: f64,
    pub min_points: u32,
    pub temporal_window_hours: f64,
    pub algorithm: String,
    pub is_active: bool,
}

impl NewClusteringVersion {
    /// An active ST-DBSCAN parameter set.
    pub fn new(epsilon_km: f64, min_points: u32, temporal_window_hours: f64) -> Self {
        Self {
            epsilon_km,
            min_points,
            temporal_window_hours,
            algorithm: clustering::st_dbscan::ALGORITHM_NAME.to_string(),
            is_active: true,
        }
    }

    pub fn into_version(self, id: i64, created_at: DateTime<Utc>) -> ClusteringVersion {
        ClusteringVersion {
            id,
            epsilon_km: self.epsilon_km,
            min_points: self.min_points,
            temporal_window_hours: self.temporal_window_hours,
            algorithm: self.algorithm,
            is_active: self.is_active,
            created_at,
        }
    }
}
