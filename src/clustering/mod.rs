//! # Clustering Stages
//!
//! The pipeline runs three stages, each over the typed [`FireStore`]:
//! - [`DetectionClusterer`] - ST-DBSCAN over pending detections → fire events
//! - [`EpisodeClusterer`] - event → episode assignment and merge resolution
//! - [`EpisodeLifecycleManager`] - metrics and status recomputed from scratch
//!
//! All stages share one [`RunContext`], resolved once per run.

pub mod detection;
pub mod episode;
pub mod lifecycle;
pub mod spatial_index;
pub mod st_dbscan;

pub use detection::{DetectionClusterer, DetectionRunStats};
pub use episode::{Assignment, AssignmentOutcome, EpisodeClusterer};
pub use lifecycle::{EpisodeLifecycleManager, EpisodeMetrics};
pub use spatial_index::SpatialIndex;
pub use st_dbscan::{StDbscanParams, st_dbscan};

use chrono::{DateTime, Utc};

use crate::config::{Environment, FlowConfig, resolve_active_version};
use crate::error::Result;
use crate::store::FireStore;
use crate::ClusteringVersion;

/// Parameters and clock shared by every stage of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub version: ClusteringVersion,
    pub flow: FlowConfig,
    /// Wall-clock time the run is evaluated at
    pub now: DateTime<Utc>,
}

impl RunContext {
    pub fn new(version: ClusteringVersion, flow: FlowConfig, now: DateTime<Utc>) -> Self {
        Self { version, flow, now }
    }

    /// Load the active clustering version and canonical parameters.
    ///
    /// Fails if no clustering version is active, or if `env` is strict and
    /// a canonical key is missing.
    pub fn resolve<S: FireStore + ?Sized>(
        store: &S,
        env: Environment,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let version = resolve_active_version(store)?;
        let flow = FlowConfig::resolve(store, env)?;
        Ok(Self::new(version, flow, now))
    }
}
