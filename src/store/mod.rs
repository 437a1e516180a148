//! Repository interface for detections, events, episodes and their links.
//!
//! The clustering stages only talk to storage through [`FireStore`]. Two
//! implementations ship with the crate:
//! - [`InMemoryStore`] - snapshot/rollback transactions, used by tests
//! - `SqliteStore` (feature `persistence`) - the durable store
//!
//! Transactions do not nest. Callers wrap one logical step (stamping one
//! cluster, resolving one event, recomputing one episode) with
//! [`with_transaction`].

pub mod memory;

pub use memory::InMemoryStore;

use chrono::{DateTime, Duration, Utc};

use crate::config::ParameterSource;
use crate::error::Result;
use crate::{
    Bounds, ClusteringVersion, Detection, EpisodeMerger, EventStatus, FireEpisode, FireEvent,
    NewClusteringVersion, NewDetection, NewEpisode, NewFireEvent,
};

/// Coarse prefilter for episode candidates.
///
/// Stores return non-closed episodes whose centroid lies inside `bbox` and
/// whose `[start_date, last_seen_at]` interval intersects `[from, to]`. The
/// exact great-circle check is applied by the episode clusterer.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub bbox: Bounds,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl CandidateQuery {
    pub fn matches(&self, episode: &FireEpisode) -> bool {
        !episode.status.is_terminal()
            && self.bbox.contains(&episode.centroid)
            && episode.start_date <= self.to
            && episode.last_seen_at >= self.from
    }
}

/// Typed repository used by every clustering stage.
pub trait FireStore: ParameterSource {
    // ------------------------------------------------------------------
    // Transactions and run lock
    // ------------------------------------------------------------------

    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    /// Take or refresh the named lock. Returns `false` when another holder
    /// owns an unexpired lock.
    fn acquire_run_lock(
        &mut self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Release the lock if `holder` owns it.
    fn release_run_lock(&mut self, name: &str, holder: &str) -> Result<()>;

    /// Current holder of an unexpired lock.
    fn run_lock_holder(&self, name: &str, now: DateTime<Utc>) -> Result<Option<String>>;

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    fn set_parameter(&mut self, key: &str, value: &str) -> Result<()>;

    /// Most recently created version with `is_active = true`.
    fn active_clustering_version(&self) -> Result<Option<ClusteringVersion>>;

    fn insert_clustering_version(
        &mut self,
        version: NewClusteringVersion,
        created_at: DateTime<Utc>,
    ) -> Result<ClusteringVersion>;

    // ------------------------------------------------------------------
    // Detections
    // ------------------------------------------------------------------

    /// Ingest detections; returns the assigned ids in input order.
    fn insert_detections(&mut self, detections: &[NewDetection]) -> Result<Vec<i64>>;

    /// Unprocessed, unassigned detections with `detected_at >= since`,
    /// ordered by `(detected_at, id)`.
    fn load_pending_detections(
        &self,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Detection>>;

    /// Mark detections processed without assigning an event.
    fn mark_detections_processed(&mut self, ids: &[i64]) -> Result<usize>;

    fn detection(&self, id: i64) -> Result<Option<Detection>>;

    fn list_detections(&self) -> Result<Vec<Detection>>;

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Insert the event and stamp every member with its id and
    /// `is_processed = true`. Fails if a member already belongs to an event.
    fn create_event(
        &mut self,
        event: NewFireEvent,
        member_ids: &[i64],
        created_at: DateTime<Utc>,
    ) -> Result<FireEvent>;

    fn event(&self, id: i64) -> Result<Option<FireEvent>>;

    fn list_events(&self) -> Result<Vec<FireEvent>>;

    /// Events with no episode link, oldest first.
    fn unlinked_events(&self, limit: Option<usize>) -> Result<Vec<FireEvent>>;

    fn update_event_status(&mut self, id: i64, status: EventStatus) -> Result<()>;

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    fn find_candidate_episodes(&self, query: &CandidateQuery) -> Result<Vec<FireEpisode>>;

    fn create_episode(&mut self, seed: NewEpisode, now: DateTime<Utc>) -> Result<FireEpisode>;

    fn episode(&self, id: i64) -> Result<Option<FireEpisode>>;

    /// Persist every mutable column of an existing episode.
    fn save_episode(&mut self, episode: &FireEpisode) -> Result<()>;

    fn list_episodes(&self) -> Result<Vec<FireEpisode>>;

    fn mark_requires_recalculation(&mut self, id: i64) -> Result<()>;

    fn episodes_requiring_recalculation(&self) -> Result<Vec<i64>>;

    /// Ids of episodes not in `closed` status.
    fn open_episode_ids(&self) -> Result<Vec<i64>>;

    // ------------------------------------------------------------------
    // Links and merges
    // ------------------------------------------------------------------

    fn episode_for_event(&self, event_id: i64) -> Result<Option<i64>>;

    fn link_count_for_event(&self, event_id: i64) -> Result<usize>;

    /// Delete any link for the event, then insert `(episode_id, event_id)`.
    /// Returns the episode the event was previously linked to.
    fn relink_event(&mut self, event_id: i64, episode_id: i64) -> Result<Option<i64>>;

    /// Move every link of `from` to `to`; returns the moved event ids.
    fn migrate_links(&mut self, from: i64, to: i64) -> Result<Vec<i64>>;

    fn linked_event_ids(&self, episode_id: i64) -> Result<Vec<i64>>;

    /// Events currently linked to the episode, ordered by id.
    fn linked_events(&self, episode_id: i64) -> Result<Vec<FireEvent>>;

    /// Append a merge record; returns it with its assigned id.
    fn record_merger(&mut self, merger: &EpisodeMerger) -> Result<EpisodeMerger>;

    fn list_mergers(&self) -> Result<Vec<EpisodeMerger>>;
}

/// Run `f` inside a store transaction, rolling back on error.
pub fn with_transaction<S, T, F>(store: &mut S, f: F) -> Result<T>
where
    S: FireStore + ?Sized,
    F: FnOnce(&mut S) -> Result<T>,
{
    store.begin()?;
    match f(store) {
        Ok(value) => {
            store.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = store.rollback() {
                log::error!("[Store] Rollback failed after '{}': {}", e, rollback_err);
            }
            Err(e)
        }
    }
}
