//! In-memory store.
//!
//! Keeps every table in ordered maps so iteration is deterministic.
//! Transactions snapshot the whole state on `begin` and restore it on
//! `rollback`, which gives tests the same all-or-nothing behaviour as the
//! SQLite store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use super::{CandidateQuery, FireStore};
use crate::config::ParameterSource;
use crate::error::{FireTrackError, OptionExt, Result};
use crate::{
    ClusteringVersion, Detection, EpisodeEventLink, EpisodeMerger, EventStatus, FireEpisode,
    FireEvent, NewClusteringVersion, NewDetection, NewEpisode, NewFireEvent,
};

#[derive(Debug, Clone)]
struct RunLock {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    detections: BTreeMap<i64, Detection>,
    events: BTreeMap<i64, FireEvent>,
    episodes: BTreeMap<i64, FireEpisode>,
    links: Vec<EpisodeEventLink>,
    mergers: Vec<EpisodeMerger>,
    versions: Vec<ClusteringVersion>,
    parameters: HashMap<String, String>,
    locks: HashMap<String, RunLock>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Store backed by plain collections.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: MemoryState,
    snapshot: Option<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw link rows, in insertion order.
    pub fn links(&self) -> &[EpisodeEventLink] {
        &self.state.links
    }

    /// Insert a link row without removing existing ones.
    ///
    /// Only exists so tests can corrupt the link table on purpose.
    #[doc(hidden)]
    pub fn insert_raw_link(&mut self, link: EpisodeEventLink) {
        self.state.links.push(link);
    }
}

impl ParameterSource for InMemoryStore {
    fn parameter(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.parameters.get(key).cloned())
    }
}

impl FireStore for InMemoryStore {
    fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(FireTrackError::Store(
                "transaction already in progress".to_string(),
            ));
        }
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| FireTrackError::Store("commit without transaction".to_string()))
    }

    fn rollback(&mut self) -> Result<()> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| FireTrackError::Store("rollback without transaction".to_string()))?;
        self.state = snapshot;
        Ok(())
    }

    fn acquire_run_lock(
        &mut self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        if let Some(lock) = self.state.locks.get(name) {
            if lock.holder != holder && lock.expires_at > now {
                return Ok(false);
            }
        }
        self.state.locks.insert(
            name.to_string(),
            RunLock {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn release_run_lock(&mut self, name: &str, holder: &str) -> Result<()> {
        if self
            .state
            .locks
            .get(name)
            .is_some_and(|lock| lock.holder == holder)
        {
            self.state.locks.remove(name);
        }
        Ok(())
    }

    fn run_lock_holder(&self, name: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .state
            .locks
            .get(name)
            .filter(|lock| lock.expires_at > now)
            .map(|lock| lock.holder.clone()))
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> Result<()> {
        self.state
            .parameters
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn active_clustering_version(&self) -> Result<Option<ClusteringVersion>> {
        Ok(self
            .state
            .versions
            .iter()
            .filter(|v| v.is_active)
            .max_by_key(|v| (v.created_at, v.id))
            .cloned())
    }

    fn insert_clustering_version(
        &mut self,
        version: NewClusteringVersion,
        created_at: DateTime<Utc>,
    ) -> Result<ClusteringVersion> {
        let id = self.state.next_id();
        let version = version.into_version(id, created_at);
        self.state.versions.push(version.clone());
        Ok(version)
    }

    fn insert_detections(&mut self, detections: &[NewDetection]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(detections.len());
        for d in detections {
            let id = self.state.next_id();
            self.state.detections.insert(
                id,
                Detection {
                    id,
                    detected_at: d.detected_at,
                    latitude: d.latitude,
                    longitude: d.longitude,
                    fire_radiative_power: d.fire_radiative_power,
                    confidence: d.confidence,
                    province: d.province.clone(),
                    is_processed: false,
                    fire_event_id: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    fn load_pending_detections(
        &self,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Detection>> {
        let mut pending: Vec<Detection> = self
            .state
            .detections
            .values()
            .filter(|d| !d.is_processed && d.fire_event_id.is_none() && d.detected_at >= since)
            .cloned()
            .collect();
        pending.sort_by_key(|d| (d.detected_at, d.id));
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        Ok(pending)
    }

    fn mark_detections_processed(&mut self, ids: &[i64]) -> Result<usize> {
        let mut count = 0;
        for id in ids {
            if let Some(d) = self.state.detections.get_mut(id) {
                d.is_processed = true;
                count += 1;
            }
        }
        Ok(count)
    }

    fn detection(&self, id: i64) -> Result<Option<Detection>> {
        Ok(self.state.detections.get(&id).cloned())
    }

    fn list_detections(&self) -> Result<Vec<Detection>> {
        Ok(self.state.detections.values().cloned().collect())
    }

    fn create_event(
        &mut self,
        event: NewFireEvent,
        member_ids: &[i64],
        created_at: DateTime<Utc>,
    ) -> Result<FireEvent> {
        for id in member_ids {
            let detection = self.state.detections.get(id).ok_or_not_found("detection", *id)?;
            if let Some(owner) = detection.fire_event_id {
                return Err(FireTrackError::InvariantViolation(format!(
                    "detection {} already belongs to event {}",
                    id, owner
                )));
            }
        }

        let id = self.state.next_id();
        let event = event.into_event(id, created_at);
        self.state.events.insert(id, event.clone());
        for member in member_ids {
            if let Some(d) = self.state.detections.get_mut(member) {
                d.fire_event_id = Some(id);
                d.is_processed = true;
            }
        }
        Ok(event)
    }

    fn event(&self, id: i64) -> Result<Option<FireEvent>> {
        Ok(self.state.events.get(&id).cloned())
    }

    fn list_events(&self) -> Result<Vec<FireEvent>> {
        Ok(self.state.events.values().cloned().collect())
    }

    fn unlinked_events(&self, limit: Option<usize>) -> Result<Vec<FireEvent>> {
        let mut events: Vec<FireEvent> = self
            .state
            .events
            .values()
            .filter(|e| !self.state.links.iter().any(|l| l.event_id == e.id))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.start_date, e.id));
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    fn update_event_status(&mut self, id: i64, status: EventStatus) -> Result<()> {
        let event = self.state.events.get_mut(&id).ok_or_not_found("event", id)?;
        event.status = status;
        Ok(())
    }

    fn find_candidate_episodes(&self, query: &CandidateQuery) -> Result<Vec<FireEpisode>> {
        Ok(self
            .state
            .episodes
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }

    fn create_episode(&mut self, seed: NewEpisode, now: DateTime<Utc>) -> Result<FireEpisode> {
        let id = self.state.next_id();
        let episode = seed.into_episode(id, now);
        self.state.episodes.insert(id, episode.clone());
        Ok(episode)
    }

    fn episode(&self, id: i64) -> Result<Option<FireEpisode>> {
        Ok(self.state.episodes.get(&id).cloned())
    }

    fn save_episode(&mut self, episode: &FireEpisode) -> Result<()> {
        let slot = self
            .state
            .episodes
            .get_mut(&episode.id)
            .ok_or_not_found("episode", episode.id)?;
        *slot = episode.clone();
        Ok(())
    }

    fn list_episodes(&self) -> Result<Vec<FireEpisode>> {
        Ok(self.state.episodes.values().cloned().collect())
    }

    fn mark_requires_recalculation(&mut self, id: i64) -> Result<()> {
        let episode = self.state.episodes.get_mut(&id).ok_or_not_found("episode", id)?;
        episode.requires_recalculation = true;
        Ok(())
    }

    fn episodes_requiring_recalculation(&self) -> Result<Vec<i64>> {
        Ok(self
            .state
            .episodes
            .values()
            .filter(|e| e.requires_recalculation)
            .map(|e| e.id)
            .collect())
    }

    fn open_episode_ids(&self) -> Result<Vec<i64>> {
        Ok(self
            .state
            .episodes
            .values()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.id)
            .collect())
    }

    fn episode_for_event(&self, event_id: i64) -> Result<Option<i64>> {
        Ok(self
            .state
            .links
            .iter()
            .find(|l| l.event_id == event_id)
            .map(|l| l.episode_id))
    }

    fn link_count_for_event(&self, event_id: i64) -> Result<usize> {
        Ok(self
            .state
            .links
            .iter()
            .filter(|l| l.event_id == event_id)
            .count())
    }

    fn relink_event(&mut self, event_id: i64, episode_id: i64) -> Result<Option<i64>> {
        if !self.state.events.contains_key(&event_id) {
            return Err(FireTrackError::NotFound {
                entity: "event",
                id: event_id,
            });
        }
        if !self.state.episodes.contains_key(&episode_id) {
            return Err(FireTrackError::NotFound {
                entity: "episode",
                id: episode_id,
            });
        }
        let previous = self.episode_for_event(event_id)?;
        self.state.links.retain(|l| l.event_id != event_id);
        self.state.links.push(EpisodeEventLink {
            episode_id,
            event_id,
        });
        Ok(previous)
    }

    fn migrate_links(&mut self, from: i64, to: i64) -> Result<Vec<i64>> {
        let mut moved = Vec::new();
        for link in self.state.links.iter_mut().filter(|l| l.episode_id == from) {
            link.episode_id = to;
            moved.push(link.event_id);
        }
        moved.sort_unstable();
        Ok(moved)
    }

    fn linked_event_ids(&self, episode_id: i64) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .state
            .links
            .iter()
            .filter(|l| l.episode_id == episode_id)
            .map(|l| l.event_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn linked_events(&self, episode_id: i64) -> Result<Vec<FireEvent>> {
        self.linked_event_ids(episode_id)?
            .into_iter()
            .map(|id| self.state.events.get(&id).cloned().ok_or_not_found("event", id))
            .collect()
    }

    fn record_merger(&mut self, merger: &EpisodeMerger) -> Result<EpisodeMerger> {
        if merger.absorbed_episode_id == merger.absorbing_episode_id {
            return Err(FireTrackError::InvalidMerge {
                episode_id: merger.absorbed_episode_id,
            });
        }
        let mut stored = merger.clone();
        stored.id = self.state.next_id();
        self.state.mergers.push(stored.clone());
        Ok(stored)
    }

    fn list_mergers(&self) -> Result<Vec<EpisodeMerger>> {
        Ok(self.state.mergers.clone())
    }
}
