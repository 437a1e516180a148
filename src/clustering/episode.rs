//! Episode assignment and merge resolution.
//!
//! For each event the clusterer looks for open episodes close in space
//! (episode epsilon, measured centroid to centroid) and overlapping in time
//! (`[start_date, last_seen_at]` against the event interval widened by the
//! temporal buffer), then:
//! - no candidate: seeds a new episode from the event
//! - one candidate: moves the event's link into it
//! - several: the earliest episode absorbs the others, which are closed,
//!   and the event is linked into the survivor
//!
//! Every episode whose links changed has its interval and centroid widened
//! before the transaction commits, so the next event of the same pass is
//! matched against the grown episode. Status and the remaining metrics are
//! left to the lifecycle recompute.
//!
//! Every write for one event happens inside a single store transaction, so
//! a failure leaves the event unlinked and it is picked up again next run.

use std::collections::BTreeSet;
use std::cmp::Ordering;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::RunContext;
use super::lifecycle::EpisodeMetrics;
use crate::error::{FireTrackError, OptionExt, Result};
use crate::geo_utils::haversine_distance;
use crate::store::{CandidateQuery, FireStore, with_transaction};
use crate::{
    Bounds, EpisodeMerger, EpisodeStatus, FireEpisode, FireEvent, MergeReason, NewEpisode,
};

/// What happened to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assignment {
    /// No candidate; a new episode was seeded from the event.
    Created { episode_id: i64 },
    /// Exactly one candidate took the event.
    Absorbed {
        episode_id: i64,
        previous_episode_id: Option<i64>,
    },
    /// Several candidates collapsed into `episode_id`.
    Merged {
        episode_id: i64,
        absorbed_episode_ids: Vec<i64>,
    },
}

impl Assignment {
    /// Episode the event ended up in.
    pub fn episode_id(&self) -> i64 {
        match self {
            Assignment::Created { episode_id }
            | Assignment::Absorbed { episode_id, .. }
            | Assignment::Merged { episode_id, .. } => *episode_id,
        }
    }
}

/// Assignment plus every open episode whose link set changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentOutcome {
    pub assignment: Assignment,
    pub touched: BTreeSet<i64>,
}

/// Assigns events to episodes.
#[derive(Debug, Clone, Copy)]
pub struct EpisodeClusterer<'a> {
    ctx: &'a RunContext,
}

impl<'a> EpisodeClusterer<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Resolve one event in its own transaction.
    pub fn assign<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        event: &FireEvent,
    ) -> Result<AssignmentOutcome> {
        with_transaction(store, |s| self.assign_in_transaction(s, event))
    }

    fn assign_in_transaction<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        event: &FireEvent,
    ) -> Result<AssignmentOutcome> {
        let mut candidates = self.find_candidates(&*store, event)?;
        let mut touched = BTreeSet::new();

        let assignment = match candidates.len() {
            0 => {
                let seed = NewEpisode::seeded_from(event, self.ctx.version.id);
                let episode = store.create_episode(seed, self.ctx.now)?;
                self.reassign(store, event.id, episode.id, &mut touched)?;
                debug!("[Episodes] Event {} seeded episode {}", event.id, episode.id);
                Assignment::Created {
                    episode_id: episode.id,
                }
            }
            1 => {
                let episode_id = candidates[0].id;
                let previous_episode_id = self.reassign(store, event.id, episode_id, &mut touched)?;
                debug!("[Episodes] Event {} joined episode {}", event.id, episode_id);
                Assignment::Absorbed {
                    episode_id,
                    previous_episode_id,
                }
            }
            _ => {
                let absorbing_idx = select_absorbing(&candidates);
                let absorbing = candidates.swap_remove(absorbing_idx);
                candidates.sort_by_key(|c| c.id);

                let mut absorbed_episode_ids = Vec::with_capacity(candidates.len());
                for absorbed in &candidates {
                    self.merge_into(store, absorbed, &absorbing, event)?;
                    absorbed_episode_ids.push(absorbed.id);
                }
                touched.insert(absorbing.id);
                self.reassign(store, event.id, absorbing.id, &mut touched)?;

                info!(
                    "[Episodes] Event {} bridged episodes {:?}; merged into {}",
                    event.id, absorbed_episode_ids, absorbing.id
                );
                Assignment::Merged {
                    episode_id: absorbing.id,
                    absorbed_episode_ids,
                }
            }
        };

        for &id in &touched {
            self.refresh_extent(store, id)?;
            store.mark_requires_recalculation(id)?;
        }

        Ok(AssignmentOutcome {
            assignment,
            touched,
        })
    }

    /// Open episodes close to the event in space and overlapping in time.
    pub fn find_candidates<S: FireStore + ?Sized>(
        &self,
        store: &S,
        event: &FireEvent,
    ) -> Result<Vec<FireEpisode>> {
        let eps = self.ctx.flow.episode_epsilon_meters();
        let buffer = self.ctx.flow.temporal_buffer();
        let query = CandidateQuery {
            bbox: Bounds::from_point(&event.centroid).expand_meters(eps),
            from: event.start_date - buffer,
            to: event.end_date + buffer,
        };

        let mut candidates: Vec<FireEpisode> = store
            .find_candidate_episodes(&query)?
            .into_iter()
            .filter(|e| {
                !e.status.is_terminal()
                    && haversine_distance(&e.centroid, &event.centroid) <= eps
                    && e.start_date <= query.to
                    && e.last_seen_at >= query.from
            })
            .collect();
        candidates.sort_by_key(|e| e.id);
        Ok(candidates)
    }

    /// Atomic swap of the event's link, followed by the single-link check.
    ///
    /// Records both the new and the previous episode as touched.
    fn reassign<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        event_id: i64,
        episode_id: i64,
        touched: &mut BTreeSet<i64>,
    ) -> Result<Option<i64>> {
        let previous = store.relink_event(event_id, episode_id)?;
        ensure_single_link(&*store, event_id, episode_id)?;

        touched.insert(episode_id);
        if let Some(prev) = previous.filter(|&p| p != episode_id) {
            let prev_episode = store.episode(prev)?.ok_or_not_found("episode", prev)?;
            if !prev_episode.status.is_terminal() {
                touched.insert(prev);
            }
        }
        Ok(previous)
    }

    /// Rewrite the episode's interval, centroid and bbox from its current
    /// links.
    fn refresh_extent<S: FireStore + ?Sized>(&self, store: &mut S, episode_id: i64) -> Result<()> {
        let events = store.linked_events(episode_id)?;
        let Some(metrics) = EpisodeMetrics::aggregate(&events) else {
            return Ok(());
        };
        let mut episode = store
            .episode(episode_id)?
            .ok_or_not_found("episode", episode_id)?;
        episode.start_date = metrics.start_date;
        episode.last_seen_at = metrics.last_seen_at;
        episode.centroid = metrics.centroid;
        episode.bbox = metrics.bbox;
        episode.updated_at = self.ctx.now;
        store.save_episode(&episode)
    }

    /// Fold `absorbed` into `absorbing`: move links, log the merge and close
    /// the absorbed episode with its timestamps frozen.
    fn merge_into<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        absorbed: &FireEpisode,
        absorbing: &FireEpisode,
        trigger: &FireEvent,
    ) -> Result<()> {
        let moved = store.migrate_links(absorbed.id, absorbing.id)?;
        for &event_id in &moved {
            ensure_single_link(&*store, event_id, absorbing.id)?;
        }

        let merger = EpisodeMerger::new(
            absorbed.id,
            absorbing.id,
            MergeReason::SpatialOverlap,
            self.ctx.version.id,
            Some(format!(
                "event {} overlapped both episodes; {} events moved",
                trigger.id,
                moved.len()
            )),
            self.ctx.now,
        )?;
        store.record_merger(&merger)?;

        let mut closed = absorbed.clone();
        close_episode(&mut closed, self.ctx.now);
        store.save_episode(&closed)?;

        debug!(
            "[Episodes] Episode {} absorbed into {} ({} events moved)",
            absorbed.id,
            absorbing.id,
            moved.len()
        );
        Ok(())
    }
}

/// Fail unless `event_id` has exactly one link, and it points at
/// `episode_id`.
fn ensure_single_link<S: FireStore + ?Sized>(store: &S, event_id: i64, episode_id: i64) -> Result<()> {
    let links = store.link_count_for_event(event_id)?;
    let owner = store.episode_for_event(event_id)?;
    if links != 1 || owner != Some(episode_id) {
        return Err(FireTrackError::InvariantViolation(format!(
            "event {} has {} links (owner {:?}) after linking into episode {}",
            event_id, links, owner, episode_id
        )));
    }
    Ok(())
}

/// Pick the surviving episode among merge candidates.
///
/// Earliest `start_date` wins; ties go to the largest estimated area, then
/// to the lowest id. `candidates` must not be empty.
pub fn select_absorbing(candidates: &[FireEpisode]) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.start_date
                .cmp(&b.start_date)
                .then_with(|| {
                    b.estimated_area_hectares
                        .partial_cmp(&a.estimated_area_hectares)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Move an episode to the terminal `closed` state, freezing its timeline.
pub fn close_episode(episode: &mut FireEpisode, now: chrono::DateTime<chrono::Utc>) {
    episode.status = EpisodeStatus::Closed;
    episode.end_date = Some(episode.end_date.unwrap_or(episode.last_seen_at));
    episode.gee_candidate = false;
    episode.gee_priority = None;
    episode.requires_recalculation = false;
    episode.updated_at = now;
}
