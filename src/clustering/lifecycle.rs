//! Episode metrics and status, recomputed from scratch.
//!
//! Metrics are never patched incrementally: reassignments and merges move
//! events between episodes, and counters kept in place would double count.
//! Every recompute aggregates the currently linked events and derives the
//! status from the result.
//!
//! Status rules, first match wins:
//! 1. `closed` stays `closed`
//! 2. no linked events → `closed` (orphaned)
//! 3. quiet for longer than the grace period → `extinct`
//! 4. any active event → `active`
//! 5. any monitoring/controlled event → `monitoring`
//! 6. otherwise `active`

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::RunContext;
use super::episode::close_episode;
use crate::config::FlowConfig;
use crate::error::{OptionExt, Result};
use crate::geo_utils::compute_center;
use crate::store::{FireStore, with_transaction};
use crate::{Bounds, EpisodeStatus, EventStatus, FireEpisode, FireEvent, GeoPoint};

/// Aggregates over an episode's linked events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    pub start_date: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: u32,
    pub detection_count: u32,
    pub frp_sum: f64,
    pub frp_max: f64,
    pub estimated_area_hectares: f64,
    pub centroid: GeoPoint,
    pub bbox: Bounds,
    pub provinces: Vec<String>,
}

impl EpisodeMetrics {
    /// Aggregate events. `None` when there are none.
    pub fn aggregate(events: &[FireEvent]) -> Option<Self> {
        let first = events.first()?;

        let centroids: Vec<GeoPoint> = events.iter().map(|e| e.centroid).collect();
        let provinces: BTreeSet<String> = events.iter().filter_map(|e| e.province.clone()).collect();

        Some(Self {
            start_date: events.iter().map(|e| e.start_date).min().unwrap_or(first.start_date),
            last_seen_at: events.iter().map(|e| e.end_date).max().unwrap_or(first.end_date),
            event_count: events.len() as u32,
            detection_count: events.iter().map(|e| e.total_detections).sum(),
            frp_sum: events.iter().map(|e| e.sum_frp).sum(),
            frp_max: events.iter().map(|e| e.max_frp).fold(0.0_f64, f64::max),
            estimated_area_hectares: events.iter().map(|e| e.estimated_area_hectares).sum(),
            centroid: compute_center(&centroids),
            bbox: Bounds::from_points(&centroids).unwrap_or(Bounds::from_point(&first.centroid)),
            provinces: provinces.into_iter().collect(),
        })
    }
}

/// Age a stored event status against the clock.
///
/// Active events fall back to monitoring after the active period and to
/// extinct after the grace period. Statuses set by field reports
/// (`controlled`, `extinct`) are never promoted back.
pub fn aged_event_status(
    status: EventStatus,
    end_date: DateTime<Utc>,
    now: DateTime<Utc>,
    flow: &FlowConfig,
) -> EventStatus {
    let quiet = now - end_date;
    match status {
        EventStatus::Active | EventStatus::Monitoring if quiet > flow.grace_period() => {
            EventStatus::Extinct
        }
        EventStatus::Active if quiet > flow.event_active_period() => EventStatus::Monitoring,
        other => other,
    }
}

/// Derive the status of a non-closed episode from its linked events.
pub fn derive_status(
    current: EpisodeStatus,
    events: &[FireEvent],
    last_seen_at: DateTime<Utc>,
    now: DateTime<Utc>,
    flow: &FlowConfig,
) -> EpisodeStatus {
    if current.is_terminal() || events.is_empty() {
        return EpisodeStatus::Closed;
    }
    if now - last_seen_at > flow.grace_period() {
        return EpisodeStatus::Extinct;
    }
    if events.iter().any(|e| e.status == EventStatus::Active) {
        return EpisodeStatus::Active;
    }
    if events
        .iter()
        .any(|e| matches!(e.status, EventStatus::Monitoring | EventStatus::Controlled))
    {
        return EpisodeStatus::Monitoring;
    }
    EpisodeStatus::Active
}

/// Recomputes episode metrics and status.
#[derive(Debug, Clone, Copy)]
pub struct EpisodeLifecycleManager<'a> {
    ctx: &'a RunContext,
}

impl<'a> EpisodeLifecycleManager<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Recompute one episode in its own transaction.
    pub fn recompute<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        episode_id: i64,
    ) -> Result<FireEpisode> {
        with_transaction(store, |s| self.recompute_in_transaction(s, episode_id))
    }

    fn recompute_in_transaction<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        episode_id: i64,
    ) -> Result<FireEpisode> {
        let mut episode = store
            .episode(episode_id)?
            .ok_or_not_found("episode", episode_id)?;

        if episode.status.is_terminal() {
            // Closed is terminal: leave metrics and timeline as frozen
            if episode.requires_recalculation {
                episode.requires_recalculation = false;
                store.save_episode(&episode)?;
            }
            return Ok(episode);
        }

        let mut events = store.linked_events(episode_id)?;
        for event in &mut events {
            let aged = aged_event_status(event.status, event.end_date, self.ctx.now, &self.ctx.flow);
            if aged != event.status {
                store.update_event_status(event.id, aged)?;
                event.status = aged;
            }
        }

        let Some(metrics) = EpisodeMetrics::aggregate(&events) else {
            info!("[Lifecycle] Episode {} has no events left; closing", episode_id);
            close_episode(&mut episode, self.ctx.now);
            episode.event_count = 0;
            episode.detection_count = 0;
            store.save_episode(&episode)?;
            return Ok(episode);
        };

        let previous_status = episode.status;
        let status = derive_status(
            episode.status,
            &events,
            metrics.last_seen_at,
            self.ctx.now,
            &self.ctx.flow,
        );

        episode.start_date = metrics.start_date;
        episode.last_seen_at = metrics.last_seen_at;
        episode.event_count = metrics.event_count;
        episode.detection_count = metrics.detection_count;
        episode.frp_sum = metrics.frp_sum;
        episode.frp_max = metrics.frp_max;
        episode.estimated_area_hectares = metrics.estimated_area_hectares;
        episode.centroid = metrics.centroid;
        episode.bbox = metrics.bbox;
        episode.provinces = metrics.provinces;
        episode.status = status;
        episode.end_date = match status {
            EpisodeStatus::Extinct => Some(metrics.last_seen_at),
            _ => None,
        };

        episode.gee_candidate = episode.event_count >= self.ctx.version.min_points
            && status != EpisodeStatus::Closed;
        episode.gee_priority = episode
            .gee_candidate
            .then_some(i64::from(episode.detection_count));
        episode.requires_recalculation = false;
        episode.updated_at = self.ctx.now;

        store.save_episode(&episode)?;

        if previous_status != status {
            info!(
                "[Lifecycle] Episode {}: {} -> {}",
                episode.id, previous_status, status
            );
        } else {
            debug!(
                "[Lifecycle] Episode {} recomputed: {} events, {} detections",
                episode.id, episode.event_count, episode.detection_count
            );
        }

        Ok(episode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap()
    }

    fn event(id: i64, status: EventStatus, end_hours: i64, province: Option<&str>) -> FireEvent {
        FireEvent {
            id,
            centroid: GeoPoint::new(-35.0 + id as f64 * 0.01, -71.5),
            start_date: t0() + Duration::hours(end_hours - 2),
            end_date: t0() + Duration::hours(end_hours),
            total_detections: 4,
            avg_frp: 5.0,
            max_frp: 9.0 + id as f64,
            sum_frp: 20.0,
            avg_confidence: 85.0,
            is_significant: true,
            status,
            h3_index: None,
            province: province.map(str::to_string),
            estimated_area_hectares: 56.25,
            clustering_version_id: 1,
            created_at: t0(),
        }
    }

    #[test]
    fn test_aggregate_is_pure_over_events() {
        let events = vec![
            event(1, EventStatus::Active, 10, Some("Maule")),
            event(2, EventStatus::Active, 30, Some("Ñuble")),
            event(3, EventStatus::Active, 20, Some("Maule")),
        ];
        let m = EpisodeMetrics::aggregate(&events).unwrap();
        assert_eq!(m.event_count, 3);
        assert_eq!(m.detection_count, 12);
        assert_eq!(m.frp_sum, 60.0);
        assert_eq!(m.frp_max, 12.0);
        assert_eq!(m.start_date, t0() + Duration::hours(8));
        assert_eq!(m.last_seen_at, t0() + Duration::hours(30));
        assert_eq!(m.provinces, vec!["Maule".to_string(), "Ñuble".to_string()]);
        assert!((m.centroid.latitude - (-34.98)).abs() < 1e-9);
        assert!(EpisodeMetrics::aggregate(&[]).is_none());
    }

    #[test]
    fn test_status_rules() {
        let flow = FlowConfig::default();
        let last_seen = t0();
        let soon = t0() + Duration::hours(10);
        let late = t0() + Duration::hours(73);

        let active = vec![event(1, EventStatus::Active, 0, None)];
        let controlled = vec![event(1, EventStatus::Controlled, 0, None)];
        let extinct = vec![event(1, EventStatus::Extinct, 0, None)];

        assert_eq!(
            derive_status(EpisodeStatus::Closed, &active, last_seen, soon, &flow),
            EpisodeStatus::Closed
        );
        assert_eq!(
            derive_status(EpisodeStatus::Active, &[], last_seen, soon, &flow),
            EpisodeStatus::Closed
        );
        assert_eq!(
            derive_status(EpisodeStatus::Active, &active, last_seen, late, &flow),
            EpisodeStatus::Extinct
        );
        assert_eq!(
            derive_status(EpisodeStatus::Extinct, &active, last_seen, soon, &flow),
            EpisodeStatus::Active
        );
        assert_eq!(
            derive_status(EpisodeStatus::Active, &controlled, last_seen, soon, &flow),
            EpisodeStatus::Monitoring
        );
        assert_eq!(
            derive_status(EpisodeStatus::Monitoring, &extinct, last_seen, soon, &flow),
            EpisodeStatus::Active
        );
    }

    #[test]
    fn test_event_ageing() {
        let flow = FlowConfig::default();
        let end = t0();
        assert_eq!(
            aged_event_status(EventStatus::Active, end, end + Duration::hours(5), &flow),
            EventStatus::Active
        );
        assert_eq!(
            aged_event_status(EventStatus::Active, end, end + Duration::hours(30), &flow),
            EventStatus::Monitoring
        );
        assert_eq!(
            aged_event_status(EventStatus::Monitoring, end, end + Duration::hours(80), &flow),
            EventStatus::Extinct
        );
        assert_eq!(
            aged_event_status(EventStatus::Controlled, end, end + Duration::hours(80), &flow),
            EventStatus::Controlled
        );
    }
}
