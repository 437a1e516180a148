//! # Clustering Engine
//!
//! One scheduled batch pass over the store:
//!
//! 1. Take the run lock (concurrent passes are refused, not queued). The
//!    lease is renewed after every step; a pass that loses it aborts
//! 2. Resolve the [`RunContext`] (active version + flow config)
//! 3. [`DetectionClusterer`] - pending detections → events
//! 4. [`EpisodeClusterer`] - every unlinked event → episode
//! 5. [`EpisodeLifecycleManager`] - every touched or flagged episode, plus
//!    (optionally) every open episode so quiet fires age to extinct
//! 6. Release the lock
//!
//! Progress markers make an interrupted pass safe to repeat: processed
//! detections are never reloaded, unlinked events are picked up again, and
//! episodes keep `requires_recalculation` until a recompute succeeds.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clustering::{
    Assignment, DetectionClusterer, DetectionRunStats, EpisodeClusterer, EpisodeLifecycleManager,
    RunContext,
};
use crate::config::Environment;
use crate::error::{FireTrackError, Result};
use crate::store::FireStore;
use crate::EpisodeStatus;

/// Name of the lock serializing clustering passes.
pub const DEFAULT_LOCK_NAME: &str = "firetrack.clustering";

/// Default lock lease; a crashed holder blocks the job for at most this long.
pub const DEFAULT_LOCK_TTL_MINUTES: i64 = 30;

/// Lock holder name unique to this process and call: host, pid and a
/// random suffix. Containers commonly share a pid, so the pid alone is not
/// enough to tell workers apart.
pub fn default_lock_holder() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "firetrack-{}-{}-{}",
        host,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Parameters of one scheduled pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Only detections at or after this instant are clustered
    pub since: DateTime<Utc>,
    pub max_detections: Option<usize>,
    /// Cap on unlinked events assigned in this pass
    pub max_events: Option<usize>,
    /// Recompute every open episode, not just touched ones
    pub refresh_open_episodes: bool,
    pub lock_holder: String,
    pub lock_ttl_minutes: i64,
}

impl RunOptions {
    /// Look back `days` from `now`.
    pub fn days_back(days: i64, now: DateTime<Utc>) -> Self {
        Self {
            since: now - Duration::days(days),
            max_detections: None,
            max_events: None,
            refresh_open_episodes: true,
            lock_holder: default_lock_holder(),
            lock_ttl_minutes: DEFAULT_LOCK_TTL_MINUTES,
        }
    }

    pub fn with_max_detections(mut self, max: usize) -> Self {
        self.max_detections = Some(max);
        self
    }

    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events = Some(max);
        self
    }

    pub fn with_lock_holder(mut self, holder: impl Into<String>) -> Self {
        self.lock_holder = holder.into();
        self
    }
}

/// Summary of a pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub clustering_version_id: i64,
    pub detections: DetectionRunStats,
    pub events_assigned: usize,
    pub episodes_created: usize,
    pub events_absorbed: usize,
    /// Episodes closed by merge resolution
    pub episodes_merged: usize,
    pub episodes_recomputed: usize,
    pub episodes_closed: usize,
    pub episodes_extinct: usize,
}

/// The run lock as held by one pass.
///
/// Lease time starts at the pass's `now` and advances with the wall time
/// spent since acquisition, so backfills evaluated in the past still renew
/// against a consistent clock.
#[derive(Debug)]
pub struct RunLease {
    name: String,
    holder: String,
    ttl: Duration,
    acquired_at: DateTime<Utc>,
    started: Instant,
}

impl RunLease {
    /// Take the lock, or fail with [`FireTrackError::LockHeld`].
    pub fn acquire<S: FireStore + ?Sized>(
        store: &mut S,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self> {
        if !store.acquire_run_lock(name, holder, now, ttl)? {
            let current = store
                .run_lock_holder(name, now)?
                .unwrap_or_else(|| "unknown".to_string());
            return Err(FireTrackError::LockHeld {
                name: name.to_string(),
                holder: current,
            });
        }
        Ok(Self {
            name: name.to_string(),
            holder: holder.to_string(),
            ttl,
            acquired_at: now,
            started: Instant::now(),
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Current lease time.
    pub fn clock(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.acquired_at + elapsed
    }

    /// Push the expiry to `clock() + ttl`.
    pub fn renew<S: FireStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        self.renew_at(store, self.clock())
    }

    /// Push the expiry to `at + ttl`. Fails with
    /// [`FireTrackError::LockLost`] if another holder took the lock after
    /// this lease expired.
    pub fn renew_at<S: FireStore + ?Sized>(&self, store: &mut S, at: DateTime<Utc>) -> Result<()> {
        if store.acquire_run_lock(&self.name, &self.holder, at, self.ttl)? {
            return Ok(());
        }
        let current = store
            .run_lock_holder(&self.name, at)?
            .unwrap_or_else(|| "unknown".to_string());
        Err(FireTrackError::LockLost {
            name: self.name.clone(),
            holder: current,
        })
    }

    /// Drop the lock if this lease still owns it.
    pub fn release<S: FireStore + ?Sized>(self, store: &mut S) -> Result<()> {
        store.release_run_lock(&self.name, &self.holder)
    }
}

/// Runs clustering passes under the run lock.
#[derive(Debug, Clone)]
pub struct ClusteringEngine {
    environment: Environment,
    lock_name: String,
}

impl ClusteringEngine {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            lock_name: DEFAULT_LOCK_NAME.to_string(),
        }
    }

    /// Use a different lock name (e.g. one per region).
    pub fn with_lock_name(mut self, name: impl Into<String>) -> Self {
        self.lock_name = name.into();
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Run one full pass evaluated at `now`.
    ///
    /// Returns [`FireTrackError::LockHeld`] without touching any data if
    /// another pass holds the lock, and [`FireTrackError::LockLost`] if the
    /// lease was taken over mid-pass.
    pub fn run<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        options: &RunOptions,
        now: DateTime<Utc>,
    ) -> Result<RunReport> {
        let ttl = Duration::minutes(options.lock_ttl_minutes);
        let lease = match RunLease::acquire(store, &self.lock_name, &options.lock_holder, now, ttl) {
            Ok(lease) => lease,
            Err(e) => {
                warn!("[Engine] Skipping pass: {}", e);
                return Err(e);
            }
        };

        let result = self.run_locked(store, options, now, &lease);

        if let Err(e) = lease.release(store) {
            warn!("[Engine] Failed to release lock '{}': {}", self.lock_name, e);
        }
        if let Err(e) = &result {
            error!("[Engine] Pass aborted: {}", e);
        }
        result
    }

    fn run_locked<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        options: &RunOptions,
        now: DateTime<Utc>,
        lease: &RunLease,
    ) -> Result<RunReport> {
        let ctx = RunContext::resolve(&*store, self.environment, now)?;
        info!(
            "[Engine] Pass with clustering version {} (eps {} km, min_points {}, window {} h) since {}",
            ctx.version.id,
            ctx.version.epsilon_km,
            ctx.version.min_points,
            ctx.version.temporal_window_hours,
            options.since
        );

        let mut report = RunReport {
            clustering_version_id: ctx.version.id,
            ..Default::default()
        };

        // Stage 1: detections → events
        report.detections =
            DetectionClusterer::new(&ctx).run(store, options.since, options.max_detections)?;
        lease.renew(store)?;

        // Stage 2: unlinked events → episodes
        let episodes = EpisodeClusterer::new(&ctx);
        let mut touched: BTreeSet<i64> = BTreeSet::new();
        for event in store.unlinked_events(options.max_events)? {
            let outcome = episodes.assign(store, &event)?;
            lease.renew(store)?;
            match &outcome.assignment {
                Assignment::Created { .. } => report.episodes_created += 1,
                Assignment::Absorbed { .. } => report.events_absorbed += 1,
                Assignment::Merged {
                    absorbed_episode_ids,
                    ..
                } => {
                    report.events_absorbed += 1;
                    report.episodes_merged += absorbed_episode_ids.len();
                }
            }
            report.events_assigned += 1;
            touched.extend(outcome.touched);
        }

        // Stage 3: recompute touched, flagged and (optionally) open episodes
        touched.extend(store.episodes_requiring_recalculation()?);
        if options.refresh_open_episodes {
            touched.extend(store.open_episode_ids()?);
        }

        let lifecycle = EpisodeLifecycleManager::new(&ctx);
        for episode_id in touched {
            let episode = lifecycle.recompute(store, episode_id)?;
            lease.renew(store)?;
            report.episodes_recomputed += 1;
            match episode.status {
                EpisodeStatus::Closed => report.episodes_closed += 1,
                EpisodeStatus::Extinct => report.episodes_extinct += 1,
                _ => {}
            }
        }

        info!(
            "[Engine] Pass done: {} events created, {} assigned ({} new episodes, {} merged), {} episodes recomputed",
            report.detections.events_created,
            report.events_assigned,
            report.episodes_created,
            report.episodes_merged,
            report.episodes_recomputed
        );

        Ok(report)
    }
}
