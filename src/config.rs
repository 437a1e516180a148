//! Canonical flow parameters and clustering version resolution.
//!
//! Two kinds of configuration govern a run:
//! - the active [`ClusteringVersion`] (event epsilon, min-points, temporal
//!   window), which is mandatory and never defaulted;
//! - canonical flow parameters ([`FlowConfig`]) read from a keyed parameter
//!   store, resolved with an environment-aware policy.
//!
//! In production a missing or unparsable canonical key is fatal. Everywhere
//! else the documented default is used and a warning is logged. A transient
//! read failure falls back to the default in every environment.

use std::fmt::Display;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{FireTrackError, Result};
use crate::store::FireStore;
use crate::ClusteringVersion;

/// Environment variable selecting the deployment environment.
pub const ENVIRONMENT_VAR: &str = "FIRETRACK_ENV";

/// Canonical parameter keys.
pub mod keys {
    pub const EPISODE_EPSILON_KM: &str = "episode.epsilon_km";
    pub const EPISODE_TEMPORAL_BUFFER_HOURS: &str = "episode.temporal_buffer_hours";
    pub const EPISODE_GRACE_HOURS: &str = "episode.grace_hours";
    pub const EVENT_ACTIVE_HOURS: &str = "event.active_hours";
    pub const EVENT_H3_RESOLUTION: &str = "event.h3_resolution";
    pub const DETECTION_MIN_CONFIDENCE: &str = "detection.min_confidence";

    pub const ALL: [&str; 6] = [
        EPISODE_EPSILON_KM,
        EPISODE_TEMPORAL_BUFFER_HOURS,
        EPISODE_GRACE_HOURS,
        EVENT_ACTIVE_HOURS,
        EVENT_H3_RESOLUTION,
        DETECTION_MIN_CONFIDENCE,
    ];
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    /// Parse an environment name. Unknown names map to `Development`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }

    /// Read [`ENVIRONMENT_VAR`]; unset means `Development`.
    pub fn from_env() -> Self {
        std::env::var(ENVIRONMENT_VAR)
            .map(|v| Self::parse(&v))
            .unwrap_or(Environment::Development)
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Finest H3 resolution.
pub const MAX_H3_RESOLUTION: u8 = 15;

/// Read-only key/value parameter source.
pub trait ParameterSource {
    fn parameter(&self, key: &str) -> Result<Option<String>>;
}

/// Canonical flow parameters, resolved once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Spatial epsilon for episode candidate search.
    /// Default: 10.0 km (wider than the event epsilon)
    pub episode_epsilon_km: f64,

    /// Buffer added on both sides of an event's interval when looking for
    /// overlapping episodes. Default: 48 hours
    pub episode_temporal_buffer_hours: f64,

    /// Inactivity after which an episode becomes extinct. Default: 72 hours
    pub grace_hours: f64,

    /// Age after which an active event is downgraded to monitoring.
    /// Default: 24 hours
    pub event_active_hours: f64,

    /// H3 resolution used for event cell indexes. Default: 7
    pub h3_resolution: u8,

    /// Detections below this confidence are marked processed but never
    /// clustered. Default: 50
    pub min_confidence: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            episode_epsilon_km: 10.0,
            episode_temporal_buffer_hours: 48.0,
            grace_hours: 72.0,
            event_active_hours: 24.0,
            h3_resolution: 7,
            min_confidence: 50.0,
        }
    }
}

impl FlowConfig {
    /// Resolve every canonical key against `source` under `env`'s policy.
    pub fn resolve<P: ParameterSource + ?Sized>(source: &P, env: Environment) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            episode_epsilon_km: resolve_param(
                source,
                env,
                keys::EPISODE_EPSILON_KM,
                defaults.episode_epsilon_km,
            )?,
            episode_temporal_buffer_hours: resolve_param(
                source,
                env,
                keys::EPISODE_TEMPORAL_BUFFER_HOURS,
                defaults.episode_temporal_buffer_hours,
            )?,
            grace_hours: resolve_param(source, env, keys::EPISODE_GRACE_HOURS, defaults.grace_hours)?,
            event_active_hours: resolve_param(
                source,
                env,
                keys::EVENT_ACTIVE_HOURS,
                defaults.event_active_hours,
            )?,
            h3_resolution: resolve_param_checked(
                source,
                env,
                keys::EVENT_H3_RESOLUTION,
                defaults.h3_resolution,
                |&r| r <= MAX_H3_RESOLUTION,
            )?,
            min_confidence: resolve_param(
                source,
                env,
                keys::DETECTION_MIN_CONFIDENCE,
                defaults.min_confidence,
            )?,
        };
        debug!("[Config] Resolved flow config for {:?}: {:?}", env, config);
        Ok(config)
    }

    pub fn episode_epsilon_meters(&self) -> f64 {
        self.episode_epsilon_km * 1000.0
    }

    pub fn temporal_buffer(&self) -> chrono::Duration {
        hours(self.episode_temporal_buffer_hours)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        hours(self.grace_hours)
    }

    pub fn event_active_period(&self) -> chrono::Duration {
        hours(self.event_active_hours)
    }
}

fn hours(h: f64) -> chrono::Duration {
    chrono::Duration::seconds((h * 3600.0).round() as i64)
}

/// Resolve a single key.
///
/// - present and parsable: the stored value
/// - missing or unparsable: fatal in production, default + warning elsewhere
/// - source error: default + warning in every environment
pub fn resolve_param<P, T>(source: &P, env: Environment, key: &str, default: T) -> Result<T>
where
    P: ParameterSource + ?Sized,
    T: FromStr + Display,
    T::Err: Display,
{
    resolve_param_checked(source, env, key, default, |_| true)
}

/// [`resolve_param`] with a range check. A parsable value rejected by
/// `is_valid` is treated like an unparsable one.
pub fn resolve_param_checked<P, T, F>(
    source: &P,
    env: Environment,
    key: &str,
    default: T,
    is_valid: F,
) -> Result<T>
where
    P: ParameterSource + ?Sized,
    T: FromStr + Display,
    T::Err: Display,
    F: Fn(&T) -> bool,
{
    let raw = match source.parameter(key) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("[Config] Failed to read '{}' ({}); using default {}", key, e, default);
            return Ok(default);
        }
    };

    let Some(value) = raw else {
        if env.is_production() {
            return Err(FireTrackError::Config {
                key: key.to_string(),
                reason: "missing canonical key".to_string(),
            });
        }
        warn!("[Config] Missing '{}'; using default {}", key, default);
        return Ok(default);
    };

    let reason = match value.trim().parse::<T>() {
        Ok(parsed) if is_valid(&parsed) => return Ok(parsed),
        Ok(parsed) => format!("{} is out of range", parsed),
        Err(e) => format!("cannot parse '{}': {}", value, e),
    };

    if env.is_production() {
        return Err(FireTrackError::Config {
            key: key.to_string(),
            reason,
        });
    }
    warn!(
        "[Config] Invalid value '{}' for '{}' ({}); using default {}",
        value, key, reason, default
    );
    Ok(default)
}

/// Load the most recently created active clustering version.
///
/// There is no default: without explicit parameters clustering must not run.
pub fn resolve_active_version<S: FireStore + ?Sized>(store: &S) -> Result<ClusteringVersion> {
    let version = store
        .active_clustering_version()?
        .ok_or(FireTrackError::NoActiveClusteringVersion)?;
    version.validate()?;
    Ok(version)
}
