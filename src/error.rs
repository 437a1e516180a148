//! Unified error type for the clustering pipeline.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FireTrackError>;

/// Errors raised by the clustering stages and the stores.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FireTrackError {
    /// No `is_active = true` clustering version exists. Clustering never
    /// runs with assumed parameters.
    #[error("no active clustering version; refusing to cluster without explicit parameters")]
    NoActiveClusteringVersion,

    /// A canonical parameter is missing or malformed in a strict environment.
    #[error("configuration error for '{key}': {reason}")]
    Config { key: String, reason: String },

    /// Underlying storage failure.
    #[error("store error: {0}")]
    Store(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// An episode cannot absorb itself.
    #[error("episode {episode_id} cannot be merged into itself")]
    InvalidMerge { episode_id: i64 },

    /// A data invariant was broken. This is a logic bug, never retried.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Another clustering run holds the run lock.
    #[error("run lock '{name}' is held by '{holder}'")]
    LockHeld { name: String, holder: String },

    /// The lease expired mid-pass and another holder took the lock.
    #[error("run lock '{name}' was taken over by '{holder}'")]
    LockLost { name: String, holder: String },

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

impl FireTrackError {
    /// Errors that must abort the whole run rather than a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FireTrackError::NoActiveClusteringVersion
                | FireTrackError::Config { .. }
                | FireTrackError::InvariantViolation(_)
        )
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for FireTrackError {
    fn from(err: rusqlite::Error) -> Self {
        FireTrackError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for FireTrackError {
    fn from(err: serde_json::Error) -> Self {
        FireTrackError::Store(format!("serialization: {err}"))
    }
}

/// Extension for turning lookups into `NotFound` errors.
pub trait OptionExt<T> {
    fn ok_or_not_found(self, entity: &'static str, id: i64) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, entity: &'static str, id: i64) -> Result<T> {
        self.ok_or(FireTrackError::NotFound { entity, id })
    }
}
