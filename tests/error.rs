//! Tests for error types and status parsing

use firetrack::{
    EpisodeMerger, EpisodeStatus, EventStatus, FireTrackError, MergeReason, OptionExt,
};

#[test]
fn test_error_messages() {
    let err = FireTrackError::NotFound {
        entity: "episode",
        id: 42,
    };
    assert_eq!(err.to_string(), "episode 42 not found");

    let err = FireTrackError::LockHeld {
        name: "firetrack.clustering".to_string(),
        holder: "worker-2".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "run lock 'firetrack.clustering' is held by 'worker-2'"
    );
}

#[test]
fn test_fatal_classification() {
    assert!(FireTrackError::NoActiveClusteringVersion.is_fatal());
    assert!(FireTrackError::InvariantViolation("two links".to_string()).is_fatal());
    assert!(!FireTrackError::Store("busy".to_string()).is_fatal());
    assert!(
        !FireTrackError::LockHeld {
            name: "x".to_string(),
            holder: "y".to_string()
        }
        .is_fatal()
    );
    assert!(
        !FireTrackError::LockLost {
            name: "x".to_string(),
            holder: "y".to_string()
        }
        .is_fatal()
    );
}

#[test]
fn test_ok_or_not_found() {
    let found: Option<u8> = Some(1);
    assert_eq!(found.ok_or_not_found("event", 1), Ok(1));

    let missing: Option<u8> = None;
    assert_eq!(
        missing.ok_or_not_found("event", 7),
        Err(FireTrackError::NotFound {
            entity: "event",
            id: 7
        })
    );
}

#[test]
fn test_status_round_trip_through_strings() {
    for status in [
        EventStatus::Active,
        EventStatus::Monitoring,
        EventStatus::Controlled,
        EventStatus::Extinct,
    ] {
        assert_eq!(status.as_str().parse::<EventStatus>(), Ok(status));
    }
    assert_eq!("closed".parse::<EpisodeStatus>(), Ok(EpisodeStatus::Closed));
    assert!(EpisodeStatus::Closed.is_terminal());
    assert!(!EpisodeStatus::Extinct.is_terminal());
    assert_eq!(
        "spatial_overlap".parse::<MergeReason>(),
        Ok(MergeReason::SpatialOverlap)
    );

    assert!(matches!(
        "smouldering".parse::<EventStatus>(),
        Err(FireTrackError::UnknownVariant { .. })
    ));
}

#[test]
fn test_serde_uses_snake_case() {
    let json = serde_json::to_string(&MergeReason::TemporalContinuity).unwrap();
    assert_eq!(json, "\"temporal_continuity\"");
    let status: EpisodeStatus = serde_json::from_str("\"monitoring\"").unwrap();
    assert_eq!(status, EpisodeStatus::Monitoring);
}

#[test]
fn test_episode_cannot_absorb_itself() {
    let now = chrono::Utc::now();
    let err = EpisodeMerger::new(5, 5, MergeReason::ManualMerge, 1, None, now).unwrap_err();
    assert_eq!(err, FireTrackError::InvalidMerge { episode_id: 5 });
}
