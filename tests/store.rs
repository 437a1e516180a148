//! Repository behaviour shared by every `FireStore` implementation.
//!
//! Each check runs against the in-memory store and the SQLite store.

mod common;

use chrono::Duration;
use common::*;
use firetrack::{
    Bounds, CandidateQuery, EpisodeMerger, EpisodeStatus, EventStatus, FireEvent, FireStore,
    FireTrackError, GeoPoint, InMemoryStore, MergeReason, NewEpisode, NewFireEvent,
    ParameterSource, SqliteStore, with_transaction,
};

fn draft_event(lat: f64, lng: f64, start_h: i64, version_id: i64) -> NewFireEvent {
    NewFireEvent {
        centroid: GeoPoint::new(lat, lng),
        start_date: hours(start_h),
        end_date: hours(start_h + 1),
        total_detections: 3,
        avg_frp: 10.0,
        max_frp: 14.0,
        sum_frp: 30.0,
        avg_confidence: 85.0,
        is_significant: true,
        status: EventStatus::Active,
        h3_index: None,
        province: Some("Maule".to_string()),
        estimated_area_hectares: 42.1875,
        clustering_version_id: version_id,
    }
}

fn event_with_members<S: FireStore>(store: &mut S, lat: f64, start_h: i64) -> FireEvent {
    let version = store.active_clustering_version().unwrap().unwrap();
    let ids = insert_burst(store, lat, LNG, hours(start_h), 3);
    store
        .create_event(draft_event(lat, LNG, start_h, version.id), &ids, hours(start_h + 2))
        .unwrap()
}

// ============================================================================
// Checks
// ============================================================================

fn check_pending_and_event_stamping<S: FireStore>(store: &mut S) {
    seed_version(store);
    let ids = insert_burst(store, LAT, LNG, t0(), 4);

    let pending = store.load_pending_detections(t0(), Some(3)).unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.windows(2).all(|w| w[0].detected_at <= w[1].detected_at));
    assert_eq!(store.load_pending_detections(hours(1), None).unwrap().len(), 0);

    let version = store.active_clustering_version().unwrap().unwrap();
    let event = store
        .create_event(draft_event(LAT, LNG, 0, version.id), &ids[..3], hours(1))
        .unwrap();
    assert_eq!(store.event(event.id).unwrap().unwrap(), event);

    for id in &ids[..3] {
        let d = store.detection(*id).unwrap().unwrap();
        assert!(d.is_processed);
        assert_eq!(d.fire_event_id, Some(event.id));
    }
    assert_eq!(store.load_pending_detections(t0(), None).unwrap().len(), 1);

    // A detection can only belong to one event
    let err = store
        .create_event(draft_event(LAT, LNG, 0, version.id), &ids[2..], hours(1))
        .unwrap_err();
    assert!(matches!(err, FireTrackError::InvariantViolation(_)));

    assert_eq!(store.mark_detections_processed(&ids[3..]).unwrap(), 1);
    assert!(store.load_pending_detections(t0(), None).unwrap().is_empty());
}

fn check_links_and_merges<S: FireStore>(store: &mut S) {
    seed_version(store);
    let version = store.active_clustering_version().unwrap().unwrap();
    let e1 = event_with_members(store, LAT, 0);
    let e2 = event_with_members(store, LAT + 0.01, 2);

    assert_eq!(store.unlinked_events(None).unwrap().len(), 2);

    let a = store
        .create_episode(NewEpisode::seeded_from(&e1, version.id), hours(3))
        .unwrap();
    let b = store
        .create_episode(NewEpisode::seeded_from(&e2, version.id), hours(3))
        .unwrap();
    assert_eq!(a.status, EpisodeStatus::Active);
    assert!(a.requires_recalculation);

    assert_eq!(store.relink_event(e1.id, a.id).unwrap(), None);
    assert_eq!(store.relink_event(e2.id, b.id).unwrap(), None);
    assert!(store.unlinked_events(None).unwrap().is_empty());

    // Move e2 into a, then back to b
    assert_eq!(store.relink_event(e2.id, a.id).unwrap(), Some(b.id));
    assert_eq!(store.link_count_for_event(e2.id).unwrap(), 1);
    assert_eq!(store.linked_event_ids(a.id).unwrap(), vec![e1.id, e2.id]);
    assert_eq!(store.relink_event(e2.id, b.id).unwrap(), Some(a.id));

    let moved = store.migrate_links(b.id, a.id).unwrap();
    assert_eq!(moved, vec![e2.id]);
    assert!(store.linked_event_ids(b.id).unwrap().is_empty());
    let linked: Vec<i64> = store.linked_events(a.id).unwrap().iter().map(|e| e.id).collect();
    assert_eq!(linked, vec![e1.id, e2.id]);

    let merger = EpisodeMerger::new(
        b.id,
        a.id,
        MergeReason::SpatialOverlap,
        version.id,
        Some("test".to_string()),
        hours(4),
    )
    .unwrap();
    let stored = store.record_merger(&merger).unwrap();
    assert_eq!(stored.absorbed_episode_id, b.id);
    assert_eq!(store.list_mergers().unwrap(), vec![stored]);

    let mut self_merge = merger.clone();
    self_merge.absorbing_episode_id = b.id;
    assert_eq!(
        store.record_merger(&self_merge).unwrap_err(),
        FireTrackError::InvalidMerge { episode_id: b.id }
    );

    let err = store.relink_event(e1.id, 9_999).unwrap_err();
    assert!(matches!(err, FireTrackError::NotFound { entity: "episode", .. }));
}

fn check_episode_queries<S: FireStore>(store: &mut S) {
    seed_version(store);
    let version = store.active_clustering_version().unwrap().unwrap();
    let e1 = event_with_members(store, LAT, 0);

    let mut episode = store
        .create_episode(NewEpisode::seeded_from(&e1, version.id), hours(3))
        .unwrap();
    episode.provinces = vec!["Maule".to_string(), "Ñuble".to_string()];
    episode.slides_data = Some(serde_json::json!({ "slides": [1, 2] }));
    episode.requires_recalculation = false;
    store.save_episode(&episode).unwrap();
    assert_eq!(store.episode(episode.id).unwrap().unwrap(), episode);

    let near = CandidateQuery {
        bbox: Bounds::from_point(&e1.centroid).expand_meters(10_000.0),
        from: hours(-48),
        to: hours(48),
    };
    assert_eq!(store.find_candidate_episodes(&near).unwrap().len(), 1);

    let later = CandidateQuery {
        from: hours(100),
        to: hours(200),
        ..near.clone()
    };
    assert!(store.find_candidate_episodes(&later).unwrap().is_empty());

    let far = CandidateQuery {
        bbox: Bounds::from_point(&GeoPoint::new(LAT + 1.0, LNG)).expand_meters(10_000.0),
        ..near.clone()
    };
    assert!(store.find_candidate_episodes(&far).unwrap().is_empty());

    assert!(store.episodes_requiring_recalculation().unwrap().is_empty());
    store.mark_requires_recalculation(episode.id).unwrap();
    assert_eq!(store.episodes_requiring_recalculation().unwrap(), vec![episode.id]);
    assert_eq!(store.open_episode_ids().unwrap(), vec![episode.id]);

    episode.status = EpisodeStatus::Closed;
    store.save_episode(&episode).unwrap();
    assert!(store.open_episode_ids().unwrap().is_empty());
    assert!(store.find_candidate_episodes(&near).unwrap().is_empty());

    store.update_event_status(e1.id, EventStatus::Controlled).unwrap();
    assert_eq!(
        store.event(e1.id).unwrap().unwrap().status,
        EventStatus::Controlled
    );
}

fn check_transactions<S: FireStore>(store: &mut S) {
    seed_version(store);

    let result: firetrack::Result<()> = with_transaction(store, |s| {
        insert_burst(s, LAT, LNG, t0(), 3);
        Err(FireTrackError::Store("boom".to_string()))
    });
    assert!(result.is_err());
    assert!(store.list_detections().unwrap().is_empty());

    with_transaction(store, |s| {
        insert_burst(s, LAT, LNG, t0(), 3);
        Ok(())
    })
    .unwrap();
    assert_eq!(store.list_detections().unwrap().len(), 3);

    store.begin().unwrap();
    assert!(store.begin().is_err());
    store.rollback().unwrap();
    assert!(store.commit().is_err());
}

fn check_run_lock_and_parameters<S: FireStore>(store: &mut S) {
    let ttl = Duration::minutes(30);
    assert!(store.acquire_run_lock("job", "a", t0(), ttl).unwrap());
    assert!(!store.acquire_run_lock("job", "b", t0(), ttl).unwrap());
    // Re-entrant for the same holder
    assert!(store.acquire_run_lock("job", "a", t0(), ttl).unwrap());
    assert_eq!(store.run_lock_holder("job", t0()).unwrap(), Some("a".to_string()));

    // Release by a non-holder is ignored
    store.release_run_lock("job", "b").unwrap();
    assert_eq!(store.run_lock_holder("job", t0()).unwrap(), Some("a".to_string()));

    // Expired lease can be taken over
    let later = t0() + Duration::hours(1);
    assert_eq!(store.run_lock_holder("job", later).unwrap(), None);
    assert!(store.acquire_run_lock("job", "b", later, ttl).unwrap());
    store.release_run_lock("job", "b").unwrap();
    assert_eq!(store.run_lock_holder("job", later).unwrap(), None);

    assert_eq!(store.parameter("episode.grace_hours").unwrap(), None);
    store.set_parameter("episode.grace_hours", "72").unwrap();
    store.set_parameter("episode.grace_hours", "96").unwrap();
    assert_eq!(
        store.parameter("episode.grace_hours").unwrap(),
        Some("96".to_string())
    );
}

fn check_active_version<S: FireStore>(store: &mut S) {
    assert!(store.active_clustering_version().unwrap().is_none());
    seed_version(store);
    let mut newer = firetrack::NewClusteringVersion::new(2.0, 4, 12.0);
    store.insert_clustering_version(newer.clone(), t0()).unwrap();
    newer.is_active = false;
    store.insert_clustering_version(newer, hours(1)).unwrap();

    let active = store.active_clustering_version().unwrap().unwrap();
    assert_eq!(active.epsilon_km, 2.0);
    assert_eq!(active.min_points, 4);
    assert_eq!(active.algorithm, "st_dbscan");
}

// ============================================================================
// Runners
// ============================================================================

macro_rules! store_tests {
    ($($name:ident => $check:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[test]
                fn $name() {
                    $check(&mut InMemoryStore::new());
                }
            )*
        }

        mod sqlite {
            use super::*;
            $(
                #[test]
                fn $name() {
                    $check(&mut SqliteStore::open_in_memory().unwrap());
                }
            )*
        }
    };
}

store_tests! {
    test_pending_and_event_stamping => check_pending_and_event_stamping,
    test_links_and_merges => check_links_and_merges,
    test_episode_queries => check_episode_queries,
    test_transactions => check_transactions,
    test_run_lock_and_parameters => check_run_lock_and_parameters,
    test_active_version => check_active_version,
}

#[test]
fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fires.sqlite");

    let episode_count = {
        let mut store = SqliteStore::open(&path).unwrap();
        seed_version(&mut store);
        insert_burst(&mut store, LAT, LNG, t0(), 3);
        let engine = firetrack::ClusteringEngine::new(firetrack::Environment::Development);
        let options = firetrack::RunOptions::days_back(7, hours(2)).with_lock_holder("test");
        engine.run(&mut store, &options, hours(2)).unwrap();
        store.list_episodes().unwrap().len()
    };
    assert_eq!(episode_count, 1);

    let store = SqliteStore::open(&path).unwrap();
    let episodes = store.list_episodes().unwrap();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].event_count, 1);
    assert_eq!(episodes[0].detection_count, 3);
    assert_eq!(store.list_events().unwrap().len(), 1);
    assert!(store.list_detections().unwrap().iter().all(|d| d.is_processed));
}
