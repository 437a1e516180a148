//! SQLite-backed [`FireStore`].
//!
//! Timestamps are stored as UTC epoch milliseconds. Province lists and
//! slide payloads are stored as JSON text. The link table keys on
//! `event_id`, so the database itself refuses a second link for an event.
//!
//! Transactions use `BEGIN IMMEDIATE` so a second writer blocks up front
//! instead of failing at commit time.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::config::ParameterSource;
use crate::error::{FireTrackError, Result};
use crate::store::{CandidateQuery, FireStore};
use crate::{
    Bounds, ClusteringVersion, Detection, EpisodeMerger, EventStatus, FireEpisode, FireEvent,
    GeoPoint, NewClusteringVersion, NewDetection, NewEpisode, NewFireEvent,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clustering_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    epsilon_km REAL NOT NULL,
    min_points INTEGER NOT NULL,
    temporal_window_hours REAL NOT NULL,
    algorithm TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS parameters (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_locks (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fire_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    centroid_lat REAL NOT NULL,
    centroid_lng REAL NOT NULL,
    start_date INTEGER NOT NULL,
    end_date INTEGER NOT NULL,
    total_detections INTEGER NOT NULL,
    avg_frp REAL NOT NULL,
    max_frp REAL NOT NULL,
    sum_frp REAL NOT NULL,
    avg_confidence REAL NOT NULL,
    is_significant INTEGER NOT NULL,
    status TEXT NOT NULL,
    h3_index TEXT,
    province TEXT,
    estimated_area_hectares REAL NOT NULL,
    clustering_version_id INTEGER NOT NULL REFERENCES clustering_versions(id),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    detected_at INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    fire_radiative_power REAL NOT NULL,
    confidence REAL NOT NULL,
    province TEXT,
    is_processed INTEGER NOT NULL DEFAULT 0,
    fire_event_id INTEGER REFERENCES fire_events(id)
);
CREATE INDEX IF NOT EXISTS idx_detections_pending
    ON detections(is_processed, detected_at);

CREATE TABLE IF NOT EXISTS fire_episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL,
    start_date INTEGER NOT NULL,
    end_date INTEGER,
    last_seen_at INTEGER NOT NULL,
    centroid_lat REAL NOT NULL,
    centroid_lng REAL NOT NULL,
    bbox_min_lat REAL NOT NULL,
    bbox_max_lat REAL NOT NULL,
    bbox_min_lng REAL NOT NULL,
    bbox_max_lng REAL NOT NULL,
    provinces TEXT NOT NULL,
    event_count INTEGER NOT NULL,
    detection_count INTEGER NOT NULL,
    frp_sum REAL NOT NULL,
    frp_max REAL NOT NULL,
    estimated_area_hectares REAL NOT NULL,
    gee_candidate INTEGER NOT NULL,
    gee_priority INTEGER,
    clustering_version_id INTEGER NOT NULL REFERENCES clustering_versions(id),
    requires_recalculation INTEGER NOT NULL,
    slides_data TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episodes_open
    ON fire_episodes(status, centroid_lat, centroid_lng);

CREATE TABLE IF NOT EXISTS fire_episode_events (
    event_id INTEGER PRIMARY KEY REFERENCES fire_events(id),
    episode_id INTEGER NOT NULL REFERENCES fire_episodes(id)
);
CREATE INDEX IF NOT EXISTS idx_episode_events_episode
    ON fire_episode_events(episode_id);

CREATE TABLE IF NOT EXISTS episode_mergers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    absorbed_episode_id INTEGER NOT NULL REFERENCES fire_episodes(id),
    absorbing_episode_id INTEGER NOT NULL REFERENCES fire_episodes(id),
    reason TEXT NOT NULL,
    merged_by_version_id INTEGER NOT NULL,
    notes TEXT,
    merged_at INTEGER NOT NULL,
    CHECK (absorbed_episode_id <> absorbing_episode_id)
);
"#;

const DETECTION_COLUMNS: &str = "id, detected_at, latitude, longitude, fire_radiative_power, \
     confidence, province, is_processed, fire_event_id";

const EVENT_COLUMNS: &str = "id, centroid_lat, centroid_lng, start_date, end_date, \
     total_detections, avg_frp, max_frp, sum_frp, avg_confidence, is_significant, status, \
     h3_index, province, estimated_area_hectares, clustering_version_id, created_at";

const EPISODE_COLUMNS: &str = "id, status, start_date, end_date, last_seen_at, centroid_lat, \
     centroid_lng, bbox_min_lat, bbox_max_lat, bbox_min_lng, bbox_max_lng, provinces, \
     event_count, detection_count, frp_sum, frp_max, estimated_area_hectares, gee_candidate, \
     gee_priority, clustering_version_id, requires_recalculation, slides_data, created_at, \
     updated_at";

const VERSION_COLUMNS: &str =
    "id, epsilon_km, min_points, temporal_window_hours, algorithm, is_active, created_at";

const MERGER_COLUMNS: &str = "id, absorbed_episode_id, absorbing_episode_id, reason, \
     merged_by_version_id, notes, merged_at";

/// Durable store on a single SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("[Store] Opened SQLite store at {}", path.display());
        Self::with_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(millis) => DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis)),
        None => Ok(None),
    }
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = FireTrackError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json<T: serde::de::DeserializeOwned>(raw: &str, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn detection_from_row(row: &Row<'_>) -> rusqlite::Result<Detection> {
    Ok(Detection {
        id: row.get(0)?,
        detected_at: ts(row, 1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        fire_radiative_power: row.get(4)?,
        confidence: row.get(5)?,
        province: row.get(6)?,
        is_processed: row.get(7)?,
        fire_event_id: row.get(8)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<FireEvent> {
    Ok(FireEvent {
        id: row.get(0)?,
        centroid: GeoPoint::new(row.get(1)?, row.get(2)?),
        start_date: ts(row, 3)?,
        end_date: ts(row, 4)?,
        total_detections: row.get(5)?,
        avg_frp: row.get(6)?,
        max_frp: row.get(7)?,
        sum_frp: row.get(8)?,
        avg_confidence: row.get(9)?,
        is_significant: row.get(10)?,
        status: parsed(row, 11)?,
        h3_index: row.get(12)?,
        province: row.get(13)?,
        estimated_area_hectares: row.get(14)?,
        clustering_version_id: row.get(15)?,
        created_at: ts(row, 16)?,
    })
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<FireEpisode> {
    let provinces: String = row.get(11)?;
    let slides: Option<String> = row.get(21)?;
    Ok(FireEpisode {
        id: row.get(0)?,
        status: parsed(row, 1)?,
        start_date: ts(row, 2)?,
        end_date: opt_ts(row, 3)?,
        last_seen_at: ts(row, 4)?,
        centroid: GeoPoint::new(row.get(5)?, row.get(6)?),
        bbox: Bounds {
            min_lat: row.get(7)?,
            max_lat: row.get(8)?,
            min_lng: row.get(9)?,
            max_lng: row.get(10)?,
        },
        provinces: json(&provinces, 11)?,
        event_count: row.get(12)?,
        detection_count: row.get(13)?,
        frp_sum: row.get(14)?,
        frp_max: row.get(15)?,
        estimated_area_hectares: row.get(16)?,
        gee_candidate: row.get(17)?,
        gee_priority: row.get(18)?,
        clustering_version_id: row.get(19)?,
        requires_recalculation: row.get(20)?,
        slides_data: slides.as_deref().map(|s| json(s, 21)).transpose()?,
        created_at: ts(row, 22)?,
        updated_at: ts(row, 23)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<ClusteringVersion> {
    Ok(ClusteringVersion {
        id: row.get(0)?,
        epsilon_km: row.get(1)?,
        min_points: row.get(2)?,
        temporal_window_hours: row.get(3)?,
        algorithm: row.get(4)?,
        is_active: row.get(5)?,
        created_at: ts(row, 6)?,
    })
}

fn merger_from_row(row: &Row<'_>) -> rusqlite::Result<EpisodeMerger> {
    Ok(EpisodeMerger {
        id: row.get(0)?,
        absorbed_episode_id: row.get(1)?,
        absorbing_episode_id: row.get(2)?,
        reason: parsed(row, 3)?,
        merged_by_version_id: row.get(4)?,
        notes: row.get(5)?,
        merged_at: ts(row, 6)?,
    })
}

/// SQLite `LIMIT` value; negative means unbounded.
fn sql_limit(limit: Option<usize>) -> i64 {
    limit
        .and_then(|l| i64::try_from(l).ok())
        .unwrap_or(-1)
}

impl SqliteStore {
    fn query_events(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<FireEvent>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_episodes(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<FireEpisode>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, episode_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_ids(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }
}

impl ParameterSource for SqliteStore {
    fn parameter(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM parameters WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl FireStore for SqliteStore {
    fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(FireTrackError::Store(
                "transaction already in progress".to_string(),
            ));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(FireTrackError::Store("commit without transaction".to_string()));
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(FireTrackError::Store(
                "rollback without transaction".to_string(),
            ));
        }
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn acquire_run_lock(
        &mut self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT INTO run_locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE run_locks.holder = excluded.holder OR run_locks.expires_at <= ?4",
            params![
                name,
                holder,
                (now + ttl).timestamp_millis(),
                now.timestamp_millis()
            ],
        )?;
        Ok(changed == 1)
    }

    fn release_run_lock(&mut self, name: &str, holder: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM run_locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }

    fn run_lock_holder(&self, name: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT holder FROM run_locks WHERE name = ?1 AND expires_at > ?2",
                params![name, now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO parameters (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn active_clustering_version(&self) -> Result<Option<ClusteringVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM clustering_versions WHERE is_active = 1
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        Ok(self.conn.query_row(&sql, [], version_from_row).optional()?)
    }

    fn insert_clustering_version(
        &mut self,
        version: NewClusteringVersion,
        created_at: DateTime<Utc>,
    ) -> Result<ClusteringVersion> {
        self.conn.execute(
            "INSERT INTO clustering_versions
                (epsilon_km, min_points, temporal_window_hours, algorithm, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version.epsilon_km,
                version.min_points,
                version.temporal_window_hours,
                version.algorithm,
                version.is_active,
                created_at.timestamp_millis()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("[Store] Inserted clustering version {}", id);
        Ok(version.into_version(id, created_at))
    }

    fn insert_detections(&mut self, detections: &[NewDetection]) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO detections
                (detected_at, latitude, longitude, fire_radiative_power, confidence, province)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        let mut ids = Vec::with_capacity(detections.len());
        for d in detections {
            let id = stmt.insert(params![
                d.detected_at.timestamp_millis(),
                d.latitude,
                d.longitude,
                d.fire_radiative_power,
                d.confidence,
                d.province
            ])?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn load_pending_detections(
        &self,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Detection>> {
        let sql = format!(
            "SELECT {DETECTION_COLUMNS} FROM detections
             WHERE is_processed = 0 AND fire_event_id IS NULL AND detected_at >= ?1
             ORDER BY detected_at, id LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![since.timestamp_millis(), sql_limit(limit)],
            detection_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn mark_detections_processed(&mut self, ids: &[i64]) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("UPDATE detections SET is_processed = 1 WHERE id = ?1")?;
        let mut count = 0;
        for id in ids {
            count += stmt.execute(params![id])?;
        }
        Ok(count)
    }

    fn detection(&self, id: i64) -> Result<Option<Detection>> {
        let sql = format!("SELECT {DETECTION_COLUMNS} FROM detections WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], detection_from_row)
            .optional()?)
    }

    fn list_detections(&self) -> Result<Vec<Detection>> {
        let sql = format!("SELECT {DETECTION_COLUMNS} FROM detections ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], detection_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn create_event(
        &mut self,
        event: NewFireEvent,
        member_ids: &[i64],
        created_at: DateTime<Utc>,
    ) -> Result<FireEvent> {
        for &id in member_ids {
            let owner: Option<Option<i64>> = self
                .conn
                .query_row(
                    "SELECT fire_event_id FROM detections WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                None => return Err(FireTrackError::NotFound { entity: "detection", id }),
                Some(Some(owner)) => {
                    return Err(FireTrackError::InvariantViolation(format!(
                        "detection {} already belongs to event {}",
                        id, owner
                    )));
                }
                Some(None) => {}
            }
        }

        self.conn.execute(
            "INSERT INTO fire_events
                (centroid_lat, centroid_lng, start_date, end_date, total_detections, avg_frp,
                 max_frp, sum_frp, avg_confidence, is_significant, status, h3_index, province,
                 estimated_area_hectares, clustering_version_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                event.centroid.latitude,
                event.centroid.longitude,
                event.start_date.timestamp_millis(),
                event.end_date.timestamp_millis(),
                event.total_detections,
                event.avg_frp,
                event.max_frp,
                event.sum_frp,
                event.avg_confidence,
                event.is_significant,
                event.status.as_str(),
                event.h3_index,
                event.province,
                event.estimated_area_hectares,
                event.clustering_version_id,
                created_at.timestamp_millis()
            ],
        )?;
        let id = self.conn.last_insert_rowid();

        let mut stmt = self.conn.prepare(
            "UPDATE detections SET fire_event_id = ?1, is_processed = 1 WHERE id = ?2",
        )?;
        for member in member_ids {
            stmt.execute(params![id, member])?;
        }

        Ok(event.into_event(id, created_at))
    }

    fn event(&self, id: i64) -> Result<Option<FireEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM fire_events WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], event_from_row)
            .optional()?)
    }

    fn list_events(&self) -> Result<Vec<FireEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM fire_events ORDER BY id");
        self.query_events(&sql, [])
    }

    fn unlinked_events(&self, limit: Option<usize>) -> Result<Vec<FireEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM fire_events e
             WHERE NOT EXISTS (SELECT 1 FROM fire_episode_events l WHERE l.event_id = e.id)
             ORDER BY start_date, id LIMIT ?1"
        );
        self.query_events(&sql, params![sql_limit(limit)])
    }

    fn update_event_status(&mut self, id: i64, status: EventStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE fire_events SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Err(FireTrackError::NotFound { entity: "event", id });
        }
        Ok(())
    }

    fn find_candidate_episodes(&self, query: &CandidateQuery) -> Result<Vec<FireEpisode>> {
        let sql = format!(
            "SELECT {EPISODE_COLUMNS} FROM fire_episodes
             WHERE status <> 'closed'
               AND centroid_lat BETWEEN ?1 AND ?2
               AND centroid_lng BETWEEN ?3 AND ?4
               AND start_date <= ?5
               AND last_seen_at >= ?6
             ORDER BY id"
        );
        self.query_episodes(
            &sql,
            params![
                query.bbox.min_lat,
                query.bbox.max_lat,
                query.bbox.min_lng,
                query.bbox.max_lng,
                query.to.timestamp_millis(),
                query.from.timestamp_millis()
            ],
        )
    }

    fn create_episode(&mut self, seed: NewEpisode, now: DateTime<Utc>) -> Result<FireEpisode> {
        // Insert a placeholder row to claim the id, then write every column
        self.conn.execute(
            "INSERT INTO fire_episodes
                (status, start_date, last_seen_at, centroid_lat, centroid_lng, bbox_min_lat,
                 bbox_max_lat, bbox_min_lng, bbox_max_lng, provinces, event_count,
                 detection_count, frp_sum, frp_max, estimated_area_hectares, gee_candidate,
                 clustering_version_id, requires_recalculation, created_at, updated_at)
             VALUES ('active', ?1, ?1, 0, 0, 0, 0, 0, 0, '[]', 0, 0, 0, 0, 0, 0, ?2, 1, ?3, ?3)",
            params![
                seed.start_date.timestamp_millis(),
                seed.clustering_version_id,
                now.timestamp_millis()
            ],
        )?;
        let episode = seed.into_episode(self.conn.last_insert_rowid(), now);
        self.save_episode(&episode)?;
        Ok(episode)
    }

    fn episode(&self, id: i64) -> Result<Option<FireEpisode>> {
        let sql = format!("SELECT {EPISODE_COLUMNS} FROM fire_episodes WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], episode_from_row)
            .optional()?)
    }

    fn save_episode(&mut self, episode: &FireEpisode) -> Result<()> {
        let provinces = serde_json::to_string(&episode.provinces)?;
        let slides = episode
            .slides_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let changed = self.conn.execute(
            "UPDATE fire_episodes SET
                status = ?2, start_date = ?3, end_date = ?4, last_seen_at = ?5,
                centroid_lat = ?6, centroid_lng = ?7, bbox_min_lat = ?8, bbox_max_lat = ?9,
                bbox_min_lng = ?10, bbox_max_lng = ?11, provinces = ?12, event_count = ?13,
                detection_count = ?14, frp_sum = ?15, frp_max = ?16,
                estimated_area_hectares = ?17, gee_candidate = ?18, gee_priority = ?19,
                clustering_version_id = ?20, requires_recalculation = ?21, slides_data = ?22,
                created_at = ?23, updated_at = ?24
             WHERE id = ?1",
            params![
                episode.id,
                episode.status.as_str(),
                episode.start_date.timestamp_millis(),
                episode.end_date.map(|d| d.timestamp_millis()),
                episode.last_seen_at.timestamp_millis(),
                episode.centroid.latitude,
                episode.centroid.longitude,
                episode.bbox.min_lat,
                episode.bbox.max_lat,
                episode.bbox.min_lng,
                episode.bbox.max_lng,
                provinces,
                episode.event_count,
                episode.detection_count,
                episode.frp_sum,
                episode.frp_max,
                episode.estimated_area_hectares,
                episode.gee_candidate,
                episode.gee_priority,
                episode.clustering_version_id,
                episode.requires_recalculation,
                slides,
                episode.created_at.timestamp_millis(),
                episode.updated_at.timestamp_millis()
            ],
        )?;
        if changed == 0 {
            return Err(FireTrackError::NotFound {
                entity: "episode",
                id: episode.id,
            });
        }
        Ok(())
    }

    fn list_episodes(&self) -> Result<Vec<FireEpisode>> {
        let sql = format!("SELECT {EPISODE_COLUMNS} FROM fire_episodes ORDER BY id");
        self.query_episodes(&sql, [])
    }

    fn mark_requires_recalculation(&mut self, id: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE fire_episodes SET requires_recalculation = 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(FireTrackError::NotFound { entity: "episode", id });
        }
        Ok(())
    }

    fn episodes_requiring_recalculation(&self) -> Result<Vec<i64>> {
        self.query_ids(
            "SELECT id FROM fire_episodes WHERE requires_recalculation = 1 ORDER BY id",
            [],
        )
    }

    fn open_episode_ids(&self) -> Result<Vec<i64>> {
        self.query_ids(
            "SELECT id FROM fire_episodes WHERE status <> 'closed' ORDER BY id",
            [],
        )
    }

    fn episode_for_event(&self, event_id: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT episode_id FROM fire_episode_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn link_count_for_event(&self, event_id: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM fire_episode_events WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn relink_event(&mut self, event_id: i64, episode_id: i64) -> Result<Option<i64>> {
        if self.event(event_id)?.is_none() {
            return Err(FireTrackError::NotFound {
                entity: "event",
                id: event_id,
            });
        }
        if self.episode(episode_id)?.is_none() {
            return Err(FireTrackError::NotFound {
                entity: "episode",
                id: episode_id,
            });
        }

        let previous = self.episode_for_event(event_id)?;
        self.conn.execute(
            "DELETE FROM fire_episode_events WHERE event_id = ?1",
            params![event_id],
        )?;
        self.conn.execute(
            "INSERT INTO fire_episode_events (event_id, episode_id) VALUES (?1, ?2)",
            params![event_id, episode_id],
        )?;
        Ok(previous)
    }

    fn migrate_links(&mut self, from: i64, to: i64) -> Result<Vec<i64>> {
        let moved = self.linked_event_ids(from)?;
        self.conn.execute(
            "UPDATE fire_episode_events SET episode_id = ?1 WHERE episode_id = ?2",
            params![to, from],
        )?;
        Ok(moved)
    }

    fn linked_event_ids(&self, episode_id: i64) -> Result<Vec<i64>> {
        self.query_ids(
            "SELECT event_id FROM fire_episode_events WHERE episode_id = ?1 ORDER BY event_id",
            params![episode_id],
        )
    }

    fn linked_events(&self, episode_id: i64) -> Result<Vec<FireEvent>> {
        let columns = EVENT_COLUMNS
            .split(", ")
            .map(|c| format!("e.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM fire_events e
             JOIN fire_episode_events l ON l.event_id = e.id
             WHERE l.episode_id = ?1
             ORDER BY e.id"
        );
        self.query_events(&sql, params![episode_id])
    }

    fn record_merger(&mut self, merger: &EpisodeMerger) -> Result<EpisodeMerger> {
        if merger.absorbed_episode_id == merger.absorbing_episode_id {
            return Err(FireTrackError::InvalidMerge {
                episode_id: merger.absorbed_episode_id,
            });
        }
        self.conn.execute(
            "INSERT INTO episode_mergers
                (absorbed_episode_id, absorbing_episode_id, reason, merged_by_version_id, notes,
                 merged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                merger.absorbed_episode_id,
                merger.absorbing_episode_id,
                merger.reason.as_str(),
                merger.merged_by_version_id,
                merger.notes,
                merger.merged_at.timestamp_millis()
            ],
        )?;
        let mut stored = merger.clone();
        stored.id = self.conn.last_insert_rowid();
        Ok(stored)
    }

    fn list_mergers(&self) -> Result<Vec<EpisodeMerger>> {
        let sql = format!("SELECT {MERGER_COLUMNS} FROM episode_mergers ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], merger_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
