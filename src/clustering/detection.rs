//! Detection clustering: pending hotspots → fire events.
//!
//! One pass:
//! 1. Load unprocessed, unassigned detections since the cut-off
//! 2. Mark low-confidence detections processed without clustering them
//! 3. Run ST-DBSCAN over the rest with the active version's parameters
//! 4. Mark noise processed
//! 5. Create one event per cluster, stamping its members atomically
//!
//! Processed detections are never loaded again, so a second pass over the
//! same data is a no-op.

use chrono::{DateTime, Utc};
use geo::{ConvexHull, GeodesicArea, MultiPoint, Point};
use h3o::{LatLng, Resolution};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::RunContext;
use super::st_dbscan::{StDbscanParams, cluster_members, noise_members, st_dbscan};
use crate::error::Result;
use crate::geo_utils::compute_center;
use crate::store::{FireStore, with_transaction};
use crate::{Detection, EventStatus, GeoPoint, NewFireEvent};

/// FRP above which an event is significant (MW).
pub const SIGNIFICANT_MAX_FRP: f64 = 50.0;

/// Mean confidence above which an event is significant.
pub const SIGNIFICANT_AVG_CONFIDENCE: f64 = 80.0;

/// Nominal ground footprint of a 375m VIIRS pixel in hectares.
pub const PIXEL_AREA_HECTARES: f64 = 14.0625;

/// Outcome of one detection clustering pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionRunStats {
    pub events_created: usize,
    /// Every detection considered, whatever happened to it
    pub detections_processed: usize,
    /// Clustered detections labelled as noise
    pub noise_count: usize,
    /// Detections skipped for low confidence
    pub low_confidence_count: usize,
    pub event_ids: Vec<i64>,
}

/// Runs ST-DBSCAN over pending detections.
#[derive(Debug, Clone, Copy)]
pub struct DetectionClusterer<'a> {
    ctx: &'a RunContext,
}

impl<'a> DetectionClusterer<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Cluster detections with `detected_at >= since`, at most
    /// `max_detections` of them (oldest first).
    pub fn run<S: FireStore + ?Sized>(
        &self,
        store: &mut S,
        since: DateTime<Utc>,
        max_detections: Option<usize>,
    ) -> Result<DetectionRunStats> {
        let pending = store.load_pending_detections(since, max_detections)?;
        let mut stats = DetectionRunStats {
            detections_processed: pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            debug!("[Detections] Nothing pending since {}", since);
            return Ok(stats);
        }

        let (eligible, low_confidence): (Vec<Detection>, Vec<Detection>) = pending
            .into_iter()
            .partition(|d| d.confidence >= self.ctx.flow.min_confidence);

        if !low_confidence.is_empty() {
            let ids: Vec<i64> = low_confidence.iter().map(|d| d.id).collect();
            store.mark_detections_processed(&ids)?;
            stats.low_confidence_count = ids.len();
        }

        let params = StDbscanParams::from(&self.ctx.version);
        let labels = st_dbscan(&eligible, &params);

        let noise: Vec<i64> = noise_members(&labels)
            .into_iter()
            .map(|i| eligible[i].id)
            .collect();
        if !noise.is_empty() {
            store.mark_detections_processed(&noise)?;
        }
        stats.noise_count = noise.len();

        for members in cluster_members(&labels) {
            let detections: Vec<&Detection> = members.iter().map(|&i| &eligible[i]).collect();
            let draft = summarize_cluster(&detections, self.ctx);
            let ids: Vec<i64> = detections.iter().map(|d| d.id).collect();

            let event = with_transaction(store, |s| s.create_event(draft, &ids, self.ctx.now))?;
            debug!(
                "[Detections] Event {} from {} detections (max FRP {:.1})",
                event.id, event.total_detections, event.max_frp
            );
            stats.event_ids.push(event.id);
        }
        stats.events_created = stats.event_ids.len();

        info!(
            "[Detections] {} considered: {} events, {} noise, {} low confidence",
            stats.detections_processed,
            stats.events_created,
            stats.noise_count,
            stats.low_confidence_count
        );

        Ok(stats)
    }
}

/// Aggregate one cluster's detections into an event draft.
///
/// `members` must not be empty.
pub fn summarize_cluster(members: &[&Detection], ctx: &RunContext) -> NewFireEvent {
    let n = members.len().max(1) as f64;
    let positions: Vec<GeoPoint> = members.iter().map(|d| d.position()).collect();
    let centroid = compute_center(&positions);

    let start_date = members
        .iter()
        .map(|d| d.detected_at)
        .min()
        .unwrap_or(ctx.now);
    let end_date = members
        .iter()
        .map(|d| d.detected_at)
        .max()
        .unwrap_or(ctx.now);

    let sum_frp: f64 = members.iter().map(|d| d.fire_radiative_power).sum();
    let max_frp = members
        .iter()
        .map(|d| d.fire_radiative_power)
        .fold(0.0_f64, f64::max);
    let avg_frp = sum_frp / n;
    let avg_confidence = members.iter().map(|d| d.confidence).sum::<f64>() / n;

    NewFireEvent {
        centroid,
        start_date,
        end_date,
        total_detections: members.len() as u32,
        avg_frp,
        max_frp,
        sum_frp,
        avg_confidence,
        is_significant: is_significant(max_frp, avg_confidence),
        status: EventStatus::Active,
        h3_index: h3_cell(&centroid, ctx.flow.h3_resolution),
        province: dominant_province(members),
        estimated_area_hectares: estimate_area_hectares(&positions),
        clustering_version_id: ctx.version.id,
    }
}

pub fn is_significant(max_frp: f64, avg_confidence: f64) -> bool {
    max_frp > SIGNIFICANT_MAX_FRP || avg_confidence > SIGNIFICANT_AVG_CONFIDENCE
}

/// Burned-area estimate: geodesic area of the convex hull, floored at one
/// pixel footprint per detection.
pub fn estimate_area_hectares(positions: &[GeoPoint]) -> f64 {
    let hull_hectares = if positions.len() >= 3 {
        let points: MultiPoint<f64> = positions
            .iter()
            .map(|p| Point::new(p.longitude, p.latitude))
            .collect();
        points.convex_hull().geodesic_area_unsigned() / 10_000.0
    } else {
        0.0
    };
    hull_hectares.max(positions.len() as f64 * PIXEL_AREA_HECTARES)
}

/// H3 cell of a point, as the canonical hex string.
pub fn h3_cell(point: &GeoPoint, resolution: u8) -> Option<String> {
    let resolution = Resolution::try_from(resolution).ok()?;
    let latlng = LatLng::new(point.latitude, point.longitude).ok()?;
    Some(latlng.to_cell(resolution).to_string())
}

/// Most frequent province among members; ties go to the alphabetically
/// first name.
fn dominant_province(members: &[&Detection]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for d in members {
        if let Some(p) = d.province.as_deref() {
            *counts.entry(p).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(p, _)| p.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClusteringVersion, FlowConfig};
    use chrono::{Duration, TimeZone};

    fn ctx() -> RunContext {
        let now = Utc.with_ymd_and_hms(2025, 2, 3, 18, 0, 0).unwrap();
        RunContext::new(
            ClusteringVersion {
                id: 7,
                epsilon_km: 1.0,
                min_points: 3,
                temporal_window_hours: 24.0,
                algorithm: "st_dbscan".to_string(),
                is_active: true,
                created_at: now,
            },
            FlowConfig::default(),
            now,
        )
    }

    fn detection(id: i64, minutes: i64, frp: f64, confidence: f64, province: &str) -> Detection {
        Detection {
            id,
            detected_at: Utc.with_ymd_and_hms(2025, 2, 3, 12, 0, 0).unwrap()
                + Duration::minutes(minutes),
            latitude: -36.6 + id as f64 * 0.0001,
            longitude: -72.1,
            fire_radiative_power: frp,
            confidence,
            province: Some(province.to_string()),
            is_processed: false,
            fire_event_id: None,
        }
    }

    #[test]
    fn test_summary_aggregates() {
        let ds = [
            detection(1, 0, 10.0, 70.0, "Biobío"),
            detection(2, 30, 60.0, 60.0, "Ñuble"),
            detection(3, 90, 20.0, 65.0, "Biobío"),
        ];
        let refs: Vec<&Detection> = ds.iter().collect();
        let draft = summarize_cluster(&refs, &ctx());

        assert_eq!(draft.total_detections, 3);
        assert_eq!(draft.sum_frp, 90.0);
        assert_eq!(draft.max_frp, 60.0);
        assert_eq!(draft.avg_frp, 30.0);
        assert_eq!(draft.start_date, ds[0].detected_at);
        assert_eq!(draft.end_date, ds[2].detected_at);
        assert!(draft.is_significant); // max FRP 60 > 50
        assert_eq!(draft.province.as_deref(), Some("Biobío"));
        assert_eq!(draft.clustering_version_id, 7);
        assert_eq!(draft.status, EventStatus::Active);
        assert!(draft.h3_index.is_some());
    }

    #[test]
    fn test_significance_thresholds() {
        assert!(!is_significant(50.0, 80.0));
        assert!(is_significant(50.1, 0.0));
        assert!(is_significant(0.0, 80.5));
    }

    #[test]
    fn test_area_floor_is_pixel_footprint() {
        let tight = vec![
            GeoPoint::new(-36.6, -72.1),
            GeoPoint::new(-36.6, -72.1),
            GeoPoint::new(-36.6, -72.1),
        ];
        assert_eq!(estimate_area_hectares(&tight), 3.0 * PIXEL_AREA_HECTARES);

        // ~1km x ~1km triangle is about 50 ha, above the 3-pixel floor
        let spread = vec![
            GeoPoint::new(-36.600, -72.100),
            GeoPoint::new(-36.600, -72.0888),
            GeoPoint::new(-36.591, -72.100),
        ];
        let area = estimate_area_hectares(&spread);
        assert!(area > 40.0 && area < 60.0, "got {area}");
    }
}
