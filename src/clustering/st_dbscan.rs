//! Spatio-temporal DBSCAN.
//!
//! Space and time are folded into one scalar distance so a single epsilon
//! applies to both:
//!
//! ```text
//! d(a, b) = max(haversine_m(a, b), |Δt_s| / window_s * eps_m)
//! ```
//!
//! Two points are neighbours only if they are within `eps_m` of each other
//! *and* within the temporal window. A point is a core point when its
//! neighbourhood (itself included) holds at least `min_points` members.
//! Non-core points reachable from a core point become border members of its
//! cluster; everything else is noise.
//!
//! Labels are assigned in input order, so sorting the input by time gives
//! stable cluster numbering across runs.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::spatial_index::SpatialIndex;
use crate::geo_utils::haversine_distance;
use crate::{ClusteringVersion, Detection, GeoPoint};

/// Label given to points that belong to no cluster.
pub const NOISE: i32 = -1;

/// Algorithm name recorded on clustering versions.
pub const ALGORITHM_NAME: &str = "st_dbscan";

/// Anything with a position and a timestamp.
pub trait SpatioTemporalPoint {
    fn position(&self) -> GeoPoint;
    fn timestamp(&self) -> DateTime<Utc>;
}

impl SpatioTemporalPoint for Detection {
    fn position(&self) -> GeoPoint {
        Detection::position(self)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.detected_at
    }
}

/// ST-DBSCAN parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StDbscanParams {
    pub eps_meters: f64,
    pub temporal_window_seconds: f64,
    pub min_points: usize,
}

impl From<&ClusteringVersion> for StDbscanParams {
    fn from(version: &ClusteringVersion) -> Self {
        Self {
            eps_meters: version.epsilon_meters(),
            temporal_window_seconds: version.temporal_window_seconds(),
            min_points: version.min_points as usize,
        }
    }
}

/// Combined spatio-temporal distance in meters.
pub fn st_distance<P: SpatioTemporalPoint>(a: &P, b: &P, params: &StDbscanParams) -> f64 {
    let spatial = haversine_distance(&a.position(), &b.position());
    let dt = (a.timestamp() - b.timestamp()).num_milliseconds().abs() as f64 / 1000.0;

    let temporal = if params.temporal_window_seconds > 0.0 {
        dt / params.temporal_window_seconds * params.eps_meters
    } else if dt == 0.0 {
        0.0
    } else {
        f64::INFINITY
    };

    spatial.max(temporal)
}

/// Neighbourhood of every point (itself included), sorted by index.
pub fn neighbourhoods<P>(points: &[P], params: &StDbscanParams) -> Vec<Vec<usize>>
where
    P: SpatioTemporalPoint + Sync,
{
    let positions: Vec<GeoPoint> = points.iter().map(|p| p.position()).collect();
    let index = SpatialIndex::build(&positions);

    let neighbours_of = |i: usize| -> Vec<usize> {
        index
            .candidates_within(&positions[i], params.eps_meters)
            .into_iter()
            .filter(|&j| j == i || st_distance(&points[i], &points[j], params) <= params.eps_meters)
            .collect()
    };

    #[cfg(feature = "parallel")]
    let neighbours: Vec<Vec<usize>> = {
        use rayon::prelude::*;
        (0..points.len()).into_par_iter().map(neighbours_of).collect()
    };

    #[cfg(not(feature = "parallel"))]
    let neighbours: Vec<Vec<usize>> = (0..points.len()).map(neighbours_of).collect();

    neighbours
}

/// Cluster `points`, returning one label per point: a cluster number
/// starting at 0, or [`NOISE`].
pub fn st_dbscan<P>(points: &[P], params: &StDbscanParams) -> Vec<i32>
where
    P: SpatioTemporalPoint + Sync,
{
    if points.is_empty() {
        return Vec::new();
    }

    let neighbours = neighbourhoods(points, params);
    let is_core = |i: usize| neighbours[i].len() >= params.min_points;

    let mut labels: Vec<Option<i32>> = vec![None; points.len()];
    let mut cluster = 0;

    for i in 0..points.len() {
        if labels[i].is_some() {
            continue;
        }
        if !is_core(i) {
            labels[i] = Some(NOISE);
            continue;
        }

        labels[i] = Some(cluster);
        let mut queue: VecDeque<usize> = neighbours[i].iter().copied().collect();

        while let Some(j) = queue.pop_front() {
            match labels[j] {
                // Noise reached from a core point becomes a border member
                Some(NOISE) => labels[j] = Some(cluster),
                None => {
                    labels[j] = Some(cluster);
                    if is_core(j) {
                        queue.extend(neighbours[j].iter().copied());
                    }
                }
                Some(_) => {}
            }
        }

        cluster += 1;
    }

    labels.into_iter().map(|l| l.unwrap_or(NOISE)).collect()
}

/// Group point indices by cluster label, in label order. Noise is skipped.
pub fn cluster_members(labels: &[i32]) -> Vec<Vec<usize>> {
    let clusters = labels.iter().copied().max().map_or(0, |m| (m + 1).max(0)) as usize;
    let mut members = vec![Vec::new(); clusters];
    for (i, &label) in labels.iter().enumerate() {
        if label >= 0 {
            members[label as usize].push(i);
        }
    }
    members
}

/// Indices labelled as noise.
pub fn noise_members(labels: &[i32]) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, l)| **l == NOISE)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    struct Hotspot {
        pos: GeoPoint,
        at: DateTime<Utc>,
    }

    impl SpatioTemporalPoint for Hotspot {
        fn position(&self) -> GeoPoint {
            self.pos
        }
        fn timestamp(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 14, 0, 0).unwrap()
    }

    fn params() -> StDbscanParams {
        StDbscanParams {
            eps_meters: 1000.0,
            temporal_window_seconds: 24.0 * 3600.0,
            min_points: 3,
        }
    }

    #[test]
    fn test_temporal_term_scales_with_epsilon() {
        let a = Hotspot {
            pos: GeoPoint::new(-37.0, -72.0),
            at: t0(),
        };
        let b = Hotspot {
            pos: GeoPoint::new(-37.0, -72.0),
            at: t0() + Duration::hours(12),
        };
        // Co-located, half a window apart: half of epsilon
        let d = st_distance(&a, &b, &params());
        assert!((d - 500.0).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_colocated_but_far_in_time_are_not_neighbours() {
        let points: Vec<Hotspot> = (0..3)
            .map(|i| Hotspot {
                pos: GeoPoint::new(-37.0, -72.0),
                at: t0() + Duration::days(2 * i),
            })
            .collect();
        let labels = st_dbscan(&points, &params());
        assert_eq!(labels, vec![NOISE, NOISE, NOISE]);
    }

    #[test]
    fn test_border_point_joins_cluster() {
        // Four tight core points ~44m apart, plus one ~930m east of the last
        // that only sees two of them and so is not core itself
        let mut points: Vec<Hotspot> = (0..4)
            .map(|i| Hotspot {
                pos: GeoPoint::new(-37.0, -72.0 + i as f64 * 0.0005),
                at: t0(),
            })
            .collect();
        points.push(Hotspot {
            pos: GeoPoint::new(-37.0, -72.0 + 0.0015 + 0.0105),
            at: t0(),
        });
        let params = StDbscanParams {
            min_points: 4,
            ..params()
        };

        let neighbours = neighbourhoods(&points, &params);
        assert_eq!(neighbours[4], vec![2, 3, 4]);

        let labels = st_dbscan(&points, &params);
        assert_eq!(labels, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_cluster_members_groups_by_label() {
        let labels = vec![0, NOISE, 1, 0, 1];
        assert_eq!(cluster_members(&labels), vec![vec![0, 3], vec![2, 4]]);
        assert_eq!(noise_members(&labels), vec![1]);
        assert!(cluster_members(&[NOISE, NOISE]).is_empty());
    }
}
