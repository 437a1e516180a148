//! R-tree over point positions for radius prefiltering.
//!
//! Points are stored as `[lng, lat]`. A radius query builds a degree
//! envelope wide enough to contain every point within the radius, so the
//! caller only has to apply its exact metric to the returned indices.

use rstar::{AABB, RTree, RTreeObject};

use crate::GeoPoint;
use crate::geo_utils::{meters_to_lat_degrees, meters_to_lng_degrees};

/// A point tagged with its index in the caller's slice.
#[derive(Debug, Clone, Copy)]
pub struct IndexedPoint {
    pub index: usize,
    pub lng: f64,
    pub lat: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

/// Spatial index over a fixed set of positions.
#[derive(Debug)]
pub struct SpatialIndex {
    tree: RTree<IndexedPoint>,
}

impl SpatialIndex {
    /// Bulk-load the index. Entry `i` refers to `positions[i]`.
    pub fn build(positions: &[GeoPoint]) -> Self {
        let points: Vec<IndexedPoint> = positions
            .iter()
            .enumerate()
            .map(|(index, p)| IndexedPoint {
                index,
                lng: p.longitude,
                lat: p.latitude,
            })
            .collect();

        Self {
            tree: RTree::bulk_load(points),
        }
    }

    /// Indices of points inside the degree envelope around `center`
    /// covering `radius_meters`. May include points slightly outside the
    /// radius; never misses one inside it (antimeridian aside).
    pub fn candidates_within(&self, center: &GeoPoint, radius_meters: f64) -> Vec<usize> {
        // Degree conversions assume 111.32 km per degree, a little more than
        // the haversine sphere; pad so the envelope stays a superset.
        let radius_meters = radius_meters * 1.01;
        let dlat = meters_to_lat_degrees(radius_meters);
        // Widen by the latitude span so the cosine is taken at the envelope
        // edge closest to the pole.
        let edge_lat = if center.latitude >= 0.0 {
            (center.latitude + dlat).min(90.0)
        } else {
            (center.latitude - dlat).max(-90.0)
        };
        let dlng = meters_to_lng_degrees(radius_meters, edge_lat);

        let envelope = AABB::from_corners(
            [center.longitude - dlng, center.latitude - dlat],
            [center.longitude + dlng, center.latitude + dlat],
        );

        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|p| p.index)
            .collect();
        hits.sort_unstable();
        hits
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}
