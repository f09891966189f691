//! Geometry primitives: points, bounding boxes, and geofence boundaries.
//!
//! Coordinates are WGS84 degrees (`lon`/`lat`); all distances are meters.
//! Containment for polygons delegates to the `geo` crate's ray-casting
//! implementation; distance-to-boundary is computed on a local
//! equirectangular projection, which is accurate to well under a percent at
//! geofence scales (hundreds of meters to a few kilometers).

use crate::error::PipelineError;
use geo::{BoundingRect, Contains};
use geo_types::{Coord, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geolocated observation point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
    /// Elevation in meters, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    /// Horizontal accuracy radius in meters, if reported by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self {
            lon,
            lat,
            elevation: None,
            accuracy_m: None,
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Great-circle distance to another point in meters.
    pub fn haversine_distance(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// True when both coordinates are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }

    fn to_geo(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    pub fn contains_point(&self, p: &GeoPoint) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }

    /// Grow the box by `meters` on every side, converting to degrees at this
    /// box's latitude.
    pub fn expanded_by_meters(&self, meters: f64) -> BBox {
        let dlat = meters / 111_320.0;
        let mid_lat = ((self.min_lat + self.max_lat) / 2.0).to_radians();
        // Guard against poles where a degree of longitude collapses.
        let dlon = meters / (111_320.0 * mid_lat.cos().max(0.01));
        BBox {
            min_lon: self.min_lon - dlon,
            min_lat: self.min_lat - dlat,
            max_lon: self.max_lon + dlon,
            max_lat: self.max_lat + dlat,
        }
    }

    fn from_rect(rect: geo_types::Rect<f64>) -> Self {
        Self {
            min_lon: rect.min().x,
            min_lat: rect.min().y,
            max_lon: rect.max().x,
            max_lat: rect.max().y,
        }
    }
}

/// The spatial extent of a geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Boundary {
    /// Circular fence: center plus radius in meters.
    Circle { center: GeoPoint, radius_m: f64 },
    /// Simple polygon fence (exterior ring, optional holes).
    Polygon { polygon: Polygon<f64> },
    /// Disjoint multi-part fence.
    MultiPolygon { polygons: MultiPolygon<f64> },
    /// 3D volume: polygonal footprint bounded by an elevation interval.
    Volume {
        footprint: Polygon<f64>,
        min_elevation: f64,
        max_elevation: f64,
    },
}

impl Boundary {
    /// Exact containment test. For volumes the point's elevation (when
    /// present) must fall inside the interval; a point with no elevation is
    /// tested against the footprint only.
    pub fn contains(&self, p: &GeoPoint) -> bool {
        match self {
            Boundary::Circle { center, radius_m } => center.haversine_distance(p) <= *radius_m,
            Boundary::Polygon { polygon } => polygon.contains(&p.to_geo()),
            Boundary::MultiPolygon { polygons } => polygons.contains(&p.to_geo()),
            Boundary::Volume {
                footprint,
                min_elevation,
                max_elevation,
            } => {
                if let Some(z) = p.elevation {
                    if z < *min_elevation || z > *max_elevation {
                        return false;
                    }
                }
                footprint.contains(&p.to_geo())
            }
        }
    }

    /// Coarse bounding box used by the spatial index.
    pub fn bbox(&self) -> BBox {
        match self {
            Boundary::Circle { center, radius_m } => BBox::new(center.lon, center.lat, center.lon, center.lat)
                .expanded_by_meters(*radius_m),
            Boundary::Polygon { polygon } => polygon
                .bounding_rect()
                .map(BBox::from_rect)
                .unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0)),
            Boundary::MultiPolygon { polygons } => polygons
                .bounding_rect()
                .map(BBox::from_rect)
                .unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0)),
            Boundary::Volume { footprint, .. } => footprint
                .bounding_rect()
                .map(BBox::from_rect)
                .unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0)),
        }
    }

    /// Distance in meters from `p` to the fence boundary; 0.0 when inside.
    pub fn distance_to(&self, p: &GeoPoint) -> f64 {
        if self.contains(p) {
            return 0.0;
        }
        match self {
            Boundary::Circle { center, radius_m } => {
                (center.haversine_distance(p) - radius_m).max(0.0)
            }
            Boundary::Polygon { polygon } => distance_to_polygon(p, polygon),
            Boundary::MultiPolygon { polygons } => polygons
                .iter()
                .map(|poly| distance_to_polygon(p, poly))
                .fold(f64::INFINITY, f64::min),
            Boundary::Volume { footprint, .. } => distance_to_polygon(p, footprint),
        }
    }

    /// Reject degenerate geometry at catalog-ingestion time so queries never
    /// have to cope with it.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self {
            Boundary::Circle { center, radius_m } => {
                if !center.is_valid() {
                    return Err(PipelineError::Validation(
                        "circle center outside WGS84 bounds".into(),
                    ));
                }
                if !radius_m.is_finite() || *radius_m <= 0.0 {
                    return Err(PipelineError::Validation(format!(
                        "circle radius must be positive, got {}",
                        radius_m
                    )));
                }
                Ok(())
            }
            Boundary::Polygon { polygon } => validate_polygon(polygon),
            Boundary::MultiPolygon { polygons } => {
                if polygons.0.is_empty() {
                    return Err(PipelineError::Validation("empty multipolygon".into()));
                }
                for poly in polygons.iter() {
                    validate_polygon(poly)?;
                }
                Ok(())
            }
            Boundary::Volume {
                footprint,
                min_elevation,
                max_elevation,
            } => {
                if min_elevation >= max_elevation {
                    return Err(PipelineError::Validation(format!(
                        "elevation range is empty: [{}, {}]",
                        min_elevation, max_elevation
                    )));
                }
                validate_polygon(footprint)
            }
        }
    }
}

fn validate_polygon(polygon: &Polygon<f64>) -> Result<(), PipelineError> {
    let ring = polygon.exterior();
    // geo-types closes rings on construction; a valid closed ring has at
    // least 4 coordinates (triangle + closing point).
    if ring.0.len() < 4 {
        return Err(PipelineError::Validation(format!(
            "polygon exterior must have at least 3 distinct vertices, got {}",
            ring.0.len().saturating_sub(1)
        )));
    }
    for c in &ring.0 {
        let p = GeoPoint::new(c.x, c.y);
        if !p.is_valid() {
            return Err(PipelineError::Validation(format!(
                "polygon vertex ({}, {}) outside WGS84 bounds",
                c.x, c.y
            )));
        }
    }
    if ring_self_intersects(&ring.0) {
        return Err(PipelineError::Validation(
            "polygon exterior ring is self-intersecting".into(),
        ));
    }
    Ok(())
}

/// Pairwise proper-intersection test over non-adjacent ring segments.
/// O(n^2), which is fine at ingestion time for fence-sized rings.
fn ring_self_intersects(coords: &[Coord<f64>]) -> bool {
    let n = coords.len() - 1; // last coord repeats the first
    if n < 4 {
        return false;
    }
    for i in 0..n {
        for j in (i + 2)..n {
            // Skip adjacent segments (they share an endpoint), including the
            // wrap-around pair (first, last).
            if i == 0 && j == n - 1 {
                continue;
            }
            if segments_properly_intersect(
                coords[i],
                coords[i + 1],
                coords[j],
                coords[j + 1],
            ) {
                return true;
            }
        }
    }
    false
}

fn segments_properly_intersect(a: Coord<f64>, b: Coord<f64>, c: Coord<f64>, d: Coord<f64>) -> bool {
    fn orient(p: Coord<f64>, q: Coord<f64>, r: Coord<f64>) -> f64 {
        (q.x - p.x) * (r.y - p.y) - (q.y - p.y) * (r.x - p.x)
    }
    let o1 = orient(a, b, c);
    let o2 = orient(a, b, d);
    let o3 = orient(c, d, a);
    let o4 = orient(c, d, b);
    (o1 * o2 < 0.0) && (o3 * o4 < 0.0)
}

/// Minimum distance in meters from a point to a polygon's exterior ring.
fn distance_to_polygon(p: &GeoPoint, polygon: &Polygon<f64>) -> f64 {
    let ring = &polygon.exterior().0;
    let mut min = f64::INFINITY;
    for pair in ring.windows(2) {
        let d = point_segment_distance_m(p, pair[0], pair[1]);
        if d < min {
            min = d;
        }
    }
    min
}

/// Point-to-segment distance on a local equirectangular projection anchored
/// at the query point's latitude.
fn point_segment_distance_m(p: &GeoPoint, a: Coord<f64>, b: Coord<f64>) -> f64 {
    let scale_lon = 111_320.0 * p.lat.to_radians().cos();
    let scale_lat = 111_320.0;

    let px = 0.0;
    let py = 0.0;
    let ax = (a.x - p.lon) * scale_lon;
    let ay = (a.y - p.lat) * scale_lat;
    let bx = (b.x - p.lon) * scale_lon;
    let by = (b.y - p.lat) * scale_lat;

    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let cx = ax + t * dx;
    let cy = ay + t * dy;
    (cx * cx + cy * cy).sqrt()
}

/// Convenience constructor for a closed polygon from `[lon, lat]` vertices.
pub fn polygon_from_ring(vertices: &[[f64; 2]]) -> Polygon<f64> {
    let coords: Vec<Coord<f64>> = vertices.iter().map(|v| Coord { x: v[0], y: v[1] }).collect();
    Polygon::new(geo_types::LineString::from(coords), vec![])
}
