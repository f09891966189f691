//! Spatial index over geofence boundaries.
//!
//! A uniform grid of degree-sized cells keyed by quantized (lon, lat). Each
//! fence is registered in every cell its bounding box touches; point queries
//! resolve one cell, prefilter by bounding box and finish with the exact
//! geometric predicate. The index is immutable once built; catalog changes
//! produce a full rebuild which is published through [`SpatialIndexHandle`]
//! with an atomic swap, so in-flight queries always run against one
//! consistent snapshot.

use crate::catalog::CatalogSnapshot;
use chrono::{DateTime, Utc};
use meridian_core::{BBox, GeoPoint, Geofence, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Grid cell edge in degrees. Roughly 1.1 km of latitude.
const CELL_DEG: f64 = 0.01;

type CellKey = (i32, i32);

#[derive(Debug)]
struct IndexedFence {
    fence: Arc<Geofence>,
    bbox: BBox,
}

/// Immutable point-in-fence index built from one catalog snapshot.
#[derive(Debug)]
pub struct SpatialIndex {
    /// Catalog version this index was built from.
    pub catalog_version: u64,
    fences: Vec<IndexedFence>,
    by_id: FxHashMap<Arc<str>, u32>,
    cells: FxHashMap<CellKey, SmallVec<[u32; 4]>>,
}

fn cell_of(lon: f64, lat: f64) -> CellKey {
    ((lon / CELL_DEG).floor() as i32, (lat / CELL_DEG).floor() as i32)
}

impl SpatialIndex {
    pub fn empty() -> Self {
        Self {
            catalog_version: 0,
            fences: Vec::new(),
            by_id: FxHashMap::default(),
            cells: FxHashMap::default(),
        }
    }

    /// Build a fresh index from a catalog snapshot. Fences validate at
    /// catalog admission, so a build over an admitted snapshot does not
    /// fail; the Result covers future boundary kinds whose bbox extraction
    /// can be degenerate.
    pub fn build(snapshot: &CatalogSnapshot) -> Result<Self> {
        let mut fences = Vec::with_capacity(snapshot.len());
        let mut by_id = FxHashMap::default();
        let mut cells: FxHashMap<CellKey, SmallVec<[u32; 4]>> = FxHashMap::default();

        for fence in snapshot.iter() {
            let bbox = fence.boundary.bbox();
            let idx = fences.len() as u32;
            by_id.insert(fence.id.clone(), idx);
            let (min_cx, min_cy) = cell_of(bbox.min_lon, bbox.min_lat);
            let (max_cx, max_cy) = cell_of(bbox.max_lon, bbox.max_lat);
            for cx in min_cx..=max_cx {
                for cy in min_cy..=max_cy {
                    cells.entry((cx, cy)).or_default().push(idx);
                }
            }
            fences.push(IndexedFence {
                fence: fence.clone(),
                bbox,
            });
        }

        debug!(
            fences = fences.len(),
            cells = cells.len(),
            version = snapshot.version,
            "spatial index built"
        );
        Ok(Self {
            catalog_version: snapshot.version,
            fences,
            by_id,
            cells,
        })
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    /// Look up a fence by id in this snapshot.
    pub fn get(&self, id: &str) -> Option<&Arc<Geofence>> {
        self.by_id.get(id).map(|&i| &self.fences[i as usize].fence)
    }

    /// All fences whose boundary contains the point.
    pub fn query(&self, p: &GeoPoint) -> Vec<Arc<Geofence>> {
        let key = cell_of(p.lon, p.lat);
        let Some(candidates) = self.cells.get(&key) else {
            return Vec::new();
        };
        candidates
            .iter()
            .map(|&i| &self.fences[i as usize])
            .filter(|f| f.bbox.contains_point(p) && f.fence.boundary.contains(p))
            .map(|f| f.fence.clone())
            .collect()
    }

    /// Containing fences whose active window covers `when`. Fences without
    /// a window are always active.
    pub fn query_at(&self, p: &GeoPoint, when: DateTime<Utc>) -> Vec<Arc<Geofence>> {
        let mut hits = self.query(p);
        hits.retain(|f| f.is_active_at(when));
        hits
    }

    /// Fences whose boundary lies within `radius_m` of the point, containing
    /// fences included at distance zero.
    pub fn nearby(&self, p: &GeoPoint, radius_m: f64) -> Vec<(Arc<Geofence>, f64)> {
        let probe = BBox::new(p.lon, p.lat, p.lon, p.lat).expanded_by_meters(radius_m);
        let (min_cx, min_cy) = cell_of(probe.min_lon, probe.min_lat);
        let (max_cx, max_cy) = cell_of(probe.max_lon, probe.max_lat);

        let mut seen: FxHashSet<u32> = FxHashSet::default();
        let mut out = Vec::new();
        for cx in min_cx..=max_cx {
            for cy in min_cy..=max_cy {
                let Some(candidates) = self.cells.get(&(cx, cy)) else {
                    continue;
                };
                for &i in candidates {
                    if !seen.insert(i) {
                        continue;
                    }
                    let entry = &self.fences[i as usize];
                    if !entry.bbox.intersects(&probe) {
                        continue;
                    }
                    let d = entry.fence.boundary.distance_to(p);
                    if d <= radius_m {
                        out.push((entry.fence.clone(), d));
                    }
                }
            }
        }
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }
}

/// Shared handle that publishes index rebuilds atomically. Readers clone the
/// inner Arc once per query batch; a rebuild failure leaves the previous
/// index serving.
pub struct SpatialIndexHandle {
    current: RwLock<Arc<SpatialIndex>>,
}

impl SpatialIndexHandle {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(SpatialIndex::empty())),
        }
    }

    pub fn load(&self) -> Arc<SpatialIndex> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rebuild from the given snapshot and swap it in. On failure the old
    /// index stays published and the error propagates to the caller.
    pub fn rebuild(&self, snapshot: &CatalogSnapshot) -> Result<()> {
        let next = Arc::new(SpatialIndex::build(snapshot)?);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        info!(
            from = guard.catalog_version,
            to = next.catalog_version,
            fences = next.len(),
            "spatial index published"
        );
        *guard = next;
        Ok(())
    }
}

impl Default for SpatialIndexHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::GeofenceCatalog;
    use meridian_core::{polygon_from_ring, Boundary};

    fn build_catalog(fences: Vec<Geofence>) -> GeofenceCatalog {
        let catalog = GeofenceCatalog::new();
        for f in fences {
            catalog.upsert(f).unwrap();
        }
        catalog
    }

    fn circle(id: &str, lon: f64, lat: f64, radius_m: f64) -> Geofence {
        Geofence::new(
            id,
            id,
            Boundary::Circle {
                center: GeoPoint::new(lon, lat),
                radius_m,
            },
        )
    }

    #[test]
    fn test_point_query_hits_containing_fences() {
        let catalog = build_catalog(vec![
            circle("near", 2.3522, 48.8566, 500.0),
            circle("far", 2.45, 48.90, 500.0),
        ]);
        let index = SpatialIndex::build(&catalog.snapshot()).unwrap();

        let hits = index.query(&GeoPoint::new(2.3525, 48.8568));
        assert_eq!(hits.len(), 1);
        assert_eq!(&*hits[0].id, "near");
    }

    #[test]
    fn test_overlapping_fences_all_reported() {
        let catalog = build_catalog(vec![
            circle("a", 0.0, 0.0, 1000.0),
            circle("b", 0.001, 0.0, 1000.0),
            Geofence::new(
                "square",
                "square",
                Boundary::Polygon {
                    polygon: polygon_from_ring(&[
                        [-0.01, -0.01],
                        [0.01, -0.01],
                        [0.01, 0.01],
                        [-0.01, 0.01],
                    ]),
                },
            ),
        ]);
        let index = SpatialIndex::build(&catalog.snapshot()).unwrap();

        let mut ids: Vec<String> = index
            .query(&GeoPoint::new(0.0005, 0.0))
            .iter()
            .map(|f| f.id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "square"]);
    }

    #[test]
    fn test_fence_spanning_many_cells() {
        // 50 km radius covers far more than one 0.01 degree cell.
        let catalog = build_catalog(vec![circle("wide", 10.0, 50.0, 50_000.0)]);
        let index = SpatialIndex::build(&catalog.snapshot()).unwrap();

        assert_eq!(index.query(&GeoPoint::new(10.0, 50.0)).len(), 1);
        assert_eq!(index.query(&GeoPoint::new(10.3, 50.2)).len(), 1);
        assert!(index.query(&GeoPoint::new(12.0, 50.0)).is_empty());
    }

    #[test]
    fn test_nearby_sorted_by_distance() {
        let catalog = build_catalog(vec![
            circle("close", 0.0, 0.0, 100.0),
            circle("farther", 0.02, 0.0, 100.0),
        ]);
        let index = SpatialIndex::build(&catalog.snapshot()).unwrap();

        let hits = index.nearby(&GeoPoint::new(0.0005, 0.0), 5000.0);
        assert_eq!(hits.len(), 2);
        assert_eq!(&*hits[0].0.id, "close");
        assert_eq!(hits[0].1, 0.0);
        assert!(hits[1].1 > 0.0);
    }

    #[test]
    fn test_handle_swap_is_isolated() {
        let catalog = build_catalog(vec![circle("a", 0.0, 0.0, 100.0)]);
        let handle = SpatialIndexHandle::new();
        handle.rebuild(&catalog.snapshot()).unwrap();

        let before = handle.load();
        catalog.upsert(circle("b", 0.0, 0.0, 100.0)).unwrap();
        handle.rebuild(&catalog.snapshot()).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(handle.load().len(), 2);
    }

    #[test]
    fn test_query_at_respects_active_window() {
        use chrono::{TimeZone, Weekday};
        use meridian_core::ActiveWindow;

        let fence = circle("school", 0.0, 0.0, 200.0).with_active_window(ActiveWindow {
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            start_minute: 7 * 60,
            end_minute: 16 * 60,
        });
        let catalog = build_catalog(vec![fence]);
        let index = SpatialIndex::build(&catalog.snapshot()).unwrap();
        let p = GeoPoint::new(0.0, 0.0);

        // Monday 2026-03-02, 09:00 vs 22:00 UTC.
        let school_hours = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();
        assert_eq!(index.query_at(&p, school_hours).len(), 1);
        assert!(index.query_at(&p, night).is_empty());
        // Raw query ignores the window.
        assert_eq!(index.query(&p).len(), 1);
    }
}
