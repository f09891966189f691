//! Versioned geofence catalog.
//!
//! The catalog is the source of truth for fence definitions. Every mutation
//! validates the incoming definition, assigns the next revision, and builds
//! a wholly new immutable snapshot which is published with a single atomic
//! swap. Deleted fences are simply absent from the next snapshot; nothing is
//! mutated in place, so a reader holding an older snapshot keeps a fully
//! consistent view.

use meridian_core::{Geofence, Result};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// An immutable view of all fences at one catalog version.
#[derive(Debug)]
pub struct CatalogSnapshot {
    /// Monotonic snapshot version.
    pub version: u64,
    fences: FxHashMap<Arc<str>, Arc<Geofence>>,
}

impl CatalogSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            fences: FxHashMap::default(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Geofence>> {
        self.fences.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Geofence>> {
        self.fences.values()
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

/// Thread-safe catalog with copy-on-write snapshots.
pub struct GeofenceCatalog {
    current: RwLock<Arc<CatalogSnapshot>>,
    next_revision: AtomicU64,
}

impl GeofenceCatalog {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            next_revision: AtomicU64::new(1),
        }
    }

    /// Take a consistent reference to the current snapshot. Callers hold the
    /// Arc for the duration of their work; later publishes do not affect it.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Insert or replace a fence. Degenerate geometry is rejected here so it
    /// never reaches the index. Returns the assigned revision.
    ///
    /// Concurrent upserts of the same (dynamic) fence are serialized by the
    /// publish lock: last writer wins, and the next index rebuild always
    /// sees the latest snapshot.
    pub fn upsert(&self, mut fence: Geofence) -> Result<u64> {
        fence.validate()?;
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        fence.revision = revision;

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut fences = guard.fences.clone();
        let id = fence.id.clone();
        fences.insert(id.clone(), Arc::new(fence));
        let version = guard.version + 1;
        *guard = Arc::new(CatalogSnapshot { version, fences });

        info!(fence = %id, revision, version, "geofence upserted");
        Ok(revision)
    }

    /// Remove a fence from the next snapshot. Returns false when the id was
    /// unknown.
    pub fn delete(&self, id: &str) -> bool {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        if !guard.fences.contains_key(id) {
            warn!(fence = %id, "delete for unknown geofence");
            return false;
        }
        let mut fences = guard.fences.clone();
        fences.remove(id);
        let version = guard.version + 1;
        *guard = Arc::new(CatalogSnapshot { version, fences });
        info!(fence = %id, version, "geofence deleted");
        true
    }

    /// All fences in the current snapshot.
    pub fn list(&self) -> Vec<Arc<Geofence>> {
        self.snapshot().iter().cloned().collect()
    }

}

impl Default for GeofenceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{polygon_from_ring, Boundary, GeoPoint};

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
    fn test_upsert_assigns_monotonic_revisions() {
        let catalog = GeofenceCatalog::new();
        let r1 = catalog.upsert(circle("a", 0.0, 0.0, 100.0)).unwrap();
        let r2 = catalog.upsert(circle("b", 1.0, 1.0, 100.0)).unwrap();
        let r3 = catalog.upsert(circle("a", 0.0, 0.0, 200.0)).unwrap();
        assert!(r1 < r2 && r2 < r3);
        assert_eq!(catalog.list().len(), 2);
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let catalog = GeofenceCatalog::new();
        catalog.upsert(circle("a", 0.0, 0.0, 100.0)).unwrap();
        let snap = catalog.snapshot();
        catalog.upsert(circle("b", 1.0, 1.0, 100.0)).unwrap();
        catalog.delete("a");

        // The older snapshot still sees exactly fence "a".
        assert_eq!(snap.len(), 1);
        assert!(snap.get("a").is_some());
        assert!(catalog.snapshot().get("a").is_none());
    }

    #[test]
    fn test_degenerate_geometry_rejected() {
        let catalog = GeofenceCatalog::new();
        let bowtie = Geofence::new(
            "bowtie",
            "bowtie",
            Boundary::Polygon {
                polygon: polygon_from_ring(&[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 1.0]]),
            },
        );
        assert!(catalog.upsert(bowtie).is_err());
        assert!(catalog.snapshot().is_empty());
    }

    #[test]
    fn test_delete_unknown_is_false() {
        let catalog = GeofenceCatalog::new();
        assert!(!catalog.delete("ghost"));
    }

    #[test]
    fn test_versions_advance_on_every_mutation() {
        let catalog = GeofenceCatalog::new();
        assert_eq!(catalog.snapshot().version, 0);
        catalog.upsert(circle("a", 0.0, 0.0, 100.0)).unwrap();
        assert_eq!(catalog.snapshot().version, 1);
        catalog.delete("a");
        assert_eq!(catalog.snapshot().version, 2);
    }
}
