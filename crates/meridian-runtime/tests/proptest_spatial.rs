//! Property-based tests for spatial containment.
//!
//! Fences are laid out on a coarse grid so they are disjoint by
//! construction; a point strictly inside one rectangle must be reported
//! for exactly that fence, regardless of how many fences share the index.

use meridian_core::{Boundary, GeoPoint, Geofence};
use meridian_runtime::{GeofenceCatalog, SpatialIndexHandle};
use proptest::prelude::*;
use std::sync::Arc;

/// A grid slot (i, j) becomes a rectangle spanning the middle 60% of a
/// 0.1-degree cell, leaving clear margins between neighbors.
fn rect_for_slot(i: u8, j: u8) -> Geofence {
    let lon0 = i as f64 * 0.1 + 0.02;
    let lat0 = j as f64 * 0.1 + 0.02;
    Geofence::new(
        format!("fence-{i}-{j}"),
        format!("fence-{i}-{j}"),
        Boundary::Polygon {
            polygon: meridian_core::polygon_from_ring(&[
                [lon0, lat0],
                [lon0 + 0.06, lat0],
                [lon0 + 0.06, lat0 + 0.06],
                [lon0, lat0 + 0.06],
            ]),
        },
    )
}

fn build_index(slots: &[(u8, u8)]) -> Arc<meridian_runtime::SpatialIndex> {
    let catalog = GeofenceCatalog::new();
    for &(i, j) in slots {
        catalog.upsert(rect_for_slot(i, j)).unwrap();
    }
    let handle = SpatialIndexHandle::new();
    handle.rebuild(&catalog.snapshot()).unwrap();
    handle.load()
}

fn slot_set() -> impl Strategy<Value = Vec<(u8, u8)>> {
    prop::collection::btree_set((0u8..8, 0u8..8), 1..20)
        .prop_map(|set| set.into_iter().collect())
}

/// Interior fraction in (0.1, 0.9) keeps the probe off the boundary.
fn interior_fraction() -> impl Strategy<Value = (f64, f64)> {
    (0.1f64..0.9, 0.1f64..0.9)
}

proptest! {
    /// A point strictly inside one grid rectangle hits exactly that fence.
    #[test]
    fn interior_point_hits_its_fence_only(
        slots in slot_set(),
        pick in any::<prop::sample::Index>(),
        (fx, fy) in interior_fraction(),
    ) {
        let index = build_index(&slots);
        let (i, j) = slots[pick.index(slots.len())];
        let p = GeoPoint::new(
            i as f64 * 0.1 + 0.02 + fx * 0.06,
            j as f64 * 0.1 + 0.02 + fy * 0.06,
        );
        let hits = index.query(&p);
        prop_assert_eq!(hits.len(), 1);
        let expected = format!("fence-{i}-{j}");
        prop_assert_eq!(&*hits[0].id, expected.as_str());
    }

    /// The margins between grid slots belong to no fence.
    #[test]
    fn margin_point_hits_nothing(
        slots in slot_set(),
        i in 0u8..8,
        j in 0u8..8,
    ) {
        let index = build_index(&slots);
        // Cell corner: 0.02 margin on every side of every rectangle.
        let p = GeoPoint::new(i as f64 * 0.1 + 0.005, j as f64 * 0.1 + 0.005);
        prop_assert!(index.query(&p).is_empty());
    }

    /// Queries never panic for arbitrary WGS84 coordinates.
    #[test]
    fn query_total_over_wgs84(
        slots in slot_set(),
        lon in -180.0f64..180.0,
        lat in -90.0f64..90.0,
    ) {
        let index = build_index(&slots);
        let _ = index.query(&GeoPoint::new(lon, lat));
        let _ = index.nearby(&GeoPoint::new(lon, lat), 250.0);
    }

    /// Circle containment agrees with haversine distance from the center.
    #[test]
    fn circle_containment_matches_distance(
        (fx, fy) in (-2.0f64..2.0, -2.0f64..2.0),
    ) {
        let center = GeoPoint::new(10.0, 45.0);
        let catalog = GeofenceCatalog::new();
        catalog
            .upsert(Geofence::new(
                "c",
                "c",
                Boundary::Circle { center: center.clone(), radius_m: 5_000.0 },
            ))
            .unwrap();
        let handle = SpatialIndexHandle::new();
        handle.rebuild(&catalog.snapshot()).unwrap();
        let index = handle.load();

        let p = GeoPoint::new(10.0 + fx * 0.05, 45.0 + fy * 0.05);
        let inside = !index.query(&p).is_empty();
        let dist = center.haversine_distance(&p);
        // Skip the knife edge; float noise there is not under test.
        prop_assume!((dist - 5_000.0).abs() > 1.0);
        prop_assert_eq!(inside, dist < 5_000.0);
    }
}
