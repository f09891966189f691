//! Per (entity, geofence) transition state machine.
//!
//! The tracker consumes ordered events together with the spatial query
//! results for each event and derives transition events. Enter/Dwell/Exit
//! run off containment; Approach/Depart/Linger run off distance to boundary
//! while the entity is outside, sharing the same pair record. Transitions
//! are pure functions of the previous pair state and the new observation,
//! so a partition can replay its input deterministically.
//!
//! Pairs are created lazily and evicted after an idle TTL. A re-appearing
//! entity after eviction is treated as first contact, so eviction can at
//! worst turn one long visit into two shorter ones, never fabricate an Exit.

use crate::spatial::SpatialIndex;
use chrono::{DateTime, Duration, Utc};
use meridian_core::{
    GeoJsonPoint, GeoPoint, Geofence, GeofenceEvent, SharedGeoEvent, TransitionKind,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Thresholds for transition derivation.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Continuous inside duration before a single Dwell fires.
    pub dwell_threshold: Duration,
    /// Outside distance below which Approach fires (and above which Depart
    /// fires on the way back out).
    pub approach_radius_m: f64,
    /// Outside distance within which time accrues toward Linger.
    pub linger_radius_m: f64,
    /// Continuous near-boundary duration before a single Linger fires.
    pub linger_threshold: Duration,
    /// Idle time after which a pair record is evicted.
    pub idle_ttl: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            dwell_threshold: Duration::seconds(60),
            approach_radius_m: 250.0,
            linger_radius_m: 100.0,
            linger_threshold: Duration::seconds(120),
            idle_ttl: Duration::hours(1),
        }
    }
}

/// Live state for one (entity, geofence) pair.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PairState {
    pub is_inside: bool,
    pub entered_at: Option<DateTime<Utc>>,
    pub entry_point: Option<GeoPoint>,
    pub last_seen_at: DateTime<Utc>,
    pub dwell_emitted: bool,
    pub linger_emitted: bool,
    pub near_since: Option<DateTime<Utc>>,
    pub last_distance: Option<f64>,
}

impl PairState {
    fn first_contact(at: DateTime<Utc>) -> Self {
        Self {
            is_inside: false,
            entered_at: None,
            entry_point: None,
            last_seen_at: at,
            dwell_emitted: false,
            linger_emitted: false,
            near_since: None,
            last_distance: None,
        }
    }
}

/// Derives transition events from ordered per-entity observations. Pair
/// records are keyed entity-first so one update only touches the pairs of
/// the entity that moved.
pub struct EntityStateTracker {
    config: TrackerConfig,
    pairs: FxHashMap<Arc<str>, FxHashMap<Arc<str>, PairState>>,
}

impl EntityStateTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            pairs: FxHashMap::default(),
        }
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.values().map(FxHashMap::len).sum()
    }

    /// Process one observation. `index` supplies both containment and
    /// distance queries against a single consistent snapshot. Events must
    /// arrive in non-decreasing event-time order per entity; the caller's
    /// reorder buffer guarantees this.
    pub fn update(&mut self, event: &SharedGeoEvent, index: &SpatialIndex) -> Vec<GeofenceEvent> {
        let now = event.event_time;
        let inside = index.query_at(&event.location, now);
        let inside_ids: FxHashSet<&str> = inside.iter().map(|f| &*f.id).collect();
        let mut out = Vec::new();

        let fences = self.pairs.entry(event.entity_id.clone()).or_default();

        // Enter / Dwell for fences currently containing the entity.
        for fence in &inside {
            let state = fences
                .entry(fence.id.clone())
                .or_insert_with(|| PairState::first_contact(now));
            state.last_seen_at = now;

            if !state.is_inside {
                state.is_inside = true;
                state.entered_at = Some(now);
                state.entry_point = Some(event.location);
                state.dwell_emitted = false;
                state.linger_emitted = false;
                state.near_since = None;
                state.last_distance = Some(0.0);
                out.push(Self::transition(TransitionKind::Enter, event, fence, None, None, None));
            } else if !state.dwell_emitted {
                if let Some(entered) = state.entered_at {
                    let inside_for = now - entered;
                    if inside_for >= self.config.dwell_threshold {
                        state.dwell_emitted = true;
                        out.push(Self::transition(
                            TransitionKind::Dwell,
                            event,
                            fence,
                            Some(duration_secs(inside_for)),
                            state.entry_point.as_ref(),
                            None,
                        ));
                    }
                }
            }
        }

        // Exit for fences the entity was inside but no longer is. Pairs that
        // exit on this event sit out the proximity pass below so an Exit is
        // never paired with a same-instant Depart.
        let mut exited: Vec<(Arc<str>, Option<f64>, Option<GeoPoint>)> = Vec::new();
        for (fence_id, state) in fences.iter_mut() {
            if !state.is_inside || inside_ids.contains(&**fence_id) {
                continue;
            }
            let dwell = state.entered_at.map(|e| duration_secs(now - e));
            state.is_inside = false;
            state.dwell_emitted = false;
            state.last_seen_at = now;
            // The containment episode ends here; the proximity episode must
            // start fresh or the next far observation reads a stale
            // near-zero distance and fabricates a Depart.
            state.last_distance = None;
            state.near_since = None;
            state.linger_emitted = false;
            exited.push((fence_id.clone(), dwell, state.entry_point.take()));
            state.entered_at = None;
        }
        let exited_ids: FxHashSet<Arc<str>> = exited.iter().map(|(id, _, _)| id.clone()).collect();
        for (fence_id, dwell, entry_point) in exited {
            if let Some(fence) = index.get(&fence_id) {
                out.push(Self::transition(
                    TransitionKind::Exit,
                    event,
                    fence,
                    dwell,
                    entry_point.as_ref(),
                    None,
                ));
            } else {
                // Fence deleted between observations; nothing to report
                // against, drop the record.
                debug!(entity = %event.entity_id, fence = %fence_id, "exit for removed geofence dropped");
                fences.remove(&fence_id);
            }
        }

        // Approach / Depart / Linger for nearby fences the entity is outside.
        let probe = self
            .config
            .approach_radius_m
            .max(self.config.linger_radius_m)
            * 2.0;
        let nearby = index.nearby(&event.location, probe);
        let near_ids: FxHashSet<&str> = nearby.iter().map(|(f, _)| &*f.id).collect();
        for (fence, distance) in &nearby {
            let distance = *distance;
            if inside_ids.contains(&*fence.id) || exited_ids.contains(&fence.id) {
                continue;
            }
            let state = fences
                .entry(fence.id.clone())
                .or_insert_with(|| PairState::first_contact(now));
            state.last_seen_at = now;

            let prev = state.last_distance;
            state.last_distance = Some(distance);

            // Approach: crossed inward through the approach radius.
            if distance <= self.config.approach_radius_m
                && prev.is_none_or(|p| p > self.config.approach_radius_m)
            {
                out.push(Self::transition(
                    TransitionKind::Approach,
                    event,
                    fence,
                    None,
                    None,
                    Some(distance),
                ));
            }
            // Depart: crossed outward through the approach radius.
            if distance > self.config.approach_radius_m
                && prev.is_some_and(|p| p <= self.config.approach_radius_m)
            {
                out.push(Self::transition(
                    TransitionKind::Depart,
                    event,
                    fence,
                    None,
                    None,
                    Some(distance),
                ));
            }

            // Linger: continuously near the boundary past the threshold.
            if distance <= self.config.linger_radius_m {
                let since = *state.near_since.get_or_insert(now);
                if !state.linger_emitted && now - since >= self.config.linger_threshold {
                    state.linger_emitted = true;
                    out.push(Self::transition(
                        TransitionKind::Linger,
                        event,
                        fence,
                        None,
                        None,
                        Some(distance),
                    ));
                }
            } else {
                state.near_since = None;
                state.linger_emitted = false;
            }
        }

        // A pair that was inside the approach radius and is no longer in the
        // probe set moved away in one step; close it out with a Depart.
        let mut gone: Vec<(Arc<str>, f64)> = Vec::new();
        for (fence_id, state) in fences.iter_mut() {
            if state.is_inside || near_ids.contains(&**fence_id) || exited_ids.contains(fence_id) {
                continue;
            }
            let was_near = state
                .last_distance
                .is_some_and(|p| p <= self.config.approach_radius_m);
            state.near_since = None;
            state.linger_emitted = false;
            if let Some(fence) = index.get(fence_id) {
                let d = fence.boundary.distance_to(&event.location);
                state.last_distance = Some(d);
                state.last_seen_at = now;
                if was_near {
                    gone.push((fence_id.clone(), d));
                }
            } else {
                state.last_distance = None;
            }
        }
        for (fence_id, d) in gone {
            if let Some(fence) = index.get(&fence_id) {
                out.push(Self::transition(TransitionKind::Depart, event, fence, None, None, Some(d)));
            }
        }

        out
    }

    /// Drop pairs idle past the TTL. Returns the number evicted.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.idle_ttl;
        let before = self.pair_count();
        for fences in self.pairs.values_mut() {
            fences.retain(|_, s| now - s.last_seen_at < ttl);
        }
        self.pairs.retain(|_, fences| !fences.is_empty());
        let evicted = before - self.pair_count();
        if evicted > 0 {
            debug!(evicted, remaining = self.pair_count(), "idle pairs evicted");
        }
        evicted
    }

    /// Snapshot of one pair, mainly for inspection in tests.
    pub fn pair_state(&self, entity_id: &str, geofence_id: &str) -> Option<&PairState> {
        self.pairs.get(entity_id)?.get(geofence_id)
    }

    /// Snapshot all pairs for checkpointing.
    pub fn checkpoint(&self) -> crate::persistence::EntityStateCheckpoint {
        crate::persistence::EntityStateCheckpoint {
            pairs: self
                .pairs
                .iter()
                .flat_map(|(e, fences)| {
                    fences
                        .iter()
                        .map(move |(g, s)| (e.to_string(), g.to_string(), s.clone()))
                })
                .collect(),
        }
    }

    /// Restore pairs from a checkpoint, replacing current state.
    pub fn restore(&mut self, cp: crate::persistence::EntityStateCheckpoint) {
        self.pairs.clear();
        for (e, g, s) in cp.pairs {
            self.pairs
                .entry(Arc::from(e.as_str()))
                .or_default()
                .insert(Arc::from(g.as_str()), s);
        }
    }

    fn transition(
        kind: TransitionKind,
        event: &SharedGeoEvent,
        fence: &Arc<Geofence>,
        dwell_time: Option<f64>,
        entry_point: Option<&GeoPoint>,
        distance: Option<f64>,
    ) -> GeofenceEvent {
        GeofenceEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: kind,
            event_time: event.event_time,
            geofence_id: fence.id.clone(),
            geofence_name: fence.name.clone(),
            entity_id: event.entity_id.clone(),
            location: GeoJsonPoint::from(&event.location),
            properties: event.properties.clone(),
            dwell_time,
            entry_point: entry_point.map(GeoJsonPoint::from),
            distance,
        }
    }
}

fn duration_secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}
