//! Keyed temporal windows with watermark-driven emission.
//!
//! Windows hold streaming accumulators, never raw events. A window closes
//! and emits exactly once, when the watermark passes `end + grace`; events
//! targeting a window past that point are counted late and dropped. Emission
//! is keyed by `(windowKey, start, end)` so replays and downstream retries
//! deduplicate cleanly.

use crate::aggregate::{Accumulator, AggSpec};
use chrono::{DateTime, Duration, TimeZone, Utc};
use meridian_core::{FxIndexMap, SharedGeoEvent, Value};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Window shape. Durations are milliseconds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowKind {
    Tumbling { size_ms: i64 },
    Sliding { size_ms: i64, slide_ms: i64 },
    Session { gap_ms: i64 },
}

impl WindowKind {
    pub fn validate(&self) -> meridian_core::Result<()> {
        let ok = match self {
            WindowKind::Tumbling { size_ms } => *size_ms > 0,
            WindowKind::Sliding { size_ms, slide_ms } => {
                *size_ms > 0 && *slide_ms > 0 && slide_ms <= size_ms
            }
            WindowKind::Session { gap_ms } => *gap_ms > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(meridian_core::PipelineError::Validation(format!(
                "invalid window shape: {self:?}"
            )))
        }
    }
}

/// Emitted aggregate for one closed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub window_key: Arc<str>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub values: FxIndexMap<String, Value>,
}

/// Serialized open-window state for checkpointing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowCheckpoint {
    windows: Vec<(String, WindowState)>,
    sessions: Vec<(String, SessionState)>,
    emitted: Vec<(String, i64, i64)>,
    late_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowState {
    start_ms: i64,
    end_ms: i64,
    accumulators: Vec<Accumulator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    start_ms: i64,
    last_activity_ms: i64,
    accumulators: Vec<Accumulator>,
}

/// Keyed window aggregator for one partition.
pub struct WindowAggregator {
    kind: WindowKind,
    grace: Duration,
    aggs: Vec<AggSpec>,
    /// Open tumbling/sliding windows keyed by (key, start).
    windows: FxHashMap<(Arc<str>, i64), WindowState>,
    /// Open sessions keyed by key.
    sessions: FxHashMap<Arc<str>, SessionState>,
    /// Dedup horizon: (key, start, end) triples already emitted.
    emitted: FxHashSet<(Arc<str>, i64, i64)>,
    late_events: u64,
}

impl WindowAggregator {
    pub fn new(kind: WindowKind, grace: Duration, aggs: Vec<AggSpec>) -> meridian_core::Result<Self> {
        kind.validate()?;
        Ok(Self {
            kind,
            grace,
            aggs,
            windows: FxHashMap::default(),
            sessions: FxHashMap::default(),
            emitted: FxHashSet::default(),
            late_events: 0,
        })
    }

    /// Late events dropped so far.
    pub fn late_count(&self) -> u64 {
        self.late_events
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len() + self.sessions.len()
    }

    /// Fold one event into every window it belongs to. `watermark` is the
    /// current effective watermark; windows already past `end + grace` when
    /// the event arrives reject it as late.
    pub fn add(
        &mut self,
        key: impl Into<Arc<str>>,
        event: &SharedGeoEvent,
        watermark: Option<DateTime<Utc>>,
    ) {
        let key: Arc<str> = key.into();
        let ts = event.event_time.timestamp_millis();
        let horizon = watermark.map(|w| (w - self.grace).timestamp_millis());

        match self.kind {
            WindowKind::Tumbling { size_ms } => {
                let start = ts.div_euclid(size_ms) * size_ms;
                self.add_to_window(key, start, start + size_ms, ts, horizon, event);
            }
            WindowKind::Sliding { size_ms, slide_ms } => {
                // Every window whose [start, start+size) covers ts.
                let newest_start = ts.div_euclid(slide_ms) * slide_ms;
                let mut start = newest_start;
                while start > ts - size_ms {
                    self.add_to_window(key.clone(), start, start + size_ms, ts, horizon, event);
                    start -= slide_ms;
                }
            }
            WindowKind::Session { .. } => {
                if horizon.is_some_and(|h| ts < h) {
                    self.late_events += 1;
                    debug!(key = %key, event = %event.id, "late event dropped from session");
                    return;
                }
                let session = self
                    .sessions
                    .entry(key)
                    .or_insert_with(|| SessionState {
                        start_ms: ts,
                        last_activity_ms: ts,
                        accumulators: self.aggs.iter().map(|a| Accumulator::for_func(a.func)).collect(),
                    });
                session.start_ms = session.start_ms.min(ts);
                session.last_activity_ms = session.last_activity_ms.max(ts);
                fold(&self.aggs, &mut session.accumulators, event);
            }
        }
    }

    fn add_to_window(
        &mut self,
        key: Arc<str>,
        start_ms: i64,
        end_ms: i64,
        ts: i64,
        horizon_ms: Option<i64>,
        event: &SharedGeoEvent,
    ) {
        // A window whose end has passed the watermark horizon is closed for
        // good; re-opening it would break emit-once.
        if horizon_ms.is_some_and(|h| end_ms <= h)
            || self.emitted.contains(&(key.clone(), start_ms, end_ms))
        {
            self.late_events += 1;
            debug!(key = %key, event = %event.id, start_ms, "late event dropped");
            return;
        }
        debug_assert!(ts >= start_ms && ts < end_ms);
        let state = self
            .windows
            .entry((key, start_ms))
            .or_insert_with(|| WindowState {
                start_ms,
                end_ms,
                accumulators: self.aggs.iter().map(|a| Accumulator::for_func(a.func)).collect(),
            });
        fold(&self.aggs, &mut state.accumulators, event);
    }

    /// Close and emit every window whose `end + grace` the watermark has
    /// passed, ordered by (start, key).
    pub fn advance(&mut self, watermark: DateTime<Utc>) -> Vec<AggregateResult> {
        let horizon = (watermark - self.grace).timestamp_millis();
        let mut results = Vec::new();

        let closed: Vec<(Arc<str>, i64)> = self
            .windows
            .iter()
            .filter(|(_, w)| w.end_ms <= horizon)
            .map(|((k, s), _)| (k.clone(), *s))
            .collect();
        for key in closed {
            let state = self.windows.remove(&key).unwrap();
            self.emit(key.0, state.start_ms, state.end_ms, &state.accumulators, &mut results);
        }

        if let WindowKind::Session { gap_ms } = self.kind {
            let expired: Vec<Arc<str>> = self
                .sessions
                .iter()
                .filter(|(_, s)| s.last_activity_ms + gap_ms <= horizon)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                let s = self.sessions.remove(&key).unwrap();
                let end_ms = s.last_activity_ms + gap_ms;
                self.emit(key, s.start_ms, end_ms, &s.accumulators, &mut results);
            }
        }

        // The late check in add() blocks anything below the horizon, so
        // dedup entries older than that can go.
        self.emitted.retain(|(_, _, end)| *end > horizon);

        results.sort_by(|a, b| a.start.cmp(&b.start).then(a.window_key.cmp(&b.window_key)));
        results
    }

    /// Flush everything still open, regardless of watermark. Shutdown only;
    /// emitted results still respect the dedup key.
    pub fn flush(&mut self) -> Vec<AggregateResult> {
        let mut results = Vec::new();
        let open: Vec<(Arc<str>, i64)> = self.windows.keys().cloned().collect();
        for key in open {
            let state = self.windows.remove(&key).unwrap();
            self.emit(key.0, state.start_ms, state.end_ms, &state.accumulators, &mut results);
        }
        if let WindowKind::Session { gap_ms } = self.kind {
            let open: Vec<Arc<str>> = self.sessions.keys().cloned().collect();
            for key in open {
                let s = self.sessions.remove(&key).unwrap();
                self.emit(key, s.start_ms, s.last_activity_ms + gap_ms, &s.accumulators, &mut results);
            }
        }
        results.sort_by(|a, b| a.start.cmp(&b.start).then(a.window_key.cmp(&b.window_key)));
        results
    }

    /// Snapshot open windows, sessions and the dedup horizon.
    pub fn checkpoint(&self) -> WindowCheckpoint {
        WindowCheckpoint {
            windows: self
                .windows
                .iter()
                .map(|((k, _), w)| (k.to_string(), w.clone()))
                .collect(),
            sessions: self
                .sessions
                .iter()
                .map(|(k, s)| (k.to_string(), s.clone()))
                .collect(),
            emitted: self
                .emitted
                .iter()
                .map(|(k, s, e)| (k.to_string(), *s, *e))
                .collect(),
            late_events: self.late_events,
        }
    }

    /// Restore from a checkpoint, replacing any open state.
    pub fn restore(&mut self, cp: WindowCheckpoint) {
        self.windows = cp
            .windows
            .into_iter()
            .map(|(k, w)| ((Arc::from(k.as_str()), w.start_ms), w))
            .collect();
        self.sessions = cp
            .sessions
            .into_iter()
            .map(|(k, s)| (Arc::from(k.as_str()), s))
            .collect();
        self.emitted = cp
            .emitted
            .into_iter()
            .map(|(k, s, e)| (Arc::from(k.as_str()), s, e))
            .collect();
        self.late_events = cp.late_events;
    }

    fn emit(
        &mut self,
        key: Arc<str>,
        start_ms: i64,
        end_ms: i64,
        accumulators: &[Accumulator],
        results: &mut Vec<AggregateResult>,
    ) {
        if !self.emitted.insert((key.clone(), start_ms, end_ms)) {
            warn!(key = %key, start_ms, end_ms, "duplicate window emission suppressed");
            return;
        }
        let mut values = FxIndexMap::default();
        for (spec, acc) in self.aggs.iter().zip(accumulators) {
            let name = match &spec.field {
                Some(f) => format!("{}_{}", spec.func.name(), f),
                None => spec.func.name(),
            };
            values.insert(name, acc.finish());
        }
        results.push(AggregateResult {
            window_key: key,
            start: Utc.timestamp_millis_opt(start_ms).unwrap(),
            end: Utc.timestamp_millis_opt(end_ms).unwrap(),
            values,
        });
    }
}

fn fold(aggs: &[AggSpec], accumulators: &mut [Accumulator], event: &SharedGeoEvent) {
    for (spec, acc) in aggs.iter().zip(accumulators.iter_mut()) {
        let value = spec.field.as_deref().and_then(|f| event.get_float(f));
        acc.observe(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggFunc;
    use meridian_core::{GeoEvent, GeoPoint};

    fn base() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn ev(id: &str, secs: i64, speed: f64) -> SharedGeoEvent {
        Arc::new(
            GeoEvent::new(id, "v1", GeoPoint::new(0.0, 0.0))
                .with_event_time(base() + Duration::seconds(secs))
                .with_property("speed", speed),
        )
    }

    fn counter(kind: WindowKind, grace_secs: i64) -> WindowAggregator {
        WindowAggregator::new(
            kind,
            Duration::seconds(grace_secs),
            vec![
                AggSpec {
                    func: AggFunc::Count,
                    field: None,
                },
                AggSpec {
                    func: AggFunc::Avg,
                    field: Some("speed".into()),
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_tumbling_close_and_emit() {
        let mut agg = counter(WindowKind::Tumbling { size_ms: 10_000 }, 0);
        agg.add("k", &ev("a", 1, 10.0), None);
        agg.add("k", &ev("b", 4, 30.0), None);
        agg.add("k", &ev("c", 12, 50.0), None);

        let out = agg.advance(base() + Duration::seconds(10));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values["count"], Value::Int(2));
        assert_eq!(out[0].values["avg_speed"], Value::Float(20.0));

        let rest = agg.advance(base() + Duration::seconds(30));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].values["count"], Value::Int(1));
    }

    #[test]
    fn test_tumbling_counts_are_complete() {
        let mut agg = counter(WindowKind::Tumbling { size_ms: 10_000 }, 0);
        for i in 0..40 {
            agg.add("k", &ev(&format!("e{i}"), i, 1.0), None);
        }
        let out = agg.advance(base() + Duration::seconds(60));
        let total: i64 = out
            .iter()
            .map(|r| match r.values["count"] {
                Value::Int(n) => n,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 40);
    }

    #[test]
    fn test_sliding_windows_overlap() {
        let mut agg = counter(
            WindowKind::Sliding {
                size_ms: 20_000,
                slide_ms: 10_000,
            },
            0,
        );
        // t=15s belongs to [0,20) and [10,30).
        agg.add("k", &ev("a", 15, 5.0), None);
        let out = agg.advance(base() + Duration::seconds(40));
        assert_eq!(out.len(), 2);
        for r in &out {
            assert_eq!(r.values["count"], Value::Int(1));
        }
    }

    #[test]
    fn test_session_closes_after_gap() {
        let mut agg = counter(WindowKind::Session { gap_ms: 30_000 }, 0);
        agg.add("k", &ev("a", 0, 1.0), None);
        agg.add("k", &ev("b", 10, 2.0), None);

        // Gap not yet elapsed.
        assert!(agg.advance(base() + Duration::seconds(30)).is_empty());

        let out = agg.advance(base() + Duration::seconds(41));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, base());
        assert_eq!(out[0].end, base() + Duration::seconds(40));
        assert_eq!(out[0].values["count"], Value::Int(2));
    }

    #[test]
    fn test_late_event_excluded_and_counted() {
        let mut agg = counter(WindowKind::Tumbling { size_ms: 10_000 }, 5);
        agg.add("k", &ev("a", 1, 10.0), None);
        let wm = base() + Duration::seconds(20);
        let out = agg.advance(wm);
        assert_eq!(out.len(), 1);

        // Lands in the already-emitted [0,10) window.
        agg.add("k", &ev("late", 2, 99.0), Some(wm));
        assert_eq!(agg.late_count(), 1);
        assert!(agg.advance(base() + Duration::seconds(60)).is_empty());
    }

    #[test]
    fn test_replay_emits_identical_results() {
        let run = || {
            let mut agg = counter(WindowKind::Tumbling { size_ms: 10_000 }, 0);
            for i in 0..25 {
                agg.add("k", &ev(&format!("e{i}"), i * 2, i as f64), None);
            }
            let mut out = agg.advance(base() + Duration::seconds(120));
            out.extend(agg.flush());
            out.iter()
                .map(|r| {
                    (
                        r.window_key.to_string(),
                        r.start,
                        r.end,
                        format!("{:?}", r.values),
                    )
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_keys_isolated() {
        let mut agg = counter(WindowKind::Tumbling { size_ms: 10_000 }, 0);
        agg.add("a", &ev("e1", 1, 1.0), None);
        agg.add("b", &ev("e2", 2, 2.0), None);
        let out = agg.advance(base() + Duration::seconds(10));
        assert_eq!(out.len(), 2);
        let keys: Vec<&str> = out.iter().map(|r| &*r.window_key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_checkpoint_restore_continues_windows() {
        let mut agg = counter(WindowKind::Tumbling { size_ms: 10_000 }, 0);
        agg.add("k", &ev("a", 1, 10.0), None);

        let cp = agg.checkpoint();
        let mut restored = counter(WindowKind::Tumbling { size_ms: 10_000 }, 0);
        restored.restore(cp);
        restored.add("k", &ev("b", 5, 30.0), None);

        let out = restored.advance(base() + Duration::seconds(10));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values["count"], Value::Int(2));
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert!(WindowKind::Tumbling { size_ms: 0 }.validate().is_err());
        assert!(WindowKind::Sliding {
            size_ms: 10,
            slide_ms: 20
        }
        .validate()
        .is_err());
        assert!(WindowKind::Session { gap_ms: -1 }.validate().is_err());
    }
}
