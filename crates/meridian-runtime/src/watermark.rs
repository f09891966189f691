//! Event-time watermarks and bounded reordering.
//!
//! Watermarks are tracked per source stream; the effective watermark is the
//! minimum across sources, so no stream's events are declared late because a
//! faster stream ran ahead. The [`ReorderBuffer`] sits in front of the
//! state tracker and releases events in event-time order once the watermark
//! has passed them.

use crate::persistence::{SourceWatermarkCheckpoint, WatermarkCheckpoint};
use chrono::{DateTime, Duration, Utc};
use meridian_core::SharedGeoEvent;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Tracks watermarks for multiple event sources.
///
/// Per-source watermarks never recede. The effective watermark can move
/// backward only when a previously silent source reports its first, lower
/// watermark; consumers that require global monotonicity clamp on read.
pub struct WatermarkTracker {
    sources: FxHashMap<String, SourceWatermark>,
    effective: Option<DateTime<Utc>>,
    /// Tolerance applied to sources that were never explicitly registered.
    default_ooo: Duration,
}

struct SourceWatermark {
    watermark: Option<DateTime<Utc>>,
    max_timestamp: Option<DateTime<Utc>>,
    max_out_of_orderness: Duration,
}

impl WatermarkTracker {
    pub fn new() -> Self {
        Self {
            sources: FxHashMap::default(),
            effective: None,
            default_ooo: Duration::zero(),
        }
    }

    /// Tolerance used when auto-registering a source on first observation.
    pub fn with_default_out_of_orderness(mut self, ooo: Duration) -> Self {
        self.default_ooo = ooo;
        self
    }

    /// Register a source with its out-of-orderness tolerance.
    pub fn register_source(&mut self, name: &str, max_ooo: Duration) {
        self.sources.insert(
            name.to_string(),
            SourceWatermark {
                watermark: None,
                max_timestamp: None,
                max_out_of_orderness: max_ooo,
            },
        );
    }

    /// Observe an event timestamp from a source. Unknown sources are
    /// auto-registered with the default tolerance.
    pub fn observe(&mut self, source: &str, event_ts: DateTime<Utc>) {
        let Some(sw) = self.sources.get_mut(source) else {
            self.register_source(source, self.default_ooo);
            return self.observe(source, event_ts);
        };

        if sw.max_timestamp.is_none_or(|max| event_ts > max) {
            sw.max_timestamp = Some(event_ts);
            let new_wm = event_ts - sw.max_out_of_orderness;
            if sw.watermark.is_none_or(|wm| new_wm > wm) {
                sw.watermark = Some(new_wm);
            }
        }
        self.recompute_effective();
    }

    /// Effective (minimum) watermark across all sources.
    pub fn effective_watermark(&self) -> Option<DateTime<Utc>> {
        self.effective
    }

    /// Advance a source watermark from an upstream signal.
    pub fn advance_source(&mut self, source: &str, wm: DateTime<Utc>) {
        if let Some(sw) = self.sources.get_mut(source) {
            if sw.watermark.is_none_or(|current| wm > current) {
                sw.watermark = Some(wm);
            }
            self.recompute_effective();
        }
    }

    fn recompute_effective(&mut self) {
        let min_wm = self
            .sources
            .values()
            .filter_map(|sw| sw.watermark)
            .min();
        // Sources with no watermark yet do not hold the effective back.
        if min_wm.is_some() {
            self.effective = min_wm;
        }
    }

    pub fn checkpoint(&self) -> WatermarkCheckpoint {
        WatermarkCheckpoint {
            sources: self
                .sources
                .iter()
                .map(|(name, sw)| {
                    (
                        name.clone(),
                        SourceWatermarkCheckpoint {
                            watermark_ms: sw.watermark.map(|w| w.timestamp_millis()),
                            max_timestamp_ms: sw.max_timestamp.map(|t| t.timestamp_millis()),
                            max_out_of_orderness_ms: sw.max_out_of_orderness.num_milliseconds(),
                        },
                    )
                })
                .collect(),
            effective_watermark_ms: self.effective.map(|w| w.timestamp_millis()),
        }
    }

    pub fn restore(&mut self, cp: &WatermarkCheckpoint) {
        for (name, scp) in &cp.sources {
            let sw = self
                .sources
                .entry(name.clone())
                .or_insert_with(|| SourceWatermark {
                    watermark: None,
                    max_timestamp: None,
                    max_out_of_orderness: Duration::milliseconds(scp.max_out_of_orderness_ms),
                });
            sw.watermark = scp.watermark_ms.and_then(DateTime::from_timestamp_millis);
            sw.max_timestamp = scp
                .max_timestamp_ms
                .and_then(DateTime::from_timestamp_millis);
            sw.max_out_of_orderness = Duration::milliseconds(scp.max_out_of_orderness_ms);
        }
        self.effective = cp
            .effective_watermark_ms
            .and_then(DateTime::from_timestamp_millis);
    }
}

impl Default for WatermarkTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Min-heap entry ordered by event time, with an arrival sequence so equal
/// timestamps release in arrival order.
struct Buffered {
    ts: DateTime<Utc>,
    seq: u64,
    event: SharedGeoEvent,
}

impl PartialEq for Buffered {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.seq == other.seq
    }
}
impl Eq for Buffered {}
impl PartialOrd for Buffered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Buffered {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ts.cmp(&other.ts).then(self.seq.cmp(&other.seq))
    }
}

/// Buffers out-of-order events and releases them in event-time order once
/// the watermark passes. Events strictly older than the watermark at
/// admission are rejected as late; an event exactly at the watermark is
/// still admitted, matching what `release` emits.
pub struct ReorderBuffer {
    heap: BinaryHeap<Reverse<Buffered>>,
    next_seq: u64,
}

pub enum Admission {
    Buffered,
    /// Event time was strictly below the watermark when it arrived.
    Late,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Admit an event against the current watermark.
    pub fn push(&mut self, event: SharedGeoEvent, watermark: Option<DateTime<Utc>>) -> Admission {
        if let Some(wm) = watermark {
            if event.event_time < wm {
                return Admission::Late;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Buffered {
            ts: event.event_time,
            seq,
            event,
        }));
        Admission::Buffered
    }

    /// Release every buffered event with timestamp at or below the
    /// watermark, in event-time order.
    pub fn release(&mut self, watermark: DateTime<Utc>) -> Vec<SharedGeoEvent> {
        let mut out = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.ts > watermark {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            out.push(entry.event);
        }
        out
    }

    /// Drain everything regardless of watermark, in event-time order. Used
    /// at shutdown.
    pub fn drain_all(&mut self) -> Vec<SharedGeoEvent> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(entry)) = self.heap.pop() {
            out.push(entry.event);
        }
        out
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}
