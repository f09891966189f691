//! Geofence definitions.
//!
//! Fences are immutable once published: updates go through the catalog,
//! which assigns a new revision and builds a fresh snapshot. Nothing in the
//! query path ever mutates a fence in place.

use crate::error::{PipelineError, Result};
use crate::geom::Boundary;
use crate::value::Value;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Optional day/time restriction on when a fence is active.
///
/// Times are minutes past midnight UTC. A window wrapping midnight
/// (`start > end`) is honored, e.g. 22:00-06:00.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveWindow {
    /// Days on which the fence is active; empty means every day.
    #[serde(default)]
    pub days: Vec<Weekday>,
    /// Start of the active interval, minutes past midnight UTC.
    pub start_minute: u16,
    /// End of the active interval, minutes past midnight UTC (exclusive).
    pub end_minute: u16,
}

impl ActiveWindow {
    pub fn is_active_at(&self, when: DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&when.weekday()) {
            return false;
        }
        let minute = (when.hour() * 60 + when.minute()) as u16;
        if self.start_minute <= self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            // Wraps midnight.
            minute >= self.start_minute || minute < self.end_minute
        }
    }
}

/// A named spatial region used to detect entity containment and transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: Arc<str>,
    pub name: Arc<str>,
    pub boundary: Boundary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_window: Option<ActiveWindow>,
    #[serde(default)]
    pub attributes: IndexMap<String, Value>,
    /// Monotonic version, assigned by the catalog on upsert.
    #[serde(default)]
    pub revision: u64,
    /// True for fences whose geometry moves/updates over time.
    #[serde(default)]
    pub is_dynamic: bool,
}

impl Geofence {
    pub fn new(id: impl Into<Arc<str>>, name: impl Into<Arc<str>>, boundary: Boundary) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            boundary,
            active_window: None,
            attributes: IndexMap::new(),
            revision: 0,
            is_dynamic: false,
        }
    }

    pub fn with_active_window(mut self, window: ActiveWindow) -> Self {
        self.active_window = Some(window);
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }

    /// True unless an active window excludes `when`.
    pub fn is_active_at(&self, when: DateTime<Utc>) -> bool {
        self.active_window
            .as_ref()
            .map(|w| w.is_active_at(when))
            .unwrap_or(true)
    }

    /// Full definition validation, applied at catalog ingestion.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(PipelineError::Validation("geofence id must not be empty".into()));
        }
        self.boundary.validate().map_err(|e| PipelineError::GeofenceHealth {
            fence: self.id.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{polygon_from_ring, GeoPoint};
    use chrono::TimeZone;

    fn square_fence(id: &str) -> Geofence {
        Geofence::new(
            id,
            id,
            Boundary::Polygon {
                polygon: polygon_from_ring(&[[0.0, 0.0], [0.01, 0.0], [0.01, 0.01], [0.0, 0.01]]),
            },
        )
    }

    #[test]
    fn test_active_window_plain() {
        let w = ActiveWindow {
            days: vec![],
            start_minute: 8 * 60,
            end_minute: 17 * 60,
        };
        let morning = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2025, 6, 2, 22, 0, 0).unwrap();
        assert!(w.is_active_at(morning));
        assert!(!w.is_active_at(night));
    }

    #[test]
    fn test_active_window_wraps_midnight() {
        let w = ActiveWindow {
            days: vec![],
            start_minute: 22 * 60,
            end_minute: 6 * 60,
        };
        let midnight = Utc.with_ymd_and_hms(2025, 6, 2, 1, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        assert!(w.is_active_at(midnight));
        assert!(!w.is_active_at(noon));
    }

    #[test]
    fn test_active_window_days() {
        let w = ActiveWindow {
            days: vec![Weekday::Mon, Weekday::Tue],
            start_minute: 0,
            end_minute: 24 * 60,
        };
        let monday = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(w.is_active_at(monday));
        assert!(!w.is_active_at(sunday));
    }

    #[test]
    fn test_fence_without_window_always_active() {
        let f = square_fence("f1");
        assert!(f.is_active_at(Utc::now()));
    }

    #[test]
    fn test_validation_maps_to_health_error() {
        let bad = Geofence::new(
            "bowtie",
            "bowtie",
            Boundary::Polygon {
                polygon: polygon_from_ring(&[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 1.0]]),
            },
        );
        match bad.validate() {
            Err(PipelineError::GeofenceHealth { fence, .. }) => assert_eq!(fence, "bowtie"),
            other => panic!("expected GeofenceHealth, got {:?}", other),
        }
    }

    #[test]
    fn test_fence_json_roundtrip() {
        let f = square_fence("zone-a").with_active_window(ActiveWindow {
            days: vec![Weekday::Fri],
            start_minute: 60,
            end_minute: 120,
        });
        let json = serde_json::to_string(&f).unwrap();
        let back: Geofence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
        assert!(back.boundary.contains(&GeoPoint::new(0.005, 0.005)));
    }
}
