//! Event types: raw geolocated observations in, derived geofence events out.

use crate::geom::GeoPoint;
use crate::value::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Type alias for IndexMap with FxBuildHasher for fast field access.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared reference to a GeoEvent for cheap passing through pipelines.
pub type SharedGeoEvent = Arc<GeoEvent>;

/// One geolocated observation. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoEvent {
    /// Unique event id (Arc<str> for O(1) clone in the hot path).
    pub id: Arc<str>,
    /// Tracked entity this observation belongs to; the partitioning key.
    pub entity_id: Arc<str>,
    /// Event type name.
    pub event_type: Arc<str>,
    /// Source-assigned timestamp.
    #[serde(default = "Utc::now")]
    pub event_time: DateTime<Utc>,
    /// Ingest-assigned timestamp.
    #[serde(default = "Utc::now")]
    pub processing_time: DateTime<Utc>,
    /// Observed position.
    pub location: GeoPoint,
    /// String-keyed scalar payload.
    #[serde(default)]
    pub properties: FxIndexMap<String, Value>,
    /// Originating stream/source name; drives per-source watermarks.
    #[serde(default)]
    pub source: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: FxIndexMap<String, String>,
}

impl GeoEvent {
    pub fn new(
        id: impl Into<Arc<str>>,
        entity_id: impl Into<Arc<str>>,
        location: GeoPoint,
    ) -> Self {
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            event_type: Arc::from("position"),
            event_time: Utc::now(),
            processing_time: Utc::now(),
            location,
            properties: IndexMap::with_hasher(FxBuildHasher),
            source: String::new(),
            tags: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<Arc<str>>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_event_time(mut self, ts: DateTime<Utc>) -> Self {
        self.event_time = ts;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(|v| v.as_float())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(|v| v.as_int())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// Ingress validation: events failing this never enter the pipeline.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.id.is_empty() {
            return Err(crate::error::PipelineError::Validation(
                "event id must not be empty".into(),
            ));
        }
        if self.entity_id.is_empty() {
            return Err(crate::error::PipelineError::Validation(
                "entity id must not be empty".into(),
            ));
        }
        if !self.location.is_valid() {
            return Err(crate::error::PipelineError::Validation(format!(
                "location ({}, {}) outside WGS84 bounds",
                self.location.lon, self.location.lat
            )));
        }
        Ok(())
    }
}

/// Geofence transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    Enter,
    Exit,
    Dwell,
    Linger,
    Approach,
    Depart,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Enter => "Enter",
            TransitionKind::Exit => "Exit",
            TransitionKind::Dwell => "Dwell",
            TransitionKind::Linger => "Linger",
            TransitionKind::Approach => "Approach",
            TransitionKind::Depart => "Depart",
        }
    }
}

/// GeoJSON point representation used on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJsonPoint {
    #[serde(rename = "type")]
    pub kind: String,
    /// `[lon, lat]` per GeoJSON.
    pub coordinates: [f64; 2],
}

impl From<&GeoPoint> for GeoJsonPoint {
    fn from(p: &GeoPoint) -> Self {
        Self {
            kind: "Point".to_string(),
            coordinates: [p.lon, p.lat],
        }
    }
}

/// A derived geofence transition event. Append-only: never mutated after
/// emission. The JSON shape is wire-compatible with downstream dashboards
/// and alerting, so field names here are load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceEvent {
    pub event_id: String,
    pub event_type: TransitionKind,
    pub event_time: DateTime<Utc>,
    pub geofence_id: Arc<str>,
    pub geofence_name: Arc<str>,
    pub entity_id: Arc<str>,
    pub location: GeoJsonPoint,
    #[serde(default)]
    pub properties: FxIndexMap<String, Value>,
    /// Seconds spent inside, for Dwell and Exit.
    pub dwell_time: Option<f64>,
    /// Where the entity first crossed in, for Dwell and Exit.
    pub entry_point: Option<GeoJsonPoint>,
    /// Distance to boundary in meters, for Approach/Depart/Linger.
    pub distance: Option<f64>,
}
