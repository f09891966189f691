//! # Meridian Core
//!
//! Foundational types for the Meridian spatial complex-event-processing
//! engine:
//!
//! - [`event`]: raw [`GeoEvent`] observations and derived [`GeofenceEvent`]s
//! - [`geom`]: WGS84 points, bounding boxes, fence boundaries
//! - [`geofence`]: fence definitions with active windows and revisions
//! - [`value`]: runtime values for event property maps
//! - [`error`]: the pipeline error taxonomy

pub mod error;
pub mod event;
pub mod geofence;
pub mod geom;
pub mod value;

pub use error::{PipelineError, Result};
pub use event::{FxIndexMap, GeoEvent, GeoJsonPoint, GeofenceEvent, SharedGeoEvent, TransitionKind};
pub use geofence::{ActiveWindow, Geofence};
pub use geom::{polygon_from_ring, BBox, Boundary, GeoPoint, EARTH_RADIUS_M};
pub use value::Value;
