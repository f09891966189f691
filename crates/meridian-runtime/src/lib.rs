//! # Meridian Runtime
//!
//! The processing engine for the Meridian spatial CEP core:
//!
//! - [`catalog`]: versioned geofence snapshots with atomic publication
//! - [`spatial`]: immutable grid index over one catalog snapshot
//! - [`watermark`]: per-source watermarks and event-time reordering
//! - [`tracker`]: per (entity, geofence) transition detection
//! - [`aggregate`] / [`window`]: streaming accumulators over event-time
//!   windows
//! - [`workflow`]: DAG of processing nodes executed per event
//! - [`router`]: entity-hash partitioning with bounded queues
//! - [`enrich`], [`sink`], [`dead_letter`], [`metrics`], [`persistence`]:
//!   lookups, outputs, fault isolation, observability, checkpoints
//! - [`engine`]: the facade tying it together

pub mod aggregate;
pub mod catalog;
pub mod dead_letter;
pub mod engine;
pub mod enrich;
pub mod metrics;
pub mod persistence;
pub mod router;
pub mod sink;
pub mod spatial;
pub mod tracker;
pub mod watermark;
pub mod window;
pub mod workflow;

pub use catalog::{CatalogSnapshot, GeofenceCatalog};
pub use engine::{Engine, EngineConfig};
pub use router::{AggregationConfig, IngestionRouter, RouterConfig};
pub use sink::{CollectSink, ConsoleSink, FileSink, MultiSink, Output, Sink};
pub use spatial::{SpatialIndex, SpatialIndexHandle};
pub use tracker::{EntityStateTracker, TrackerConfig};
pub use watermark::{ReorderBuffer, WatermarkTracker};
pub use window::{AggregateResult, WindowAggregator, WindowKind};
pub use workflow::{NodeRegistry, Workflow, WorkflowDefinition, WorkflowNode};
