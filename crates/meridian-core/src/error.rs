//! Error taxonomy for the processing pipeline.
//!
//! Errors local to one event or one node never abort processing of other
//! events; they are surfaced through metrics and dead-letter records.

use thiserror::Error;

/// Pipeline errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed event or geometry, rejected at ingress.
    #[error("validation error: {0}")]
    Validation(String),

    /// Corrupt or invalid geofence geometry; the fence is excluded from the
    /// active index, other fences are unaffected.
    #[error("geofence '{fence}' unhealthy: {reason}")]
    GeofenceHealth { fence: String, reason: String },

    /// A workflow node faulted for one event; isolated to the dead-letter
    /// path.
    #[error("node '{node}' failed: {reason}")]
    NodeExecution { node: String, reason: String },

    /// Event arrived behind the watermark; counted and dropped, never
    /// escalated.
    #[error("late event {event_id}: event time behind watermark")]
    LateData { event_id: String },

    /// An enrich lookup exceeded its deadline; the event proceeds down the
    /// error path.
    #[error("node '{node}' exceeded its {budget_ms}ms budget")]
    Timeout { node: String, budget_ms: u64 },

    /// Workflow definition rejected before activation (cycle, dangling edge,
    /// unknown node type).
    #[error("invalid workflow: {0}")]
    Workflow(String),
}

impl PipelineError {
    /// Stable label for metrics and dead-letter records.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::GeofenceHealth { .. } => "geofence_health",
            PipelineError::NodeExecution { .. } => "node_execution",
            PipelineError::LateData { .. } => "late_data",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Workflow(_) => "workflow",
        }
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, PipelineError>;
