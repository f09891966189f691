//! Dead letter queue for events that fail inside a workflow node.
//!
//! A node fault is isolated to the event being processed: the event lands
//! here with error metadata instead of aborting the graph. The DLQ appends
//! one JSON line per failed event for later reprocessing.

use meridian_core::GeoEvent;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A dead letter entry with error metadata.
#[derive(serde::Serialize)]
struct DlqEntry<'a> {
    /// ISO-8601 timestamp when the event was dead-lettered.
    timestamp: String,
    /// Workflow the event was traversing.
    workflow: &'a str,
    /// Node that faulted.
    node: &'a str,
    /// Error message from the failed evaluation.
    error: &'a str,
    /// The event that failed.
    event: &'a GeoEvent,
}

/// File-backed dead letter queue.
///
/// Appends JSON-lines to a file. Thread-safe via internal mutex on the
/// file handle.
pub struct DeadLetterQueue {
    file: Mutex<File>,
    path: PathBuf,
    events_total: AtomicU64,
}

impl DeadLetterQueue {
    /// Open (or create) a DLQ file at the given path.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            events_total: AtomicU64::new(0),
        })
    }

    /// Record a failed event with its node and error.
    pub fn write(&self, workflow: &str, node: &str, error: &str, event: &GeoEvent) {
        let entry = DlqEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            workflow,
            node,
            error,
            event,
        };

        if let Ok(line) = serde_json::to_string(&entry) {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            // Best-effort: a DLQ write failure must not take the pipeline down.
            if writeln!(file, "{}", line).is_ok() {
                self.events_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of events written so far.
    pub fn count(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }
}
