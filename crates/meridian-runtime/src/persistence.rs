//! State persistence for restart recovery.
//!
//! The pipeline checkpoints three things per partition: entity-geofence
//! pair states, open window accumulators, and watermark positions. The
//! store contract requires atomic upsert per key so a crash between
//! checkpoint and ack never double-applies on recovery.

use crate::tracker::PairState;
use crate::window::WindowCheckpoint;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Error from a state store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("key not found: {0}")]
    NotFound(String),
}

/// Per-source watermark position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceWatermarkCheckpoint {
    pub watermark_ms: Option<i64>,
    pub max_timestamp_ms: Option<i64>,
    pub max_out_of_orderness_ms: i64,
}

/// Watermark tracker state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatermarkCheckpoint {
    pub sources: HashMap<String, SourceWatermarkCheckpoint>,
    pub effective_watermark_ms: Option<i64>,
}

/// All pair states for one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityStateCheckpoint {
    pub pairs: Vec<(String, String, PairState)>,
}

/// Full checkpoint for one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    pub partition: usize,
    pub timestamp_ms: i64,
    pub entity_state: EntityStateCheckpoint,
    pub windows: WindowCheckpoint,
    pub watermarks: WatermarkCheckpoint,
}

/// Trait for state storage backends. Each key maps to one value and `put`
/// must be atomic: readers see either the old or the new value, never a
/// torn write.
pub trait StateStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Flush all pending writes to durable storage.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn entity_key(partition: usize) -> String {
    format!("meridian:entity-state:{partition}")
}

fn window_key(partition: usize) -> String {
    format!("meridian:windows:{partition}")
}

fn checkpoint_key(partition: usize) -> String {
    format!("meridian:checkpoint:{partition}")
}

/// Save pair states for a partition.
pub fn save_entity_state(
    store: &dyn StateStore,
    partition: usize,
    state: &EntityStateCheckpoint,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.put(&entity_key(partition), &data)
}

/// Load pair states for a partition, empty when never saved.
pub fn load_entity_state(
    store: &dyn StateStore,
    partition: usize,
) -> Result<EntityStateCheckpoint, StoreError> {
    match store.get(&entity_key(partition))? {
        Some(data) => {
            serde_json::from_slice(&data).map_err(|e| StoreError::Serialization(e.to_string()))
        }
        None => Ok(EntityStateCheckpoint::default()),
    }
}

/// Save open-window state for a partition.
pub fn save_window_checkpoint(
    store: &dyn StateStore,
    partition: usize,
    cp: &WindowCheckpoint,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec(cp).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.put(&window_key(partition), &data)
}

/// Load open-window state for a partition.
pub fn load_window_checkpoint(
    store: &dyn StateStore,
    partition: usize,
) -> Result<Option<WindowCheckpoint>, StoreError> {
    match store.get(&window_key(partition))? {
        Some(data) => {
            serde_json::from_slice(&data).map_err(|e| StoreError::Serialization(e.to_string()))
        }
        None => Ok(None),
    }
}

/// Save a full partition checkpoint in one atomic write.
pub fn save_partition_checkpoint(
    store: &dyn StateStore,
    cp: &PartitionCheckpoint,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec(cp).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.put(&checkpoint_key(cp.partition), &data)?;
    store.flush()
}

/// Load the last full checkpoint for a partition.
pub fn load_partition_checkpoint(
    store: &dyn StateStore,
    partition: usize,
) -> Result<Option<PartitionCheckpoint>, StoreError> {
    match store.get(&checkpoint_key(partition))? {
        Some(data) => {
            serde_json::from_slice(&data).map_err(|e| StoreError::Serialization(e.to_string()))
        }
        None => Ok(None),
    }
}

/// In-memory state store for testing and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}
