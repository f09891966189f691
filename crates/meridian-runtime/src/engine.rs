//! The engine facade: catalog, spatial index, ingestion router, workflows
//! and outputs composed behind one handle.
//!
//! Geofence mutations go through the catalog and trigger an off-path index
//! rebuild; the swap is atomic, so queries either see the whole previous
//! generation or the whole next one.

use crate::catalog::GeofenceCatalog;
use crate::dead_letter::DeadLetterQueue;
use crate::enrich::EnrichmentProvider;
use crate::metrics::Metrics;
use crate::persistence::StateStore;
use crate::router::{IngestionRouter, RouterConfig};
use crate::sink::{ConsoleSink, Sink};
use crate::spatial::SpatialIndexHandle;
use crate::workflow::{NodeRegistry, WorkflowDefinition};
use meridian_core::{GeoEvent, Geofence, Result};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct EngineConfig {
    pub router: RouterConfig,
    /// Dead-letter file; node faults are dropped silently when absent.
    pub dead_letter_path: Option<PathBuf>,
    /// Enrichment providers available to `enrich` workflow nodes, by name.
    pub providers: FxHashMap<String, Arc<dyn EnrichmentProvider>>,
    pub sink: Option<Arc<dyn Sink>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            dead_letter_path: None,
            providers: FxHashMap::default(),
            sink: None,
        }
    }
}

pub struct Engine {
    catalog: GeofenceCatalog,
    spatial: Arc<SpatialIndexHandle>,
    router: IngestionRouter,
    metrics: Metrics,
    dead_letter: Option<Arc<DeadLetterQueue>>,
}

impl Engine {
    /// Start the engine. Falls back to a console sink when none is given.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let metrics = Metrics::new();
        let spatial = Arc::new(SpatialIndexHandle::new());
        let sink = config
            .sink
            .unwrap_or_else(|| Arc::new(ConsoleSink::new("console")));
        let dead_letter = match &config.dead_letter_path {
            Some(path) => Some(Arc::new(DeadLetterQueue::open(path)?)),
            None => None,
        };
        let registry = Arc::new(NodeRegistry::with_builtins(config.providers));
        let router = IngestionRouter::start(
            config.router,
            spatial.clone(),
            registry,
            sink,
            metrics.clone(),
            dead_letter.clone(),
        )?;
        info!("engine started");
        Ok(Self {
            catalog: GeofenceCatalog::new(),
            spatial,
            router,
            metrics,
            dead_letter,
        })
    }

    /// Validate and route one event; awaits under backpressure.
    pub async fn ingest(&self, event: GeoEvent) -> Result<()> {
        self.router.ingest(event).await
    }

    /// Add or replace a fence. The snapshot and the index swap atomically;
    /// in-flight queries finish against the previous generation.
    pub fn upsert_geofence(&self, fence: Geofence) -> Result<u64> {
        let revision = self.catalog.upsert(fence)?;
        self.publish_index()?;
        Ok(revision)
    }

    pub fn delete_geofence(&self, id: &str) -> Result<bool> {
        let removed = self.catalog.delete(id);
        if removed {
            self.publish_index()?;
        }
        Ok(removed)
    }

    pub fn list_geofences(&self) -> Vec<Arc<Geofence>> {
        self.catalog.list()
    }

    fn publish_index(&self) -> Result<()> {
        let snapshot = self.catalog.snapshot();
        self.spatial.rebuild(&snapshot)?;
        self.metrics.active_geofences.set(snapshot.len() as f64);
        Ok(())
    }

    /// Parse, validate and install a workflow on every partition. A
    /// definition that fails validation never replaces the running one.
    pub async fn load_workflow(&self, json: &str) -> Result<()> {
        let def = WorkflowDefinition::from_json(json)?;
        self.router.load_workflow(def).await
    }

    pub async fn checkpoint(&self, store: Arc<dyn StateStore>) -> Result<()> {
        self.router.checkpoint(store).await
    }

    pub async fn evict_idle(&self) {
        self.router.evict_idle().await;
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn dead_letter(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dead_letter.as_ref()
    }

    /// Drain every partition and stop.
    pub async fn shutdown(self) {
        self.router.shutdown().await;
        info!("engine stopped");
    }
}
