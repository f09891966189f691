//! Partitioned ingestion: entity-hash routing into bounded per-partition
//! queues, each drained by a worker that owns the full per-partition
//! pipeline state.
//!
//! All events for one entity land on the same partition, so per-entity
//! ordering holds without any cross-partition coordination. Queues are
//! bounded; a full queue exerts backpressure on the caller instead of
//! dropping or buffering unboundedly.

use crate::dead_letter::DeadLetterQueue;
use crate::metrics::Metrics;
use crate::persistence::{self, PartitionCheckpoint, StateStore};
use crate::sink::{Output, Sink};
use crate::spatial::SpatialIndexHandle;
use crate::tracker::{EntityStateTracker, TrackerConfig};
use crate::watermark::{Admission, ReorderBuffer, WatermarkTracker};
use crate::aggregate::AggSpec;
use crate::window::{WindowAggregator, WindowKind};
use crate::workflow::{NodeContext, NodeRegistry, Workflow, WorkflowDefinition};
use chrono::Utc;
use meridian_core::{GeoEvent, PipelineError, Result, SharedGeoEvent};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stable entity-to-partition assignment.
pub fn partition_for(entity_id: &str, partitions: usize) -> usize {
    let mut hasher = rustc_hash::FxHasher::default();
    entity_id.hash(&mut hasher);
    (hasher.finish() as usize) % partitions.max(1)
}

/// Windowed aggregation applied on every partition, keyed by entity.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    pub window: WindowKind,
    /// Allowed lateness beyond the watermark before a window closes.
    pub grace: chrono::Duration,
    pub aggregates: Vec<AggSpec>,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub partitions: usize,
    /// Per-partition queue bound; senders block when it fills.
    pub queue_capacity: usize,
    /// Watermark lag behind the max observed timestamp per source.
    pub out_of_orderness: chrono::Duration,
    pub tracker: TrackerConfig,
    /// Per-partition windowed aggregation; disabled when absent.
    pub aggregation: Option<AggregationConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            queue_capacity: 1024,
            out_of_orderness: chrono::Duration::zero(),
            tracker: TrackerConfig::default(),
            aggregation: None,
        }
    }
}

enum Command {
    Event(SharedGeoEvent),
    /// Replace the workflow at the next event boundary.
    LoadWorkflow(Arc<WorkflowDefinition>),
    Checkpoint(Arc<dyn StateStore>, oneshot::Sender<Result<()>>),
    EvictIdle,
}

/// The ingestion front door. Owns the partition workers; dropping the
/// router without calling [`IngestionRouter::shutdown`] aborts in-flight
/// state.
pub struct IngestionRouter {
    senders: Vec<mpsc::Sender<Command>>,
    workers: Vec<JoinHandle<()>>,
    metrics: Metrics,
}

impl IngestionRouter {
    pub fn start(
        config: RouterConfig,
        spatial: Arc<SpatialIndexHandle>,
        registry: Arc<NodeRegistry>,
        sink: Arc<dyn Sink>,
        metrics: Metrics,
        dead_letter: Option<Arc<DeadLetterQueue>>,
    ) -> Result<Self> {
        let partitions = config.partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let aggregator = match &config.aggregation {
                Some(a) => Some(WindowAggregator::new(a.window, a.grace, a.aggregates.clone())?),
                None => None,
            };
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            let worker = PartitionWorker {
                partition,
                spatial: spatial.clone(),
                registry: registry.clone(),
                sink: sink.clone(),
                metrics: metrics.clone(),
                dead_letter: dead_letter.clone(),
                watermarks: WatermarkTracker::new()
                    .with_default_out_of_orderness(config.out_of_orderness),
                reorder: ReorderBuffer::new(),
                tracker: EntityStateTracker::new(config.tracker.clone()),
                aggregator,
                workflow: None,
            };
            workers.push(tokio::spawn(worker.run(rx)));
            senders.push(tx);
        }
        info!(partitions, capacity = config.queue_capacity, "ingestion router started");
        Ok(Self {
            senders,
            workers,
            metrics,
        })
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Validate and route one event. Awaits when the target partition's
    /// queue is full.
    pub async fn ingest(&self, event: GeoEvent) -> Result<()> {
        event.validate()?;
        self.metrics.record_event(if event.source.is_empty() {
            "default"
        } else {
            &event.source
        });
        let partition = partition_for(&event.entity_id, self.senders.len());
        self.senders[partition]
            .send(Command::Event(Arc::new(event)))
            .await
            .map_err(|_| PipelineError::Workflow("router is shut down".into()))
    }

    /// Install a workflow on every partition. Each worker builds its own
    /// instance so node state stays partition-local; the swap happens at an
    /// event boundary, never mid-event.
    pub async fn load_workflow(&self, def: WorkflowDefinition) -> Result<()> {
        let def = Arc::new(def);
        for tx in &self.senders {
            tx.send(Command::LoadWorkflow(def.clone()))
                .await
                .map_err(|_| PipelineError::Workflow("router is shut down".into()))?;
        }
        Ok(())
    }

    /// Checkpoint every partition's state into the store.
    pub async fn checkpoint(&self, store: Arc<dyn StateStore>) -> Result<()> {
        let mut acks = Vec::with_capacity(self.senders.len());
        for tx in &self.senders {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send(Command::Checkpoint(store.clone(), ack_tx))
                .await
                .map_err(|_| PipelineError::Workflow("router is shut down".into()))?;
            acks.push(ack_rx);
        }
        for ack in acks {
            ack.await
                .map_err(|_| PipelineError::Workflow("partition worker gone".into()))??;
        }
        Ok(())
    }

    /// Ask every partition to drop idle pair records.
    pub async fn evict_idle(&self) {
        for tx in &self.senders {
            let _ = tx.send(Command::EvictIdle).await;
        }
    }

    /// Close the queues, drain every partition (reorder buffers released in
    /// order, open windows flushed) and wait for the workers to finish.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "partition worker panicked during shutdown");
            }
        }
        info!("ingestion router drained");
    }
}

struct PartitionWorker {
    partition: usize,
    spatial: Arc<SpatialIndexHandle>,
    registry: Arc<NodeRegistry>,
    sink: Arc<dyn Sink>,
    metrics: Metrics,
    dead_letter: Option<Arc<DeadLetterQueue>>,
    watermarks: WatermarkTracker,
    reorder: ReorderBuffer,
    tracker: EntityStateTracker,
    aggregator: Option<WindowAggregator>,
    workflow: Option<Workflow>,
}

impl PartitionWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let label = self.partition.to_string();
        while let Some(cmd) = rx.recv().await {
            self.metrics
                .partition_queue_size
                .with_label_values(&[&label])
                .set(rx.len() as f64);
            match cmd {
                Command::Event(event) => self.on_event(event).await,
                Command::LoadWorkflow(def) => self.on_load_workflow(&def),
                Command::Checkpoint(store, ack) => {
                    let _ = ack.send(self.on_checkpoint(store.as_ref()));
                }
                Command::EvictIdle => {
                    let evicted = self.tracker.evict_idle(Utc::now());
                    if evicted > 0 {
                        debug!(partition = self.partition, evicted, "idle pairs evicted");
                    }
                }
            }
        }

        // Queue closed: release everything still buffered, in order, then
        // flush open windows.
        let remaining = self.reorder.drain_all();
        for event in remaining {
            self.process(event).await;
        }
        if let Some(agg) = &mut self.aggregator {
            for result in agg.flush() {
                Self::emit(&self.sink, Output::Aggregate(result)).await;
            }
        }
        if let Some(wf) = &mut self.workflow {
            let mut ctx = NodeContext::new(self.spatial.load(), None);
            for output in wf.drain(&mut ctx) {
                Self::emit(&self.sink, output).await;
            }
        }
        if let Err(e) = self.sink.flush().await {
            warn!(partition = self.partition, error = %e, "sink flush failed");
        }
        debug!(partition = self.partition, "partition drained");
    }

    async fn on_event(&mut self, event: SharedGeoEvent) {
        let source = if event.source.is_empty() {
            "default".to_string()
        } else {
            event.source.clone()
        };
        // Admission is judged against the watermark as of arrival; the
        // event's own observation must not retroactively reject it.
        let arrival_wm = self.watermarks.effective_watermark();
        let event_time = event.event_time;
        match self.reorder.push(event, arrival_wm) {
            Admission::Late => {
                self.metrics.record_late("router");
                return;
            }
            Admission::Buffered => {}
        }
        self.watermarks.observe(&source, event_time);
        if let Some(wm) = self.watermarks.effective_watermark() {
            for ready in self.reorder.release(wm) {
                self.process(ready).await;
            }
        }
    }

    /// One event, in order, through the partition pipeline.
    async fn process(&mut self, event: SharedGeoEvent) {
        let index = self.spatial.load();
        let watermark = self.watermarks.effective_watermark();

        let started = std::time::Instant::now();
        let transitions = self.tracker.update(&event, &index);
        self.metrics
            .record_spatial_query("containment", started.elapsed().as_secs_f64());
        for t in transitions {
            self.metrics.record_transition(t.event_type.as_str());
            Self::emit(&self.sink, Output::Transition(t)).await;
        }
        self.metrics.tracked_pairs.set(self.tracker.pair_count() as f64);

        if let Some(agg) = &mut self.aggregator {
            agg.add(event.entity_id.clone(), &event, watermark);
            if let Some(wm) = watermark {
                for result in agg.advance(wm) {
                    Self::emit(&self.sink, Output::Aggregate(result)).await;
                }
            }
        }

        if let Some(wf) = &mut self.workflow {
            let mut ctx = NodeContext::new(index, watermark);
            let outputs = wf
                .execute(&event, &mut ctx, self.dead_letter.as_deref(), Some(&self.metrics))
                .await;
            for output in outputs {
                Self::emit(&self.sink, output).await;
            }
        }
    }

    fn on_load_workflow(&mut self, def: &WorkflowDefinition) {
        match Workflow::build(def, &self.registry) {
            Ok(wf) => {
                info!(partition = self.partition, workflow = %def.name, "workflow installed");
                self.workflow = Some(wf);
            }
            Err(e) => {
                warn!(partition = self.partition, workflow = %def.name, error = %e, "workflow rejected");
                self.metrics.record_error(e.kind());
            }
        }
    }

    fn on_checkpoint(&self, store: &dyn StateStore) -> Result<()> {
        let cp = PartitionCheckpoint {
            partition: self.partition,
            timestamp_ms: Utc::now().timestamp_millis(),
            entity_state: self.tracker.checkpoint(),
            windows: self
                .aggregator
                .as_ref()
                .map(|a| a.checkpoint())
                .unwrap_or_default(),
            watermarks: self.watermarks.checkpoint(),
        };
        persistence::save_partition_checkpoint(store, &cp)
            .map_err(|e| PipelineError::Workflow(format!("checkpoint: {e}")))?;
        debug!(partition = self.partition, "checkpoint written");
        Ok(())
    }

    async fn emit(sink: &Arc<dyn Sink>, output: Output) {
        if let Err(e) = sink.send(&output).await {
            warn!(error = %e, "sink delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggFunc;
    use crate::catalog::GeofenceCatalog;
    use crate::sink::CollectSink;
    use meridian_core::{Boundary, GeoPoint, Geofence, TransitionKind};
    use rustc_hash::FxHashMap;

    fn square_fence(id: &str) -> Geofence {
        Geofence::new(
            id,
            id,
            Boundary::Polygon {
                polygon: meridian_core::polygon_from_ring(&[
                    [0.0, 0.0],
                    [0.01, 0.0],
                    [0.01, 0.01],
                    [0.0, 0.01],
                ]),
            },
        )
    }

    fn setup() -> (Arc<SpatialIndexHandle>, Arc<CollectSink>, IngestionRouter) {
        let catalog = GeofenceCatalog::new();
        catalog.upsert(square_fence("zone-a")).unwrap();
        let spatial = Arc::new(SpatialIndexHandle::new());
        spatial.rebuild(&catalog.snapshot()).unwrap();

        let sink = CollectSink::new();
        let sink_dyn: Arc<dyn Sink> = sink.clone();
        let router = IngestionRouter::start(
            RouterConfig {
                partitions: 2,
                queue_capacity: 64,
                ..RouterConfig::default()
            },
            spatial.clone(),
            Arc::new(NodeRegistry::with_builtins(FxHashMap::default())),
            sink_dyn,
            Metrics::new(),
            None,
        )
        .unwrap();
        (spatial, sink, router)
    }

    fn position(id: &str, entity: &str, lon: f64, lat: f64, secs: i64) -> GeoEvent {
        let base = chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).unwrap();
        GeoEvent::new(id, entity, GeoPoint::new(lon, lat))
            .with_event_time(base + chrono::Duration::seconds(secs))
            .with_source("test")
    }

    #[test]
    fn test_partition_assignment_stable() {
        let a = partition_for("vehicle-17", 8);
        for _ in 0..10 {
            assert_eq!(partition_for("vehicle-17", 8), a);
        }
        assert!(a < 8);
    }

    #[test]
    fn test_partition_assignment_spreads() {
        let hit: std::collections::HashSet<usize> = (0..100)
            .map(|i| partition_for(&format!("entity-{i}"), 4))
            .collect();
        assert!(hit.len() > 1);
    }

    #[tokio::test]
    async fn test_enter_exit_through_router() {
        let (_spatial, sink, router) = setup();

        // Inside, then outside. The second event also advances the
        // watermark past the first, releasing it from the reorder buffer;
        // the final drain releases the rest.
        router
            .ingest(position("e1", "v1", 0.005, 0.005, 10))
            .await
            .unwrap();
        router
            .ingest(position("e2", "v1", 0.5, 0.5, 40))
            .await
            .unwrap();
        router.shutdown().await;

        let outputs = sink.take().await;
        let kinds: Vec<TransitionKind> = outputs
            .iter()
            .filter_map(|o| match o {
                Output::Transition(t) => Some(t.event_type),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![TransitionKind::Enter, TransitionKind::Exit]);
    }

    #[tokio::test]
    async fn test_out_of_order_events_reordered() {
        let catalog = GeofenceCatalog::new();
        catalog.upsert(square_fence("zone-a")).unwrap();
        let spatial = Arc::new(SpatialIndexHandle::new());
        spatial.rebuild(&catalog.snapshot()).unwrap();

        let sink = CollectSink::new();
        let sink_dyn: Arc<dyn Sink> = sink.clone();
        let router = IngestionRouter::start(
            RouterConfig {
                partitions: 1,
                out_of_orderness: chrono::Duration::seconds(20),
                ..RouterConfig::default()
            },
            spatial,
            Arc::new(NodeRegistry::with_builtins(FxHashMap::default())),
            sink_dyn,
            Metrics::new(),
            None,
        )
        .unwrap();

        // Arrival order 30, 25, 60; event-time order must win. 25 is inside
        // the fence and within tolerance, so Enter must precede the Exit
        // triggered by the outside event at 30.
        router
            .ingest(position("e1", "v7", 0.5, 0.5, 30))
            .await
            .unwrap();
        router
            .ingest(position("e2", "v7", 0.005, 0.005, 25))
            .await
            .unwrap();
        router
            .ingest(position("e3", "v7", 0.5, 0.5, 60))
            .await
            .unwrap();
        router.shutdown().await;

        let outputs = sink.take().await;
        let kinds: Vec<TransitionKind> = outputs
            .iter()
            .filter_map(|o| match o {
                Output::Transition(t) => Some(t.event_type),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![TransitionKind::Enter, TransitionKind::Exit]);
    }

    #[tokio::test]
    async fn test_windowed_aggregation_through_router() {
        let catalog = GeofenceCatalog::new();
        catalog.upsert(square_fence("zone-a")).unwrap();
        let spatial = Arc::new(SpatialIndexHandle::new());
        spatial.rebuild(&catalog.snapshot()).unwrap();

        let sink = CollectSink::new();
        let sink_dyn: Arc<dyn Sink> = sink.clone();
        let router = IngestionRouter::start(
            RouterConfig {
                partitions: 1,
                aggregation: Some(AggregationConfig {
                    window: WindowKind::Tumbling { size_ms: 10_000 },
                    grace: chrono::Duration::zero(),
                    aggregates: vec![AggSpec {
                        func: AggFunc::Count,
                        field: None,
                    }],
                }),
                ..RouterConfig::default()
            },
            spatial,
            Arc::new(NodeRegistry::with_builtins(FxHashMap::default())),
            sink_dyn,
            Metrics::new(),
            None,
        )
        .unwrap();

        // Two fixes land in the first 10s window; the third closes it by
        // pushing the watermark well past its end.
        router.ingest(position("e1", "v1", 0.5, 0.5, 1)).await.unwrap();
        router.ingest(position("e2", "v1", 0.5, 0.5, 4)).await.unwrap();
        router.ingest(position("e3", "v1", 0.5, 0.5, 60)).await.unwrap();
        router.shutdown().await;

        let outputs = sink.take().await;
        let counts: Vec<i64> = outputs
            .iter()
            .filter_map(|o| match o {
                Output::Aggregate(r) => r.values.get("count").and_then(|v| v.as_int()),
                _ => None,
            })
            .collect();
        assert!(counts.contains(&2), "closed window should count both events: {counts:?}");
        // The open window drains at shutdown.
        assert!(counts.contains(&1), "drain should flush the open window: {counts:?}");
    }

    #[tokio::test]
    async fn test_late_event_dropped() {
        let (_spatial, sink, router) = setup();

        router
            .ingest(position("e1", "v2", 0.5, 0.5, 100))
            .await
            .unwrap();
        // Behind the zero-tolerance watermark set by e1.
        router
            .ingest(position("e2", "v2", 0.005, 0.005, 50))
            .await
            .unwrap();
        router.shutdown().await;

        let outputs = sink.take().await;
        // The late inside-event must not have produced an Enter.
        assert!(outputs
            .iter()
            .all(|o| !matches!(o, Output::Transition(t) if t.event_type == TransitionKind::Enter)));
    }

    #[tokio::test]
    async fn test_ingest_rejects_invalid_event() {
        let (_spatial, _sink, router) = setup();
        let bad = GeoEvent::new("e1", "v1", GeoPoint::new(190.0, 0.0));
        assert!(matches!(
            router.ingest(bad).await,
            Err(PipelineError::Validation(_))
        ));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoint_covers_all_partitions() {
        let (_spatial, _sink, router) = setup();
        router
            .ingest(position("e1", "v1", 0.005, 0.005, 10))
            .await
            .unwrap();
        router
            .ingest(position("e2", "v9", 0.005, 0.005, 10))
            .await
            .unwrap();

        let store = Arc::new(crate::persistence::MemoryStore::new());
        router.checkpoint(store.clone()).await.unwrap();
        router.shutdown().await;

        let p0 = persistence::load_partition_checkpoint(store.as_ref(), 0).unwrap();
        let p1 = persistence::load_partition_checkpoint(store.as_ref(), 1).unwrap();
        assert!(p0.is_some() && p1.is_some());
    }

    #[tokio::test]
    async fn test_workflow_swap_at_event_boundary() {
        let (_spatial, sink, router) = setup();

        router
            .load_workflow(
                serde_json::from_value(serde_json::json!({
                    "name": "tagger",
                    "nodes": [
                        {"id": "tag", "type": "transform", "config": {"set": {"seen": true}}}
                    ],
                    "edges": []
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        router
            .ingest(position("e1", "v1", 0.5, 0.5, 10))
            .await
            .unwrap();
        router.shutdown().await;

        let outputs = sink.take().await;
        assert!(outputs
            .iter()
            .any(|o| matches!(o, Output::Workflow(w) if w.node == "tag")));
    }
}
