//! Workflow executor: a DAG of processing nodes applied per event.
//!
//! A workflow arrives as pure data (nodes + edges), is validated for
//! acyclicity at load time, and is then executed per event by walking the
//! nodes in topological order. Node types are a tagged registry mapping a
//! type string to a constructor, so a designer can compose graphs without
//! the core knowing about them at compile time.
//!
//! Per-node state (tracker pairs, window accumulators) is owned exclusively
//! by the node instance. A node fault for one event goes to the dead-letter
//! queue and, when wired, down that node's `error` port; other paths and
//! other events are unaffected.

use crate::dead_letter::DeadLetterQueue;
use crate::enrich::{lookup_with_deadline, EnrichmentCache, EnrichmentProvider};
use crate::metrics::Metrics;
use crate::sink::{Output, WorkflowOutput};
use crate::spatial::SpatialIndex;
use crate::tracker::{EntityStateTracker, TrackerConfig};
use crate::window::{WindowAggregator, WindowKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use meridian_core::{
    FxIndexMap, GeoEvent, PipelineError, Result, SharedGeoEvent, Value,
};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default output port.
pub const PORT_OUT: &str = "out";
/// Port taken on node-level errors and enrich timeouts.
pub const PORT_ERROR: &str = "error";

/// One node in a workflow definition.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_port() -> String {
    PORT_OUT.to_string()
}

/// One edge. `port` selects which output of `from` feeds `to`.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default = "default_port")]
    pub port: String,
}

/// A workflow as loaded from the designer: pure data, no behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

impl WorkflowDefinition {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::Validation(format!("workflow definition: {e}")))
    }
}

/// Shared evaluation context for one event's pass through a workflow.
pub struct NodeContext {
    /// Consistent spatial snapshot for the whole pass.
    pub index: Arc<SpatialIndex>,
    /// Effective watermark at which the event is being processed.
    pub watermark: Option<DateTime<Utc>>,
    /// Transitions and aggregates emitted during the pass.
    pub emissions: Vec<Output>,
}

impl NodeContext {
    pub fn new(index: Arc<SpatialIndex>, watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            index,
            watermark,
            emissions: Vec::new(),
        }
    }
}

/// The node capability: evaluate one event into zero or more (port, event)
/// pairs. Mutable because nodes own their accumulators and pair state.
#[async_trait]
pub trait WorkflowNode: Send {
    async fn evaluate(
        &mut self,
        event: &SharedGeoEvent,
        ctx: &mut NodeContext,
    ) -> Result<Vec<(String, SharedGeoEvent)>>;

    /// Flush any node-held state at shutdown, emitting into `ctx`.
    fn drain(&mut self, _ctx: &mut NodeContext) {}
}

type NodeCtor =
    Box<dyn Fn(&str, &serde_json::Value) -> Result<Box<dyn WorkflowNode>> + Send + Sync>;

/// Tagged registry mapping a node type string to its constructor.
pub struct NodeRegistry {
    ctors: FxHashMap<String, NodeCtor>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            ctors: FxHashMap::default(),
        }
    }

    /// Registry with the built-in node kinds. `providers` backs `enrich`
    /// nodes by name.
    pub fn with_builtins(providers: FxHashMap<String, Arc<dyn EnrichmentProvider>>) -> Self {
        let mut registry = Self::new();
        registry.register("filter", |id, cfg| {
            Ok(Box::new(FilterNode::from_config(id, cfg)?) as Box<dyn WorkflowNode>)
        });
        registry.register("transform", |id, cfg| {
            Ok(Box::new(TransformNode::from_config(id, cfg)?) as Box<dyn WorkflowNode>)
        });
        registry.register("branch", |id, cfg| {
            Ok(Box::new(BranchNode::from_config(id, cfg)?) as Box<dyn WorkflowNode>)
        });
        registry.register("geofence_check", |id, cfg| {
            Ok(Box::new(GeofenceCheckNode::from_config(id, cfg)?) as Box<dyn WorkflowNode>)
        });
        registry.register("aggregate", |id, cfg| {
            Ok(Box::new(AggregateNode::from_config(id, cfg)?) as Box<dyn WorkflowNode>)
        });
        registry.register("enrich", move |id, cfg| {
            Ok(Box::new(EnrichNode::from_config(id, cfg, &providers)?) as Box<dyn WorkflowNode>)
        });
        registry
    }

    pub fn register<F>(&mut self, node_type: &str, ctor: F)
    where
        F: Fn(&str, &serde_json::Value) -> Result<Box<dyn WorkflowNode>> + Send + Sync + 'static,
    {
        self.ctors.insert(node_type.to_string(), Box::new(ctor));
    }

    pub fn build(&self, spec: &NodeSpec) -> Result<Box<dyn WorkflowNode>> {
        let ctor = self.ctors.get(&spec.node_type).ok_or_else(|| {
            PipelineError::Validation(format!(
                "unknown node type '{}' for node '{}'",
                spec.node_type, spec.id
            ))
        })?;
        ctor(&spec.id, &spec.config)
    }

    pub fn known_types(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct NodeSlot {
    id: String,
    node: Box<dyn WorkflowNode>,
}

/// A loaded, validated, executable workflow. Built once from a definition;
/// replaced wholesale between events, never mutated mid-event.
pub struct Workflow {
    name: Arc<str>,
    nodes: Vec<NodeSlot>,
    /// Node indices in topological order.
    order: Vec<usize>,
    /// Nodes with no incoming edges; every event starts there.
    sources: Vec<usize>,
    /// (node index, port) -> downstream node indices.
    routes: FxHashMap<(usize, String), Vec<usize>>,
}

impl Workflow {
    /// Build and validate. Rejects duplicate ids, dangling edges and cycles.
    pub fn build(def: &WorkflowDefinition, registry: &NodeRegistry) -> Result<Self> {
        if def.nodes.is_empty() {
            return Err(PipelineError::Workflow(format!(
                "workflow '{}' has no nodes",
                def.name
            )));
        }

        let mut index_of: FxHashMap<&str, usize> = FxHashMap::default();
        for (i, spec) in def.nodes.iter().enumerate() {
            if index_of.insert(spec.id.as_str(), i).is_some() {
                return Err(PipelineError::Workflow(format!(
                    "duplicate node id '{}'",
                    spec.id
                )));
            }
        }

        let mut routes: FxHashMap<(usize, String), Vec<usize>> = FxHashMap::default();
        let mut in_degree = vec![0usize; def.nodes.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); def.nodes.len()];
        for edge in &def.edges {
            let from = *index_of.get(edge.from.as_str()).ok_or_else(|| {
                PipelineError::Workflow(format!("edge from unknown node '{}'", edge.from))
            })?;
            let to = *index_of.get(edge.to.as_str()).ok_or_else(|| {
                PipelineError::Workflow(format!("edge to unknown node '{}'", edge.to))
            })?;
            routes.entry((from, edge.port.clone())).or_default().push(to);
            successors[from].push(to);
            in_degree[to] += 1;
        }

        // Kahn's algorithm; a leftover node means a cycle.
        let sources: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut queue: std::collections::VecDeque<usize> = sources.iter().copied().collect();
        let mut degrees = in_degree;
        let mut order = Vec::with_capacity(def.nodes.len());
        while let Some(n) = queue.pop_front() {
            order.push(n);
            for &next in &successors[n] {
                degrees[next] -= 1;
                if degrees[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if order.len() != def.nodes.len() {
            return Err(PipelineError::Workflow(format!(
                "workflow '{}' contains a cycle",
                def.name
            )));
        }

        let mut nodes = Vec::with_capacity(def.nodes.len());
        for spec in &def.nodes {
            nodes.push(NodeSlot {
                id: spec.id.clone(),
                node: registry.build(spec)?,
            });
        }

        debug!(workflow = %def.name, nodes = nodes.len(), "workflow loaded");
        Ok(Self {
            name: Arc::from(def.name.as_str()),
            nodes,
            order,
            sources,
            routes,
        })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Push one event through the graph. Returns terminal workflow outputs
    /// plus everything the nodes emitted into the context during the pass.
    pub async fn execute(
        &mut self,
        event: &SharedGeoEvent,
        ctx: &mut NodeContext,
        dlq: Option<&DeadLetterQueue>,
        metrics: Option<&Metrics>,
    ) -> Vec<Output> {
        let mut inboxes: Vec<Vec<SharedGeoEvent>> = vec![Vec::new(); self.nodes.len()];
        for &s in &self.sources {
            inboxes[s].push(event.clone());
        }

        let mut outputs = Vec::new();
        for pos in 0..self.order.len() {
            let idx = self.order[pos];
            let inbox = std::mem::take(&mut inboxes[idx]);
            for ev in inbox {
                match self.nodes[idx].node.evaluate(&ev, ctx).await {
                    Ok(emitted) => {
                        for (port, out_ev) in emitted {
                            match self.routes.get(&(idx, port.clone())) {
                                Some(targets) => {
                                    for &t in targets {
                                        inboxes[t].push(out_ev.clone());
                                    }
                                }
                                // No matched edge: the path terminates here
                                // as a named workflow output.
                                None => outputs.push(Output::Workflow(WorkflowOutput {
                                    workflow: self.name.clone(),
                                    node: self.nodes[idx].id.clone(),
                                    port,
                                    event: out_ev,
                                })),
                            }
                        }
                    }
                    Err(e) => {
                        let node_id = &self.nodes[idx].id;
                        warn!(workflow = %self.name, node = %node_id, error = %e, "node fault isolated");
                        if let Some(m) = metrics {
                            m.record_error(e.kind());
                        }
                        if let Some(dlq) = dlq {
                            dlq.write(&self.name, node_id, &e.to_string(), &ev);
                        }
                        if let Some(targets) = self.routes.get(&(idx, PORT_ERROR.to_string())) {
                            for &t in targets {
                                inboxes[t].push(ev.clone());
                            }
                        }
                    }
                }
            }
        }

        outputs.append(&mut ctx.emissions);
        outputs
    }

    /// Flush node-held state (open windows) at shutdown.
    pub fn drain(&mut self, ctx: &mut NodeContext) -> Vec<Output> {
        for slot in &mut self.nodes {
            slot.node.drain(ctx);
        }
        std::mem::take(&mut ctx.emissions)
    }
}

// ---------------------------------------------------------------------------
// Built-in nodes
// ---------------------------------------------------------------------------

fn parse_config<'a, T: Deserialize<'a>>(id: &str, cfg: &'a serde_json::Value) -> Result<T> {
    T::deserialize(cfg)
        .map_err(|e| PipelineError::Validation(format!("node '{id}' config: {e}")))
}

/// Field predicate shared by filter and branch nodes.
#[derive(Debug, Clone, Deserialize)]
struct Predicate {
    field: String,
    op: String,
    #[serde(default)]
    value: Option<Value>,
}

impl Predicate {
    fn validate(&self, id: &str) -> Result<()> {
        match self.op.as_str() {
            "exists" => Ok(()),
            "==" | "!=" | ">" | ">=" | "<" | "<=" if self.value.is_some() => Ok(()),
            "==" | "!=" | ">" | ">=" | "<" | "<=" => Err(PipelineError::Validation(format!(
                "node '{id}': op '{}' requires a value",
                self.op
            ))),
            other => Err(PipelineError::Validation(format!(
                "node '{id}': unknown op '{other}'"
            ))),
        }
    }

    fn matches(&self, event: &GeoEvent) -> bool {
        let actual = event.get(&self.field);
        match self.op.as_str() {
            "exists" => actual.is_some(),
            "==" => loose_eq(actual, self.value.as_ref()),
            "!=" => !loose_eq(actual, self.value.as_ref()),
            op => {
                let (Some(a), Some(b)) = (
                    actual.and_then(Value::as_float),
                    self.value.as_ref().and_then(Value::as_float),
                ) else {
                    return false;
                };
                match op {
                    ">" => a > b,
                    ">=" => a >= b,
                    "<" => a < b,
                    "<=" => a <= b,
                    _ => false,
                }
            }
        }
    }
}

/// Equality with numeric coercion: a config written as `5` matches a field
/// ingested as `5.0`. Non-numeric values compare structurally.
fn loose_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => a == b,
    }
}

/// Pass events matching a predicate, drop the rest.
struct FilterNode {
    predicate: Predicate,
}

impl FilterNode {
    fn from_config(id: &str, cfg: &serde_json::Value) -> Result<Self> {
        let predicate: Predicate = parse_config(id, cfg)?;
        predicate.validate(id)?;
        Ok(Self { predicate })
    }
}

#[async_trait]
impl WorkflowNode for FilterNode {
    async fn evaluate(
        &mut self,
        event: &SharedGeoEvent,
        _ctx: &mut NodeContext,
    ) -> Result<Vec<(String, SharedGeoEvent)>> {
        if self.predicate.matches(event) {
            Ok(vec![(PORT_OUT.to_string(), event.clone())])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Route to `true` or `false` ports on a predicate.
struct BranchNode {
    predicate: Predicate,
}

impl BranchNode {
    fn from_config(id: &str, cfg: &serde_json::Value) -> Result<Self> {
        let predicate: Predicate = parse_config(id, cfg)?;
        predicate.validate(id)?;
        Ok(Self { predicate })
    }
}

#[async_trait]
impl WorkflowNode for BranchNode {
    async fn evaluate(
        &mut self,
        event: &SharedGeoEvent,
        _ctx: &mut NodeContext,
    ) -> Result<Vec<(String, SharedGeoEvent)>> {
        let port = if self.predicate.matches(event) {
            "true"
        } else {
            "false"
        };
        Ok(vec![(port.to_string(), event.clone())])
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TransformConfig {
    /// Properties to set to literal values.
    #[serde(default)]
    set: FxIndexMap<String, Value>,
    /// Properties to copy from other properties (to <- from).
    #[serde(default)]
    copy: FxIndexMap<String, String>,
    /// Properties to remove.
    #[serde(default)]
    drop: Vec<String>,
    /// Replace the event type.
    #[serde(default)]
    event_type: Option<String>,
}

/// Field mapping and derivation.
struct TransformNode {
    config: TransformConfig,
}

impl TransformNode {
    fn from_config(id: &str, cfg: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            config: parse_config(id, cfg)?,
        })
    }
}

#[async_trait]
impl WorkflowNode for TransformNode {
    async fn evaluate(
        &mut self,
        event: &SharedGeoEvent,
        _ctx: &mut NodeContext,
    ) -> Result<Vec<(String, SharedGeoEvent)>> {
        let mut next = (**event).clone();
        for (key, value) in &self.config.set {
            next.properties.insert(key.clone(), value.clone());
        }
        for (to, from) in &self.config.copy {
            if let Some(v) = event.get(from) {
                next.properties.insert(to.clone(), v.clone());
            }
        }
        for key in &self.config.drop {
            next.properties.shift_remove(key);
        }
        if let Some(t) = &self.config.event_type {
            next.event_type = Arc::from(t.as_str());
        }
        Ok(vec![(PORT_OUT.to_string(), Arc::new(next))])
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GeofenceCheckConfig {
    #[serde(default = "default_dwell_secs")]
    dwell_threshold_secs: i64,
    #[serde(default = "default_approach_m")]
    approach_radius_m: f64,
    #[serde(default = "default_linger_m")]
    linger_radius_m: f64,
    #[serde(default = "default_linger_secs")]
    linger_threshold_secs: i64,
    /// Annotate the passing event with containment results.
    #[serde(default = "default_true")]
    annotate: bool,
}

fn default_dwell_secs() -> i64 {
    60
}
fn default_approach_m() -> f64 {
    250.0
}
fn default_linger_m() -> f64 {
    100.0
}
fn default_linger_secs() -> i64 {
    120
}
fn default_true() -> bool {
    true
}

/// Containment and transition detection against the live index. The node
/// owns its tracker; two geofence_check nodes in one graph track
/// independently.
struct GeofenceCheckNode {
    tracker: EntityStateTracker,
    annotate: bool,
}

impl GeofenceCheckNode {
    fn from_config(id: &str, cfg: &serde_json::Value) -> Result<Self> {
        let config: GeofenceCheckConfig = parse_config(id, cfg)?;
        Ok(Self {
            tracker: EntityStateTracker::new(TrackerConfig {
                dwell_threshold: Duration::seconds(config.dwell_threshold_secs),
                approach_radius_m: config.approach_radius_m,
                linger_radius_m: config.linger_radius_m,
                linger_threshold: Duration::seconds(config.linger_threshold_secs),
                ..TrackerConfig::default()
            }),
            annotate: config.annotate,
        })
    }
}

#[async_trait]
impl WorkflowNode for GeofenceCheckNode {
    async fn evaluate(
        &mut self,
        event: &SharedGeoEvent,
        ctx: &mut NodeContext,
    ) -> Result<Vec<(String, SharedGeoEvent)>> {
        let containing = ctx.index.query_at(&event.location, event.event_time);
        let transitions = self.tracker.update(event, &ctx.index);

        let out_event = if self.annotate {
            let mut next = (**event).clone();
            next.properties.insert(
                "geofences".to_string(),
                Value::Array(
                    containing
                        .iter()
                        .map(|f| Value::Str(f.id.to_string()))
                        .collect(),
                ),
            );
            if let Some(first) = transitions.first() {
                next.properties.insert(
                    "transition".to_string(),
                    Value::Str(first.event_type.as_str().to_string()),
                );
            }
            Arc::new(next)
        } else {
            event.clone()
        };

        let mut ports = vec![(PORT_OUT.to_string(), out_event.clone())];
        if !transitions.is_empty() {
            // Extra port for graphs that only care about boundary crossings.
            ports.push(("transition".to_string(), out_event));
        }
        for t in transitions {
            ctx.emissions.push(Output::Transition(t));
        }
        Ok(ports)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AggregateConfig {
    /// Property to group by; entity id when absent.
    #[serde(default)]
    key_field: Option<String>,
    #[serde(flatten)]
    window: WindowKind,
    #[serde(default)]
    grace_ms: i64,
    aggregates: Vec<AggregateSpecConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct AggregateSpecConfig {
    func: String,
    #[serde(default)]
    field: Option<String>,
}

/// Windowed aggregation over the passing stream. Owns its accumulators.
struct AggregateNode {
    key_field: Option<String>,
    aggregator: WindowAggregator,
}

impl AggregateNode {
    fn from_config(id: &str, cfg: &serde_json::Value) -> Result<Self> {
        let config: AggregateConfig = parse_config(id, cfg)?;
        let aggs = config
            .aggregates
            .iter()
            .map(|a| {
                Ok(crate::aggregate::AggSpec {
                    func: crate::aggregate::AggFunc::parse(&a.func)?,
                    field: a.field.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            key_field: config.key_field,
            aggregator: WindowAggregator::new(
                config.window,
                Duration::milliseconds(config.grace_ms),
                aggs,
            )?,
        })
    }
}

#[async_trait]
impl WorkflowNode for AggregateNode {
    async fn evaluate(
        &mut self,
        event: &SharedGeoEvent,
        ctx: &mut NodeContext,
    ) -> Result<Vec<(String, SharedGeoEvent)>> {
        let key: Arc<str> = match &self.key_field {
            Some(f) => match event.get(f) {
                Some(v) => Arc::from(v.to_string().as_str()),
                None => event.entity_id.clone(),
            },
            None => event.entity_id.clone(),
        };
        self.aggregator.add(key, event, ctx.watermark);
        if let Some(wm) = ctx.watermark {
            for result in self.aggregator.advance(wm) {
                ctx.emissions.push(Output::Aggregate(result));
            }
        }
        Ok(vec![(PORT_OUT.to_string(), event.clone())])
    }

    fn drain(&mut self, ctx: &mut NodeContext) {
        for result in self.aggregator.flush() {
            ctx.emissions.push(Output::Aggregate(result));
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EnrichConfig {
    provider: String,
    /// Property used as the lookup key; entity id when absent.
    #[serde(default)]
    key_field: Option<String>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default = "default_budget_ms")]
    budget_ms: u64,
    #[serde(default)]
    cache_ttl_secs: Option<u64>,
}

fn default_budget_ms() -> u64 {
    500
}

/// External lookup with a hard deadline. Timeout and lookup errors route
/// the original event down the `error` port with an annotation instead of
/// blocking or faulting the graph.
struct EnrichNode {
    provider: Arc<dyn EnrichmentProvider>,
    cache: Option<EnrichmentCache>,
    key_field: Option<String>,
    fields: Vec<String>,
    budget: std::time::Duration,
}

impl EnrichNode {
    fn from_config(
        id: &str,
        cfg: &serde_json::Value,
        providers: &FxHashMap<String, Arc<dyn EnrichmentProvider>>,
    ) -> Result<Self> {
        let config: EnrichConfig = parse_config(id, cfg)?;
        let provider = providers.get(&config.provider).cloned().ok_or_else(|| {
            PipelineError::Validation(format!(
                "node '{id}': unknown enrichment provider '{}'",
                config.provider
            ))
        })?;
        Ok(Self {
            provider,
            cache: config
                .cache_ttl_secs
                .map(|s| EnrichmentCache::new(std::time::Duration::from_secs(s))),
            key_field: config.key_field,
            fields: config.fields,
            budget: std::time::Duration::from_millis(config.budget_ms),
        })
    }
}

#[async_trait]
impl WorkflowNode for EnrichNode {
    async fn evaluate(
        &mut self,
        event: &SharedGeoEvent,
        _ctx: &mut NodeContext,
    ) -> Result<Vec<(String, SharedGeoEvent)>> {
        let key = match &self.key_field {
            Some(f) => event
                .get(f)
                .cloned()
                .unwrap_or_else(|| Value::Str(event.entity_id.to_string())),
            None => Value::Str(event.entity_id.to_string()),
        };

        match lookup_with_deadline(
            self.provider.as_ref(),
            self.cache.as_ref(),
            &key,
            &self.fields,
            self.budget,
        )
        .await
        {
            Ok(result) => {
                let mut next = (**event).clone();
                for (k, v) in result.fields {
                    next.properties.insert(k, v);
                }
                Ok(vec![(PORT_OUT.to_string(), Arc::new(next))])
            }
            Err(e) => {
                let mut next = (**event).clone();
                next.properties
                    .insert("enrich_error".to_string(), Value::Str(e.to_string()));
                Ok(vec![(PORT_ERROR.to_string(), Arc::new(next))])
            }
        }
    }
}
