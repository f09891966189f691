//! Sink implementations for emitted pipeline output.

use crate::window::AggregateResult;
use anyhow::Result;
use async_trait::async_trait;
use meridian_core::{GeofenceEvent, SharedGeoEvent};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

/// An event routed out of a workflow through a named port.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutput {
    pub workflow: Arc<str>,
    pub node: String,
    pub port: String,
    pub event: SharedGeoEvent,
}

/// Everything the pipeline can emit to the outside.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Output {
    Transition(GeofenceEvent),
    Aggregate(AggregateResult),
    Workflow(WorkflowOutput),
}

/// Trait for output sinks. Emission is synchronous per call; delivery,
/// retry and batching live in the connector behind the sink.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, output: &Output) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}

/// Console sink - prints JSON lines to stdout
pub struct ConsoleSink {
    name: String,
}

impl ConsoleSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, output: &Output) -> Result<()> {
        println!("{}", serde_json::to_string(output)?);
        Ok(())
    }
}

/// File sink - appends JSON lines to a file
pub struct FileSink {
    name: String,
    #[allow(dead_code)]
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl FileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            name: name.into(),
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, output: &Output) -> Result<()> {
        let json = serde_json::to_string(output)?;
        let mut file = self.file.lock().await;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush()?;
        Ok(())
    }
}

/// Collect sink - buffers outputs in memory, for tests and embedding
#[derive(Default)]
pub struct CollectSink {
    outputs: Mutex<Vec<Output>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn take(&self) -> Vec<Output> {
        std::mem::take(&mut *self.outputs.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.outputs.lock().await.len()
    }
}

#[async_trait]
impl Sink for CollectSink {
    fn name(&self) -> &str {
        "collect"
    }

    async fn send(&self, output: &Output) -> Result<()> {
        self.outputs.lock().await.push(output.clone());
        Ok(())
    }
}

/// Multi-sink that broadcasts to multiple sinks. One failing sink is logged
/// and skipped, not propagated.
pub struct MultiSink {
    name: String,
    sinks: Vec<Arc<dyn Sink>>,
}

impl MultiSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sinks: Vec::new(),
        }
    }

    pub fn add(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl Sink for MultiSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, output: &Output) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.send(output).await {
                error!("sink {} error: {}", sink.name(), e);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.close().await?;
        }
        Ok(())
    }
}
