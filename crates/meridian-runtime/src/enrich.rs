//! External lookup enrichment with TTL caching and bounded deadlines.
//!
//! Providers are the seam to external stores; the core only knows the
//! [`EnrichmentProvider`] trait, a deadline, and a cache. Wire protocols
//! live in connectors behind the trait.

use async_trait::async_trait;
use meridian_core::{FxIndexMap, Value};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Maximum cache entries before eviction.
const MAX_ENTRIES: usize = 100_000;

/// Result of an enrichment lookup.
#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub fields: FxIndexMap<String, Value>,
    /// Whether this result came from cache.
    pub cached: bool,
}

/// Error during enrichment lookup.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found for key: {0}")]
    NotFound(String),
}

/// Trait for enrichment data providers.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Look up enrichment data by key.
    async fn lookup(
        &self,
        key: &Value,
        fields: &[String],
    ) -> Result<EnrichmentResult, EnrichmentError>;

    /// Provider name for logging.
    fn provider_name(&self) -> &str;
}

/// In-memory provider backed by a fixed table. Useful for tests and for
/// embedding small reference datasets (fleet registries, driver rosters).
pub struct StaticProvider {
    name: String,
    table: FxHashMap<String, FxIndexMap<String, Value>>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: FxHashMap::default(),
        }
    }

    pub fn with_row(mut self, key: impl Into<String>, row: FxIndexMap<String, Value>) -> Self {
        self.table.insert(key.into(), row);
        self
    }
}

#[async_trait]
impl EnrichmentProvider for StaticProvider {
    async fn lookup(
        &self,
        key: &Value,
        fields: &[String],
    ) -> Result<EnrichmentResult, EnrichmentError> {
        let key_str = key.to_string();
        let row = self
            .table
            .get(&key_str)
            .ok_or_else(|| EnrichmentError::NotFound(key_str.clone()))?;
        let fields = if fields.is_empty() {
            row.clone()
        } else {
            fields
                .iter()
                .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
                .collect()
        };
        Ok(EnrichmentResult {
            fields,
            cached: false,
        })
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

struct CacheEntry {
    fields: FxIndexMap<String, Value>,
    expires_at: Instant,
}

/// Thread-safe TTL cache for enrichment results.
///
/// A `Mutex<FxHashMap>` is enough here: enrichment calls are I/O-bound, so
/// lock hold times are negligible against network latency.
pub struct EnrichmentCache {
    entries: Mutex<FxHashMap<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EnrichmentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a cached result. Returns None on miss or expiry.
    pub fn get(&self, key: &str) -> Option<FxIndexMap<String, Value>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.fields.clone());
            }
            entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: String, fields: FxIndexMap<String, Value>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_ENTRIES {
            let to_remove = MAX_ENTRIES / 10;
            let now = Instant::now();
            let mut stale: Vec<String> = Vec::with_capacity(to_remove);
            for (k, v) in entries.iter() {
                if v.expires_at <= now || stale.len() < to_remove {
                    stale.push(k.clone());
                }
                if stale.len() >= to_remove {
                    break;
                }
            }
            for k in stale {
                entries.remove(&k);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                fields,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Cache hit/miss counters.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Perform a cached lookup with a hard deadline. On timeout the provider
/// call is abandoned and `EnrichmentError::Timeout` returned; the caller
/// routes the event down its error path.
pub async fn lookup_with_deadline(
    provider: &dyn EnrichmentProvider,
    cache: Option<&EnrichmentCache>,
    key: &Value,
    fields: &[String],
    budget: Duration,
) -> Result<EnrichmentResult, EnrichmentError> {
    let cache_key = key.to_string();
    if let Some(cache) = cache {
        if let Some(fields) = cache.get(&cache_key) {
            return Ok(EnrichmentResult {
                fields,
                cached: true,
            });
        }
    }

    match tokio::time::timeout(budget, provider.lookup(key, fields)).await {
        Ok(Ok(result)) => {
            if let Some(cache) = cache {
                cache.insert(cache_key, result.fields.clone());
            }
            Ok(result)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!(
                provider = provider.provider_name(),
                budget_ms = budget.as_millis() as u64,
                "enrichment lookup timed out"
            );
            Err(EnrichmentError::Timeout(budget.as_millis() as u64))
        }
    }
}
