//! Memory/persistence boundary
//!
//! The engine treats persistence as optional: a store handle is injected
//! at construction time (never a process-wide singleton), and its absence
//! only disables cross-run execution history - scheduling itself never
//! touches the store on the hot path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::Result;

/// Options for store/retrieve/list calls
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub namespace: Option<String>,
    pub ttl: Option<Duration>,
    pub limit: Option<usize>,
}

impl StoreOptions {
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One stored entry, as returned by `list`
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub key: String,
    pub value: Value,
}

/// External key-value store boundary (namespaced keys, optional TTL)
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn store(&self, key: &str, value: Value, opts: &StoreOptions) -> Result<()>;
    async fn retrieve(&self, key: &str, opts: &StoreOptions) -> Result<Option<Value>>;
    async fn list(&self, opts: &StoreOptions) -> Result<Vec<StoreEntry>>;
    async fn delete(&self, key: &str, opts: &StoreOptions) -> Result<()>;
}

struct Stored {
    value: Value,
    expires_at: Option<Instant>,
}

impl Stored {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-process reference implementation: DashMap-backed, TTL enforced
/// lazily on read.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Stored>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(key: &str, opts: &StoreOptions) -> String {
        match &opts.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store(&self, key: &str, value: Value, opts: &StoreOptions) -> Result<()> {
        self.entries.insert(
            Self::full_key(key, opts),
            Stored {
                value,
                expires_at: opts.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn retrieve(&self, key: &str, opts: &StoreOptions) -> Result<Option<Value>> {
        let full = Self::full_key(key, opts);
        if let Some(entry) = self.entries.get(&full) {
            if !entry.expired() {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Drop expired entries on the way out
        self.entries.remove_if(&full, |_, v| v.expired());
        Ok(None)
    }

    async fn list(&self, opts: &StoreOptions) -> Result<Vec<StoreEntry>> {
        let prefix = opts
            .namespace
            .as_ref()
            .map(|ns| format!("{}:", ns))
            .unwrap_or_default();
        let mut entries: Vec<StoreEntry> = self
            .entries
            .iter()
            .filter(|r| !r.value().expired() && r.key().starts_with(&prefix))
            .map(|r| StoreEntry {
                key: r.key()[prefix.len()..].to_string(),
                value: r.value().value.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(limit) = opts.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str, opts: &StoreOptions) -> Result<()> {
        self.entries.remove(&Self::full_key(key, opts));
        Ok(())
    }
}

/// Convenience alias for the injected handle
pub type SharedStore = Arc<dyn MemoryStore>;
