//! Memory collaborator surface.
//!
//! The executor treats memory as an opaque key/value store plus an append-only
//! log of remembered entries. It never interprets the contents; it only hands
//! a reference to every tool handler's context. Concurrent access is the
//! store's own responsibility.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// One remembered entry in the append log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Capability set the executor passes through to tool handlers.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;
    async fn remember(&self, entry: MemoryEntry) -> anyhow::Result<()>;
}

/// Non-persistent in-process memory store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    kv: Arc<RwLock<HashMap<String, Value>>>,
    log: Arc<RwLock<Vec<MemoryEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the append log, oldest first.
    pub async fn entries(&self) -> Vec<MemoryEntry> {
        self.log.read().await.clone()
    }
}

#[async_trait]
impl Memory for InMemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.kv.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.kv.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remember(&self, entry: MemoryEntry) -> anyhow::Result<()> {
        self.log.write().await.push(entry);
        Ok(())
    }
}
