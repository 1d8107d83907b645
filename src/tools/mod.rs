//! Tool system.
//!
//! Tools are the hands of the agent: each one wraps a single capability
//! (scrape a page, manage tabs, store a fact) behind the [`Tool`] trait. The
//! registry maps tool names to handlers and is owned by the executor that was
//! constructed with it — there is no process-global registry, so tests and
//! embedders can run isolated tool sets side by side.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::memory::Memory;
use crate::safety::SafetyPolicy;

pub use memory::{RecallFact, StoreFact};

/// Context handed to every handler invocation.
///
/// `safety` is the exact policy the run was started with, so handlers can
/// inspect the rules they execute under. `memory` is the externally owned
/// store; the executor never serializes access to it.
#[derive(Clone)]
pub struct ToolContext {
    pub safety: SafetyPolicy,
    pub run_id: String,
    pub memory: Arc<dyn Memory>,
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Trait for implementing tools.
///
/// A handler failing returns an error; it must never panic the executor. The
/// executor maps handler errors to per-node outcomes and keeps the run alive.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// Execute the tool with the given input.
    async fn invoke(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

/// Registry of available tools.
///
/// Populated once at startup and treated as read-only while runs are active.
/// Registration is last-write-wins so tests can override a tool with a mock.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Create a registry with the built-in memory tools.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(memory::StoreFact));
        registry.register(Arc::new(memory::RecallFact));
        tracing::debug!(count = registry.tools.len(), "registered built-in tools");
        registry
    }

    /// Register a tool under its own name. Last registration wins.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "tool registration overwritten");
        }
    }

    /// Look up a handler by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all available tools.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }
}
