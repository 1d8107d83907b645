//! Memory tools - let plan nodes store and recall facts through the run's
//! memory collaborator.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Tool, ToolContext};
use crate::memory::MemoryEntry;

/// Tool for appending a fact to the memory log.
pub struct StoreFact;

#[derive(Debug, Deserialize)]
struct StoreFactArgs {
    content: String,
    #[serde(default)]
    category: Option<String>,
}

#[async_trait]
impl Tool for StoreFact {
    fn name(&self) -> &str {
        "store_fact"
    }

    fn description(&self) -> &str {
        "Store a fact in long-term memory so later runs can recall it."
    }

    async fn invoke(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let args: StoreFactArgs = serde_json::from_value(input)?;

        let mut entry = MemoryEntry::new(args.content);
        if let Some(category) = args.category {
            entry = entry.with_category(category);
        }
        ctx.memory.remember(entry).await?;

        Ok(json!({"stored": true}))
    }
}

/// Tool for reading a value from the memory key/value surface.
pub struct RecallFact;

#[derive(Debug, Deserialize)]
struct RecallFactArgs {
    key: String,
}

#[async_trait]
impl Tool for RecallFact {
    fn name(&self) -> &str {
        "recall_fact"
    }

    fn description(&self) -> &str {
        "Recall a value previously stored under a key."
    }

    async fn invoke(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let args: RecallFactArgs = serde_json::from_value(input)?;
        let value = ctx.memory.get(&args.key).await?;
        Ok(json!({
            "key": args.key,
            "value": value,
        }))
    }
}
