//! # planrun
//!
//! Task-graph executor with embedded safety policy enforcement.
//!
//! Takes a declarative plan of tool invocations produced by an AI planner,
//! executes it under a hard node budget, and gates every invocation through a
//! risk-tiered consent/domain policy before it is allowed to run.
//!
//! ## Architecture
//!
//! ```text
//!  Planner ──▶ Plan ──▶ PlanRunner ──(per node)──▶ SafetyEvaluator
//!                           │                           │ allowed
//!                           │                           ▼
//!                           │                      ToolRegistry ──▶ handler
//!                           │                           │
//!                           └──◀── NodeOutcome ◀────────┘
//!                           ▼
//!                       RunResult ──▶ caller / UI
//! ```
//!
//! ## Run Flow
//! 1. Validate the plan's dependency graph (cycles and duplicate ids fail fast)
//! 2. Compute a deterministic topological order and truncate to the node budget
//! 3. Gate each node through risk classification, domain rules, and consent
//! 4. Dispatch allowed nodes to their handlers, independent nodes in parallel
//! 5. Aggregate per-node outcomes; partial success is the normal case
//!
//! ## Modules
//! - `plan`: plan data model and ordering
//! - `safety`: risk tiers, domain policy, consent providers
//! - `tools`: the `Tool` trait, registry, and built-in memory tools
//! - `executor`: the `PlanRunner` control loop
//! - `memory`: the memory collaborator surface

pub mod error;
pub mod executor;
pub mod memory;
pub mod plan;
pub mod safety;
pub mod tools;

pub use error::NodeError;
pub use executor::{NodeOutcome, PlanRunner, RunEvent, RunOptions, RunResult, RunStatus};
pub use memory::{InMemoryStore, Memory, MemoryEntry};
pub use plan::{Plan, PlanError, PlanNode};
pub use safety::{
    ConsentLedger, ConsentProvider, ConsentResponse, DenyAll, RiskTier, SafetyDecision,
    SafetyEvaluator, SafetyPolicy,
};
pub use tools::{Tool, ToolContext, ToolInfo, ToolRegistry};
