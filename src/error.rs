//! Per-node error taxonomy.
//!
//! Only structural plan problems ([`crate::plan::PlanError`]) abort a run.
//! Everything here is localized to a single node and reported inside the
//! `RunResult`, so partial-success runs are the normal case.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single node did not produce an output.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    /// The node references a tool with no registration.
    #[error("unknown tool '{tool}'")]
    ToolNotFound { tool: String },

    /// The safety evaluator refused the invocation.
    #[error("blocked by safety policy: {reason}")]
    SafetyDenied { reason: String },

    /// A declared dependency did not succeed, so this node never started.
    #[error("dependency '{dependency}' did not succeed")]
    DependencyFailed { dependency: String },

    /// The handler itself returned an error.
    #[error("tool execution failed: {message}")]
    ToolExecutionFailed { message: String },

    /// The run was cancelled while this node was pending or in flight.
    #[error("run cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::SafetyDenied {
            reason: reason.into(),
        }
    }

    pub fn execution_failed(err: &anyhow::Error) -> Self {
        Self::ToolExecutionFailed {
            message: format!("{err:#}"),
        }
    }
}
