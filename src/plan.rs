//! Plan data model and structural validation.
//!
//! A [`Plan`] is a DAG of tool-invocation nodes produced by a planner and
//! submitted once for execution. The executor never mutates a plan; it only
//! validates it and derives an execution order from it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A declarative plan: a set of tool invocations with dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Planner-assigned identifier, used for correlation only.
    pub id: String,
    /// Nodes in declaration order. Order matters as the tie-break for
    /// scheduling, not as an execution guarantee.
    pub nodes: Vec<PlanNode>,
}

/// A single tool invocation within a plan.
///
/// # Invariants
/// - `id` is unique within the plan
/// - `depends_on` references ids within the same plan
/// - the `depends_on` relation is acyclic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub id: String,
    /// Tool name; resolved against the registry at execution time.
    pub tool: String,
    /// Opaque structured input, passed to the handler as-is.
    #[serde(default)]
    pub input: Value,
    /// Ids of nodes that must succeed before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl PlanNode {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            input,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Structural plan errors, detected before any node executes.
///
/// These are fatal to the whole run: no consent is requested and no tool is
/// resolved once one of these is found.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanError {
    #[error("duplicate node id '{id}' in plan")]
    DuplicateNodeId { id: String },

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle involving node '{node}'")]
    CycleDetected { node: String },
}

impl Plan {
    pub fn new(id: impl Into<String>, nodes: Vec<PlanNode>) -> Self {
        Self {
            id: id.into(),
            nodes,
        }
    }

    /// Validate the plan and compute a deterministic execution order.
    ///
    /// Kahn's algorithm with a declaration-order tie-break: among nodes whose
    /// dependencies are all satisfied, the earliest-declared runs first. This
    /// makes budget truncation reproducible across runs.
    ///
    /// Returns indices into `self.nodes`.
    ///
    /// # Errors
    /// - [`PlanError::DuplicateNodeId`] if two nodes share an id
    /// - [`PlanError::UnknownDependency`] if an edge points outside the plan
    /// - [`PlanError::CycleDetected`] if the dependency relation has a cycle
    pub fn execution_order(&self) -> Result<Vec<usize>, PlanError> {
        let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if index_of.insert(node.id.as_str(), i).is_some() {
                return Err(PlanError::DuplicateNodeId {
                    id: node.id.clone(),
                });
            }
        }

        let mut indegree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let mut seen: HashSet<&str> = HashSet::new();
            for dep in &node.depends_on {
                let Some(&dep_idx) = index_of.get(dep.as_str()) else {
                    return Err(PlanError::UnknownDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                // Repeated edges count once.
                if seen.insert(dep.as_str()) {
                    indegree[i] += 1;
                    dependents[dep_idx].push(i);
                }
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut placed = vec![false; self.nodes.len()];
        while order.len() < self.nodes.len() {
            // Declaration-order scan keeps the tie-break stable.
            let next = (0..self.nodes.len()).find(|&i| !placed[i] && indegree[i] == 0);
            let Some(i) = next else {
                let stuck = (0..self.nodes.len())
                    .find(|&i| !placed[i])
                    .expect("unplaced node must exist when ordering is stuck");
                return Err(PlanError::CycleDetected {
                    node: self.nodes[stuck].id.clone(),
                });
            };
            placed[i] = true;
            for &dep in &dependents[i] {
                indegree[dep] -= 1;
            }
            order.push(i);
        }

        Ok(order)
    }
}
