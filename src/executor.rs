//! Task-graph executor.
//!
//! Drives a [`Plan`] to completion under a node budget: validates the
//! dependency graph, computes a deterministic execution order, gates every
//! node through the [`SafetyEvaluator`], dispatches allowed nodes to the
//! [`ToolRegistry`], and aggregates per-node outcomes into a [`RunResult`].
//!
//! Independent nodes run as logically parallel tasks on a `JoinSet`; nodes
//! sharing a dependency edge are strictly sequenced. Only a structural plan
//! error aborts a run — every other failure is localized to its node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::NodeError;
use crate::memory::Memory;
use crate::plan::{Plan, PlanError, PlanNode};
use crate::safety::{ConsentProvider, SafetyEvaluator, SafetyPolicy};
use crate::tools::{ToolContext, ToolRegistry};

/// Per-run execution settings.
pub struct RunOptions {
    /// Policy forwarded verbatim into every node's context.
    pub safety: SafetyPolicy,
    /// Upper bound on how many nodes may be attempted.
    pub max_nodes: usize,
    /// Caller-supplied correlation id; not validated for uniqueness.
    pub run_id: String,
    /// Overrides the evaluator's default consent deadline for this run.
    pub consent_timeout: Option<Duration>,
    /// Cancelling this token stops new nodes and signals in-flight handlers.
    pub cancel: CancellationToken,
    /// Optional live event stream; a closed receiver is ignored.
    pub events: Option<UnboundedSender<RunEvent>>,
}

impl RunOptions {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            safety: SafetyPolicy::default(),
            max_nodes,
            run_id: uuid::Uuid::new_v4().to_string(),
            consent_timeout: None,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_safety(mut self, safety: SafetyPolicy) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_consent_timeout(mut self, timeout: Duration) -> Self {
        self.consent_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Live run telemetry for UIs.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A node passed scheduling and is being evaluated/executed.
    NodeStarted { node_id: String, tool: String },
    /// A node reached a terminal state.
    NodeFinished { outcome: NodeOutcome },
    /// The run was cancelled; no further nodes will start.
    RunCancelled,
}

/// Terminal state of one node.
///
/// Exactly one of `output` and `error` is set. Entries appear in completion
/// order, not declaration order — consumers must index by `node_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

impl NodeOutcome {
    pub fn success(node_id: impl Into<String>, output: Value) -> Self {
        Self {
            node_id: node_id.into(),
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(node_id: impl Into<String>, error: NodeError) -> Self {
        Self {
            node_id: node_id.into(),
            output: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every eligible node within budget was attempted.
    Completed,
    /// The run was cancelled; unstarted nodes produce no outcome.
    Cancelled,
}

/// Aggregated result of one plan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub results: Vec<NodeOutcome>,
    pub status: RunStatus,
}

impl RunResult {
    /// Outcome for a node, if it was attempted.
    pub fn outcome(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.results.iter().find(|o| o.node_id == node_id)
    }
}

/// The executor. Owns its tool registry and safety evaluator; holds no state
/// across runs.
pub struct PlanRunner {
    registry: Arc<ToolRegistry>,
    evaluator: Arc<SafetyEvaluator>,
}

impl PlanRunner {
    pub fn new(registry: Arc<ToolRegistry>, consent: Arc<dyn ConsentProvider>) -> Self {
        Self {
            registry,
            evaluator: Arc::new(SafetyEvaluator::new(consent)),
        }
    }

    /// Construct with a pre-configured evaluator (custom consent deadline).
    pub fn with_evaluator(registry: Arc<ToolRegistry>, evaluator: SafetyEvaluator) -> Self {
        Self {
            registry,
            evaluator: Arc::new(evaluator),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute a plan under the given options.
    ///
    /// # Errors
    /// Returns [`PlanError`] for structural problems (cycles, duplicate ids,
    /// unknown dependencies), detected before any consent query or tool
    /// resolution. All other failures are reported per node in the result.
    pub async fn run_plan(
        &self,
        plan: &Plan,
        memory: Arc<dyn Memory>,
        options: RunOptions,
    ) -> Result<RunResult, PlanError> {
        let order = plan.execution_order()?;
        // Truncate the ordering, not the declaration list, so dependency-
        // eligible nodes are prioritized. A topological prefix never contains
        // a node without its dependencies.
        let budget = options.max_nodes.min(order.len());
        let scheduled: Vec<usize> = order.into_iter().take(budget).collect();

        tracing::info!(
            run_id = %options.run_id,
            plan_id = %plan.id,
            scheduled = scheduled.len(),
            total = plan.nodes.len(),
            "starting plan run"
        );

        let mut results: Vec<NodeOutcome> = Vec::with_capacity(budget);
        // Terminal flag per finished node id: true iff it succeeded.
        let mut finished: HashMap<String, bool> = HashMap::new();
        let mut started: HashSet<usize> = HashSet::new();
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
        // Task id -> node id, so a panicking handler is still attributable.
        let mut inflight: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut cancelled = false;

        loop {
            if !cancelled && options.cancel.is_cancelled() {
                cancelled = true;
                emit(&options.events, RunEvent::RunCancelled);
            }

            if !cancelled {
                // Settle skips and launch ready nodes until fixpoint: one
                // failed dependency can cascade through several levels.
                loop {
                    let mut progressed = false;
                    for &idx in &scheduled {
                        if started.contains(&idx) {
                            continue;
                        }
                        let node = &plan.nodes[idx];
                        let failed_dep = node
                            .depends_on
                            .iter()
                            .find(|d| finished.get(d.as_str()) == Some(&false));
                        if let Some(dep) = failed_dep {
                            started.insert(idx);
                            finished.insert(node.id.clone(), false);
                            let outcome = NodeOutcome::failure(
                                node.id.clone(),
                                NodeError::DependencyFailed {
                                    dependency: dep.clone(),
                                },
                            );
                            tracing::debug!(
                                run_id = %options.run_id,
                                node_id = %node.id,
                                dependency = %dep,
                                "skipping node with failed dependency"
                            );
                            emit(
                                &options.events,
                                RunEvent::NodeFinished {
                                    outcome: outcome.clone(),
                                },
                            );
                            results.push(outcome);
                            progressed = true;
                        } else if node
                            .depends_on
                            .iter()
                            .all(|d| finished.get(d.as_str()) == Some(&true))
                        {
                            started.insert(idx);
                            progressed = true;
                            let handle =
                                self.spawn_node(&mut tasks, node.clone(), memory.clone(), &options);
                            inflight.insert(handle.id(), node.id.clone());
                        }
                    }
                    if !progressed {
                        break;
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = options.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    emit(&options.events, RunEvent::RunCancelled);
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let outcome = match joined {
                        Ok((task_id, outcome)) => {
                            inflight.remove(&task_id);
                            outcome
                        }
                        Err(join_err) => {
                            // A panicking handler must not crash the run.
                            let node_id = inflight.remove(&join_err.id()).unwrap_or_default();
                            tracing::error!(
                                run_id = %options.run_id,
                                node_id = %node_id,
                                error = %join_err,
                                "node task panicked"
                            );
                            NodeOutcome::failure(
                                node_id,
                                NodeError::ToolExecutionFailed {
                                    message: join_err.to_string(),
                                },
                            )
                        }
                    };
                    finished.insert(outcome.node_id.clone(), outcome.is_success());
                    emit(
                        &options.events,
                        RunEvent::NodeFinished {
                            outcome: outcome.clone(),
                        },
                    );
                    results.push(outcome);
                }
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        tracing::info!(
            run_id = %options.run_id,
            plan_id = %plan.id,
            attempted = results.len(),
            succeeded = results.iter().filter(|o| o.is_success()).count(),
            ?status,
            "plan run finished"
        );
        Ok(RunResult { results, status })
    }

    fn spawn_node(
        &self,
        tasks: &mut JoinSet<NodeOutcome>,
        node: PlanNode,
        memory: Arc<dyn Memory>,
        options: &RunOptions,
    ) -> tokio::task::AbortHandle {
        emit(
            &options.events,
            RunEvent::NodeStarted {
                node_id: node.id.clone(),
                tool: node.tool.clone(),
            },
        );
        let evaluator = self.evaluator.clone();
        let registry = self.registry.clone();
        let safety = options.safety.clone();
        let run_id = options.run_id.clone();
        let consent_timeout = options.consent_timeout;
        let cancel = options.cancel.clone();
        tasks.spawn(execute_node(
            node,
            evaluator,
            registry,
            memory,
            safety,
            run_id,
            consent_timeout,
            cancel,
        ))
    }
}

/// One node's full lifecycle: evaluate, resolve, invoke.
#[allow(clippy::too_many_arguments)]
async fn execute_node(
    node: PlanNode,
    evaluator: Arc<SafetyEvaluator>,
    registry: Arc<ToolRegistry>,
    memory: Arc<dyn Memory>,
    safety: SafetyPolicy,
    run_id: String,
    consent_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> NodeOutcome {
    let PlanNode {
        id, tool, input, ..
    } = node;

    // The consent wait inside evaluation can block; a cancelled run must not
    // sit out the consent deadline before reporting the node.
    let decision = tokio::select! {
        _ = cancel.cancelled() => {
            return NodeOutcome::failure(id, NodeError::Cancelled);
        }
        decision = evaluator.evaluate(&tool, &input, &safety, consent_timeout) => decision,
    };
    if !decision.allowed {
        let reason = decision
            .reason
            .unwrap_or_else(|| "blocked by safety policy".to_string());
        tracing::warn!(run_id = %run_id, node_id = %id, tool = %tool, %reason, "node denied");
        return NodeOutcome::failure(id, NodeError::SafetyDenied { reason });
    }

    let Some(handler) = registry.resolve(&tool) else {
        tracing::warn!(run_id = %run_id, node_id = %id, tool = %tool, "tool not registered");
        return NodeOutcome::failure(id, NodeError::ToolNotFound { tool });
    };

    let ctx = ToolContext {
        safety,
        run_id: run_id.clone(),
        memory,
    };
    tracing::debug!(run_id = %run_id, node_id = %id, tool = %tool, "invoking tool");
    tokio::select! {
        _ = cancel.cancelled() => NodeOutcome::failure(id, NodeError::Cancelled),
        result = handler.invoke(input, &ctx) => match result {
            Ok(output) => NodeOutcome::success(id, output),
            Err(err) => {
                tracing::warn!(
                    run_id = %run_id,
                    node_id = %id,
                    tool = %tool,
                    error = %err,
                    "tool execution failed"
                );
                NodeOutcome::failure(id, NodeError::execution_failed(&err))
            }
        },
    }
}

fn emit(events: &Option<UnboundedSender<RunEvent>>, event: RunEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::safety::{ConsentLedger, ConsentProvider, ConsentResponse, DenyAll};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct OkTool {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl OkTool {
        fn new(name: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    name,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl Tool for OkTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "always succeeds"
        }

        async fn invoke(&self, _input: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ok"))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn invoke(&self, _input: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            anyhow::bail!("boom")
        }
    }

    struct PolicyProbe {
        seen: Arc<Mutex<Vec<SafetyPolicy>>>,
    }

    #[async_trait]
    impl Tool for PolicyProbe {
        fn name(&self) -> &str {
            "probe"
        }

        fn description(&self) -> &str {
            "records the policy it ran under"
        }

        async fn invoke(&self, _input: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
            self.seen.lock().unwrap().push(ctx.safety.clone());
            Ok(json!(null))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps forever"
        }

        async fn invoke(&self, _input: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!("done"))
        }
    }

    struct CountingConsent {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConsentProvider for CountingConsent {
        async fn check(&self, _tool: &str, _input: &Value) -> anyhow::Result<ConsentResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ConsentResponse { has_consent: true })
        }
    }

    /// Honors `RUST_LOG` so failing runs can be re-run with telemetry.
    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn runner_with(tools: Vec<Arc<dyn Tool>>) -> PlanRunner {
        init_test_logging();
        let mut registry = ToolRegistry::empty();
        for tool in tools {
            registry.register(tool);
        }
        PlanRunner::new(Arc::new(registry), Arc::new(DenyAll))
    }

    fn memory() -> Arc<dyn Memory> {
        Arc::new(InMemoryStore::new())
    }

    fn node(id: &str, tool: &str) -> PlanNode {
        PlanNode::new(id, tool, json!({}))
    }

    #[tokio::test]
    async fn budget_limits_attempted_nodes() {
        let (tool, calls) = OkTool::new("summarize");
        let runner = runner_with(vec![tool]);
        let plan = Plan::new("p", vec![node("a", "summarize"), node("b", "summarize")]);

        let result = runner
            .run_plan(&plan, memory(), RunOptions::new(1))
            .await
            .unwrap();

        assert_eq!(result.results.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Declaration order is the documented tie-break.
        assert_eq!(result.results[0].node_id, "a");
        assert_eq!(result.results[0].output, Some(json!("ok")));
        assert!(result.outcome("b").is_none());
    }

    #[tokio::test]
    async fn zero_budget_attempts_nothing() {
        let (tool, calls) = OkTool::new("summarize");
        let runner = runner_with(vec![tool]);
        let plan = Plan::new("p", vec![node("a", "summarize")]);

        let result = runner
            .run_plan(&plan, memory(), RunOptions::new(0))
            .await
            .unwrap();

        assert!(result.results.is_empty());
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn truncation_applies_to_the_ordering_not_declaration_order() {
        let (tool, _) = OkTool::new("summarize");
        let runner = runner_with(vec![tool]);
        // "b" is declared first but depends on "a"; within a budget of 2 the
        // dependency-eligible pair {a, b} runs, not {b, c}.
        let plan = Plan::new(
            "p",
            vec![
                node("b", "summarize").depends_on(["a"]),
                node("a", "summarize"),
                node("c", "summarize"),
            ],
        );

        let result = runner
            .run_plan(&plan, memory(), RunOptions::new(2))
            .await
            .unwrap();

        assert!(result.outcome("a").is_some());
        assert!(result.outcome("b").is_some());
        assert!(result.outcome("c").is_none());
    }

    #[tokio::test]
    async fn policy_forwarded_verbatim_into_every_context() {
        // "probe" is an unknown tool and therefore high risk; grant consent so
        // the handler is actually invoked.
        let ledger = ConsentLedger::new();
        ledger.grant("probe").await;

        init_test_logging();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(PolicyProbe { seen: seen.clone() }));
        let runner = PlanRunner::new(Arc::new(registry), Arc::new(ledger));
        let plan = Plan::new(
            "p",
            vec![node("a", "probe"), node("b", "probe"), node("c", "probe")],
        );
        let policy = SafetyPolicy::default()
            .deny_domains(["blocked.com"])
            .allow_domains(["example.com"]);

        runner
            .run_plan(
                &plan,
                memory(),
                RunOptions::new(10).with_safety(policy.clone()),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for observed in seen.iter() {
            assert_eq!(observed, &policy);
        }
    }

    #[tokio::test]
    async fn denied_domain_is_a_node_error_and_siblings_still_run() {
        let (ok, _) = OkTool::new("summarize");
        let (scrape, scrape_calls) = OkTool::new("scrape_page");
        let runner = runner_with(vec![ok, scrape]);
        let plan = Plan::new(
            "p",
            vec![
                PlanNode::new("bad", "scrape_page", json!({"url": "https://blocked.com/page"})),
                node("good", "summarize"),
            ],
        );
        let policy = SafetyPolicy::default().deny_domains(["blocked.com"]);

        let result = runner
            .run_plan(
                &plan,
                memory(),
                RunOptions::new(10).with_safety(policy),
            )
            .await
            .unwrap();

        let bad = result.outcome("bad").unwrap();
        match bad.error.as_ref().unwrap() {
            NodeError::SafetyDenied { reason } => {
                assert!(reason.contains("Domain"));
                assert!(reason.contains("blocked.com"));
            }
            other => panic!("expected SafetyDenied, got {other:?}"),
        }
        assert_eq!(scrape_calls.load(Ordering::SeqCst), 0);
        assert!(result.outcome("good").unwrap().is_success());
    }

    #[tokio::test]
    async fn withheld_consent_denies_without_invoking_the_tool() {
        let (tabs, calls) = OkTool::new("manage_tabs");
        let runner = runner_with(vec![tabs]);
        let plan = Plan::new("p", vec![node("t", "manage_tabs")]);
        let policy = SafetyPolicy::default().with_consent_required(true);

        let result = runner
            .run_plan(&plan, memory(), RunOptions::new(10).with_safety(policy))
            .await
            .unwrap();

        let outcome = result.outcome("t").unwrap();
        assert!(matches!(
            outcome.error,
            Some(NodeError::SafetyDenied { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_dependency_cascades_but_spares_siblings() {
        // "flaky" is an unknown tool and therefore high risk; grant consent so
        // its handler runs and fails on its own terms.
        let ledger = ConsentLedger::new();
        ledger.grant("flaky").await;

        let (ok, _) = OkTool::new("summarize");
        let mut registry = ToolRegistry::empty();
        registry.register(ok);
        registry.register(Arc::new(FailTool));
        let runner = PlanRunner::new(Arc::new(registry), Arc::new(ledger));

        let plan = Plan::new(
            "p",
            vec![
                node("a", "flaky"),
                node("b", "summarize").depends_on(["a"]),
                node("c", "summarize").depends_on(["b"]),
                node("d", "summarize"),
            ],
        );

        let result = runner
            .run_plan(&plan, memory(), RunOptions::new(10))
            .await
            .unwrap();

        assert!(matches!(
            result.outcome("a").unwrap().error,
            Some(NodeError::ToolExecutionFailed { .. })
        ));
        assert!(matches!(
            result.outcome("b").unwrap().error,
            Some(NodeError::DependencyFailed { ref dependency }) if dependency == "a"
        ));
        assert!(matches!(
            result.outcome("c").unwrap().error,
            Some(NodeError::DependencyFailed { ref dependency }) if dependency == "b"
        ));
        assert!(result.outcome("d").unwrap().is_success());
    }

    #[tokio::test]
    async fn unregistered_tool_is_a_node_error_not_an_abort() {
        // An unknown tool is high risk; grant consent so resolution is reached.
        let ledger = ConsentLedger::new();
        ledger.grant("no_such_tool").await;

        let mut registry = ToolRegistry::empty();
        let (ok, _) = OkTool::new("summarize");
        registry.register(ok);
        let runner = PlanRunner::new(Arc::new(registry), Arc::new(ledger));

        let plan = Plan::new(
            "p",
            vec![node("ghost", "no_such_tool"), node("real", "summarize")],
        );
        let result = runner
            .run_plan(&plan, memory(), RunOptions::new(10))
            .await
            .unwrap();

        assert!(matches!(
            result.outcome("ghost").unwrap().error,
            Some(NodeError::ToolNotFound { ref tool }) if tool == "no_such_tool"
        ));
        assert!(result.outcome("real").unwrap().is_success());
    }

    #[tokio::test]
    async fn cycles_rejected_before_any_tool_or_consent_activity() {
        let (tool, tool_calls) = OkTool::new("manage_tabs");
        let consent_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::empty();
        registry.register(tool);
        let runner = PlanRunner::new(
            Arc::new(registry),
            Arc::new(CountingConsent {
                calls: consent_calls.clone(),
            }),
        );

        let plan = Plan::new(
            "p",
            vec![
                node("a", "manage_tabs").depends_on(["b"]),
                node("b", "manage_tabs").depends_on(["a"]),
            ],
        );
        let options = RunOptions::new(10)
            .with_safety(SafetyPolicy::default().with_consent_required(true));

        let err = runner.run_plan(&plan, memory(), options).await.unwrap_err();
        assert!(matches!(err, PlanError::CycleDetected { .. }));
        assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
        assert_eq!(consent_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reruns_with_granting_provider_are_idempotent() {
        let ledger = ConsentLedger::new();
        ledger.grant("manage_tabs").await;

        let mut registry = ToolRegistry::empty();
        let (tabs, _) = OkTool::new("manage_tabs");
        let (sum, _) = OkTool::new("summarize");
        registry.register(tabs);
        registry.register(sum);
        let runner = PlanRunner::new(Arc::new(registry), Arc::new(ledger));

        let plan = Plan::new(
            "p",
            vec![
                node("s", "summarize"),
                node("t", "manage_tabs").depends_on(["s"]),
            ],
        );
        let policy = SafetyPolicy::default().with_consent_required(true);

        let mut successes: Vec<Vec<String>> = Vec::new();
        for _ in 0..2 {
            let result = runner
                .run_plan(
                    &plan,
                    memory(),
                    RunOptions::new(10).with_safety(policy.clone()),
                )
                .await
                .unwrap();
            let mut ids: Vec<String> = result
                .results
                .iter()
                .filter(|o| o.is_success())
                .map(|o| o.node_id.clone())
                .collect();
            ids.sort();
            successes.push(ids);
        }
        assert_eq!(successes[0], vec!["s", "t"]);
        assert_eq!(successes[0], successes[1]);
    }

    #[tokio::test]
    async fn independent_nodes_complete_and_index_by_node_id() {
        let (tool, calls) = OkTool::new("summarize");
        let runner = Arc::new(runner_with(vec![tool]));
        let plan = Plan::new(
            "p",
            vec![node("x", "summarize"), node("y", "summarize"), node("z", "summarize")],
        );

        let result = runner
            .run_plan(&plan, memory(), RunOptions::new(10))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        for id in ["x", "y", "z"] {
            assert!(result.outcome(id).unwrap().is_success());
        }
    }

    #[tokio::test]
    async fn cancellation_returns_partial_results() {
        // "slow" is an unknown tool and therefore high risk; grant consent so
        // it actually starts and is in flight when the token fires.
        let ledger = ConsentLedger::new();
        ledger.grant("slow").await;

        let mut registry = ToolRegistry::empty();
        let (fast, _) = OkTool::new("summarize");
        registry.register(fast);
        registry.register(Arc::new(SlowTool));
        let runner = Arc::new(PlanRunner::new(Arc::new(registry), Arc::new(ledger)));

        let plan = Plan::new(
            "p",
            vec![
                node("quick", "summarize"),
                node("stuck", "slow"),
                node("after", "summarize").depends_on(["stuck"]),
            ],
        );
        let cancel = CancellationToken::new();
        let options = RunOptions::new(10).with_cancel(cancel.clone());

        let run = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_plan(&plan, memory(), options).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = run.await.unwrap().unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.outcome("quick").unwrap().is_success());
        assert_eq!(
            result.outcome("stuck").unwrap().error,
            Some(NodeError::Cancelled)
        );
        // Never started: no outcome entry.
        assert!(result.outcome("after").is_none());
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_pending_consent_wait() {
        struct HangingConsent;

        #[async_trait]
        impl ConsentProvider for HangingConsent {
            async fn check(&self, _tool: &str, _input: &Value) -> anyhow::Result<ConsentResponse> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ConsentResponse { has_consent: true })
            }
        }

        let mut registry = ToolRegistry::empty();
        let (tabs, calls) = OkTool::new("manage_tabs");
        registry.register(tabs);
        let runner = Arc::new(PlanRunner::new(Arc::new(registry), Arc::new(HangingConsent)));

        let plan = Plan::new("p", vec![node("t", "manage_tabs")]);
        let cancel = CancellationToken::new();
        let options = RunOptions::new(10)
            .with_safety(SafetyPolicy::default().with_consent_required(true))
            .with_consent_timeout(Duration::from_secs(3600))
            .with_cancel(cancel.clone());

        let run = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_plan(&plan, memory(), options).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        // The run must resolve well before the consent deadline.
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run stalled in the consent wait")
            .unwrap()
            .unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(
            result.outcome("t").unwrap().error,
            Some(NodeError::Cancelled)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn events_report_node_lifecycle() {
        let (tool, _) = OkTool::new("summarize");
        let runner = runner_with(vec![tool]);
        let plan = Plan::new("p", vec![node("a", "summarize")]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        runner
            .run_plan(&plan, memory(), RunOptions::new(10).with_events(tx))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            RunEvent::NodeStarted { node_id, tool } if node_id == "a" && tool == "summarize"
        ));
        assert!(matches!(
            &events[1],
            RunEvent::NodeFinished { outcome } if outcome.is_success()
        ));
    }

    #[tokio::test]
    async fn run_id_reaches_tool_context() {
        struct RunIdProbe {
            seen: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Tool for RunIdProbe {
            fn name(&self) -> &str {
                "probe"
            }

            fn description(&self) -> &str {
                "records the run id"
            }

            async fn invoke(&self, _input: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
                self.seen.lock().unwrap().push(ctx.run_id.clone());
                Ok(json!(null))
            }
        }

        // "probe" is an unknown tool and therefore high risk; grant consent so
        // the handler is actually invoked.
        let ledger = ConsentLedger::new();
        ledger.grant("probe").await;

        init_test_logging();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(RunIdProbe { seen: seen.clone() }));
        let runner = PlanRunner::new(Arc::new(registry), Arc::new(ledger));
        let plan = Plan::new("p", vec![node("a", "probe")]);

        runner
            .run_plan(
                &plan,
                memory(),
                RunOptions::new(10).with_run_id("run-42"),
            )
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), ["run-42"]);
    }
}
