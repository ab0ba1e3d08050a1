/// Graph runner
///
/// Walks a workflow breadth-first from its trigger nodes. Every node runs at
/// most once per run, outputs accumulate into `$P`, and connection rules are
/// only followed from nodes that succeeded. A run never fails as a whole: node
/// errors end up in the trace and only stop that node's branch.
use crate::runtime::executor::{NodeExecutor, NodeResult};
use crate::runtime::expression::EvalContext;
use crate::runtime::graph::WorkflowGraph;
use crate::workflow::types::Workflow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    Completed,
    /// Stopped at a checkpoint between two nodes
    Cancelled,
}

/// Everything one run produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    pub state: RunState,
    /// Node name -> result, one entry per executed node
    pub results: HashMap<String, NodeResult>,
    /// Node names in the order they were executed
    pub execution_order: Vec<String>,
    /// Engine-level log lines
    pub logs: Vec<String>,
}

impl ExecutionTrace {
    pub fn has_errors(&self) -> bool {
        self.results.values().any(|result| !result.is_success())
    }

    pub fn result(&self, node: &str) -> Option<&NodeResult> {
        self.results.get(node)
    }

    fn log(&mut self, line: String) {
        tracing::info!("📋 {}", line);
        self.logs.push(line);
    }
}

/// Runs workflows node by node through a shared `NodeExecutor`
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    executor: Arc<NodeExecutor>,
}

impl ExecutionEngine {
    pub fn new(executor: Arc<NodeExecutor>) -> Self {
        Self { executor }
    }

    /// Run `workflow` to completion. `global_overrides` win over the
    /// workflow's own `global` values.
    pub async fn run(&self, workflow: &Workflow, global_overrides: Option<&Map<String, Value>>) -> ExecutionTrace {
        self.run_with_cancellation(workflow, global_overrides, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but checks `cancel` before each node. A node
    /// already executing is allowed to finish.
    pub async fn run_with_cancellation(
        &self,
        workflow: &Workflow,
        global_overrides: Option<&Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> ExecutionTrace {
        let mut trace = ExecutionTrace::default();
        let run_started = tokio::time::Instant::now();

        tracing::info!("🚀 Starting workflow execution: {}", workflow.key());

        let start_nodes = start_nodes(workflow);
        if start_nodes.is_empty() {
            trace.log("workflow has no nodes, nothing to run".to_string());
            trace.state = RunState::Completed;
            return trace;
        }

        let graph = WorkflowGraph::build(workflow);
        tracing::debug!(
            "📊 Workflow graph: {} nodes, {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        for warning in graph.diagnostics(&start_nodes) {
            trace.log(format!("warning: {warning}"));
        }

        let mut global = workflow.global.clone();
        if let Some(overrides) = global_overrides {
            global.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let mut p: Map<String, Value> = Map::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = start_nodes.into_iter().collect();

        trace.state = RunState::Running;
        trace.log(format!(
            "run started with {} start node(s): {}",
            queue.len(),
            queue.iter().cloned().collect::<Vec<_>>().join(", ")
        ));

        while let Some(name) = queue.pop_front() {
            if cancel.is_cancelled() {
                trace.log(format!("run cancelled before node {name}"));
                trace.state = RunState::Cancelled;
                break;
            }

            if processed.contains(&name) {
                continue;
            }

            let Some(node) = workflow.node(&name) else {
                tracing::warn!("⚠️ Queued node '{}' is not declared, skipping", name);
                continue;
            };

            let context = EvalContext::new(p.clone(), global.clone());
            let result = self.executor.execute(node, &context).await;
            processed.insert(name.clone());

            let succeeded = result.is_success();
            match &result.error {
                None => trace.log(format!("node {} ({}) succeeded in {}ms", name, node.node_type, result.duration_ms)),
                Some(error) => trace.log(format!("node {} ({}) failed: {}", name, node.node_type, error)),
            }

            if succeeded {
                merge_output(&mut p, &name, &result.output);
            }
            trace.execution_order.push(name.clone());
            trace.results.insert(name.clone(), result);

            if !succeeded {
                continue;
            }

            let context = EvalContext::new(p.clone(), global.clone());
            for rule in workflow.outgoing(&name).iter().flatten() {
                if processed.contains(&rule.node) {
                    continue;
                }

                let Some(condition) = rule.when.as_deref() else {
                    queue.push_back(rule.node.clone());
                    continue;
                };

                match self.evaluate_condition(condition, &context).await {
                    Ok(true) => queue.push_back(rule.node.clone()),
                    Ok(false) => trace.log(format!("skipped {} -> {}: condition '{}' is false", name, rule.node, condition)),
                    Err(error) => trace.log(format!(
                        "skipped {} -> {}: condition '{}' failed: {}",
                        name, rule.node, condition, error
                    )),
                }
            }
        }

        if trace.state == RunState::Running {
            trace.state = RunState::Completed;
        }

        let elapsed = run_started.elapsed();
        trace.log(format!(
            "run finished: {} node(s) executed, {} failed",
            trace.execution_order.len(),
            trace.results.values().filter(|r| !r.is_success()).count()
        ));
        tracing::info!("🎉 Workflow '{}' finished in {:?} ({:?})", workflow.key(), elapsed, trace.state);

        trace
    }

    async fn evaluate_condition(&self, condition: &str, context: &EvalContext) -> Result<bool, String> {
        let evaluator = self.executor.interpolator().evaluator().clone();
        let limit = evaluator.await_limit();
        let condition = condition.to_string();
        let context = context.clone();
        let task = tokio::task::spawn_blocking(move || evaluator.evaluate_condition(&condition, &context));

        match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined.map_err(|e| e.to_string())?.map_err(|e| e.to_string()),
            Err(_) => Err(format!("condition evaluation timed out after {limit:?}")),
        }
    }
}

/// Trigger nodes in declaration order, or the first node when there are none
pub fn start_nodes(workflow: &Workflow) -> Vec<String> {
    let triggers: Vec<String> = workflow
        .nodes
        .iter()
        .filter(|node| node.node_type.is_trigger())
        .map(|node| node.name.clone())
        .collect();

    if !triggers.is_empty() {
        return triggers;
    }

    workflow
        .nodes
        .first()
        .map(|node| vec![node.name.clone()])
        .unwrap_or_default()
}

/// Shallow-merge an object output into `$P`, then store it under the node name.
/// Same-named keys from different nodes overwrite each other (last write wins).
fn merge_output(p: &mut Map<String, Value>, node_name: &str, output: &Value) {
    if let Value::Object(fields) = output {
        for (key, value) in fields {
            p.insert(key.clone(), value.clone());
        }
    }
    p.insert(node_name.to_string(), output.clone());
}
