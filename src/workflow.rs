//! DAG workflow orchestration
//!
//! Workflows are trees of task, sequence, parallel, conditional and merge
//! nodes executed against a caller-supplied executor. A shared context map
//! threads initial inputs and per-node results (keyed by node id) through
//! the run.
//!
//! Parallel children all write to the shared context, so parallel task
//! nodes must not read sibling results from it; only nodes sequenced after
//! the parallel block may rely on them.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::message::Payload;
use crate::new_id;

/// Agent executor contract: `(agent_name, params) -> result map`.
///
/// Params carry the node's `task_params` plus the reserved key `"_context"`
/// holding a snapshot of the workflow context. Failures are recorded as
/// `{"error": message}` on the failing node; the engine never propagates
/// them as panics.
pub type Executor =
    Arc<dyn Fn(String, Payload) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Sequence,
    Parallel,
    Conditional,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Agent dispatched for `Task` nodes.
    pub agent_name: Option<String>,
    pub task_params: Payload,
    /// Condition string for `Conditional` nodes: `"<key> == <value>"`,
    /// `"<key>"` (truthiness), or empty for always-true.
    pub condition: Option<String>,
    /// Child node ids, in declared order.
    pub children: Vec<String>,
    pub status: WorkflowStatus,
    pub result: Option<Payload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub nodes: StdHashMap<String, WorkflowNode>,
    /// The first node added. Immutable thereafter.
    pub root_id: Option<String>,
    pub status: WorkflowStatus,
    pub metadata: Payload,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    pub node_results: StdHashMap<String, Value>,
    pub total_duration: Duration,
    /// Failed node ids, or a reason marker when the run never started.
    pub failed_nodes: Vec<String>,
}

impl WorkflowResult {
    fn rejected(workflow_id: &str, reason: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            success: false,
            node_results: StdHashMap::new(),
            total_duration: Duration::ZERO,
            failed_nodes: vec![reason.to_string()],
        }
    }
}

/// Per-workflow status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub total_nodes: usize,
    pub node_statuses: StdHashMap<String, WorkflowStatus>,
}

/// Mutable state of one run, shared by concurrently executing branches.
/// Locks are only held for map access, never across awaits.
struct RunState {
    context: Mutex<Payload>,
    node_results: Mutex<StdHashMap<String, Value>>,
    failed_nodes: Mutex<Vec<String>>,
}

impl RunState {
    fn has_failed(&self, node_id: &str) -> bool {
        self.failed_nodes.lock().iter().any(|id| id == node_id)
    }

    fn mark_failed(&self, node_id: &str) {
        self.failed_nodes.lock().push(node_id.to_string());
    }
}

struct EngineState {
    workflows: HashMap<String, WorkflowDefinition>,
    executor: Option<Executor>,
}

/// DAG execution engine.
///
/// Cheap to clone; all clones share the same workflows and executor.
#[derive(Clone)]
pub struct WorkflowEngine {
    state: Arc<Mutex<EngineState>>,
}

impl WorkflowEngine {
    /// Create an engine without an executor; `Task` nodes fail until one is
    /// installed.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                workflows: HashMap::new(),
                executor: None,
            })),
        }
    }

    pub fn with_executor(executor: Executor) -> Self {
        let engine = Self::new();
        engine.set_executor(executor);
        engine
    }

    /// Install or replace the agent executor.
    pub fn set_executor(&self, executor: Executor) {
        self.state.lock().executor = Some(executor);
    }

    /// Create an empty workflow.
    pub fn create_workflow(
        &self,
        name: &str,
        description: &str,
        metadata: Payload,
    ) -> WorkflowDefinition {
        let workflow = WorkflowDefinition {
            id: new_id(),
            name: name.to_string(),
            description: description.to_string(),
            nodes: StdHashMap::new(),
            root_id: None,
            status: WorkflowStatus::Pending,
            metadata,
        };
        self.state
            .lock()
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        info!("workflow created: {name}");
        workflow
    }

    /// Add a node. The first node added becomes the root.
    ///
    /// Returns `None` for an unknown workflow.
    pub fn add_node(
        &self,
        workflow_id: &str,
        name: &str,
        kind: NodeKind,
        agent_name: Option<String>,
        task_params: Payload,
        condition: Option<String>,
    ) -> Option<WorkflowNode> {
        let mut state = self.state.lock();
        let workflow = state.workflows.get_mut(workflow_id)?;

        let node = WorkflowNode {
            id: new_id(),
            name: name.to_string(),
            kind,
            agent_name,
            task_params,
            condition,
            children: Vec::new(),
            status: WorkflowStatus::Pending,
            result: None,
        };
        if workflow.root_id.is_none() {
            workflow.root_id = Some(node.id.clone());
        }
        workflow.nodes.insert(node.id.clone(), node.clone());
        Some(node)
    }

    /// Connect parent to child. Idempotent; both nodes must exist.
    pub fn connect_nodes(&self, workflow_id: &str, parent_id: &str, child_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(workflow) = state.workflows.get_mut(workflow_id) else {
            return false;
        };
        if !workflow.nodes.contains_key(child_id) {
            return false;
        }
        let Some(parent) = workflow.nodes.get_mut(parent_id) else {
            return false;
        };
        if !parent.children.iter().any(|id| id == child_id) {
            parent.children.push(child_id.to_string());
        }
        true
    }

    /// Execute a workflow from its root.
    ///
    /// The context starts as `initial_context` and accumulates each
    /// completed task's result under the task's node id. Total duration is
    /// measured on a monotonic clock.
    pub async fn execute(&self, workflow_id: &str, initial_context: Payload) -> WorkflowResult {
        let root_id = {
            let mut state = self.state.lock();
            let Some(workflow) = state.workflows.get_mut(workflow_id) else {
                return WorkflowResult::rejected(workflow_id, "workflow_not_found");
            };
            let Some(root_id) = workflow.root_id.clone() else {
                return WorkflowResult::rejected(workflow_id, "no_root_node");
            };
            workflow.status = WorkflowStatus::Running;
            root_id
        };

        let started = quanta::Instant::now();
        let run = Arc::new(RunState {
            context: Mutex::new(initial_context),
            node_results: Mutex::new(StdHashMap::new()),
            failed_nodes: Mutex::new(Vec::new()),
        });

        self.dispatch(workflow_id.to_string(), root_id, run.clone())
            .await;

        let total_duration = started.elapsed();
        let node_results = run.node_results.lock().clone();
        let failed_nodes = run.failed_nodes.lock().clone();
        let success = failed_nodes.is_empty();

        let name = {
            let mut state = self.state.lock();
            match state.workflows.get_mut(workflow_id) {
                Some(workflow) => {
                    workflow.status = if success {
                        WorkflowStatus::Completed
                    } else {
                        WorkflowStatus::Failed
                    };
                    workflow.name.clone()
                }
                None => workflow_id.to_string(),
            }
        };
        info!(
            "workflow finished: {} (success={}, duration={:.2}s)",
            name,
            success,
            total_duration.as_secs_f64()
        );

        WorkflowResult {
            workflow_id: workflow_id.to_string(),
            success,
            node_results,
            total_duration,
            failed_nodes,
        }
    }

    fn dispatch(
        &self,
        workflow_id: String,
        node_id: String,
        run: Arc<RunState>,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(node) = self.node_snapshot(&workflow_id, &node_id) else {
                run.mark_failed(&node_id);
                return;
            };
            self.set_node_status(&workflow_id, &node_id, WorkflowStatus::Running);

            match node.kind {
                NodeKind::Task => self.run_task(&workflow_id, &node, &run).await,

                NodeKind::Sequence => {
                    for child_id in &node.children {
                        self.dispatch(workflow_id.clone(), child_id.clone(), run.clone())
                            .await;
                        if run.has_failed(child_id) {
                            self.set_node_status(&workflow_id, &node_id, WorkflowStatus::Failed);
                            run.mark_failed(&node_id);
                            return;
                        }
                    }
                }

                NodeKind::Parallel => {
                    join_all(node.children.iter().map(|child_id| {
                        self.dispatch(workflow_id.clone(), child_id.clone(), run.clone())
                    }))
                    .await;
                    if node.children.iter().any(|child_id| run.has_failed(child_id)) {
                        self.set_node_status(&workflow_id, &node_id, WorkflowStatus::Failed);
                        run.mark_failed(&node_id);
                        return;
                    }
                }

                NodeKind::Conditional => {
                    let branch = {
                        let context = run.context.lock();
                        select_branch(&node, &context)
                    };
                    match branch {
                        Some(child_id) => {
                            self.dispatch(workflow_id.clone(), child_id, run.clone())
                                .await;
                        }
                        None => debug!("condition not met, skipping: {}", node.name),
                    }
                }

                // Merge runs every child even after a failure; failed
                // children still fail the merge node once all have run.
                NodeKind::Merge => {
                    for child_id in &node.children {
                        self.dispatch(workflow_id.clone(), child_id.clone(), run.clone())
                            .await;
                    }
                    if node.children.iter().any(|child_id| run.has_failed(child_id)) {
                        self.set_node_status(&workflow_id, &node_id, WorkflowStatus::Failed);
                        run.mark_failed(&node_id);
                        return;
                    }
                }
            }

            if !run.has_failed(&node_id) {
                self.set_node_status(&workflow_id, &node_id, WorkflowStatus::Completed);
            }
        })
    }

    async fn run_task(&self, workflow_id: &str, node: &WorkflowNode, run: &RunState) {
        let executor = self.state.lock().executor.clone();
        let Some(executor) = executor else {
            warn!("no executor installed, task failed: {}", node.name);
            self.set_node_status(workflow_id, &node.id, WorkflowStatus::Failed);
            run.mark_failed(&node.id);
            return;
        };
        let Some(agent_name) = node.agent_name.clone() else {
            warn!("no agent assigned, task failed: {}", node.name);
            self.set_node_status(workflow_id, &node.id, WorkflowStatus::Failed);
            run.mark_failed(&node.id);
            return;
        };

        let mut params = node.task_params.clone();
        let snapshot = run.context.lock().clone();
        params.insert("_context".to_string(), Value::Object(snapshot));

        match executor(agent_name.clone(), params).await {
            Ok(result) => {
                run.node_results
                    .lock()
                    .insert(node.id.clone(), Value::Object(result.clone()));
                run.context
                    .lock()
                    .insert(node.id.clone(), Value::Object(result.clone()));
                self.record_task_result(workflow_id, &node.id, result);
                debug!("task completed: {} (agent={})", node.name, agent_name);
            }
            Err(err) => {
                error!("task failed: {} -> {err}", node.name);
                let mut failure = Payload::new();
                failure.insert("error".to_string(), Value::String(err.to_string()));
                run.node_results
                    .lock()
                    .insert(node.id.clone(), Value::Object(failure));
                self.set_node_status(workflow_id, &node.id, WorkflowStatus::Failed);
                run.mark_failed(&node.id);
            }
        }
    }

    /// Pause a running workflow. Only `Running` can pause.
    pub fn pause_workflow(&self, workflow_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.workflows.get_mut(workflow_id) {
            Some(workflow) if workflow.status == WorkflowStatus::Running => {
                workflow.status = WorkflowStatus::Paused;
                true
            }
            _ => false,
        }
    }

    /// Cancel a workflow from any non-terminal status.
    ///
    /// Flips the status only; in-flight executor calls are not interrupted.
    pub fn cancel_workflow(&self, workflow_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(workflow) = state.workflows.get_mut(workflow_id) else {
            return false;
        };
        if matches!(
            workflow.status,
            WorkflowStatus::Completed | WorkflowStatus::Cancelled
        ) {
            return false;
        }
        workflow.status = WorkflowStatus::Cancelled;
        true
    }

    /// Per-node status report for a workflow.
    pub fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatusReport> {
        let state = self.state.lock();
        let workflow = state.workflows.get(workflow_id)?;
        Some(WorkflowStatusReport {
            workflow_id: workflow_id.to_string(),
            name: workflow.name.clone(),
            status: workflow.status,
            total_nodes: workflow.nodes.len(),
            node_statuses: workflow
                .nodes
                .iter()
                .map(|(id, node)| (id.clone(), node.status))
                .collect(),
        })
    }

    /// Snapshot of a workflow definition.
    pub fn workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.state.lock().workflows.get(workflow_id).cloned()
    }

    fn node_snapshot(&self, workflow_id: &str, node_id: &str) -> Option<WorkflowNode> {
        self.state
            .lock()
            .workflows
            .get(workflow_id)
            .and_then(|workflow| workflow.nodes.get(node_id))
            .cloned()
    }

    fn set_node_status(&self, workflow_id: &str, node_id: &str, status: WorkflowStatus) {
        let mut state = self.state.lock();
        if let Some(node) = state
            .workflows
            .get_mut(workflow_id)
            .and_then(|workflow| workflow.nodes.get_mut(node_id))
        {
            node.status = status;
        }
    }

    fn record_task_result(&self, workflow_id: &str, node_id: &str, result: Payload) {
        let mut state = self.state.lock();
        if let Some(node) = state
            .workflows
            .get_mut(workflow_id)
            .and_then(|workflow| workflow.nodes.get_mut(node_id))
        {
            node.result = Some(result);
            node.status = WorkflowStatus::Completed;
        }
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick a conditional branch: child 0 when the condition holds, child 1
/// (if present) when it does not, `None` to skip.
fn select_branch(node: &WorkflowNode, context: &Payload) -> Option<String> {
    if node.children.is_empty() {
        return None;
    }
    let condition = node.condition.as_deref().unwrap_or("");
    let met = condition_met(condition, context);

    if met {
        node.children.first().cloned()
    } else {
        node.children.get(1).cloned()
    }
}

/// Evaluate a condition string against the context.
///
/// Supported shapes: `"<key> == <value>"` compares the stringified context
/// value; a bare `"<key>"` checks truthiness; the empty string is true.
fn condition_met(condition: &str, context: &Payload) -> bool {
    if let Some((key, expected)) = condition.split_once("==") {
        let actual = context
            .get(key.trim())
            .map(stringify)
            .unwrap_or_default();
        actual == expected.trim()
    } else if !condition.trim().is_empty() {
        context.get(condition.trim()).map(truthy).unwrap_or(false)
    } else {
        true
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
