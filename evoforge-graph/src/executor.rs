//! # Graph Executor
//!
//! Runs a [`CompiledGraph`] against one set of inputs:
//!
//! ```text
//! current = start_node
//! loop:
//!     inputs  = context[node.signature.inputs]     (MissingInput)
//!     outputs = invoke(node, inputs) within timeout (ModelInvocationFailed / InvocationTimeout)
//!     context.merge(outputs)
//!     current = edge(node, context)                (BranchVariableMissing)
//!     stop when current == end, or the step budget runs out (LoopBudgetExceeded)
//! ```
//!
//! The executor keeps no state between runs. Failures come back together
//! with the partial trace so callers can still record and diagnose them.

use crate::compiler::{CompiledGraph, CompiledNode, Target, Transition};
use crate::context::{branch_key, ExecutionContext, Fields};
use crate::error::{self, Error, Result};
use crate::invoker::{NodeCall, NodeInvoker};
use crate::trace::{ExecutionTrace, Route, TraceStep};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

// ============================================================================
// Configuration
// ============================================================================

/// Executor limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum node invocations per run
    pub max_steps: usize,
    /// Per-invocation timeout in milliseconds
    pub node_timeout_ms: u64,
    /// Optional cap on how often a node on a cycle may run in one run;
    /// nodes outside every cycle run at most once anyway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_node_visits: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 32,
            node_timeout_ms: 120_000,
            max_node_visits: None,
        }
    }
}

impl ExecutorConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_node_visits(mut self, visits: usize) -> Self {
        self.max_node_visits = Some(visits);
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// Successful run: the final context and the trace that produced it
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub outputs: Fields,
    pub trace: ExecutionTrace,
}

/// Failed run: the error plus everything executed before it
#[derive(Debug)]
pub struct RunFailure {
    pub error: Error,
    pub trace: ExecutionTrace,
}

impl RunFailure {
    /// Node the failure is attributed to, if known
    pub fn node(&self) -> Option<&str> {
        self.error.context_value("node")
    }

    pub fn into_error(self) -> Error {
        self.error
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} step(s)", self.error, self.trace.len())
    }
}

impl std::error::Error for RunFailure {}

pub type RunResult = std::result::Result<RunOutput, RunFailure>;

// ============================================================================
// Executor
// ============================================================================

/// Interprets compiled graphs, delegating node work to a [`NodeInvoker`]
#[derive(Clone)]
pub struct GraphExecutor {
    invoker: Arc<dyn NodeInvoker>,
    config: ExecutorConfig,
}

impl GraphExecutor {
    pub fn new(invoker: Arc<dyn NodeInvoker>) -> Self {
        Self {
            invoker,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the graph once from `start_node` with the given inputs
    pub async fn run(&self, graph: &CompiledGraph, inputs: Fields) -> RunResult {
        let mut run = Run {
            ctx: ExecutionContext::new(inputs),
            steps: Vec::new(),
            visits: vec![0; graph.len()],
        };

        match self.drive(graph, &mut run).await {
            Ok(()) => {
                debug!(
                    agent_id = graph.agent_id(),
                    steps = run.steps.len(),
                    "run reached end"
                );
                Ok(RunOutput {
                    outputs: run.ctx.into_fields(),
                    trace: ExecutionTrace::new(run.steps),
                })
            }
            Err(error) => {
                let error = error
                    .with_operation("executor::run")
                    .with_context("agent_id", graph.agent_id())
                    .with_context("version", graph.version().to_string());
                debug!(steps = run.steps.len(), error = %error, "run failed");
                Err(RunFailure {
                    error,
                    trace: ExecutionTrace::new(run.steps),
                })
            }
        }
    }

    async fn drive(&self, graph: &CompiledGraph, run: &mut Run) -> Result<()> {
        let mut current = Target::Node(graph.start());

        while let Target::Node(id) = current {
            let node = graph.node(id);
            let step = run.steps.len() + 1;

            if run.steps.len() >= self.config.max_steps {
                return Err(error::loop_budget_exceeded(&node.name, self.config.max_steps));
            }
            run.visits[id.index()] += 1;
            if let (true, Some(max)) = (node.in_cycle, self.config.max_node_visits) {
                if run.visits[id.index()] > max {
                    return Err(error::loop_budget_exceeded(&node.name, max)
                        .with_context("limit", "max_node_visits"));
                }
            }

            let inputs = run
                .ctx
                .select(node.spec.signature.inputs())
                .map_err(|field| error::missing_input(&node.name, field))?;

            let started = Instant::now();
            let invoked = self.invoke(graph, node, &inputs, step).await;
            let elapsed = started.elapsed();

            let outputs = match invoked.and_then(|raw| validate_outputs(node, raw)) {
                Ok(outputs) => outputs,
                Err(e) => {
                    run.steps.push(TraceStep {
                        step,
                        node: node.name.clone(),
                        inputs,
                        outputs: Fields::new(),
                        elapsed,
                        next: None,
                        route: None,
                    });
                    return Err(e.with_context("step", step.to_string()));
                }
            };

            run.ctx.merge(&outputs);
            let routed = route(node, &run.ctx);

            let (next, taken) = match &routed {
                Ok((next, taken)) => (Some(*next), Some(taken.clone())),
                Err(_) => (None, None),
            };
            debug!(
                step,
                node = %node.name,
                next = next.map(|t| graph.target_name(t)).unwrap_or("-"),
                elapsed_ms = elapsed.as_millis() as u64,
                "node finished"
            );
            run.steps.push(TraceStep {
                step,
                node: node.name.clone(),
                inputs,
                outputs,
                elapsed,
                next: next.map(|t| graph.target_ref(t)),
                route: taken,
            });

            current = routed?.0;
        }

        Ok(())
    }

    async fn invoke(
        &self,
        graph: &CompiledGraph,
        node: &CompiledNode,
        inputs: &Fields,
        step: usize,
    ) -> Result<Fields> {
        let call = NodeCall {
            agent_id: graph.agent_id(),
            node: &node.name,
            spec: &node.spec,
            inputs,
            step,
        };
        let timeout = self.config.node_timeout();

        match tokio::time::timeout(timeout, self.invoker.invoke(call)).await {
            Err(_) => Err(error::invocation_timeout(&node.name, timeout)),
            Ok(Err(e)) if e.context_value("node").is_none() => Err(e.with_context("node", &node.name)),
            Ok(result) => result,
        }
    }
}

struct Run {
    ctx: ExecutionContext,
    steps: Vec<TraceStep>,
    visits: Vec<usize>,
}

/// Keep exactly the declared outputs; a missing one fails the invocation
fn validate_outputs(node: &CompiledNode, mut raw: Fields) -> Result<Fields> {
    let mut outputs = Fields::new();
    for field in node.spec.signature.outputs() {
        match raw.remove(field) {
            Some(value) => {
                outputs.insert(field.clone(), value);
            }
            None => return Err(error::missing_output(&node.name, field)),
        }
    }
    if !raw.is_empty() {
        let extra: Vec<&String> = raw.keys().collect();
        debug!(node = %node.name, ?extra, "dropping undeclared output fields");
    }
    Ok(outputs)
}

/// Resolve the transition taken after a node ran
fn route(node: &CompiledNode, ctx: &ExecutionContext) -> Result<(Target, Route)> {
    match &node.transition {
        Transition::Sequence(next) => Ok((*next, Route::Sequence)),
        Transition::Branch {
            source_var,
            arms,
            default,
        } => {
            let value = ctx
                .get(source_var)
                .filter(|v| !v.is_null())
                .ok_or_else(|| error::branch_variable_missing(&node.name, source_var))?;
            let key = branch_key(value);
            match arms.get(&key) {
                Some(next) => Ok((*next, Route::Matched { value: key })),
                None => {
                    debug!(node = %node.name, value = %key, "no branch matched, taking default");
                    Ok((*default, Route::Default { value: key }))
                }
            }
        }
    }
}
