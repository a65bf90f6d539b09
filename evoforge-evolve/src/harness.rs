//! # Evaluation Harness
//!
//! Runs the executor over every example of a dataset, scores each result,
//! and aggregates a [`ScoreRecord`]. Examples are independent, so they are
//! dispatched concurrently up to `concurrency`; the aggregate is only
//! computed after every example finished or failed.
//!
//! Per-example failures are never dropped: the run is scored with the
//! scorer's failure value and lands in the bad-case list together with its
//! partial trace and the reason.

use crate::config::HarnessConfig;
use crate::dataset::{Dataset, Example};
use crate::scorer::Scorer;
use evoforge_graph::{CompiledGraph, Error, ErrorKind, ExecutionTrace, Fields, GraphExecutor};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Why an example's run failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl FailureInfo {
    pub fn from_error(error: &Error) -> Self {
        Self {
            kind: error.kind().as_str().to_string(),
            message: error.message().to_string(),
            node: error.context_value("node").map(str::to_string),
            field: error.context_value("field").map(str::to_string),
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind.as_str()
    }
}

/// An example that failed or scored below the pass threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadCase {
    /// Index into the dataset
    pub example: usize,
    pub inputs: Fields,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub expected: Fields,
    /// Final context of a run that completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Fields>,
    pub trace: ExecutionTrace,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

/// Result of evaluating one descriptor version on one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub agent_id: String,
    pub version: u64,
    pub dataset_id: String,
    pub score: f64,
    pub examples: usize,
    pub failures: usize,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub bad_cases: Vec<BadCase>,
}

/// A completed run that met the pass threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredTrace {
    pub example: usize,
    pub inputs: Fields,
    pub outputs: Fields,
    pub trace: ExecutionTrace,
    pub score: f64,
}

/// Score record plus the passing traces, best first
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub record: ScoreRecord,
    pub passing: Vec<ScoredTrace>,
}

pub struct EvaluationHarness {
    executor: GraphExecutor,
    config: HarnessConfig,
}

impl EvaluationHarness {
    pub fn new(executor: GraphExecutor) -> Self {
        Self {
            executor,
            config: HarnessConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Evaluate a compiled graph over the whole dataset
    pub async fn evaluate(
        &self,
        graph: &CompiledGraph,
        dataset: &Dataset,
        scorer: &dyn Scorer,
    ) -> Evaluation {
        let concurrency = self.config.concurrency.max(1);

        let mut results: Vec<_> = stream::iter(dataset.examples.iter().enumerate())
            .map(|(index, example)| async move {
                (index, self.executor.run(graph, example.inputs.clone()).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut scores = Vec::with_capacity(results.len());
        let mut bad_cases = Vec::new();
        let mut passing = Vec::new();
        let mut failures = 0;

        for (index, result) in results {
            let example: &Example = &dataset.examples[index];
            match result {
                Ok(run) => {
                    let score = scorer.score(example, &run.outputs);
                    debug!(example = index, score, path = %run.trace.summary(), "example scored");
                    scores.push(score);

                    if score >= self.config.pass_threshold {
                        passing.push(ScoredTrace {
                            example: index,
                            inputs: example.inputs.clone(),
                            outputs: run.outputs,
                            trace: run.trace,
                            score,
                        });
                    } else {
                        bad_cases.push(BadCase {
                            example: index,
                            inputs: example.inputs.clone(),
                            expected: example.expected.clone(),
                            outputs: Some(run.outputs),
                            trace: run.trace,
                            score,
                            failure: None,
                        });
                    }
                }
                Err(failure) => {
                    let score = scorer.failure_value();
                    warn!(example = index, error = %failure.error, "example run failed");
                    failures += 1;
                    scores.push(score);
                    bad_cases.push(BadCase {
                        example: index,
                        inputs: example.inputs.clone(),
                        expected: example.expected.clone(),
                        outputs: None,
                        failure: Some(FailureInfo::from_error(&failure.error)),
                        trace: failure.trace,
                        score,
                    });
                }
            }
        }

        passing.sort_by(|a, b| b.score.total_cmp(&a.score));
        let score = scorer.reduce(&scores);

        info!(
            agent_id = graph.agent_id(),
            version = graph.version(),
            dataset = %dataset.id,
            score,
            bad_cases = bad_cases.len(),
            failures,
            "evaluation finished"
        );

        Evaluation {
            record: ScoreRecord {
                agent_id: graph.agent_id().to_string(),
                version: graph.version(),
                dataset_id: dataset.id.clone(),
                score,
                examples: dataset.len(),
                failures,
                timestamp: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                bad_cases,
            },
            passing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evoforge_graph::{
        compile, fields, invoker_fn, AgentDescriptor, EdgeSpec, NodeCall, NodeInvoker, NodeKind,
        NodeSpec,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn qa() -> AgentDescriptor {
        AgentDescriptor::new("qa", "planner")
            .with_node(
                "planner",
                NodeSpec::new(NodeKind::Reasoned, "question -> plan", "Plan.").unwrap(),
            )
            .with_node(
                "solver",
                NodeSpec::new(NodeKind::Direct, "question, plan -> answer", "Solve.").unwrap(),
            )
            .with_flow("planner", EdgeSpec::next("solver"))
    }

    fn arithmetic() -> Dataset {
        let ex = |q: &str, a: &str| {
            Example::new(fields([("question", q)])).with_expected(fields([("answer", a)]))
        };
        Dataset::new("arith", vec![ex("2+2", "4"), ex("5*10", "50"), ex("boom", "0")])
    }

    /// Answers by table; explodes on "boom"
    fn calculator() -> Arc<dyn NodeInvoker> {
        Arc::new(invoker_fn(|call: &NodeCall<'_>| {
            let question = call.input_str("question").unwrap_or_default();
            match (call.node, question) {
                (_, "boom") => Err(Error::model_invocation_failed(call.node, "model crashed")),
                ("planner", _) => Ok(fields([("plan", "compute")])),
                (_, "2+2") => Ok(fields([("answer", "4")])),
                _ => Ok(fields([("answer", "5")])),
            }
        }))
    }

    fn exact(example: &Example, outputs: &Fields) -> f64 {
        (example.expected.get("answer") == outputs.get("answer")) as u8 as f64
    }

    #[tokio::test]
    async fn test_failures_are_scored_and_recorded() {
        let graph = compile(&qa()).unwrap();
        let harness = EvaluationHarness::new(GraphExecutor::new(calculator()));

        let eval = harness.evaluate(&graph, &arithmetic(), &exact).await;
        let record = &eval.record;

        assert_eq!(record.examples, 3);
        assert_eq!(record.failures, 1);
        assert!((record.score - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.bad_cases.len(), 2);

        let wrong = &record.bad_cases[0];
        assert_eq!(wrong.example, 1);
        assert!(wrong.failure.is_none());
        assert_eq!(wrong.trace.path(), vec!["planner", "solver"]);

        let crashed = &record.bad_cases[1];
        let failure = crashed.failure.as_ref().unwrap();
        assert!(failure.is(ErrorKind::ModelInvocationFailed));
        assert_eq!(failure.node.as_deref(), Some("planner"));
        assert_eq!(crashed.trace.len(), 1);

        assert_eq!(eval.passing.len(), 1);
        assert_eq!(eval.passing[0].example, 0);
    }

    #[tokio::test]
    async fn test_evaluate_is_idempotent() {
        let graph = compile(&qa()).unwrap();
        let harness = EvaluationHarness::new(GraphExecutor::new(calculator()))
            .with_config(HarnessConfig::default().with_concurrency(3));
        let dataset = arithmetic();

        let a = harness.evaluate(&graph, &dataset, &exact).await.record;
        let b = harness.evaluate(&graph, &dataset, &exact).await.record;

        assert_eq!(a.score, b.score);
        assert_eq!(a.version, b.version);
        assert_eq!(a.failures, b.failures);
        assert_eq!(a.bad_cases.len(), b.bad_cases.len());
        for (x, y) in a.bad_cases.iter().zip(&b.bad_cases) {
            assert_eq!(x.example, y.example);
            assert_eq!(x.score, y.score);
            assert_eq!(x.outputs, y.outputs);
            assert_eq!(x.failure, y.failure);
            assert_eq!(x.trace.summary(), y.trace.summary());
        }
    }

    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl NodeInvoker for Gauge {
        async fn invoke(&self, call: NodeCall<'_>) -> evoforge_graph::Result<Fields> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(match call.node {
                "planner" => fields([("plan", "p")]),
                _ => fields([("answer", "4")]),
            })
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let gauge = Arc::new(Gauge {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let graph = compile(&qa()).unwrap();
        let harness = EvaluationHarness::new(GraphExecutor::new(gauge.clone()))
            .with_config(HarnessConfig::default().with_concurrency(2));

        let examples = (0..8)
            .map(|i| Example::new(fields([("question", format!("q{}", i))])))
            .collect();
        let eval = harness
            .evaluate(&graph, &Dataset::new("load", examples), &|_: &Example, _: &Fields| 1.0)
            .await;

        assert_eq!(eval.passing.len(), 8);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(eval.record.score, 1.0);
    }
}
