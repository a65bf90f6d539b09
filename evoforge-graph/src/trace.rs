//! # Execution Trace
//!
//! The ordered record of node invocations for one run. The evaluation
//! harness mines passing traces for demonstrations; diagnostics inspect
//! failing ones to find where and how the agent breaks down.

use crate::context::Fields;
use crate::descriptor::NodeRef;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the executor chose the node after a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    /// Unconditional edge, or no flow entry (implicit `end`)
    Sequence,
    /// Branch value matched a declared key
    Matched { value: String },
    /// Branch value matched no key; the default arm was taken
    Default { value: String },
}

/// One node invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// 1-based position in the run
    pub step: usize,
    pub node: String,
    pub inputs: Fields,
    pub outputs: Fields,
    pub elapsed: Duration,
    /// Where control went next; `None` when the run failed at this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
}

/// Immutable record of one executor run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    steps: Vec<TraceStep>,
}

impl ExecutionTrace {
    pub(crate) fn new(steps: Vec<TraceStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Node names in visiting order
    pub fn path(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.node.as_str()).collect()
    }

    pub fn last(&self) -> Option<&TraceStep> {
        self.steps.last()
    }

    /// Steps of one node, in order
    pub fn steps_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a TraceStep> + 'a {
        self.steps.iter().filter(move |s| s.node == node)
    }

    /// Total time spent inside node invocations
    pub fn elapsed(&self) -> Duration {
        self.steps.iter().map(|s| s.elapsed).sum()
    }

    /// Compact single-line rendering, e.g. `generator -> critic[FAIL] -> refiner`
    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(|s| match &s.route {
                Some(Route::Matched { value }) => format!("{}[{}]", s.node, value),
                Some(Route::Default { value }) => format!("{}[{}?]", s.node, value),
                _ => s.node.clone(),
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fields;

    fn step(n: usize, node: &str, route: Option<Route>) -> TraceStep {
        TraceStep {
            step: n,
            node: node.into(),
            inputs: Fields::new(),
            outputs: fields([("x", n as u64)]),
            elapsed: Duration::from_millis(10),
            next: None,
            route,
        }
    }

    #[test]
    fn test_path_and_summary() {
        let trace = ExecutionTrace::new(vec![
            step(1, "generator", Some(Route::Sequence)),
            step(2, "critic", Some(Route::Matched { value: "FAIL".into() })),
            step(3, "refiner", Some(Route::Sequence)),
            step(4, "critic", Some(Route::Default { value: "MAYBE".into() })),
        ]);

        assert_eq!(trace.path(), vec!["generator", "critic", "refiner", "critic"]);
        assert_eq!(
            trace.summary(),
            "generator -> critic[FAIL] -> refiner -> critic[MAYBE?]"
        );
        assert_eq!(trace.steps_for("critic").count(), 2);
        assert_eq!(trace.elapsed(), Duration::from_millis(40));
    }
}
