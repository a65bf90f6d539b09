//! # Scorers
//!
//! How textual quality is judged is not this crate's concern: a [`Scorer`]
//! is injected. It scores one example's outputs, names the value a failed
//! run receives, and reduces per-example scores into an aggregate.

use crate::dataset::Example;
use evoforge_graph::Fields;
use serde_json::Value;

pub trait Scorer: Send + Sync {
    /// Score one successful run
    fn score(&self, example: &Example, outputs: &Fields) -> f64;

    /// Score assigned to a run that failed with an execution error
    fn failure_value(&self) -> f64 {
        0.0
    }

    /// Aggregate per-example scores; the mean by default
    fn reduce(&self, scores: &[f64]) -> f64 {
        if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }
}

impl<F> Scorer for F
where
    F: Fn(&Example, &Fields) -> f64 + Send + Sync,
{
    fn score(&self, example: &Example, outputs: &Fields) -> f64 {
        self(example, outputs)
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value.map(|v| match v {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    })
}

/// 1.0 when the output field equals the expected field after trimming
#[derive(Debug, Clone)]
pub struct ExactMatch {
    field: String,
}

impl ExactMatch {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Scorer for ExactMatch {
    fn score(&self, example: &Example, outputs: &Fields) -> f64 {
        match (
            text(example.expected.get(&self.field)),
            text(outputs.get(&self.field)),
        ) {
            (Some(expected), Some(got)) if expected == got => 1.0,
            _ => 0.0,
        }
    }
}

/// 1.0 when the output field contains the expected text, e.g. "the answer is 4" for "4"
#[derive(Debug, Clone)]
pub struct ContainsMatch {
    field: String,
}

impl ContainsMatch {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Scorer for ContainsMatch {
    fn score(&self, example: &Example, outputs: &Fields) -> f64 {
        match (
            text(example.expected.get(&self.field)),
            text(outputs.get(&self.field)),
        ) {
            (Some(expected), Some(got)) if got.contains(&expected) => 1.0,
            _ => 0.0,
        }
    }
}
