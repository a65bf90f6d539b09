//! # Failure Diagnostics
//!
//! Mechanical inspection of a score record's bad cases, handed to the outer
//! mutator when the inner loop stagnates. Failures are characterized three
//! ways:
//!
//! - **by node**: which node the failing runs died in
//! - **missing information**: context fields a node needed but nobody produced
//! - **instruction following**: a branching node whose output keeps missing
//!   the declared branch values, or a node that drops a declared output
//!
//! The largest of these becomes the dominant [`FailureMode`].

use crate::error::ErrorKind;
use crate::harness::{BadCase, ScoreRecord};
use evoforge_graph::{AgentDescriptor, EdgeSpec, Fields, Route};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Bad cases quoted in the rendered report
const REPORT_CASES: usize = 3;

/// A node that does not follow its instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Breakdown {
    /// Branch values fell through to the default arm
    UnmatchedBranch {
        node: String,
        source_var: String,
        /// Unmatched value -> occurrences
        values: BTreeMap<String, usize>,
        visits: usize,
        defaulted: usize,
    },
    /// The node's reply lacked a declared output field
    MalformedOutput {
        node: String,
        field: String,
        occurrences: usize,
    },
}

impl Breakdown {
    pub fn node(&self) -> &str {
        match self {
            Breakdown::UnmatchedBranch { node, .. } | Breakdown::MalformedOutput { node, .. } => node,
        }
    }

    pub fn occurrences(&self) -> usize {
        match self {
            Breakdown::UnmatchedBranch { defaulted, .. } => *defaulted,
            Breakdown::MalformedOutput { occurrences, .. } => *occurrences,
        }
    }

    fn describe(&self) -> String {
        match self {
            Breakdown::UnmatchedBranch {
                node,
                source_var,
                values,
                visits,
                defaulted,
            } => {
                let seen = values
                    .iter()
                    .map(|(v, n)| format!("{:?} x{}", v, n))
                    .collect::<Vec<_>>()
                    .join(", ");
                if visits == defaulted {
                    format!(
                        "{}: `{}` never matches a branch value (got {})",
                        node, source_var, seen
                    )
                } else {
                    format!(
                        "{}: `{}` missed the branch values {}/{} times (got {})",
                        node, source_var, defaulted, visits, seen
                    )
                }
            }
            Breakdown::MalformedOutput {
                node,
                field,
                occurrences,
            } => format!("{}: output `{}` missing {} times", node, field, occurrences),
        }
    }
}

/// Dominant characterization of a failure set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailureMode {
    /// No bad cases
    None,
    MissingInformation { field: String },
    InstructionFollowing { node: String },
    NodeCluster { node: String },
    /// Wrong answers with no mechanical signal
    Scattered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub agent_id: String,
    pub version: u64,
    pub score: f64,
    pub examples: usize,
    /// Runs that failed with an execution error
    pub failures: usize,
    /// Runs that completed below the pass threshold
    pub low_scores: usize,
    /// Node -> failed runs that died there
    pub by_node: BTreeMap<String, usize>,
    /// Field -> runs that needed it and did not have it
    pub missing_information: BTreeMap<String, usize>,
    pub breakdowns: Vec<Breakdown>,
    pub mode: FailureMode,
    pub bad_cases: Vec<BadCase>,
}

impl Diagnostics {
    /// Characterize the bad cases of one evaluation of `descriptor`
    pub fn new(descriptor: &AgentDescriptor, record: &ScoreRecord) -> Self {
        let mut by_node = BTreeMap::new();
        let mut missing_information = BTreeMap::new();
        let mut malformed: BTreeMap<(String, String), usize> = BTreeMap::new();
        let mut branches: BTreeMap<String, (usize, usize, BTreeMap<String, usize>)> = BTreeMap::new();

        for case in &record.bad_cases {
            if let Some(failure) = &case.failure {
                if let Some(node) = &failure.node {
                    *by_node.entry(node.clone()).or_insert(0) += 1;
                }
                let field = failure.field.clone();
                if failure.is(ErrorKind::MissingInput) || failure.is(ErrorKind::BranchVariableMissing) {
                    if let Some(field) = field {
                        *missing_information.entry(field).or_insert(0) += 1;
                    }
                } else if failure.is(ErrorKind::ModelInvocationFailed) {
                    if let (Some(node), Some(field)) = (failure.node.clone(), field) {
                        *malformed.entry((node, field)).or_insert(0) += 1;
                    }
                }
            }

            for step in case.trace.steps() {
                let (visits, defaulted, values) = match &step.route {
                    Some(Route::Matched { .. }) | Some(Route::Default { .. }) => {
                        branches.entry(step.node.clone()).or_default()
                    }
                    _ => continue,
                };
                *visits += 1;
                if let Some(Route::Default { value }) = &step.route {
                    *defaulted += 1;
                    *values.entry(value.clone()).or_insert(0) += 1;
                }
            }
        }

        let mut breakdowns: Vec<Breakdown> = branches
            .into_iter()
            .filter(|(_, (_, defaulted, _))| *defaulted > 0)
            .map(|(node, (visits, defaulted, values))| Breakdown::UnmatchedBranch {
                source_var: match descriptor.flow.get(&node) {
                    Some(EdgeSpec::Branch { source_var, .. }) => source_var.clone(),
                    _ => String::new(),
                },
                node,
                values,
                visits,
                defaulted,
            })
            .collect();
        breakdowns.extend(malformed.into_iter().map(|((node, field), occurrences)| {
            Breakdown::MalformedOutput {
                node,
                field,
                occurrences,
            }
        }));
        breakdowns.sort_by(|a, b| b.occurrences().cmp(&a.occurrences()));

        let failures = record.bad_cases.iter().filter(|c| c.failure.is_some()).count();
        let mode = dominant_mode(
            record.bad_cases.len(),
            &by_node,
            &missing_information,
            &breakdowns,
        );

        Self {
            agent_id: record.agent_id.clone(),
            version: record.version,
            score: record.score,
            examples: record.examples,
            failures,
            low_scores: record.bad_cases.len() - failures,
            by_node,
            missing_information,
            breakdowns,
            mode,
            bad_cases: record.bad_cases.clone(),
        }
    }

    /// Plain-text report for the outer mutator
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Current Score: {:.2}%", self.score * 100.0);
        let _ = writeln!(out, "Failure Count: {}", self.bad_cases.len());
        let _ = writeln!(out, "Failure Mode: {}", describe_mode(&self.mode));

        if !self.by_node.is_empty() {
            let _ = writeln!(out, "Failures By Node: {}", render_counts(&self.by_node));
        }
        if !self.missing_information.is_empty() {
            let _ = writeln!(
                out,
                "Missing Information: {}",
                render_counts(&self.missing_information)
            );
        }
        if !self.breakdowns.is_empty() {
            let _ = writeln!(out, "Instruction Breakdowns:");
            for b in &self.breakdowns {
                let _ = writeln!(out, "- {}", b.describe());
            }
        }

        if !self.bad_cases.is_empty() {
            let cases: Vec<String> = self
                .bad_cases
                .iter()
                .take(REPORT_CASES)
                .map(render_case)
                .collect();
            out.push_str("Top 3 Bad Cases:\n");
            out.push_str(&cases.join("\n---\n"));
        }
        out
    }
}

fn dominant_mode(
    total: usize,
    by_node: &BTreeMap<String, usize>,
    missing: &BTreeMap<String, usize>,
    breakdowns: &[Breakdown],
) -> FailureMode {
    if total == 0 {
        return FailureMode::None;
    }

    let top = |counts: &BTreeMap<String, usize>| {
        counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(k, n)| (k.clone(), *n))
    };

    let missing_total: usize = missing.values().sum();
    let breakdown_total: usize = breakdowns.iter().map(Breakdown::occurrences).sum();
    let cluster = top(by_node).unwrap_or_default();

    if missing_total == 0 && breakdown_total == 0 && cluster.1 == 0 {
        return FailureMode::Scattered;
    }
    if missing_total >= breakdown_total && missing_total >= cluster.1 {
        let (field, _) = top(missing).unwrap_or_default();
        FailureMode::MissingInformation { field }
    } else if breakdown_total >= cluster.1 {
        FailureMode::InstructionFollowing {
            node: breakdowns
                .first()
                .map(|b| b.node().to_string())
                .unwrap_or_default(),
        }
    } else {
        FailureMode::NodeCluster { node: cluster.0 }
    }
}

fn describe_mode(mode: &FailureMode) -> String {
    match mode {
        FailureMode::None => "none".into(),
        FailureMode::MissingInformation { field } => {
            format!("missing information (`{}` is never available)", field)
        }
        FailureMode::InstructionFollowing { node } => {
            format!("instruction following breakdown in `{}`", node)
        }
        FailureMode::NodeCluster { node } => format!("failures cluster in node `{}`", node),
        FailureMode::Scattered => "scattered wrong answers".into(),
    }
}

fn render_counts(counts: &BTreeMap<String, usize>) -> String {
    counts
        .iter()
        .map(|(k, n)| format!("{}={}", k, n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_fields(fields: &Fields) -> String {
    let body = fields
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}: {:?}", k, s),
            other => format!("{}: {}", k, other),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{}}}", body)
}

fn render_case(case: &BadCase) -> String {
    if let Some(failure) = &case.failure {
        let mut s = format!(
            "Input: {}\nRuntime Error: [{}] {}",
            render_fields(&case.inputs),
            failure.kind,
            failure.message
        );
        if !case.trace.is_empty() {
            let _ = write!(s, "\nPath: {}", case.trace.summary());
        }
        return s;
    }

    let expected = if case.expected.is_empty() {
        "N/A".to_string()
    } else {
        render_fields(&case.expected)
    };
    let got = case
        .outputs
        .as_ref()
        .map(render_fields)
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "Input: {}\nExpected: {}\nGot: {}\nPath: {}",
        render_fields(&case.inputs),
        expected,
        got,
        case.trace.summary()
    )
}
