//! # Mutations
//!
//! Two independent transformations produce the next descriptor version:
//!
//! - the **inner** optimizer rewrites instructions and demonstrations while
//!   holding the topology fixed
//! - the **outer** mutator may change the topology (split a node, attach a
//!   tool, add a critic loop) or report that it found nothing worth trying
//!
//! Both are collaborators behind traits; [`FewShotBootstrap`] and
//! [`LlmArchitect`] are the stock implementations.

use crate::diagnostics::Diagnostics;
use crate::error::{self, Error, Result};
use crate::harness::ScoredTrace;
use crate::scorer::Scorer;
use async_trait::async_trait;
use evoforge_graph::{
    AgentDescriptor, ChatMessage, CompletionRequest, Demonstration, LlmProvider, ParseMode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How a lineage entry came to be
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    /// First version handed to the controller
    Initial,
    /// Instructions/demonstrations tuned by an inner optimizer
    Inner { optimizer: String },
    /// Topology rewritten by the outer mutator
    Structural { reason: String },
    /// Re-issue of the known-good version `to`
    Revert { to: u64 },
}

/// Inner-loop collaborator: tunes a descriptor without touching its topology
#[async_trait]
pub trait InnerOptimizer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a tuned descriptor from passing traces, best first
    async fn optimize(
        &self,
        descriptor: &AgentDescriptor,
        traces: &[ScoredTrace],
        scorer: &dyn Scorer,
    ) -> Result<AgentDescriptor>;
}

/// Result of one outer mutation attempt
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    Mutated {
        descriptor: AgentDescriptor,
        reason: String,
    },
    /// Nothing worth trying; distinct from a failed attempt
    NoViableMutation { reason: String },
}

/// Outer-loop collaborator: rewrites the topology from a failure diagnosis
#[async_trait]
pub trait OuterMutator: Send + Sync {
    async fn mutate(
        &self,
        descriptor: &AgentDescriptor,
        diagnostics: &Diagnostics,
    ) -> Result<MutationOutcome>;
}

/// Reject inner-optimizer output that changed more than instructions and demos
pub fn check_inner(before: &AgentDescriptor, after: &AgentDescriptor) -> Result<()> {
    if before.agent_id != after.agent_id {
        return Err(error::invalid_mutation(format!(
            "inner optimizer changed agent_id from '{}' to '{}'",
            before.agent_id, after.agent_id
        )));
    }
    if !before.same_topology(after) {
        return Err(error::invalid_mutation("inner optimizer altered the topology")
            .with_context("agent_id", before.agent_id.clone()));
    }
    Ok(())
}

// ============================================================================
// Few-shot bootstrap
// ============================================================================

/// Attaches demonstrations mined from passing traces
///
/// Every node that appears in a passing trace gets up to `max_demos`
/// demonstrations built from its own steps, taken from the best traces first
/// and deduplicated by inputs. Instructions are left alone.
#[derive(Debug, Clone)]
pub struct FewShotBootstrap {
    max_demos: usize,
}

impl Default for FewShotBootstrap {
    fn default() -> Self {
        Self { max_demos: 2 }
    }
}

impl FewShotBootstrap {
    pub fn new(max_demos: usize) -> Self {
        Self { max_demos }
    }
}

#[async_trait]
impl InnerOptimizer for FewShotBootstrap {
    fn name(&self) -> &str {
        "few_shot_bootstrap"
    }

    async fn optimize(
        &self,
        descriptor: &AgentDescriptor,
        traces: &[ScoredTrace],
        _scorer: &dyn Scorer,
    ) -> Result<AgentDescriptor> {
        let mut tuned = descriptor.clone();

        for (name, node) in tuned.nodes.iter_mut() {
            let mut demos: Vec<Demonstration> = Vec::new();
            let steps = traces.iter().flat_map(|t| t.trace.steps_for(name));
            for step in steps {
                if demos.len() >= self.max_demos {
                    break;
                }
                if step.outputs.is_empty() || demos.iter().any(|d| d.inputs == step.inputs) {
                    continue;
                }
                demos.push(Demonstration {
                    inputs: step.inputs.clone(),
                    outputs: step.outputs.clone(),
                });
            }
            if !demos.is_empty() {
                debug!(node = %name, demos = demos.len(), "bootstrapped demonstrations");
                node.demos = demos;
            }
        }

        Ok(tuned)
    }
}

// ============================================================================
// LLM architect
// ============================================================================

const NO_VIABLE_MUTATION: &str = "NO_VIABLE_MUTATION";

const ARCHITECT_PROMPT: &str = r#"You are the architect of a multi-step LLM agent. The agent is described by a JSON descriptor: `start_node`, `nodes` (name -> {type, signature, instruction, tools}) and `flow` (name -> edge).

Node types: Direct, Reasoned, ToolUsing. A signature reads "a, b -> c, d".
Edges: {"next": "<node>|end"} or {"type": "branch", "source_var": "<output field>", "branches": {"<value>": "<node>|end"}, "default": "<node>|end"}.

Read the diagnosis and fix the bottleneck by rewriting the topology. Mutation strategies:
1. Splitting: a node doing too much becomes a planner -> executor pair.
2. Tooling: calculation or lookup failures turn the node into ToolUsing with tools attached.
3. Looping: unstable quality gets a critic node and a branch back to a refiner.

Reply with one line `mutation_reason: <short reason>` followed by the complete new descriptor in a ```json block. Keep `agent_id` unchanged. If no structural change would help, reply with NO_VIABLE_MUTATION: <reason>."#;

/// Outer mutator backed by a completion provider
pub struct LlmArchitect<P> {
    provider: P,
    temperature: Option<f32>,
}

impl<P: LlmProvider> LlmArchitect<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl<P: LlmProvider> OuterMutator for LlmArchitect<P> {
    async fn mutate(
        &self,
        descriptor: &AgentDescriptor,
        diagnostics: &Diagnostics,
    ) -> Result<MutationOutcome> {
        let messages = vec![
            ChatMessage::system(ARCHITECT_PROMPT),
            ChatMessage::user(format!(
                "Current descriptor:\n```json\n{}\n```\n\nDiagnosis:\n{}",
                descriptor.to_json_pretty()?,
                diagnostics.report()
            )),
        ];
        let mut request = CompletionRequest::new(messages);
        if let Some(t) = self.temperature {
            request = request.with_temperature(t);
        }

        let response = self
            .provider
            .complete(request)
            .await
            .map_err(|e| Error::from(e).with_operation("LlmArchitect::mutate"))?;
        parse_architect_reply(descriptor, response.content.as_deref().unwrap_or_default())
    }
}

/// Interpret an architect reply against the descriptor it was asked to change
pub fn parse_architect_reply(current: &AgentDescriptor, reply: &str) -> Result<MutationOutcome> {
    if let Some(reason) = no_viable_reason(reply) {
        return Ok(MutationOutcome::NoViableMutation {
            reason: if reason.is_empty() {
                "architect found no viable mutation".into()
            } else {
                reason.to_string()
            },
        });
    }

    let reason = reply
        .lines()
        .find_map(|line| {
            let line = line.trim().trim_start_matches('*');
            let (key, value) = line.split_once(':')?;
            key.trim_end_matches('*')
                .trim()
                .eq_ignore_ascii_case("mutation_reason")
                .then(|| value.trim().to_string())
        })
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "structural mutation".to_string());

    let json = extract_json(reply);
    let mut proposed = AgentDescriptor::from_json(json, ParseMode::Lenient).map_err(|e| {
        error::invalid_mutation(format!("architect returned an unusable descriptor: {}", e.message()))
            .with_context("agent_id", current.agent_id.clone())
    })?;
    proposed.agent_id = current.agent_id.clone();

    if proposed.same_topology(current) {
        return Ok(MutationOutcome::NoViableMutation {
            reason: "architect returned the current topology".into(),
        });
    }

    info!(agent_id = %current.agent_id, reason = %reason, "architect proposed a new topology");
    Ok(MutationOutcome::Mutated {
        descriptor: proposed,
        reason,
    })
}

/// Reason after a `NO_VIABLE_MUTATION` marker that opens a line outside any code fence
fn no_viable_reason(reply: &str) -> Option<&str> {
    let mut fenced = false;
    for line in reply.lines() {
        let line = line.trim().trim_start_matches('*');
        if line.starts_with("```") {
            fenced = !fenced;
            continue;
        }
        if fenced {
            continue;
        }
        if let Some(rest) = line.strip_prefix(NO_VIABLE_MUTATION) {
            return Some(rest.trim_start_matches('*').trim_start_matches(':').trim());
        }
    }
    None
}

/// Pull the JSON body out of a fenced or bare reply
fn extract_json(content: &str) -> &str {
    if content.contains("```json") {
        content
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .unwrap_or(content)
    } else if content.contains("```") {
        content
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .unwrap_or(content)
    } else {
        match (content.find('{'), content.rfind('}')) {
            (Some(start), Some(end)) if start < end => &content[start..=end],
            _ => content.trim(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, Example};
    use crate::harness::{EvaluationHarness, ScoreRecord};
    use evoforge_graph::{
        compile, fields, invoker_fn, CompletionResponse, EdgeSpec, ErrorKind, Fields, FinishReason,
        GraphExecutor, NodeCall, NodeKind, NodeSpec, ProviderError, Usage,
    };
    use std::sync::{Arc, Mutex};

    fn solver() -> AgentDescriptor {
        AgentDescriptor::new("solver", "solve").with_node(
            "solve",
            NodeSpec::new(NodeKind::Reasoned, "question -> answer", "Answer the question.").unwrap(),
        )
    }

    fn split_solver() -> AgentDescriptor {
        AgentDescriptor::new("renamed", "plan")
            .with_node(
                "plan",
                NodeSpec::new(NodeKind::Reasoned, "question -> plan", "Plan.").unwrap(),
            )
            .with_node(
                "solve",
                NodeSpec::new(NodeKind::Direct, "question, plan -> answer", "Solve.").unwrap(),
            )
            .with_flow("plan", EdgeSpec::next("solve"))
    }

    fn empty_diagnostics(descriptor: &AgentDescriptor) -> Diagnostics {
        Diagnostics::new(
            descriptor,
            &ScoreRecord {
                agent_id: descriptor.agent_id.clone(),
                version: descriptor.version,
                dataset_id: "d".into(),
                score: 0.4,
                examples: 5,
                failures: 0,
                timestamp: 0,
                bad_cases: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_bootstrap_attaches_demos_from_passing_traces() {
        let graph = compile(&solver()).unwrap();
        let invoker = invoker_fn(|call: &NodeCall<'_>| {
            let q = call.input_str("question").unwrap_or_default();
            Ok(fields([("answer", format!("{} done", q))]))
        });
        let harness = EvaluationHarness::new(GraphExecutor::new(Arc::new(invoker)));
        let dataset = Dataset::new(
            "d",
            ["a", "b", "a", "c"]
                .iter()
                .map(|q| Example::new(fields([("question", *q)])))
                .collect(),
        );
        let scorer = |_: &Example, _: &Fields| 1.0;
        let eval = harness.evaluate(&graph, &dataset, &scorer).await;

        let tuned = FewShotBootstrap::default()
            .optimize(&solver(), &eval.passing, &scorer)
            .await
            .unwrap();

        let demos = &tuned.node("solve").unwrap().demos;
        assert_eq!(demos.len(), 2);
        assert_ne!(demos[0].inputs, demos[1].inputs);
        assert_eq!(tuned.node("solve").unwrap().instruction, "Answer the question.");
        check_inner(&solver(), &tuned).unwrap();
    }

    #[test]
    fn test_check_inner_rejects_topology_change() {
        let mut split = split_solver();
        split.agent_id = "solver".into();
        let err = check_inner(&solver(), &split).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMutation);

        let err = check_inner(&solver(), &split_solver()).unwrap_err();
        assert!(err.message().contains("agent_id"));
    }

    #[test]
    fn test_parse_fenced_reply() {
        let reply = format!(
            "**mutation_reason**: split planning from solving\n```json\n{}\n```",
            split_solver().to_json_pretty().unwrap()
        );
        match parse_architect_reply(&solver(), &reply).unwrap() {
            MutationOutcome::Mutated { descriptor, reason } => {
                assert_eq!(reason, "split planning from solving");
                assert_eq!(descriptor.agent_id, "solver");
                assert_eq!(descriptor.start_node, "plan");
            }
            other => panic!("expected a mutation, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_no_viable_and_garbage() {
        match parse_architect_reply(&solver(), "NO_VIABLE_MUTATION: already minimal").unwrap() {
            MutationOutcome::NoViableMutation { reason } => assert_eq!(reason, "already minimal"),
            other => panic!("unexpected {:?}", other),
        }

        let same = solver().to_json_pretty().unwrap();
        assert!(matches!(
            parse_architect_reply(&solver(), &same).unwrap(),
            MutationOutcome::NoViableMutation { .. }
        ));

        let err = parse_architect_reply(&solver(), "here you go: {not json}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMutation);
    }

    #[test]
    fn test_marker_inside_descriptor_is_not_a_refusal() {
        let mut proposed = split_solver();
        proposed.nodes.get_mut("plan").unwrap().instruction =
            "Plan the steps. NO_VIABLE_MUTATION is not an answer.".into();
        let reply = format!(
            "mutation_reason: split planning\n```json\n{}\n```",
            proposed.to_json_pretty().unwrap()
        );
        assert!(matches!(
            parse_architect_reply(&solver(), &reply).unwrap(),
            MutationOutcome::Mutated { .. }
        ));

        let prose = "The graph is small.\n**NO_VIABLE_MUTATION**: nothing to split\nThanks.";
        match parse_architect_reply(&solver(), prose).unwrap() {
            MutationOutcome::NoViableMutation { reason } => assert_eq!(reason, "nothing to split"),
            other => panic!("unexpected {:?}", other),
        }
    }

    struct Canned {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn default_model(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            let prompt = request
                .messages
                .iter()
                .filter_map(|m| m.content.clone())
                .collect::<Vec<_>>()
                .join("\n");
            self.prompts.lock().unwrap().push(prompt);
            Ok(CompletionResponse {
                id: "r".into(),
                model: "stub".into(),
                content: Some(self.reply.clone()),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_architect_sends_descriptor_and_diagnosis() {
        let provider = Canned {
            reply: format!("mutation_reason: split\n{}", split_solver().to_json_pretty().unwrap()),
            prompts: Mutex::new(Vec::new()),
        };
        let architect = LlmArchitect::new(provider);

        let outcome = architect
            .mutate(&solver(), &empty_diagnostics(&solver()))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Mutated { .. }));

        let prompts = architect.provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("\"start_node\": \"solve\""));
        assert!(prompts[0].contains("Current Score: 40.00%"));
    }
}
