//! # Evolution Controller
//!
//! Drives the dual-loop policy for one agent lineage:
//!
//! ```text
//!            inner round, still improving
//!              ┌──────────┐
//!              ▼          │
//!  ──────▶ Exploring ─────┘──── window flat ────▶ Stagnant
//!              ▲                                    │ diagnose
//!              │ mutation compiled                  ▼
//!              │ (or no viable mutation)  ◀──── Mutating
//!              │
//!  target reached / rounds spent / retries spent ──▶ Converged
//! ```
//!
//! Rounds are strictly sequential: one call to [`EvolutionController::run_round`]
//! performs one transition. Every descriptor version is appended to the
//! [`VersionStore`] before it is compiled or evaluated, and a rejected or
//! invalid version is superseded by a `Revert` entry re-issuing the last
//! known-good descriptor, so the store's latest version is always runnable.

use crate::config::EvolutionConfig;
use crate::dataset::Dataset;
use crate::diagnostics::Diagnostics;
use crate::error::{self, Error, Result};
use crate::harness::{Evaluation, EvaluationHarness, ScoredTrace};
use crate::mutation::{check_inner, FewShotBootstrap, InnerOptimizer, Mutation, MutationOutcome, OuterMutator};
use crate::scorer::Scorer;
use crate::stagnation::StagnationDetector;
use crate::store::{VersionEntry, VersionStore};
use evoforge_graph::{compile, AgentDescriptor, CompiledGraph};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Running inner optimization on the current descriptor
    Exploring,
    /// The score window stopped improving
    Stagnant,
    /// Outer structural step in progress
    Mutating,
    /// Terminal
    Converged,
}

/// Why the controller stopped evolving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ConvergenceReason {
    TargetReached { score: f64 },
    ResourceBudgetExhausted { rounds: usize },
    MutationRetriesExhausted { detail: String },
}

impl ConvergenceReason {
    pub fn is_success(&self) -> bool {
        matches!(self, ConvergenceReason::TargetReached { .. })
    }

    /// The evolution error behind an unsuccessful convergence
    pub fn to_error(&self, agent_id: &str) -> Option<Error> {
        match self {
            ConvergenceReason::TargetReached { .. } => None,
            ConvergenceReason::ResourceBudgetExhausted { rounds } => {
                Some(error::resource_budget_exhausted(agent_id, *rounds))
            }
            ConvergenceReason::MutationRetriesExhausted { detail } => {
                Some(error::mutation_retries_exhausted(agent_id, detail.clone()))
            }
        }
    }
}

/// One evaluation round in the trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundScore {
    pub round: usize,
    /// Version that was evaluated
    pub version: u64,
    pub score: f64,
    /// Whether the evaluated version became current
    pub adopted: bool,
}

/// Snapshot of the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub agent_id: String,
    pub state: ControllerState,
    pub round: usize,
    pub current_version: u64,
    pub current_score: Option<f64>,
    pub best_score: Option<f64>,
    pub trajectory: Vec<RoundScore>,
    pub noop_episodes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConvergenceReason>,
    pub stopped: bool,
}

/// Cloneable stop signal, checked between rounds
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The descriptor version the controller currently stands on
#[derive(Clone)]
struct Current {
    graph: CompiledGraph,
    mutation: Mutation,
    /// Latest evaluation of this version, `None` until its baseline ran
    evaluation: Option<Evaluation>,
}

impl Current {
    fn descriptor(&self) -> &AgentDescriptor {
        self.graph.descriptor()
    }

    fn score(&self) -> Option<f64> {
        self.evaluation.as_ref().map(|e| e.record.score)
    }
}

pub struct EvolutionController {
    harness: EvaluationHarness,
    dataset: Dataset,
    scorer: Arc<dyn Scorer>,
    inner: Arc<dyn InnerOptimizer>,
    outer: Arc<dyn OuterMutator>,
    store: Arc<dyn VersionStore>,
    config: EvolutionConfig,
    detector: StagnationDetector,
    stop: StopHandle,

    state: ControllerState,
    current: Option<Current>,
    /// Highest version appended by this controller
    latest_version: u64,
    round: usize,
    /// Scores of the current topology, one per round
    window: Vec<f64>,
    trajectory: Vec<RoundScore>,
    best_score: Option<f64>,
    diagnostics: Option<Diagnostics>,
    noop_episodes: usize,
    reason: Option<ConvergenceReason>,
}

impl EvolutionController {
    pub fn new(
        harness: EvaluationHarness,
        dataset: Dataset,
        scorer: Arc<dyn Scorer>,
        outer: Arc<dyn OuterMutator>,
        store: Arc<dyn VersionStore>,
    ) -> Self {
        let config = EvolutionConfig::default();
        Self {
            harness,
            dataset,
            scorer,
            inner: Arc::new(FewShotBootstrap::default()),
            outer,
            store,
            detector: StagnationDetector::new(config.stagnation_window, config.stagnation_epsilon),
            config,
            stop: StopHandle::default(),
            state: ControllerState::Exploring,
            current: None,
            latest_version: 0,
            round: 0,
            window: Vec::new(),
            trajectory: Vec::new(),
            best_score: None,
            diagnostics: None,
            noop_episodes: 0,
            reason: None,
        }
    }

    pub fn with_inner(mut self, inner: Arc<dyn InnerOptimizer>) -> Self {
        self.inner = inner;
        self
    }

    pub fn with_config(mut self, config: EvolutionConfig) -> Self {
        self.detector = StagnationDetector::new(config.stagnation_window, config.stagnation_epsilon);
        self.config = config;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Diagnosis of the last stagnation episode
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }

    /// The current descriptor, if initialized
    pub fn current(&self) -> Option<&AgentDescriptor> {
        self.current.as_ref().map(Current::descriptor)
    }

    /// Adopt the starting descriptor
    ///
    /// The descriptor must compile. If the store already holds this lineage
    /// the descriptor is re-issued after its latest version.
    pub fn initialize(&mut self, mut descriptor: AgentDescriptor) -> Result<()> {
        self.config.validate()?;

        if let Some(latest) = self.store.latest(&descriptor.agent_id)? {
            if latest.version() >= descriptor.version {
                descriptor.version = latest.version() + 1;
            }
        }
        let graph = compile(&descriptor).map_err(|e| e.with_operation("EvolutionController::initialize"))?;
        self.store.append(VersionEntry::new(descriptor.clone(), Mutation::Initial))?;

        info!(agent_id = %descriptor.agent_id, version = descriptor.version, "evolution initialized");
        self.latest_version = descriptor.version;
        self.current = Some(Current {
            graph,
            mutation: Mutation::Initial,
            evaluation: None,
        });
        self.state = ControllerState::Exploring;
        Ok(())
    }

    /// Perform one state transition and return the new state
    pub async fn run_round(&mut self) -> Result<ControllerState> {
        if self.current.is_none() {
            return Err(Error::unexpected("controller has no descriptor; call initialize first")
                .with_operation("EvolutionController::run_round"));
        }

        match self.state {
            ControllerState::Exploring => self.explore().await?,
            ControllerState::Stagnant => self.diagnose()?,
            ControllerState::Mutating => self.mutate().await?,
            ControllerState::Converged => {}
        }
        Ok(self.state)
    }

    /// Run rounds until converged or stopped
    pub async fn run(&mut self) -> Result<ControllerStatus> {
        while self.state != ControllerState::Converged {
            if self.stop.is_stopped() {
                info!(state = ?self.state, round = self.round, "stop requested; halting");
                break;
            }
            self.run_round().await?;
        }
        Ok(self.status())
    }

    pub fn status(&self) -> ControllerStatus {
        let current = self.current.as_ref();
        ControllerStatus {
            agent_id: current
                .map(|c| c.descriptor().agent_id.clone())
                .unwrap_or_default(),
            state: self.state,
            round: self.round,
            current_version: current.map(|c| c.descriptor().version).unwrap_or_default(),
            current_score: current.and_then(Current::score),
            best_score: self.best_score,
            trajectory: self.trajectory.clone(),
            noop_episodes: self.noop_episodes,
            reason: self.reason.clone(),
            stopped: self.stop.is_stopped(),
        }
    }

    // ------------------------------------------------------------------------
    // Exploring
    // ------------------------------------------------------------------------

    async fn explore(&mut self) -> Result<()> {
        if self.round >= self.config.max_rounds {
            self.converge(ConvergenceReason::ResourceBudgetExhausted { rounds: self.round });
            return Ok(());
        }
        self.round += 1;

        // `self.current` stays in place until the round succeeds
        let Some(current) = self.current.clone() else {
            return Err(Error::unexpected("controller has no descriptor"));
        };
        let current = match current.evaluation {
            None => self.evaluate_current(current).await?,
            Some(_) => self.inner_round(current).await?,
        };
        self.current = Some(current);
        self.after_round();
        Ok(())
    }

    /// Evaluate the current version in place and record its score
    async fn evaluate_current(&mut self, mut current: Current) -> Result<Current> {
        let evaluation = self.evaluate(&current.graph).await;
        self.store.append(
            VersionEntry::new(current.descriptor().clone(), current.mutation.clone())
                .with_score(evaluation.record.clone()),
        )?;
        self.push_round(current.descriptor().version, evaluation.record.score, true);
        current.evaluation = Some(evaluation);
        Ok(current)
    }

    /// Tune the current version and keep the candidate if it is not worse
    async fn inner_round(&mut self, current: Current) -> Result<Current> {
        let traces: Vec<ScoredTrace> = current
            .evaluation
            .as_ref()
            .map(|e| {
                e.passing
                    .iter()
                    .take(self.config.max_training_traces)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let candidate = self
            .inner
            .optimize(current.descriptor(), &traces, self.scorer.as_ref())
            .await
            .and_then(|c| check_inner(current.descriptor(), &c).map(|_| c));
        let mut candidate = match candidate {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(round = self.round, error = %e, "inner optimizer produced no candidate; re-evaluating");
                return self.evaluate_current(current).await;
            }
        };

        candidate.version = self.next_version();
        let mutation = Mutation::Inner {
            optimizer: self.inner.name().to_string(),
        };
        self.store.append(VersionEntry::new(candidate.clone(), mutation.clone()))?;

        let graph = match compile(&candidate) {
            Ok(graph) => graph,
            Err(e) => {
                warn!(version = candidate.version, error = %e, "inner candidate does not compile");
                let current = self.revert(current)?;
                let score = current.score().unwrap_or_default();
                self.push_round(candidate.version, score, false);
                return Ok(current);
            }
        };

        let evaluation = self.evaluate(&graph).await;
        let score = evaluation.record.score;
        self.store.append(
            VersionEntry::new(candidate.clone(), mutation.clone()).with_score(evaluation.record.clone()),
        )?;

        let baseline = current.score().unwrap_or_default();
        if score >= baseline {
            debug!(version = candidate.version, score, baseline, "inner candidate adopted");
            self.push_round(candidate.version, score, true);
            Ok(Current {
                graph,
                mutation,
                evaluation: Some(evaluation),
            })
        } else {
            debug!(version = candidate.version, score, baseline, "inner candidate rejected");
            let rejected = candidate.version;
            let current = self.revert(current)?;
            self.push_round(rejected, score, false);
            Ok(current)
        }
    }

    fn after_round(&mut self) {
        let Some(score) = self.current.as_ref().and_then(Current::score) else {
            return;
        };
        self.window.push(score);
        self.best_score = Some(self.best_score.map_or(score, |best| best.max(score)));

        info!(round = self.round, score, window = ?self.window, "round finished");

        if score >= self.config.target_score {
            self.converge(ConvergenceReason::TargetReached { score });
        } else if self.detector.is_stagnant(&self.window) {
            info!(round = self.round, "score trajectory stagnant");
            self.state = ControllerState::Stagnant;
        }
    }

    // ------------------------------------------------------------------------
    // Stagnant / Mutating
    // ------------------------------------------------------------------------

    fn diagnose(&mut self) -> Result<()> {
        let Some(current) = self.current.as_ref() else {
            return Err(Error::unexpected("controller has no descriptor"));
        };
        let Some(evaluation) = current.evaluation.as_ref() else {
            return Err(Error::unexpected("stagnant without an evaluation"));
        };

        let diagnostics = Diagnostics::new(current.descriptor(), &evaluation.record);
        info!(
            version = diagnostics.version,
            failures = diagnostics.failures,
            mode = ?diagnostics.mode,
            "diagnosed stagnation"
        );
        self.diagnostics = Some(diagnostics);
        self.state = ControllerState::Mutating;
        Ok(())
    }

    async fn mutate(&mut self) -> Result<()> {
        let Some(current) = self.current.clone() else {
            return Err(Error::unexpected("controller has no descriptor"));
        };
        let Some(diagnostics) = self.diagnostics.clone() else {
            return Err(Error::unexpected("mutating without a diagnosis"));
        };

        let retries = self.config.mutation_retries;
        let mut last_problem = String::new();
        let mut superseded = false;

        for attempt in 1..=retries {
            let outcome = self.outer.mutate(current.descriptor(), &diagnostics).await;
            match outcome {
                Ok(MutationOutcome::NoViableMutation { reason }) => {
                    self.noop_episodes += 1;
                    info!(attempt, noop_episodes = self.noop_episodes, reason = %reason, "no viable mutation");
                    self.settle(current, superseded)?;
                    if self.noop_episodes >= self.config.max_noop_episodes {
                        self.converge(ConvergenceReason::MutationRetriesExhausted {
                            detail: format!(
                                "no viable mutation in {} consecutive stagnation episodes: {}",
                                self.noop_episodes, reason
                            ),
                        });
                    } else {
                        self.state = ControllerState::Exploring;
                    }
                    return Ok(());
                }
                Ok(MutationOutcome::Mutated {
                    mut descriptor,
                    reason,
                }) => {
                    if descriptor.agent_id != current.descriptor().agent_id {
                        last_problem = format!("mutation renamed the agent to '{}'", descriptor.agent_id);
                        warn!(attempt, problem = %last_problem, "mutation rejected");
                        continue;
                    }

                    descriptor.version = self.next_version();
                    let mutation = Mutation::Structural { reason };
                    if let Err(e) = self.store.append(VersionEntry::new(descriptor.clone(), mutation.clone())) {
                        if superseded {
                            if let Err(revert) = self.settle(current, true) {
                                warn!(error = %revert, "could not re-issue the last good version");
                            }
                        }
                        return Err(e);
                    }
                    superseded = true;

                    match compile(&descriptor) {
                        Ok(graph) => {
                            info!(attempt, version = descriptor.version, "structural mutation adopted");
                            self.current = Some(Current {
                                graph,
                                mutation,
                                evaluation: None,
                            });
                            self.window.clear();
                            self.noop_episodes = 0;
                            self.state = ControllerState::Exploring;
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(attempt, version = descriptor.version, error = %e, "mutation does not compile");
                            last_problem = e.to_string();
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "outer mutation failed");
                    last_problem = e.to_string();
                }
            }
        }

        self.settle(current, superseded)?;
        self.converge(ConvergenceReason::MutationRetriesExhausted {
            detail: format!("{} mutation attempts failed; last: {}", retries, last_problem),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn evaluate(&self, graph: &CompiledGraph) -> Evaluation {
        self.harness
            .evaluate(graph, &self.dataset, self.scorer.as_ref())
            .await
    }

    fn next_version(&mut self) -> u64 {
        self.latest_version += 1;
        self.latest_version
    }

    /// Re-issue the current descriptor after versions that superseded it
    fn revert(&mut self, current: Current) -> Result<Current> {
        let good = current.descriptor().version;
        let mut descriptor = current.descriptor().clone();
        descriptor.version = self.next_version();

        let mutation = Mutation::Revert { to: good };
        let mut entry = VersionEntry::new(descriptor.clone(), mutation.clone());
        if let Some(evaluation) = &current.evaluation {
            let mut record = evaluation.record.clone();
            record.version = descriptor.version;
            entry = entry.with_score(record);
        }
        self.store.append(entry)?;
        debug!(from = good, to = descriptor.version, "reverted to known-good version");

        Ok(Current {
            graph: compile(&descriptor)?,
            mutation,
            evaluation: current.evaluation,
        })
    }

    /// Make `current` the controller's version again, re-issuing it when
    /// this episode appended versions after it
    fn settle(&mut self, current: Current, superseded: bool) -> Result<()> {
        let current = if superseded { self.revert(current)? } else { current };
        self.current = Some(current);
        Ok(())
    }

    fn push_round(&mut self, version: u64, score: f64, adopted: bool) {
        self.trajectory.push(RoundScore {
            round: self.round,
            version,
            score,
            adopted,
        });
    }

    fn converge(&mut self, reason: ConvergenceReason) {
        match &reason {
            ConvergenceReason::TargetReached { score } => {
                info!(round = self.round, score, "evolution converged")
            }
            other => warn!(round = self.round, reason = ?other, "evolution stopped"),
        }
        self.reason = Some(reason);
        self.state = ControllerState::Converged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::dataset::Example;
    use crate::store::MemoryVersionStore;
    use async_trait::async_trait;
    use evoforge_graph::{
        fields, invoker_fn, EdgeSpec, ErrorKind, Fields, GraphExecutor, NodeCall, NodeKind,
        NodeSpec,
    };
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn solver() -> AgentDescriptor {
        AgentDescriptor::new("solver", "solve").with_node(
            "solve",
            NodeSpec::new(NodeKind::Direct, "question -> answer", "v0").unwrap(),
        )
    }

    /// Echoes the node's instruction as the answer
    fn harness() -> EvaluationHarness {
        let invoker = invoker_fn(|call: &NodeCall<'_>| {
            let out = call
                .spec
                .signature
                .outputs()
                .iter()
                .map(|f| (f.clone(), call.instruction().into()))
                .collect::<Fields>();
            Ok(out)
        });
        EvaluationHarness::new(GraphExecutor::new(Arc::new(invoker)))
            .with_config(HarnessConfig::default().with_pass_threshold(0.0))
    }

    fn dataset() -> Dataset {
        Dataset::new("d", vec![Example::new(fields([("question", "q")]))])
    }

    /// Scores the echoed instruction through a lookup table
    fn table(scores: &'static [(&'static str, f64)]) -> Arc<dyn Scorer> {
        Arc::new(move |_: &Example, outputs: &Fields| {
            let answer = outputs
                .get("answer")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            scores
                .iter()
                .find(|(k, _)| *k == answer)
                .map(|(_, s)| *s)
                .unwrap_or(0.0)
        })
    }

    /// Rewrites every instruction to v1, v2, ...
    struct Renamer {
        calls: AtomicUsize,
    }

    impl Renamer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InnerOptimizer for Renamer {
        fn name(&self) -> &str {
            "renamer"
        }

        async fn optimize(
            &self,
            descriptor: &AgentDescriptor,
            _traces: &[ScoredTrace],
            _scorer: &dyn Scorer,
        ) -> Result<AgentDescriptor> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut next = descriptor.clone();
            for node in next.nodes.values_mut() {
                node.instruction = format!("v{}", n);
            }
            Ok(next)
        }
    }

    /// Replays scripted outcomes, then reports no viable mutation
    struct Scripted {
        outcomes: Mutex<Vec<Result<MutationOutcome>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<MutationOutcome>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OuterMutator for Scripted {
        async fn mutate(
            &self,
            _descriptor: &AgentDescriptor,
            _diagnostics: &Diagnostics,
        ) -> Result<MutationOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop().unwrap_or_else(|| {
                Ok(MutationOutcome::NoViableMutation {
                    reason: "nothing left".into(),
                })
            })
        }
    }

    fn controller(
        scorer: Arc<dyn Scorer>,
        outer: Arc<dyn OuterMutator>,
        store: Arc<MemoryVersionStore>,
        config: EvolutionConfig,
    ) -> EvolutionController {
        let mut controller = EvolutionController::new(harness(), dataset(), scorer, outer, store)
            .with_inner(Renamer::new())
            .with_config(config);
        controller.initialize(solver()).unwrap();
        controller
    }

    const TRAJECTORY: &[(&str, f64)] = &[("v0", 0.50), ("v1", 0.51), ("v2", 0.505), ("v3", 0.509)];

    #[tokio::test]
    async fn test_stagnant_after_fourth_round() {
        let store = Arc::new(MemoryVersionStore::new());
        let mut c = controller(
            table(TRAJECTORY),
            Scripted::new(Vec::new()),
            store.clone(),
            EvolutionConfig::default().with_stagnation(3, 0.02),
        );

        for _ in 0..3 {
            assert_eq!(c.run_round().await.unwrap(), ControllerState::Exploring);
        }
        assert_eq!(c.run_round().await.unwrap(), ControllerState::Stagnant);

        let status = c.status();
        assert_eq!(status.round, 4);
        let scores: Vec<f64> = status.trajectory.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![0.50, 0.51, 0.505, 0.509]);
        let adopted: Vec<bool> = status.trajectory.iter().map(|r| r.adopted).collect();
        assert_eq!(adopted, vec![true, true, false, false]);
        assert_eq!(status.best_score, Some(0.51));
        assert_eq!(status.current_score, Some(0.51));

        // v1 adopted, v2 and v3 each followed by a revert to the good version
        let history = store.history("solver").unwrap();
        let latest = history.last().unwrap();
        assert!(matches!(latest.mutation, Mutation::Revert { .. }));
        assert_eq!(latest.descriptor.node("solve").unwrap().instruction, "v1");
        assert_eq!(latest.version(), status.current_version);
        assert_eq!(store.trajectory("solver").unwrap().first().unwrap().score, 0.50);
    }

    #[tokio::test]
    async fn test_three_noop_episodes_converge() {
        let outer = Scripted::new(Vec::new());
        let mut c = controller(
            table(&[]),
            outer.clone(),
            Arc::new(MemoryVersionStore::new()),
            EvolutionConfig::default(),
        );

        let status = c.run().await.unwrap();
        assert_eq!(status.state, ControllerState::Converged);
        assert_eq!(outer.calls(), 3);
        assert_eq!(status.noop_episodes, 3);
        match status.reason.unwrap() {
            ConvergenceReason::MutationRetriesExhausted { detail } => {
                assert!(detail.contains("no viable mutation"))
            }
            other => panic!("unexpected reason {:?}", other),
        }
        assert_eq!(
            c.status().reason.unwrap().to_error("solver").unwrap().kind(),
            ErrorKind::MutationRetriesExhausted
        );
    }

    fn planner_solver() -> AgentDescriptor {
        AgentDescriptor::new("solver", "plan")
            .with_node(
                "plan",
                NodeSpec::new(NodeKind::Reasoned, "question -> plan", "planned").unwrap(),
            )
            .with_node(
                "solve",
                NodeSpec::new(NodeKind::Direct, "plan -> answer", "split").unwrap(),
            )
            .with_flow("plan", EdgeSpec::next("solve"))
    }

    #[tokio::test]
    async fn test_structural_mutation_reaches_target() {
        let store = Arc::new(MemoryVersionStore::new());
        let outer = Scripted::new(vec![Ok(MutationOutcome::Mutated {
            descriptor: planner_solver(),
            reason: "split planning".into(),
        })]);
        let mut c = controller(
            table(&[("split", 0.95)]),
            outer.clone(),
            store.clone(),
            EvolutionConfig::default(),
        );

        let status = c.run().await.unwrap();
        assert_eq!(status.reason, Some(ConvergenceReason::TargetReached { score: 0.95 }));
        assert_eq!(outer.calls(), 1);
        assert_eq!(c.current().unwrap().start_node, "plan");

        let history = store.history("solver").unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(&e.mutation, Mutation::Structural { reason } if reason == "split planning")));
        // versions never go backwards
        assert!(history.windows(2).all(|w| w[0].version() <= w[1].version()));
    }

    #[tokio::test]
    async fn test_invalid_mutations_revert_to_last_good() {
        let broken = planner_solver().with_flow("solve", EdgeSpec::next("nowhere"));
        let store = Arc::new(MemoryVersionStore::new());
        let outer = Scripted::new(vec![
            Ok(MutationOutcome::Mutated {
                descriptor: broken.clone(),
                reason: "a".into(),
            }),
            Err(error::invalid_mutation("garbled reply")),
            Ok(MutationOutcome::Mutated {
                descriptor: broken,
                reason: "c".into(),
            }),
        ]);
        let mut c = controller(table(&[]), outer.clone(), store.clone(), EvolutionConfig::default());

        let status = c.run().await.unwrap();
        assert_eq!(outer.calls(), 3);
        assert!(matches!(
            status.reason,
            Some(ConvergenceReason::MutationRetriesExhausted { .. })
        ));

        let latest = store.latest("solver").unwrap().unwrap();
        assert!(matches!(latest.mutation, Mutation::Revert { .. }));
        assert_eq!(latest.descriptor.start_node, "solve");
        assert!(compile(&latest.descriptor).is_ok());
        assert_eq!(latest.version(), status.current_version);
    }

    /// Run rounds until the controller is about to mutate
    async fn until_mutating(c: &mut EvolutionController) {
        for _ in 0..20 {
            if c.run_round().await.unwrap() == ControllerState::Mutating {
                return;
            }
        }
        panic!("controller never reached Mutating");
    }

    /// The store's latest version compiles and is the controller's current one
    fn assert_runnable(store: &MemoryVersionStore, c: &EvolutionController) {
        let latest = store.latest("solver").unwrap().unwrap();
        assert!(compile(&latest.descriptor).is_ok(), "latest is {:?}", latest.mutation);
        assert_eq!(latest.version(), c.status().current_version);
        assert_eq!(c.current().unwrap(), &latest.descriptor);
    }

    fn broken() -> AgentDescriptor {
        planner_solver().with_flow("solve", EdgeSpec::next("nowhere"))
    }

    #[tokio::test]
    async fn test_no_viable_after_broken_mutation_reverts() {
        let store = Arc::new(MemoryVersionStore::new());
        let outer = Scripted::new(vec![
            Ok(MutationOutcome::Mutated {
                descriptor: broken(),
                reason: "a".into(),
            }),
            Ok(MutationOutcome::NoViableMutation {
                reason: "gave up".into(),
            }),
        ]);
        let mut c = controller(table(&[]), outer.clone(), store.clone(), EvolutionConfig::default());

        until_mutating(&mut c).await;
        assert_eq!(c.run_round().await.unwrap(), ControllerState::Exploring);
        assert_eq!(outer.calls(), 2);
        assert_eq!(c.status().noop_episodes, 1);
        assert!(matches!(
            store.latest("solver").unwrap().unwrap().mutation,
            Mutation::Revert { .. }
        ));
        assert_runnable(&store, &c);

        c.stop_handle().stop();
        c.run().await.unwrap();
        assert_runnable(&store, &c);
    }

    #[tokio::test]
    async fn test_outer_error_then_no_viable_keeps_current() {
        let store = Arc::new(MemoryVersionStore::new());
        let outer = Scripted::new(vec![Err(error::invalid_mutation("garbled reply"))]);
        let mut c = controller(table(&[]), outer.clone(), store.clone(), EvolutionConfig::default());

        until_mutating(&mut c).await;
        let before = store.history("solver").unwrap().len();
        assert_eq!(c.run_round().await.unwrap(), ControllerState::Exploring);
        assert_eq!(outer.calls(), 2);
        // nothing was appended, so nothing needed re-issuing
        assert_eq!(store.history("solver").unwrap().len(), before);
        assert_runnable(&store, &c);
    }

    #[tokio::test]
    async fn test_broken_then_valid_mutation_is_adopted() {
        let store = Arc::new(MemoryVersionStore::new());
        let outer = Scripted::new(vec![
            Ok(MutationOutcome::Mutated {
                descriptor: broken(),
                reason: "a".into(),
            }),
            Ok(MutationOutcome::Mutated {
                descriptor: planner_solver(),
                reason: "b".into(),
            }),
        ]);
        let mut c = controller(table(&[]), outer, store.clone(), EvolutionConfig::default());

        until_mutating(&mut c).await;
        assert_eq!(c.run_round().await.unwrap(), ControllerState::Exploring);
        assert_eq!(c.current().unwrap().start_node, "plan");
        assert!(matches!(
            &store.latest("solver").unwrap().unwrap().mutation,
            Mutation::Structural { reason } if reason == "b"
        ));
        assert_runnable(&store, &c);
    }

    /// Memory store whose appends fail while switched off
    #[derive(Default)]
    struct Flaky {
        inner: MemoryVersionStore,
        failing: AtomicBool,
    }

    impl Flaky {
        fn failing(&self, on: bool) {
            self.failing.store(on, Ordering::SeqCst);
        }
    }

    impl VersionStore for Flaky {
        fn append(&self, entry: VersionEntry) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(error::storage_error("disk full"));
            }
            self.inner.append(entry)
        }

        fn latest(&self, agent_id: &str) -> Result<Option<VersionEntry>> {
            self.inner.latest(agent_id)
        }

        fn history(&self, agent_id: &str) -> Result<Vec<VersionEntry>> {
            self.inner.history(agent_id)
        }
    }

    fn flaky_controller(
        scorer: Arc<dyn Scorer>,
        outer: Arc<dyn OuterMutator>,
    ) -> (EvolutionController, Arc<Flaky>) {
        let store = Arc::new(Flaky::default());
        let mut c = EvolutionController::new(harness(), dataset(), scorer, outer, store.clone())
            .with_inner(Renamer::new());
        c.initialize(solver()).unwrap();
        (c, store)
    }

    #[tokio::test]
    async fn test_store_failure_keeps_current_descriptor() {
        let (mut c, store) = flaky_controller(table(TRAJECTORY), Scripted::new(Vec::new()));

        store.failing(true);
        let err = c.run_round().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailed);
        assert_eq!(c.current().unwrap().version, 1);
        assert_eq!(c.status().current_version, 1);

        // the next round re-runs the baseline and carries on
        store.failing(false);
        assert_eq!(c.run_round().await.unwrap(), ControllerState::Exploring);
        assert_eq!(c.status().current_score, Some(0.50));
        assert_eq!(store.latest("solver").unwrap().unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_during_mutation_keeps_current_descriptor() {
        let outer = Scripted::new(vec![
            Ok(MutationOutcome::Mutated {
                descriptor: planner_solver(),
                reason: "a".into(),
            }),
            Ok(MutationOutcome::Mutated {
                descriptor: planner_solver(),
                reason: "a".into(),
            }),
        ]);
        let (mut c, store) = flaky_controller(table(&[]), outer);
        until_mutating(&mut c).await;
        let version = c.status().current_version;

        store.failing(true);
        assert_eq!(c.run_round().await.unwrap_err().kind(), ErrorKind::StorageFailed);
        assert_eq!(c.state(), ControllerState::Mutating);
        assert_eq!(c.status().current_version, version);
        assert_eq!(c.current().unwrap().start_node, "solve");

        store.failing(false);
        assert_eq!(c.run_round().await.unwrap(), ControllerState::Exploring);
        assert_eq!(c.current().unwrap().start_node, "plan");
        let latest = store.latest("solver").unwrap().unwrap();
        assert_eq!(latest.version(), c.status().current_version);
        assert!(compile(&latest.descriptor).is_ok());
    }

    #[tokio::test]
    async fn test_round_budget_is_reported() {
        let mut c = controller(
            table(&[]),
            Scripted::new(Vec::new()),
            Arc::new(MemoryVersionStore::new()),
            EvolutionConfig::default()
                .with_max_rounds(2)
                .with_stagnation(3, 0.01),
        );

        let status = c.run().await.unwrap();
        assert_eq!(status.round, 2);
        assert_eq!(
            status.reason,
            Some(ConvergenceReason::ResourceBudgetExhausted { rounds: 2 })
        );
    }

    #[tokio::test]
    async fn test_stop_between_rounds() {
        let store = Arc::new(MemoryVersionStore::new());
        let mut c = controller(
            table(TRAJECTORY),
            Scripted::new(Vec::new()),
            store.clone(),
            EvolutionConfig::default(),
        );
        c.run_round().await.unwrap();
        c.stop_handle().stop();

        let status = c.run().await.unwrap();
        assert!(status.stopped);
        assert_eq!(status.state, ControllerState::Exploring);
        assert_eq!(status.round, 1);
        assert_eq!(store.latest("solver").unwrap().unwrap().version(), status.current_version);
    }

    #[test]
    fn test_resume_issues_a_newer_version() {
        let store = Arc::new(MemoryVersionStore::new());
        let _first = controller(table(&[]), Scripted::new(Vec::new()), store.clone(), EvolutionConfig::default());
        let second = controller(table(&[]), Scripted::new(Vec::new()), store.clone(), EvolutionConfig::default());

        assert_eq!(second.status().current_version, 2);
        assert_eq!(store.history("solver").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_round_before_initialize_fails() {
        let mut c = EvolutionController::new(
            harness(),
            dataset(),
            table(&[]),
            Scripted::new(Vec::new()),
            Arc::new(MemoryVersionStore::new()),
        );
        assert!(c.run_round().await.is_err());
    }
}
