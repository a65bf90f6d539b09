//! # evoforge evolution
//!
//! The dual loop around the graph engine: an inner loop tunes instructions
//! and demonstrations of a fixed topology, and when its score trajectory
//! stagnates an outer step rewrites the topology itself.
//!
//! ## Core Concepts
//! - **Harness**: evaluates a compiled graph over a dataset with an injected scorer
//! - **Store**: append-only lineage of descriptor versions and their scores
//! - **Diagnostics**: mechanical failure characterization from bad-case traces
//! - **Mutation**: inner optimizer and outer mutator collaborators
//! - **Controller**: the Exploring / Stagnant / Mutating / Converged state machine
//!
//! ```rust,no_run
//! use evoforge_evolve::{
//!     Dataset, EngineConfig, EvaluationHarness, EvolutionController, ExactMatch,
//!     FileVersionStore, LlmArchitect,
//! };
//! use evoforge_graph::{AgentDescriptor, GraphExecutor, LlmInvoker, OpenAIProvider, ParseMode};
//! use std::sync::Arc;
//!
//! # async fn demo() -> evoforge_evolve::Result<()> {
//! let config = EngineConfig::from_file("engine.json")?;
//! let executor = GraphExecutor::new(Arc::new(LlmInvoker::new(OpenAIProvider::from_env()?)))
//!     .with_config(config.executor.clone());
//! let harness = EvaluationHarness::new(executor).with_config(config.harness.clone());
//!
//! let mut controller = EvolutionController::new(
//!     harness,
//!     Dataset::from_file("arith.json")?,
//!     Arc::new(ExactMatch::new("answer")),
//!     Arc::new(LlmArchitect::new(OpenAIProvider::from_env()?)),
//!     Arc::new(FileVersionStore::new(".evoforge")?),
//! )
//! .with_config(config.evolution);
//!
//! controller.initialize(AgentDescriptor::from_file("solver.json", ParseMode::Strict)?)?;
//! let status = controller.run().await?;
//! println!("{:?} after {} rounds", status.reason, status.round);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod harness;
pub mod mutation;
pub mod scorer;
pub mod stagnation;
pub mod store;

pub use config::{EngineConfig, EvolutionConfig, HarnessConfig};
pub use controller::{
    ControllerState, ControllerStatus, ConvergenceReason, EvolutionController, RoundScore,
    StopHandle,
};
pub use dataset::{Dataset, Example};
pub use diagnostics::{Breakdown, Diagnostics, FailureMode};
pub use error::{Error, ErrorCategory, ErrorKind, ErrorStatus, Result};
pub use harness::{BadCase, Evaluation, EvaluationHarness, FailureInfo, ScoreRecord, ScoredTrace};
pub use mutation::{
    check_inner, FewShotBootstrap, InnerOptimizer, LlmArchitect, Mutation, MutationOutcome,
    OuterMutator,
};
pub use scorer::{ContainsMatch, ExactMatch, Scorer};
pub use stagnation::StagnationDetector;
pub use store::{FileVersionStore, MemoryVersionStore, VersionEntry, VersionStore};
