//! # evoforge graph engine
//!
//! Interprets a declarative agent description as an executable control-flow
//! graph.
//!
//! ## Core Concepts
//! - **Descriptor**: the agent's "DNA" (nodes, signatures, instructions, flow)
//! - **Compiler**: validates a descriptor into an arena of nodes plus a transition table
//! - **Executor**: walks the compiled graph for one input, producing outputs and a trace
//! - **Invoker**: the collaborator that turns one node call into output fields
//! - **Provider**: trait-based chat-completion backend used by [`LlmInvoker`]
//!
//! ```rust,no_run
//! use evoforge_graph::{compile, fields, AgentDescriptor, GraphExecutor, LlmInvoker, OpenAIProvider, ParseMode};
//! use std::sync::Arc;
//!
//! # async fn demo() -> evoforge_graph::Result<()> {
//! let dna = AgentDescriptor::from_file("poet.json", ParseMode::Strict)?;
//! let graph = compile(&dna)?;
//! let invoker = LlmInvoker::new(OpenAIProvider::from_env()?);
//! let executor = GraphExecutor::new(Arc::new(invoker));
//!
//! let out = executor
//!     .run(&graph, fields([("topic", "autumn")]))
//!     .await
//!     .map_err(|f| f.into_error())?;
//! println!("{}", out.trace.summary());
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod invoker;
pub mod llm;
pub mod provider;
pub mod signature;
pub mod trace;

pub use compiler::{compile, CompiledGraph, CompiledNode, NodeId, Target, Transition};
pub use context::{branch_key, fields, ExecutionContext, Fields};
pub use descriptor::{
    AgentDescriptor, Demonstration, EdgeSpec, NodeKind, NodeRef, NodeSpec, ParseMode, END,
};
pub use error::{Error, ErrorCategory, ErrorKind, ErrorStatus, Result};
pub use executor::{ExecutorConfig, GraphExecutor, RunFailure, RunOutput, RunResult};
pub use invoker::{invoker_fn, FnInvoker, NodeCall, NodeInvoker};
pub use llm::{LlmInvoker, ToolBox};
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    OpenAIProvider, ProviderConfig, ProviderError, ProviderType, Role, ToolCall, ToolChoice,
    ToolDefinition, Usage, UsageTracker,
};
pub use signature::Signature;
pub use trace::{ExecutionTrace, Route, TraceStep};
