//! # Node Invocation
//!
//! The executor never talks to a language model itself. Each node step is
//! handed to a [`NodeInvoker`], which turns the node's instruction and input
//! fields into output fields (or a typed failure).
//!
//! [`LlmInvoker`](crate::llm::LlmInvoker) is the production implementation;
//! tests plug in deterministic stubs.

use crate::context::Fields;
use crate::descriptor::NodeSpec;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything an invoker needs to run one node
#[derive(Debug, Clone, Copy)]
pub struct NodeCall<'a> {
    pub agent_id: &'a str,
    pub node: &'a str,
    pub spec: &'a NodeSpec,
    /// Only the node's declared input fields
    pub inputs: &'a Fields,
    /// 1-based step number within the run
    pub step: usize,
}

impl<'a> NodeCall<'a> {
    pub fn instruction(&self) -> &'a str {
        &self.spec.instruction
    }

    /// Input field as text, if present and a string
    pub fn input_str(&self, field: &str) -> Option<&'a str> {
        self.inputs.get(field).and_then(|v| v.as_str())
    }
}

/// Per-type node invocation collaborator.
///
/// Implementations should populate every declared output field; the
/// executor rejects results with missing outputs and drops extra ones.
/// Failures should be `ModelInvocationFailed` (or a more specific
/// retryable kind such as `RateLimited`).
#[async_trait]
pub trait NodeInvoker: Send + Sync {
    async fn invoke(&self, call: NodeCall<'_>) -> Result<Fields>;
}

#[async_trait]
impl<T: NodeInvoker + ?Sized> NodeInvoker for Arc<T> {
    async fn invoke(&self, call: NodeCall<'_>) -> Result<Fields> {
        (**self).invoke(call).await
    }
}

/// Adapter turning a synchronous closure into a [`NodeInvoker`]
pub struct FnInvoker<F>(F);

/// Wrap a closure as an invoker
pub fn invoker_fn<F>(f: F) -> FnInvoker<F>
where
    F: Fn(&NodeCall<'_>) -> Result<Fields> + Send + Sync,
{
    FnInvoker(f)
}

#[async_trait]
impl<F> NodeInvoker for FnInvoker<F>
where
    F: Fn(&NodeCall<'_>) -> Result<Fields> + Send + Sync,
{
    async fn invoke(&self, call: NodeCall<'_>) -> Result<Fields> {
        (self.0)(&call)
    }
}
