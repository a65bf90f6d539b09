//! # LLM-backed node invocation
//!
//! [`LlmInvoker`] implements [`NodeInvoker`] on top of any [`LlmProvider`].
//! A node becomes one chat exchange:
//!
//! - system: the node instruction plus the output protocol
//! - user: demonstrations (if any) followed by the input fields
//!
//! The model answers with one `field: value` line per output field. Reasoned
//! nodes are asked for a `reasoning` field first, which is discarded. A
//! ToolUsing node may call its tools through a [`ToolBox`] for a bounded
//! number of rounds before it has to answer.

use crate::context::Fields;
use crate::descriptor::{Demonstration, NodeKind};
use crate::error::{Error, ErrorKind, Result};
use crate::invoker::{NodeCall, NodeInvoker};
use crate::provider::{
    ChatMessage, CompletionRequest, LlmProvider, ToolDefinition, UsageTracker,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const REASONING_FIELD: &str = "reasoning";

/// Tools available to ToolUsing nodes
#[async_trait]
pub trait ToolBox: Send + Sync {
    /// Definitions for the named tools; unknown names are skipped
    fn definitions(&self, names: &BTreeSet<String>) -> Vec<ToolDefinition>;

    /// Run one tool call, returning its textual result
    async fn call(&self, name: &str, arguments: &str) -> Result<String>;
}

/// Node invoker that prompts a chat-completion provider
pub struct LlmInvoker<P> {
    provider: P,
    tools: Option<Arc<dyn ToolBox>>,
    max_tool_rounds: usize,
    temperature: Option<f32>,
    usage: Mutex<UsageTracker>,
}

impl<P: LlmProvider> LlmInvoker<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            tools: None,
            max_tool_rounds: 4,
            temperature: None,
            usage: Mutex::new(UsageTracker::new()),
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolBox>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Token usage accumulated across all invocations so far
    pub fn usage(&self) -> UsageTracker {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }

    async fn complete(&self, call: &NodeCall<'_>, request: CompletionRequest) -> Result<crate::provider::CompletionResponse> {
        let mut request = request;
        if request.temperature.is_none() {
            request.temperature = self.temperature;
        }
        let response = self
            .provider
            .complete(request)
            .await
            .map_err(|e| Error::from(e).with_context("node", call.node))?;

        if let Ok(mut usage) = self.usage.lock() {
            usage.track(&response.model, &response.usage);
        }
        Ok(response)
    }

    async fn converse(&self, call: &NodeCall<'_>, mut messages: Vec<ChatMessage>) -> Result<String> {
        let definitions = match (call.spec.kind, &self.tools) {
            (NodeKind::ToolUsing, Some(tools)) => tools.definitions(&call.spec.tools),
            (NodeKind::ToolUsing, None) => {
                return Err(Error::model_invocation_failed(
                    call.node,
                    "tool-using node invoked without a tool box",
                ))
            }
            _ => Vec::new(),
        };

        for round in 0..=self.max_tool_rounds {
            let mut request = CompletionRequest::new(messages.clone());
            if !definitions.is_empty() {
                request = request.with_tools(definitions.clone());
            }
            let response = self.complete(call, request).await?;

            if response.tool_calls.is_empty() {
                return response.content.ok_or_else(|| {
                    Error::model_invocation_failed(call.node, "empty completion")
                });
            }

            let Some(tools) = &self.tools else {
                return Err(Error::model_invocation_failed(
                    call.node,
                    "model requested tools the node does not have",
                ));
            };
            if round == self.max_tool_rounds {
                break;
            }

            messages.push(ChatMessage::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for tc in &response.tool_calls {
                let output = if call.spec.tools.contains(&tc.name) {
                    debug!(node = call.node, tool = %tc.name, "calling tool");
                    match tools.call(&tc.name, &tc.arguments).await {
                        Ok(output) => output,
                        Err(e) => format!("error: {}", e.message()),
                    }
                } else {
                    warn!(node = call.node, tool = %tc.name, "model called an unbound tool");
                    format!("error: tool '{}' is not available", tc.name)
                };
                messages.push(ChatMessage::tool_result(&tc.id, output));
            }
        }

        Err(Error::model_invocation_failed(call.node, "tool rounds exhausted")
            .with_context("max_tool_rounds", self.max_tool_rounds.to_string()))
    }
}

#[async_trait]
impl<P: LlmProvider> NodeInvoker for LlmInvoker<P> {
    async fn invoke(&self, call: NodeCall<'_>) -> Result<Fields> {
        let messages = render_messages(&call);
        let reply = self.converse(&call, messages).await?;

        let mut expected: Vec<&str> = call.spec.signature.outputs().iter().map(String::as_str).collect();
        if call.spec.kind == NodeKind::Reasoned {
            expected.insert(0, REASONING_FIELD);
        }

        let mut outputs = parse_reply(&reply, &expected);
        if call.spec.kind == NodeKind::Reasoned && !call.spec.signature.has_output(REASONING_FIELD) {
            outputs.remove(REASONING_FIELD);
        }
        if outputs.is_empty() {
            return Err(Error::new(
                ErrorKind::ModelInvocationFailed,
                "reply contained none of the requested fields",
            )
            .with_context("node", call.node));
        }
        Ok(outputs)
    }
}

/// Build the chat messages for one node call
pub fn render_messages(call: &NodeCall<'_>) -> Vec<ChatMessage> {
    let sig = &call.spec.signature;
    let mut system = String::new();

    let _ = writeln!(system, "{}", call.spec.instruction.trim());
    let _ = writeln!(system);
    let _ = writeln!(system, "Input fields: {}.", sig.inputs().join(", "));
    let _ = writeln!(
        system,
        "Answer with each output field on its own line, formatted as `field: value`, in this order:"
    );
    if call.spec.kind == NodeKind::Reasoned {
        let _ = writeln!(system, "{}: think step by step before answering", REASONING_FIELD);
    }
    for field in sig.outputs() {
        let _ = writeln!(system, "{}: ...", field);
    }
    if call.spec.kind == NodeKind::ToolUsing {
        let _ = writeln!(system);
        let _ = writeln!(system, "Call tools when you need facts you do not have.");
    }

    let mut user = String::new();
    for (i, demo) in call.spec.demos.iter().enumerate() {
        let _ = writeln!(user, "Example {}:", i + 1);
        render_demo(&mut user, demo);
        let _ = writeln!(user);
    }
    for (name, value) in call.inputs {
        let _ = writeln!(user, "{}: {}", name, display_value(value));
    }

    vec![ChatMessage::system(system.trim_end()), ChatMessage::user(user.trim_end())]
}

fn render_demo(out: &mut String, demo: &Demonstration) {
    for (name, value) in demo.inputs.iter().chain(demo.outputs.iter()) {
        let _ = writeln!(out, "{}: {}", name, display_value(value));
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split a `field: value` reply into the expected fields.
///
/// A line starting with a known `field:` opens that field; other lines are
/// appended to the field currently open. Unknown prefixes before the first
/// field are ignored.
pub fn parse_reply(reply: &str, expected: &[&str]) -> Fields {
    let mut outputs = Fields::new();
    let mut current: Option<(&str, String)> = None;

    for line in reply.lines() {
        let opened = line.split_once(':').and_then(|(key, rest)| {
            let key = key.trim().trim_matches('*').trim();
            expected
                .iter()
                .find(|f| f.eq_ignore_ascii_case(key))
                .map(|f| (*f, rest.trim().to_string()))
        });

        match opened {
            Some((field, value)) => {
                if let Some((name, text)) = current.take() {
                    outputs.insert(name.to_string(), Value::String(text.trim().to_string()));
                }
                current = Some((field, value));
            }
            None => {
                if let Some((_, text)) = current.as_mut() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(line);
                }
            }
        }
    }
    if let Some((name, text)) = current {
        outputs.insert(name.to_string(), Value::String(text.trim().to_string()));
    }

    outputs
}
