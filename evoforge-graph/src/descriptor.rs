//! # Agent Descriptor
//!
//! The declarative "DNA" of an agent: its nodes, their signatures and
//! instructions, tool bindings, and the flow edges between them.
//!
//! ## JSON form
//!
//! ```json
//! {
//!   "agent_id": "poet",
//!   "version": 1,
//!   "start_node": "generator",
//!   "nodes": {
//!     "generator": {"type": "Direct", "signature": "topic -> content", "instruction": "Write."},
//!     "critic": {"type": "Reasoned", "signature": "content -> critique, decision", "instruction": "Judge."}
//!   },
//!   "flow": {
//!     "generator": {"next": "critic"},
//!     "critic": {"type": "branch", "source_var": "decision",
//!                "branches": {"PASS": "end"}, "default": "end"}
//!   }
//! }
//! ```
//!
//! Descriptors are values: the inner optimizer and the outer mutator both
//! produce new descriptors rather than editing one in place.

use crate::context::Fields;
use crate::error::{self, Result};
use crate::signature::Signature;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Terminal sentinel for flow targets
pub const END: &str = "end";

const DESCRIPTOR_KEYS: &[&str] = &["agent_id", "version", "start_node", "nodes", "flow"];
const NODE_KEYS: &[&str] = &["type", "signature", "instruction", "tools", "demos"];

// ============================================================================
// Node references and kinds
// ============================================================================

/// A flow target: a node name or the terminal sentinel `end`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeRef {
    End,
    Node(String),
}

impl NodeRef {
    pub fn node(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == END {
            NodeRef::End
        } else {
            NodeRef::Node(name)
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, NodeRef::End)
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeRef::End => END,
            NodeRef::Node(name) => name,
        }
    }
}

impl From<String> for NodeRef {
    fn from(s: String) -> Self {
        NodeRef::node(s)
    }
}

impl From<&str> for NodeRef {
    fn from(s: &str) -> Self {
        NodeRef::node(s)
    }
}

impl From<NodeRef> for String {
    fn from(r: NodeRef) -> Self {
        r.as_str().to_string()
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a node reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Answer directly from the instruction and inputs
    #[serde(alias = "Predict")]
    Direct,
    /// Produce intermediate reasoning before the outputs
    #[serde(alias = "ChainOfThought")]
    Reasoned,
    /// Interleave reasoning with tool calls
    #[serde(alias = "ReAct")]
    ToolUsing,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Direct => write!(f, "Direct"),
            NodeKind::Reasoned => write!(f, "Reasoned"),
            NodeKind::ToolUsing => write!(f, "ToolUsing"),
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// A worked example attached to a node by the inner optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    pub inputs: Fields,
    pub outputs: Fields,
}

/// One reasoning or tool-use step of the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub signature: Signature,
    /// Behavioral prompt, rewritten by the inner optimizer
    pub instruction: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tools: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub demos: Vec<Demonstration>,
}

impl NodeSpec {
    /// Create a node, parsing its signature string
    pub fn new(kind: NodeKind, signature: &str, instruction: impl Into<String>) -> Result<Self> {
        Ok(Self {
            kind,
            signature: Signature::parse(signature)?,
            instruction: instruction.into(),
            tools: BTreeSet::new(),
            demos: Vec::new(),
        })
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.insert(tool.into());
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }
}

// ============================================================================
// Edges
// ============================================================================

/// Outgoing transition of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEdge", into = "RawEdge")]
pub enum EdgeSpec {
    /// Unconditional transition
    Sequence { next: NodeRef },
    /// Exact-match switch on one of the owning node's outputs
    Branch {
        source_var: String,
        branches: BTreeMap<String, NodeRef>,
        /// Required; kept optional so a missing default surfaces as a
        /// compile error instead of a parse error
        default: Option<NodeRef>,
    },
}

impl EdgeSpec {
    pub fn next(target: impl Into<NodeRef>) -> Self {
        EdgeSpec::Sequence {
            next: target.into(),
        }
    }

    pub fn branch<I, K, T>(source_var: impl Into<String>, arms: I, default: impl Into<NodeRef>) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<NodeRef>,
    {
        EdgeSpec::Branch {
            source_var: source_var.into(),
            branches: arms.into_iter().map(|(k, t)| (k.into(), t.into())).collect(),
            default: Some(default.into()),
        }
    }

    /// Every target this edge can transition to
    pub fn targets(&self) -> Vec<&NodeRef> {
        match self {
            EdgeSpec::Sequence { next } => vec![next],
            EdgeSpec::Branch {
                branches, default, ..
            } => branches.values().chain(default.iter()).collect(),
        }
    }
}

/// Wire shape shared by both edge variants
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEdge {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next: Option<NodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branches: Option<BTreeMap<String, NodeRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<NodeRef>,
}

impl TryFrom<RawEdge> for EdgeSpec {
    type Error = String;

    fn try_from(raw: RawEdge) -> std::result::Result<Self, String> {
        let is_branch = raw.kind.as_deref() == Some("branch") || raw.source_var.is_some();

        if is_branch {
            if raw.next.is_some() {
                return Err("edge cannot have both 'next' and branch fields".into());
            }
            let source_var = raw
                .source_var
                .ok_or_else(|| "branch edge requires 'source_var'".to_string())?;
            let branches = raw
                .branches
                .ok_or_else(|| "branch edge requires 'branches'".to_string())?;
            return Ok(EdgeSpec::Branch {
                source_var,
                branches,
                default: raw.default,
            });
        }

        if let Some(kind) = raw.kind.as_deref() {
            if kind != "sequence" {
                return Err(format!("unknown edge type '{}'", kind));
            }
        }

        match raw.next {
            Some(next) => Ok(EdgeSpec::Sequence { next }),
            None => Err("edge requires 'next' or a branch definition".into()),
        }
    }
}

impl From<EdgeSpec> for RawEdge {
    fn from(edge: EdgeSpec) -> Self {
        match edge {
            EdgeSpec::Sequence { next } => RawEdge {
                kind: None,
                next: Some(next),
                source_var: None,
                branches: None,
                default: None,
            },
            EdgeSpec::Branch {
                source_var,
                branches,
                default,
            } => RawEdge {
                kind: Some("branch".into()),
                next: None,
                source_var: Some(source_var),
                branches: Some(branches),
                default,
            },
        }
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// How unknown keys are treated when loading a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Unknown top-level or node-level keys are an error
    #[default]
    Strict,
    /// Unknown keys are dropped with a warning
    Lenient,
}

/// The complete structure of an agent, identified by `agent_id` + `version`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    #[serde(default = "default_version")]
    pub version: u64,
    pub start_node: String,
    pub nodes: BTreeMap<String, NodeSpec>,
    #[serde(default)]
    pub flow: BTreeMap<String, EdgeSpec>,
}

fn default_version() -> u64 {
    1
}

impl AgentDescriptor {
    /// Create an empty descriptor at version 1
    pub fn new(agent_id: impl Into<String>, start_node: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            version: 1,
            start_node: start_node.into(),
            nodes: BTreeMap::new(),
            flow: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, name: impl Into<String>, node: NodeSpec) -> Self {
        self.nodes.insert(name.into(), node);
        self
    }

    pub fn with_flow(mut self, from: impl Into<String>, edge: EdgeSpec) -> Self {
        self.flow.insert(from.into(), edge);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    /// Parse a descriptor from JSON text
    pub fn from_json(json: &str, mode: ParseMode) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| error::parse_error(format!("invalid descriptor JSON: {}", e)).set_source(e))?;
        Self::from_value(value, mode)
    }

    /// Build a descriptor from an already-parsed JSON value
    pub fn from_value(mut value: Value, mode: ParseMode) -> Result<Self> {
        screen_unknown_keys(&mut value, mode)?;
        serde_json::from_value(value)
            .map_err(|e| error::parse_error(format!("invalid descriptor: {}", e)).set_source(e))
    }

    /// Load a descriptor from a JSON file
    pub fn from_file(path: impl AsRef<Path>, mode: ParseMode) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| {
                evoforge_error::Error::from(e)
                    .with_context("path", path.display().to_string())
            })?;
        Self::from_json(&json, mode)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| error::serialization_error(e.to_string()))
    }

    /// Write the descriptor as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_pretty()?).map_err(|e| {
            error::io_error(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    /// True when both descriptors have the same graph shape.
    ///
    /// Instructions and demonstrations are ignored; node kinds, signatures,
    /// tools and flow must match exactly.
    pub fn same_topology(&self, other: &AgentDescriptor) -> bool {
        self.start_node == other.start_node
            && self.flow == other.flow
            && self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|(name, node)| {
                other.nodes.get(name).is_some_and(|o| {
                    o.kind == node.kind && o.signature == node.signature && o.tools == node.tools
                })
            })
    }
}

/// Reject (strict) or strip (lenient) unknown top-level and node-level keys
fn screen_unknown_keys(value: &mut Value, mode: ParseMode) -> Result<()> {
    let Some(root) = value.as_object_mut() else {
        return Err(error::parse_error("descriptor must be a JSON object"));
    };

    screen_object(root, DESCRIPTOR_KEYS, "descriptor", mode)?;

    if let Some(nodes) = root.get_mut("nodes").and_then(Value::as_object_mut) {
        for (name, node) in nodes.iter_mut() {
            if let Some(node) = node.as_object_mut() {
                screen_object(node, NODE_KEYS, &format!("node '{}'", name), mode)?;
            }
        }
    }

    Ok(())
}

fn screen_object(
    object: &mut serde_json::Map<String, Value>,
    known: &[&str],
    location: &str,
    mode: ParseMode,
) -> Result<()> {
    let unknown: Vec<String> = object
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .cloned()
        .collect();

    for key in unknown {
        match mode {
            ParseMode::Strict => return Err(error::unknown_field(location, key)),
            ParseMode::Lenient => {
                warn!(location, key = %key, "ignoring unknown descriptor key");
                object.remove(&key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const POET: &str = r#"{
        "agent_id": "poet",
        "start_node": "generator",
        "nodes": {
            "generator": {"type": "Predict", "signature": "topic -> content", "instruction": "Write a poem."},
            "critic": {"type": "ChainOfThought", "signature": "content -> critique, decision", "instruction": "Judge it."},
            "refiner": {"type": "Direct", "signature": "content, critique -> content", "instruction": "Improve it."}
        },
        "flow": {
            "generator": {"next": "critic"},
            "critic": {"type": "branch", "source_var": "decision",
                       "branches": {"PASS": "end", "FAIL": "refiner"}, "default": "end"},
            "refiner": {"next": "critic"}
        }
    }"#;

    #[test]
    fn test_parse_with_aliases() {
        let dna = AgentDescriptor::from_json(POET, ParseMode::Strict).unwrap();
        assert_eq!(dna.version, 1);
        assert_eq!(dna.nodes["generator"].kind, NodeKind::Direct);
        assert_eq!(dna.nodes["critic"].kind, NodeKind::Reasoned);

        match &dna.flow["critic"] {
            EdgeSpec::Branch {
                source_var,
                branches,
                default,
            } => {
                assert_eq!(source_var, "decision");
                assert_eq!(branches["PASS"], NodeRef::End);
                assert_eq!(branches["FAIL"], NodeRef::node("refiner"));
                assert_eq!(default.as_ref(), Some(&NodeRef::End));
            }
            other => panic!("expected branch, got {:?}", other),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let dna = AgentDescriptor::from_json(POET, ParseMode::Strict).unwrap();
        let json = dna.to_json_pretty().unwrap();
        assert!(json.contains("\"type\": \"branch\""));

        let again = AgentDescriptor::from_json(&json, ParseMode::Strict).unwrap();
        assert_eq!(dna, again);
    }

    #[test]
    fn test_strict_rejects_unknown_keys() {
        let json = POET.replacen("\"agent_id\"", "\"owner\": \"me\", \"agent_id\"", 1);
        let err = AgentDescriptor::from_json(&json, ParseMode::Strict).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownField);
        assert_eq!(err.context_value("field"), Some("owner"));

        let dna = AgentDescriptor::from_json(&json, ParseMode::Lenient).unwrap();
        assert_eq!(dna.agent_id, "poet");
    }

    #[test]
    fn test_strict_rejects_unknown_node_keys() {
        let json = POET.replacen("\"instruction\": \"Judge it.\"", "\"instruction\": \"Judge it.\", \"temperature\": 0.2", 1);
        let err = AgentDescriptor::from_json(&json, ParseMode::Strict).unwrap_err();
        assert_eq!(err.context_value("location"), Some("node 'critic'"));
        assert!(AgentDescriptor::from_json(&json, ParseMode::Lenient).is_ok());
    }

    #[test]
    fn test_branch_without_default_parses() {
        let json = POET.replacen(", \"default\": \"end\"", "", 1);
        let dna = AgentDescriptor::from_json(&json, ParseMode::Strict).unwrap();
        assert!(matches!(
            dna.flow["critic"],
            EdgeSpec::Branch { default: None, .. }
        ));
    }

    #[test]
    fn test_edge_requires_next_or_branch() {
        let json = POET.replacen("{\"next\": \"critic\"}", "{}", 1);
        let err = AgentDescriptor::from_json(&json, ParseMode::Strict).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFailed);
    }

    #[test]
    fn test_same_topology_ignores_instructions() {
        let dna = AgentDescriptor::from_json(POET, ParseMode::Strict).unwrap();
        let mut tuned = dna.clone();
        tuned.nodes.get_mut("critic").unwrap().instruction = "Be strict.".into();
        assert!(dna.same_topology(&tuned));

        let mut rewired = dna.clone();
        rewired.flow.insert("refiner".into(), EdgeSpec::next("end"));
        assert!(!dna.same_topology(&rewired));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poet.json");

        let dna = AgentDescriptor::from_json(POET, ParseMode::Strict).unwrap();
        dna.save(&path).unwrap();
        let loaded = AgentDescriptor::from_file(&path, ParseMode::Strict).unwrap();
        assert_eq!(dna, loaded);

        let err = AgentDescriptor::from_file(dir.path().join("missing.json"), ParseMode::Strict)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }
}
