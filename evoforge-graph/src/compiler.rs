//! # Graph Compiler
//!
//! Validates an [`AgentDescriptor`] and lowers it into an arena of nodes with
//! an explicit transition table. Checks run in a fixed order:
//!
//! 1. `start_node` names a declared node
//! 2. every flow key and edge target is a node or `end`
//! 3. node-local rules (tools, branch variable, branch default)
//! 4. reachability from `start_node` (unreachable nodes only warn)
//! 5. signature compatibility along sequence edges and branch arms
//!
//! Cycles are allowed; they are how refinement loops are written. Every node
//! is tagged with whether it sits on one so the executor can bound loops.
//! Compilation is pure: the descriptor is cloned, never modified.

use crate::descriptor::{AgentDescriptor, EdgeSpec, NodeKind, NodeRef, NodeSpec, END};
use crate::error::{self, Error, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

/// Arena index of a compiled node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resolved flow target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    End,
}

/// Resolved outgoing transition of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Sequence(Target),
    Branch {
        source_var: String,
        arms: BTreeMap<String, Target>,
        default: Target,
    },
}

impl Transition {
    fn targets(&self) -> Vec<Target> {
        match self {
            Transition::Sequence(t) => vec![*t],
            Transition::Branch { arms, default, .. } => {
                arms.values().copied().chain(std::iter::once(*default)).collect()
            }
        }
    }
}

/// A node after compilation
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub name: String,
    pub spec: NodeSpec,
    pub transition: Transition,
    pub reachable: bool,
    /// Sits on a cycle of the flow graph
    pub in_cycle: bool,
}

/// Executable form of a descriptor
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    descriptor: AgentDescriptor,
    nodes: Vec<CompiledNode>,
    index: HashMap<String, NodeId>,
    start: NodeId,
    warnings: Vec<String>,
}

impl CompiledGraph {
    /// The descriptor this graph was compiled from
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn agent_id(&self) -> &str {
        &self.descriptor.agent_id
    }

    pub fn version(&self) -> u64 {
        self.descriptor.version
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn node(&self, id: NodeId) -> &CompiledNode {
        &self.nodes[id.0]
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &CompiledNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Non-fatal findings, e.g. unreachable nodes
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn has_cycles(&self) -> bool {
        self.nodes.iter().any(|n| n.in_cycle)
    }

    pub fn cyclic_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.in_cycle)
            .map(|n| n.name.as_str())
            .collect()
    }

    pub fn unreachable_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| !n.reachable)
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Display name of a resolved target
    pub fn target_name(&self, target: Target) -> &str {
        match target {
            Target::Node(id) => &self.nodes[id.0].name,
            Target::End => END,
        }
    }

    pub fn target_ref(&self, target: Target) -> NodeRef {
        match target {
            Target::Node(id) => NodeRef::Node(self.nodes[id.0].name.clone()),
            Target::End => NodeRef::End,
        }
    }
}

/// Validate a descriptor and produce its executable graph
pub fn compile(descriptor: &AgentDescriptor) -> Result<CompiledGraph> {
    compile_inner(descriptor).map_err(|e| {
        e.with_operation("compiler::compile")
            .with_context("agent_id", descriptor.agent_id.clone())
            .with_context("version", descriptor.version.to_string())
    })
}

fn compile_inner(descriptor: &AgentDescriptor) -> Result<CompiledGraph> {
    if descriptor.nodes.contains_key(END) {
        return Err(Error::config_invalid(format!("node name '{}' is reserved", END))
            .with_context("node", END));
    }

    // Arena order follows the (sorted) node map, so ids are stable per descriptor.
    let index: HashMap<String, NodeId> = descriptor
        .nodes
        .keys()
        .enumerate()
        .map(|(i, name)| (name.clone(), NodeId(i)))
        .collect();

    // (a) start node
    let start = *index
        .get(&descriptor.start_node)
        .ok_or_else(|| error::start_node_missing(&descriptor.start_node))?;

    // (b) flow keys and targets
    for (from, edge) in &descriptor.flow {
        if !index.contains_key(from) {
            return Err(error::dangling_reference("flow", from));
        }
        for target in edge.targets() {
            if let NodeRef::Node(name) = target {
                if !index.contains_key(name) {
                    return Err(error::dangling_reference(from, name));
                }
            }
        }
    }

    // (c) node-local rules
    let mut warnings = Vec::new();
    for (name, node) in &descriptor.nodes {
        match node.kind {
            NodeKind::ToolUsing if node.tools.is_empty() => return Err(error::tools_missing(name)),
            NodeKind::ToolUsing => {}
            _ if !node.tools.is_empty() => {
                warn!(node = %name, kind = %node.kind, "tools ignored on non tool-using node");
                warnings.push(format!("tools on {} node '{}' are ignored", node.kind, name));
            }
            _ => {}
        }

        if let Some(EdgeSpec::Branch {
            source_var,
            default,
            ..
        }) = descriptor.flow.get(name)
        {
            if !node.signature.has_output(source_var) {
                return Err(error::branch_variable_undeclared(name, source_var));
            }
            if default.is_none() {
                return Err(error::missing_branch_default(name));
            }
        }
    }

    let resolve = |r: &NodeRef| match r {
        NodeRef::End => Target::End,
        NodeRef::Node(name) => Target::Node(index[name]),
    };

    let transitions: Vec<Transition> = descriptor
        .nodes
        .keys()
        .map(|name| match descriptor.flow.get(name) {
            None => {
                debug!(node = %name, "no flow entry, node terminates the run");
                Transition::Sequence(Target::End)
            }
            Some(EdgeSpec::Sequence { next }) => Transition::Sequence(resolve(next)),
            Some(EdgeSpec::Branch {
                source_var,
                branches,
                default,
            }) => Transition::Branch {
                source_var: source_var.clone(),
                arms: branches.iter().map(|(k, t)| (k.clone(), resolve(t))).collect(),
                default: default.as_ref().map(&resolve).unwrap_or(Target::End),
            },
        })
        .collect();

    let successors: Vec<Vec<usize>> = transitions
        .iter()
        .map(|t| {
            let mut next: Vec<usize> = t
                .targets()
                .into_iter()
                .filter_map(|t| match t {
                    Target::Node(id) => Some(id.0),
                    Target::End => None,
                })
                .collect();
            next.sort_unstable();
            next.dedup();
            next
        })
        .collect();

    // (d) reachability
    let reachable = reachable_from(start.0, &successors);
    for (name, id) in descriptor.nodes.keys().zip(0..) {
        if !reachable[id] {
            warn!(node = %name, "node is unreachable from start and will never run");
            warnings.push(format!("node '{}' is unreachable from '{}'", name, descriptor.start_node));
        }
    }

    // (e) signature compatibility
    for (from, edge) in &descriptor.flow {
        let source = &descriptor.nodes[from];
        let arms: Vec<&NodeRef> = match edge {
            EdgeSpec::Sequence { next } => vec![next],
            // The default arm is exempt: it is the fallback for values the
            // branching node was never meant to produce.
            EdgeSpec::Branch { branches, .. } => branches.values().collect(),
        };
        for target in arms {
            if let NodeRef::Node(to) = target {
                check_feeds(from, source, to, &descriptor.nodes[to])?;
            }
        }
    }

    let in_cycle = cycle_members(&successors);

    let nodes = descriptor
        .nodes
        .iter()
        .zip(transitions)
        .enumerate()
        .map(|(i, ((name, spec), transition))| CompiledNode {
            name: name.clone(),
            spec: spec.clone(),
            transition,
            reachable: reachable[i],
            in_cycle: in_cycle[i],
        })
        .collect();

    Ok(CompiledGraph {
        descriptor: descriptor.clone(),
        nodes,
        index,
        start,
        warnings,
    })
}

/// At least one of `source`'s outputs must satisfy one of `target`'s inputs
fn check_feeds(from: &str, source: &NodeSpec, to: &str, target: &NodeSpec) -> Result<()> {
    let inputs = target.signature.inputs();
    if inputs.iter().any(|f| source.signature.has_output(f)) {
        return Ok(());
    }
    let missing = inputs
        .iter()
        .find(|f| !source.signature.has_output(f))
        .map(String::as_str)
        .unwrap_or_default();
    Err(error::signature_mismatch(from, to, missing))
}

fn reachable_from(start: usize, successors: &[Vec<usize>]) -> Vec<bool> {
    let mut seen = vec![false; successors.len()];
    let mut queue = VecDeque::from([start]);
    seen[start] = true;

    while let Some(current) = queue.pop_front() {
        for &next in &successors[current] {
            if !seen[next] {
                seen[next] = true;
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Tarjan's strongly connected components; a node is cyclic when its
/// component has more than one member or it loops onto itself.
fn cycle_members(successors: &[Vec<usize>]) -> Vec<bool> {
    struct Tarjan<'a> {
        successors: &'a [Vec<usize>],
        counter: usize,
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        in_cycle: Vec<bool>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.counter);
            self.lowlink[v] = self.counter;
            self.counter += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            for &w in &self.successors[v] {
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                    }
                    Some(iw) if self.on_stack[w] => {
                        self.lowlink[v] = self.lowlink[v].min(iw);
                    }
                    Some(_) => {}
                }
            }

            if Some(self.lowlink[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                let cyclic = component.len() > 1 || self.successors[v].contains(&v);
                if cyclic {
                    for w in component {
                        self.in_cycle[w] = true;
                    }
                }
            }
        }
    }

    let n = successors.len();
    let mut tarjan = Tarjan {
        successors,
        counter: 0,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        in_cycle: vec![false; n],
    };
    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }
    tarjan.in_cycle
}
