pub mod builder;
pub mod resolver;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chainflow_core::types::{InputPort, NodeSchema};

pub use builder::GraphBuilder;
pub use resolver::{resolve, ExecutionPlan};

/// A validated node: identity, the schema of its type, and its literals.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    pub id: String,
    pub schema: NodeSchema,
    /// Literal values for parameter ports, keyed by port name.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Output selected by outgoing edges or an explicit `output` field.
    pub selected_output: Option<String>,
}

impl NodeDefinition {
    pub fn type_name(&self) -> &str {
        &self.schema.name
    }

    pub fn input_port(&self, name: &str) -> Option<&InputPort> {
        self.schema.input_port(name)
    }

    /// Capabilities this node offers downstream through its selected output.
    pub fn output_capabilities(&self) -> &BTreeSet<String> {
        self.schema
            .output_capabilities(self.selected_output.as_deref())
    }

    /// Whether the node offers `tag` through its output or at node level.
    pub fn has_capability(&self, tag: &str) -> bool {
        self.output_capabilities().contains(tag) || self.schema.capabilities.contains(tag)
    }
}

/// A validated edge from an upstream node to a downstream input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: String,
    pub source_port: Option<String>,
    pub target: String,
    pub target_port: String,
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source_port {
            Some(port) => write!(f, "{}.{} -> {}.{}", self.source, port, self.target, self.target_port),
            None => write!(f, "{} -> {}.{}", self.source, self.target, self.target_port),
        }
    }
}

/// Validated graph with forward and backward adjacency.
///
/// Node order is the declaration order of the submitted definition; every
/// traversal that must be deterministic walks nodes and edges in that order.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<NodeDefinition>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Node id to indices of edges leaving it.
    forward: HashMap<String, Vec<usize>>,
    /// Node id to indices of edges entering it.
    backward: HashMap<String, Vec<usize>>,
}

impl Graph {
    pub(crate) fn new(nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let mut forward: HashMap<String, Vec<usize>> = HashMap::new();
        let mut backward: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            forward.entry(edge.source.clone()).or_default().push(i);
            backward.entry(edge.target.clone()).or_default().push(i);
        }
        Self {
            nodes,
            index,
            edges,
            forward,
            backward,
        }
    }

    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Declaration position of a node.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges leaving `id`, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.forward
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Edges entering `id`, in declaration order.
    pub fn incoming<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.backward
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Edges entering `id` on `port`, in declaration order.
    pub fn incoming_on<'a>(&'a self, id: &str, port: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.incoming(id).filter(move |e| e.target_port == port)
    }

    /// Upstream node ids of `id`, deduplicated, in declaration order of the nodes.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = self.incoming(id).map(|e| e.source.as_str()).collect();
        deps.sort_by_key(|d| self.position(d));
        deps.dedup();
        deps
    }

    /// Nodes with no outgoing edge, in declaration order.
    pub fn sinks(&self) -> Vec<&NodeDefinition> {
        self.nodes
            .iter()
            .filter(|n| !self.forward.contains_key(&n.id))
            .collect()
    }
}
