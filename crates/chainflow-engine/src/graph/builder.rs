use std::collections::{BTreeMap, HashMap, HashSet};

use chainflow_core::definition::{GraphDefinition, RawNode};
use chainflow_core::error::{ChainflowError, Result};

use super::{Edge, Graph, NodeDefinition};
use crate::registry::TypeRegistry;

/// Turns a declarative definition into a validated [`Graph`].
///
/// Structural checks only: duplicate ids, unknown types, dangling edges,
/// unknown ports, fan-in on single-valued ports, missing required inputs and
/// conflicting output selections. Edge typing and cycles are checked by the
/// resolver.
pub struct GraphBuilder<'a> {
    registry: &'a TypeRegistry,
}

fn invalid(message: impl Into<String>) -> ChainflowError {
    ChainflowError::GraphValidation(message.into())
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    pub fn build(&self, definition: &GraphDefinition) -> Result<Graph> {
        if definition.nodes.is_empty() {
            return Err(invalid("graph has no nodes"));
        }

        let mut nodes = Vec::with_capacity(definition.nodes.len());
        let mut seen = HashSet::new();
        for raw in &definition.nodes {
            if raw.id.trim().is_empty() {
                return Err(invalid("node id must not be empty"));
            }
            if !seen.insert(raw.id.as_str()) {
                return Err(invalid(format!("duplicate node id '{}'", raw.id)));
            }
            nodes.push(self.node_definition(raw)?);
        }

        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut edges = Vec::with_capacity(definition.edges.len());
        let mut fan_in: HashMap<(&str, &str), usize> = HashMap::new();
        for raw in &definition.edges {
            let source = index
                .get(raw.source.as_str())
                .map(|&i| &nodes[i])
                .ok_or_else(|| {
                    invalid(format!("edge references unknown source node '{}'", raw.source))
                })?;
            let target = index
                .get(raw.target.as_str())
                .map(|&i| &nodes[i])
                .ok_or_else(|| {
                    invalid(format!("edge references unknown target node '{}'", raw.target))
                })?;

            let port = target.input_port(&raw.target_handle).ok_or_else(|| {
                invalid(format!(
                    "node '{}' ({}) has no input port '{}'",
                    target.id,
                    target.type_name(),
                    raw.target_handle
                ))
            })?;
            if port.is_param() {
                return Err(invalid(format!(
                    "input '{}' of node '{}' takes a literal value, not a connection",
                    port.name, target.id
                )));
            }
            if let Some(handle) = &raw.source_handle {
                if source.schema.output_port(handle).is_none() {
                    return Err(invalid(format!(
                        "node '{}' ({}) has no output '{}'",
                        source.id,
                        source.type_name(),
                        handle
                    )));
                }
            }

            let count = fan_in
                .entry((raw.target.as_str(), raw.target_handle.as_str()))
                .or_default();
            *count += 1;
            if *count > 1 && !port.list {
                return Err(invalid(format!(
                    "input '{}' of node '{}' accepts a single connection",
                    port.name, target.id
                )));
            }

            edges.push(Edge {
                source: raw.source.clone(),
                source_port: raw.source_handle.clone(),
                target: raw.target.clone(),
                target_port: raw.target_handle.clone(),
            });
        }

        for node in &mut nodes {
            node.selected_output = select_output(node, &edges)?;
        }

        for node in &nodes {
            for port in &node.schema.inputs {
                if !port.required {
                    continue;
                }
                let satisfied = if port.is_param() {
                    node.params.contains_key(&port.name) || port.default.is_some()
                } else {
                    edges
                        .iter()
                        .any(|e| e.target == node.id && e.target_port == port.name)
                };
                if !satisfied {
                    return Err(invalid(format!(
                        "node '{}' ({}) is missing required input '{}'",
                        node.id,
                        node.type_name(),
                        port.name
                    )));
                }
            }
        }

        tracing::debug!(nodes = nodes.len(), edges = edges.len(), "Graph built");
        Ok(Graph::new(nodes, edges))
    }

    fn node_definition(&self, raw: &RawNode) -> Result<NodeDefinition> {
        let schema = self.registry.lookup(&raw.type_name)?.schema.clone();

        let mut params = BTreeMap::new();
        for (name, value) in &raw.inputs {
            let Some(port) = schema.input_port(name) else {
                tracing::debug!(node = %raw.id, input = %name, "Ignoring literal for undeclared input");
                continue;
            };
            if !port.is_param() {
                return Err(invalid(format!(
                    "input '{}' of node '{}' must be connected, not given a literal",
                    name, raw.id
                )));
            }
            // Empty literals count as absent, matching how editors submit unset fields.
            if value.is_null() || value.as_str().is_some_and(|s| s.is_empty()) {
                continue;
            }
            params.insert(name.clone(), value.clone());
        }

        if let Some(output) = &raw.output {
            if schema.output_port(output).is_none() {
                return Err(invalid(format!(
                    "node '{}' ({}) has no output '{}'",
                    raw.id, schema.name, output
                )));
            }
        }

        Ok(NodeDefinition {
            id: raw.id.clone(),
            schema,
            params,
            selected_output: raw.output.clone(),
        })
    }
}

/// All outgoing edges of a node, plus its explicit `output`, must agree on one port.
fn select_output(node: &NodeDefinition, edges: &[Edge]) -> Result<Option<String>> {
    let mut selected = node.selected_output.clone();
    for edge in edges.iter().filter(|e| e.source == node.id) {
        let Some(handle) = &edge.source_port else {
            continue;
        };
        match &selected {
            Some(current) if current != handle => {
                return Err(invalid(format!(
                    "node '{}' is connected through both outputs '{}' and '{}'",
                    node.id, current, handle
                )));
            }
            Some(_) => {}
            None => selected = Some(handle.clone()),
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::types::{InputPort, OutputPort};
    use chainflow_test_utils::{chain_node, memory_node, model_node, StubNode};

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register(model_node());
        registry.register(memory_node());
        registry.register(chain_node());
        registry.register(
            StubNode::new("store", "Vector Stores")
                .output(OutputPort::new("retriever", ["BaseRetriever"]))
                .output(OutputPort::new("vectorStore", ["VectorStore"])),
        );
        registry.register(
            StubNode::new("merge", "Chains")
                .input(InputPort::node("tools", ["Tool", "BaseChain"]).list())
                .executable(),
        );
        registry
    }

    fn expect_validation(result: Result<Graph>, fragment: &str) {
        match result {
            Err(ChainflowError::GraphValidation(msg)) => {
                assert!(msg.contains(fragment), "unexpected message: {msg}")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_builds_adjacency() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("model", "stubModel")
            .node("memory", "stubMemory")
            .node("chain", "stubChain")
            .edge("model", "chain", "model")
            .edge("memory", "chain", "memory");
        let graph = GraphBuilder::new(&registry).build(&def).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies("chain"), vec!["model", "memory"]);
        assert_eq!(graph.outgoing("model").count(), 1);
        assert_eq!(graph.sinks().len(), 1);
        assert_eq!(graph.sinks()[0].id, "chain");
    }

    #[test]
    fn test_empty_graph() {
        let registry = registry();
        expect_validation(
            GraphBuilder::new(&registry).build(&GraphDefinition::new()),
            "no nodes",
        );
    }

    #[test]
    fn test_duplicate_node_id() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("a", "stubModel")
            .node("a", "stubModel");
        expect_validation(GraphBuilder::new(&registry).build(&def), "duplicate node id 'a'");
    }

    #[test]
    fn test_unknown_type() {
        let registry = registry();
        let def = GraphDefinition::new().node("x", "noSuchType");
        let err = GraphBuilder::new(&registry).build(&def).unwrap_err();
        assert!(matches!(err, ChainflowError::UnknownType(name) if name == "noSuchType"));
    }

    #[test]
    fn test_dangling_edge() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("chain", "stubChain")
            .edge("ghost", "chain", "model");
        expect_validation(GraphBuilder::new(&registry).build(&def), "unknown source node 'ghost'");
    }

    #[test]
    fn test_unknown_port() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("model", "stubModel")
            .node("chain", "stubChain")
            .edge("model", "chain", "llm");
        expect_validation(GraphBuilder::new(&registry).build(&def), "no input port 'llm'");
    }

    #[test]
    fn test_missing_required_input() {
        let registry = registry();
        let def = GraphDefinition::new().node("chain", "stubChain");
        expect_validation(
            GraphBuilder::new(&registry).build(&def),
            "missing required input 'model'",
        );
    }

    #[test]
    fn test_single_port_rejects_fan_in() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("m1", "stubModel")
            .node("m2", "stubModel")
            .node("chain", "stubChain")
            .edge("m1", "chain", "model")
            .edge("m2", "chain", "model");
        expect_validation(GraphBuilder::new(&registry).build(&def), "single connection");
    }

    #[test]
    fn test_list_port_accepts_fan_in() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("c1", "stubChain")
            .node("c2", "stubChain")
            .node("model", "stubModel")
            .node("merge", "merge")
            .edge("model", "c1", "model")
            .edge("model", "c2", "model")
            .edge("c1", "merge", "tools")
            .edge("c2", "merge", "tools");
        let graph = GraphBuilder::new(&registry).build(&def).unwrap();
        assert_eq!(graph.incoming_on("merge", "tools").count(), 2);
    }

    #[test]
    fn test_literal_on_connection_port_rejected() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("model", "stubModel")
            .with_node(RawNode::new("chain", "stubChain").param("memory", "buffer".into()))
            .edge("model", "chain", "model");
        expect_validation(GraphBuilder::new(&registry).build(&def), "must be connected");
    }

    #[test]
    fn test_empty_literal_is_absent() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("model", "stubModel")
            .with_node(RawNode::new("chain", "stubChain").param("prefix", "".into()))
            .edge("model", "chain", "model");
        let graph = GraphBuilder::new(&registry).build(&def).unwrap();
        assert!(graph.node("chain").unwrap().params.is_empty());
    }

    #[test]
    fn test_output_selection() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("store", "store")
            .node("merge", "merge")
            .edge_from("store", "vectorStore", "merge", "tools");
        let graph = GraphBuilder::new(&registry).build(&def).unwrap();
        let store = graph.node("store").unwrap();
        assert_eq!(store.selected_output.as_deref(), Some("vectorStore"));
        assert!(store.output_capabilities().contains("VectorStore"));
    }

    #[test]
    fn test_conflicting_output_selection() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("store", "store")
            .node("m1", "merge")
            .node("m2", "merge")
            .edge_from("store", "vectorStore", "m1", "tools")
            .edge_from("store", "retriever", "m2", "tools");
        expect_validation(GraphBuilder::new(&registry).build(&def), "both outputs");
    }

    #[test]
    fn test_unknown_output() {
        let registry = registry();
        let def = GraphDefinition::new()
            .node("store", "store")
            .node("merge", "merge")
            .edge_from("store", "index", "merge", "tools");
        expect_validation(GraphBuilder::new(&registry).build(&def), "no output 'index'");
    }
}
