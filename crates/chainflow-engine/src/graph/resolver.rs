use std::collections::HashMap;

use chainflow_core::error::{ChainflowError, Result};

use super::Graph;

/// Instantiation order plus the node whose output answers the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Every node, dependencies first. Ties follow declaration order.
    pub order: Vec<String>,
    pub terminal: String,
}

impl ExecutionPlan {
    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.order.iter().position(|id| id == node_id)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Order the graph, check edge types, and pick the terminal node.
///
/// Cycles are reported before type mismatches so a loop of compatible
/// nodes surfaces as a `CycleError`.
pub fn resolve(graph: &Graph) -> Result<ExecutionPlan> {
    let order = topological_order(graph)?;
    check_edge_types(graph)?;
    let terminal = select_terminal(graph)?;
    tracing::debug!(order = ?order, terminal = %terminal, "Graph resolved");
    Ok(ExecutionPlan { order, terminal })
}

/// Depth-first post-order over backward adjacency.
fn topological_order(graph: &Graph) -> Result<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(graph.len());
    let mut order = Vec::with_capacity(graph.len());
    let mut stack: Vec<&str> = Vec::new();

    for node in graph.nodes() {
        visit(graph, &node.id, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit<'g>(
    graph: &'g Graph,
    id: &'g str,
    marks: &mut HashMap<&'g str, Mark>,
    stack: &mut Vec<&'g str>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::OnStack) => {
            let start = stack.iter().position(|n| *n == id).unwrap_or(0);
            // Stack runs consumer to dependency; report it along the data flow.
            let mut cycle: Vec<String> = stack[start..].iter().rev().map(|s| s.to_string()).collect();
            cycle.push(
                cycle
                    .first()
                    .cloned()
                    .unwrap_or_else(|| id.to_string()),
            );
            return Err(ChainflowError::Cycle { cycle });
        }
        None => {}
    }

    marks.insert(id, Mark::OnStack);
    stack.push(id);
    for dep in graph.dependencies(id) {
        visit(graph, dep, marks, stack, order)?;
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    order.push(id.to_string());
    Ok(())
}

fn check_edge_types(graph: &Graph) -> Result<()> {
    for edge in graph.edges() {
        let (Some(source), Some(target)) = (graph.node(&edge.source), graph.node(&edge.target))
        else {
            continue;
        };
        let Some(port) = target.input_port(&edge.target_port) else {
            continue;
        };
        let provided = source.output_capabilities();
        if port.accepted.is_disjoint(provided) {
            return Err(ChainflowError::TypeMismatch {
                edge: edge.to_string(),
                accepted: port.accepted.iter().cloned().collect(),
                provided: provided.iter().cloned().collect(),
            });
        }
    }
    Ok(())
}

fn select_terminal(graph: &Graph) -> Result<String> {
    let sinks = graph.sinks();
    let terminal = match sinks.as_slice() {
        [only] => *only,
        [] => {
            return Err(ChainflowError::GraphValidation(
                "graph has no ending node".into(),
            ))
        }
        many => {
            let ids: Vec<&str> = many.iter().map(|n| n.id.as_str()).collect();
            return Err(ChainflowError::GraphValidation(format!(
                "graph must have exactly one ending node, found {}: {}",
                ids.len(),
                ids.join(", ")
            )));
        }
    };
    if !terminal.schema.executable {
        return Err(ChainflowError::GraphValidation(format!(
            "ending node '{}' ({}) cannot produce a result",
            terminal.id,
            terminal.type_name()
        )));
    }
    Ok(terminal.id.clone())
}
