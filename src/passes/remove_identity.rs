//! Identity-node removal.

use super::{constant_operand, Pass};
use crate::exec::resolve_reshape;
use crate::graph::{display_name, Node, QuantGraph};
use crate::ops::OpKind;
use crate::Result;

/// Excises nodes that compute the identity function under the current
/// shapes: multiply/divide by one, add/subtract zero, and reshapes or
/// flattens whose output shape equals their input shape. Consumers are
/// rewired straight to the producer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveIdentityOps;

impl RemoveIdentityOps {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for RemoveIdentityOps {
    fn name(&self) -> &str {
        "remove_identity_ops"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut applied = false;
            for id in graph.topological_sort()? {
                let node = graph.node(id).expect("sorted id").clone();
                let Some(passthrough) = identity_input(graph, &node) else {
                    continue;
                };
                if excise(graph, &node, passthrough)? {
                    tracing::debug!(node = %display_name(&node), "removed identity op");
                    applied = true;
                    changed = true;
                    break;
                }
            }
            if !applied {
                break;
            }
        }
        Ok(changed)
    }
}

/// Index of the input the node passes through unchanged, if any.
fn identity_input(graph: &QuantGraph, node: &Node) -> Option<usize> {
    match node.op {
        OpKind::Mul | OpKind::Add => {
            let (dyn_idx, const_idx) = constant_operand(graph, node)?;
            let neutral = if node.op == OpKind::Mul { 1.0 } else { 0.0 };
            let k = graph.get_initializer(&node.inputs[const_idx])?;
            (k.data().iter().all(|&v| v == neutral)).then_some(dyn_idx)
        }
        OpKind::Div | OpKind::Sub => {
            // Only a neutral right-hand operand is an identity.
            let neutral = if node.op == OpKind::Div { 1.0 } else { 0.0 };
            let k = graph.get_initializer(&node.inputs[1])?;
            (k.data().iter().all(|&v| v == neutral)).then_some(0)
        }
        OpKind::Reshape => {
            let input_shape = graph.tensor_shape(&node.inputs[0])?;
            let target = graph.get_initializer(&node.inputs[1])?;
            let requested: Vec<i64> = target.data().iter().map(|&v| v as i64).collect();
            let resolved = resolve_reshape(&input_shape, &requested).ok()?;
            (resolved == input_shape).then_some(0)
        }
        OpKind::Flatten => {
            let input_shape = graph.tensor_shape(&node.inputs[0])?;
            let axis = node.int_attr("axis").unwrap_or(1);
            (input_shape.len() == 2 && axis == 1).then_some(0)
        }
        _ => None,
    }
}

/// Rewire consumers of the node's output to `node.inputs[passthrough]`
/// and remove the node. Returns false when the surrounding structure
/// makes a clean excision impossible (treated as a non-match).
fn excise(graph: &mut QuantGraph, node: &Node, passthrough: usize) -> Result<bool> {
    let source = node.inputs[passthrough].clone();
    let out = node.outputs[0].clone();
    let id = match graph.producer(&out) {
        Some(id) => id,
        None => return Ok(false),
    };
    if graph.is_graph_output(&out) && graph.producer(&source).is_none() {
        // Source is a graph input or constant; renaming it to keep the
        // external output name would change the graph interface.
        return Ok(false);
    }

    for consumer in graph.consumers(&out) {
        let slots: Vec<usize> = graph
            .node(consumer)
            .expect("consumer id")
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, n)| *n == &out)
            .map(|(i, _)| i)
            .collect();
        for slot in slots {
            graph.set_node_input(consumer, slot, &source)?;
        }
    }

    if graph.is_graph_output(&out) {
        // Keep the externally visible output name: re-point the output
        // at the source, drop the node, then rename the source back.
        graph.replace_output(&out, &source)?;
        graph.remove_node(id)?;
        graph.rename_tensor(&source, &out)?;
    } else {
        graph.remove_node(id)?;
    }
    Ok(true)
}
