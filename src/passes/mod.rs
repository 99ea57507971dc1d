//! Rewrite passes.
//!
//! Each pass is a composable transformation on the graph: it matches a
//! local structural pattern and replaces it with an equivalent smaller or
//! cheaper one. Passes hold no cross-call state, so any ordering chosen
//! by the orchestrator is safe.

mod absorb;
mod collapse;
mod fold_constants;
mod general;
mod lower_convs;
mod remove_identity;
mod reorder;

pub use absorb::{AbsorbAddIntoMultiThreshold, AbsorbMulIntoMultiThreshold, AbsorbScalarMulIntoTopK};
pub use collapse::CollapseRepeatedOp;
pub use fold_constants::FoldConstants;
pub use general::GiveUniqueNodeNames;
pub use lower_convs::LowerConvsToMatMul;
pub use remove_identity::RemoveIdentityOps;
pub use reorder::MoveMulPastConv;

use crate::graph::{Node, NodeId, QuantGraph};
use crate::Result;

/// Graph transformation pass.
///
/// `run` returns `true` if the graph was modified, `false` otherwise;
/// the orchestrator uses this to detect fixed points. A pass presented
/// with no matching pattern — including a pattern whose algebraic
/// precondition fails — must leave the graph untouched and report
/// `false`, never error.
pub trait Pass {
    /// Name of this pass (for logging and reports).
    fn name(&self) -> &str;

    /// Run the pass on the graph.
    fn run(&self, graph: &mut QuantGraph) -> Result<bool>;
}

/// For a binary node with exactly one constant operand, the pair of
/// (dynamic input index, constant input index).
pub(crate) fn constant_operand(graph: &QuantGraph, node: &Node) -> Option<(usize, usize)> {
    if node.inputs.len() != 2 {
        return None;
    }
    let c0 = graph.get_initializer(&node.inputs[0]).is_some();
    let c1 = graph.get_initializer(&node.inputs[1]).is_some();
    match (c0, c1) {
        (false, true) => Some((0, 1)),
        (true, false) => Some((1, 0)),
        _ => None,
    }
}

/// The only consumer of `tensor`, provided the tensor is not also
/// exported as a graph output.
pub(crate) fn sole_consumer(graph: &QuantGraph, tensor: &str) -> Option<NodeId> {
    if graph.is_graph_output(tensor) {
        return None;
    }
    let consumers = graph.consumers(tensor);
    if consumers.len() == 1 {
        Some(consumers[0])
    } else {
        None
    }
}

/// Install `value` as the constant read through input `index` of `node`,
/// rewiring to a fresh initializer when the current one is shared.
pub(crate) fn replace_constant_input(
    graph: &mut QuantGraph,
    node: NodeId,
    index: usize,
    value: crate::tensor::TensorData,
) -> Result<()> {
    let tensor = graph.node(node).expect("node exists").inputs[index].clone();
    if graph.consumers(&tensor).len() == 1 {
        graph.set_initializer(&tensor, value);
    } else {
        let fresh = graph.make_unique_tensor_name(&tensor);
        graph.set_initializer(&fresh, value);
        graph.set_node_input(node, index, &fresh)?;
    }
    Ok(())
}
