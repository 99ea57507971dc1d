//! Scalar absorption.
//!
//! Each pass folds a trailing constant multiply or add into a following
//! operator's own parameters, eliminating the arithmetic node. The
//! algebraic identity and its preconditions are specific to each pass
//! and checked explicitly; a failed precondition is a non-match.

use super::{constant_operand, replace_constant_input, sole_consumer, Pass};
use crate::graph::{Node, NodeId, QuantGraph};
use crate::ops::OpKind;
use crate::tensor::TensorData;
use crate::Result;

/// Absorbs `Mul(k) -> MultiThreshold(T)` into `MultiThreshold(T / k)`.
///
/// Valid only for strictly positive k: `count(k*x >= t)` equals
/// `count(x >= t/k)` exactly when k does not flip the comparison. k may
/// be a scalar or one value per threshold row.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbsorbMulIntoMultiThreshold;

impl AbsorbMulIntoMultiThreshold {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for AbsorbMulIntoMultiThreshold {
    fn name(&self) -> &str {
        "absorb_mul_into_multithreshold"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        absorb_into_thresholds(graph, OpKind::Mul, |k| k.data().iter().all(|&v| v > 0.0), |t, k| t / k)
    }
}

/// Absorbs `Add(b) -> MultiThreshold(T)` into `MultiThreshold(T - b)`.
///
/// `count(x + b >= t) == count(x >= t - b)` holds for any b, so the only
/// preconditions are structural.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbsorbAddIntoMultiThreshold;

impl AbsorbAddIntoMultiThreshold {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for AbsorbAddIntoMultiThreshold {
    fn name(&self) -> &str {
        "absorb_add_into_multithreshold"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        absorb_into_thresholds(graph, OpKind::Add, |_| true, |t, b| t - b)
    }
}

/// Shared matcher: arithmetic node with constant operand feeding the
/// data input of a MultiThreshold whose thresholds are constant.
fn absorb_into_thresholds(
    graph: &mut QuantGraph,
    arith: OpKind,
    precondition: impl Fn(&TensorData) -> bool,
    adjust: impl Fn(f32, f32) -> f32,
) -> Result<bool> {
    let mut changed = false;
    loop {
        let mut applied = false;
        for id in graph.topological_sort()? {
            let node = graph.node(id).expect("sorted id").clone();
            if node.op != arith {
                continue;
            }
            let Some((dyn_idx, const_idx)) = constant_operand(graph, &node) else {
                continue;
            };
            let Some(mt_id) = sole_consumer(graph, &node.outputs[0]) else {
                continue;
            };
            let mt = graph.node(mt_id).expect("consumer id").clone();
            if mt.op != OpKind::MultiThreshold || mt.inputs[0] != node.outputs[0] {
                continue;
            }
            let Some(thresholds) = graph.get_initializer(&mt.inputs[1]) else {
                continue;
            };
            let k = graph
                .get_initializer(&node.inputs[const_idx])
                .expect("constant operand")
                .clone();
            if !precondition(&k) {
                continue;
            }
            let Some(adjusted) = adjust_thresholds(thresholds, &k, &adjust) else {
                continue;
            };

            replace_constant_input(graph, mt_id, 1, adjusted)?;
            graph.set_node_input(mt_id, 0, &node.inputs[dyn_idx])?;
            graph.remove_node(id)?;
            tracing::debug!(node = %node.name, op = %arith, "absorbed into thresholds");
            applied = true;
            changed = true;
            break;
        }
        if !applied {
            break;
        }
    }
    Ok(changed)
}

/// Adjusted threshold matrix, or `None` when the operand shape matches
/// neither "scalar" nor "one value per threshold row".
fn adjust_thresholds(
    thresholds: &TensorData,
    k: &TensorData,
    adjust: &impl Fn(f32, f32) -> f32,
) -> Option<TensorData> {
    let rows = thresholds.shape()[0] as usize;
    let steps = thresholds.shape()[1] as usize;
    if k.is_scalar() {
        let kv = k.data()[0];
        return Some(thresholds.map(|t| adjust(t, kv)));
    }
    // Accept any operand that squeezes to one value per channel row,
    // e.g. (1, C, 1, 1) against C threshold rows.
    let squeezed: Vec<i64> = k.shape().iter().copied().filter(|&d| d != 1).collect();
    if squeezed != [rows as i64] {
        return None;
    }
    let data = thresholds
        .data()
        .iter()
        .enumerate()
        .map(|(i, &t)| adjust(t, k.data()[i / steps]))
        .collect();
    TensorData::new(thresholds.shape().to_vec(), data).ok()
}

/// Removes a strictly positive scalar multiply feeding a TopK.
///
/// A positive scalar rescale never changes which elements rank highest,
/// so the index output is invariant; the values output is not, so the
/// pass additionally requires it to be unconsumed and unexported.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbsorbScalarMulIntoTopK;

impl AbsorbScalarMulIntoTopK {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for AbsorbScalarMulIntoTopK {
    fn name(&self) -> &str {
        "absorb_scalar_mul_into_topk"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut applied = false;
            for id in graph.topological_sort()? {
                let node = graph.node(id).expect("sorted id").clone();
                if node.op != OpKind::Mul {
                    continue;
                }
                let Some((dyn_idx, const_idx)) = constant_operand(graph, &node) else {
                    continue;
                };
                let k = graph
                    .get_initializer(&node.inputs[const_idx])
                    .expect("constant operand");
                if !k.is_scalar() || k.data()[0] <= 0.0 {
                    continue;
                }
                let Some(topk_id) = sole_consumer(graph, &node.outputs[0]) else {
                    continue;
                };
                if !topk_matches(graph, topk_id, &node) {
                    continue;
                }

                graph.set_node_input(topk_id, 0, &node.inputs[dyn_idx])?;
                graph.remove_node(id)?;
                tracing::debug!(node = %node.name, "absorbed scalar mul into topk");
                applied = true;
                changed = true;
                break;
            }
            if !applied {
                break;
            }
        }
        Ok(changed)
    }
}

fn topk_matches(graph: &QuantGraph, topk_id: NodeId, mul: &Node) -> bool {
    let Some(topk) = graph.node(topk_id) else {
        return false;
    };
    if topk.op != OpKind::TopK || topk.inputs[0] != mul.outputs[0] {
        return false;
    }
    // The ranking is preserved but the values output would change scale;
    // refuse to absorb while anyone observes it.
    let values_out = &topk.outputs[0];
    graph.consumers(values_out).is_empty() && !graph.is_graph_output(values_out)
}
