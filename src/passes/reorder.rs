//! Operator reordering.

use super::{constant_operand, replace_constant_input, sole_consumer, Pass};
use crate::graph::QuantGraph;
use crate::ops::OpKind;
use crate::tensor::TensorData;
use crate::Result;

/// Moves a constant multiply past a following convolution by rescaling
/// the convolution's weights.
///
/// Two algebraic identities are implemented, each with its own
/// preconditions:
///
/// * scalar: `Conv(k * x, W) == Conv(x, k * W)` for any conv;
/// * per-channel: `Conv_dw(k_c * x, W) == Conv_dw(x, k_c * W)` where the
///   multiplier has shape `(1, C, 1, 1)` and the convolution is
///   depthwise (`group == C`, one input channel per filter), so each
///   filter sees exactly the channel its scale belongs to.
///
/// The multiply's constant operand must be an initializer, its output
/// must feed only the convolution, and the convolution must not carry a
/// bias input (a bias would not commute with the rescale). Anything else
/// is a non-match and leaves the graph unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveMulPastConv;

impl MoveMulPastConv {
    pub fn new() -> Self {
        MoveMulPastConv
    }
}

impl Pass for MoveMulPastConv {
    fn name(&self) -> &str {
        "move_mul_past_conv"
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
                let mul_out = &node.outputs[0];
                let Some(conv_id) = sole_consumer(graph, mul_out) else {
                    continue;
                };
                let conv = graph.node(conv_id).expect("consumer id").clone();
                if conv.op != OpKind::Conv
                    || conv.inputs.len() != 2
                    || conv.inputs[0] != *mul_out
                {
                    continue;
                }
                let Some(weight) = graph.get_initializer(&conv.inputs[1]) else {
                    continue;
                };
                let k = graph
                    .get_initializer(&node.inputs[const_idx])
                    .expect("constant operand")
                    .clone();
                let group = conv.int_attr("group").unwrap_or(1);

                let Some(scaled) = rescale_weights(weight, &k, group) else {
                    continue;
                };

                replace_constant_input(graph, conv_id, 1, scaled)?;
                graph.set_node_input(conv_id, 0, &node.inputs[dyn_idx])?;
                graph.remove_node(id)?;
                tracing::debug!(node = %node.name, "moved mul past conv");
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

/// Rescaled weights, or `None` when the commuting identity's
/// preconditions do not hold.
fn rescale_weights(weight: &TensorData, k: &TensorData, group: i64) -> Option<TensorData> {
    if weight.shape().len() != 4 {
        return None;
    }
    if k.is_scalar() {
        let kv = k.data()[0];
        return Some(weight.map(|w| w * kv));
    }
    // Per-channel multiplier past a depthwise convolution only.
    let channels = weight.shape()[0];
    let depthwise = weight.shape()[1] == 1 && group == channels;
    if !depthwise || k.shape() != [1, channels, 1, 1] {
        return None;
    }
    let per_filter = weight.num_elements() / channels as usize;
    let data = weight
        .data()
        .iter()
        .enumerate()
        .map(|(i, &w)| w * k.data()[i / per_filter])
        .collect();
    TensorData::new(weight.shape().to_vec(), data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;

    fn mul_conv_graph(k: TensorData, weight: TensorData, group: i64) -> QuantGraph {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 2, 3, 3]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer("k", k);
        g.set_initializer("w", weight);
        g.add_op(OpKind::Mul)
            .name("mul0")
            .input("x")
            .input("k")
            .output("t0")
            .finish()
            .unwrap();
        let mut conv = g
            .add_op(OpKind::Conv)
            .name("conv0")
            .input("t0")
            .input("w")
            .output("y");
        if group != 1 {
            conv = conv.attr_i("group", group);
        }
        conv.finish().unwrap();
        g.add_graph_output("y");
        g
    }

    #[test]
    fn test_scalar_mul_absorbed_into_weights() {
        let weight = TensorData::new(vec![1, 2, 1, 1], vec![1.0, 2.0]).unwrap();
        let mut g = mul_conv_graph(TensorData::scalar(3.0), weight, 1);
        assert!(MoveMulPastConv::new().run(&mut g).unwrap());
        g.verify().unwrap();
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.get_initializer("w").unwrap().data(), &[3.0, 6.0]);
        let conv = g.node_by_name("conv0").unwrap();
        assert_eq!(g.node(conv).unwrap().inputs[0], "x");
    }

    #[test]
    fn test_per_channel_mul_past_depthwise_conv() {
        let weight = TensorData::new(vec![2, 1, 1, 1], vec![1.0, 1.0]).unwrap();
        let k = TensorData::new(vec![1, 2, 1, 1], vec![2.0, 5.0]).unwrap();
        let mut g = mul_conv_graph(k, weight, 2);
        assert!(MoveMulPastConv::new().run(&mut g).unwrap());
        assert_eq!(g.get_initializer("w").unwrap().data(), &[2.0, 5.0]);
    }

    #[test]
    fn test_per_channel_mul_past_dense_conv_is_no_match() {
        // group == 1: per-channel scales do not commute with a dense conv
        let weight = TensorData::new(vec![2, 2, 1, 1], vec![1.0; 4]).unwrap();
        let k = TensorData::new(vec![1, 2, 1, 1], vec![2.0, 5.0]).unwrap();
        let mut g = mul_conv_graph(k, weight, 1);
        let before = g.to_proto().unwrap();
        assert!(!MoveMulPastConv::new().run(&mut g).unwrap());
        assert_eq!(g.to_proto().unwrap(), before);
    }

    #[test]
    fn test_forked_mul_output_is_no_match() {
        let weight = TensorData::new(vec![1, 2, 1, 1], vec![1.0, 2.0]).unwrap();
        let mut g = mul_conv_graph(TensorData::scalar(3.0), weight, 1);
        // add a second consumer of the mul output
        g.set_initializer("one", TensorData::scalar(1.0));
        g.add_op(OpKind::Add)
            .name("fork")
            .input("t0")
            .input("one")
            .output("z")
            .finish()
            .unwrap();
        g.add_graph_output("z");
        assert!(!MoveMulPastConv::new().run(&mut g).unwrap());
    }
}
