//! Collapsing of repeated operators.

use super::{constant_operand, replace_constant_input, sole_consumer, Pass};
use crate::exec::execute_node;
use crate::graph::{display_name, Node, QuantGraph};
use crate::ops::OpKind;
use crate::Result;

/// Merges adjacent chains of the same commutative, associative operator
/// with constant operands into a single node whose constant combines
/// both, e.g. `Mul(2.0) -> Mul(3.0)` into `Mul(6.0)`.
///
/// Only `Mul` and `Add` chains are collapsible; the combined constant is
/// computed with the operator's own kernel so the replacement is exactly
/// the composition of the originals. The intermediate tensor must have a
/// single consumer and must not be exported.
#[derive(Debug, Clone, Copy)]
pub struct CollapseRepeatedOp {
    op: OpKind,
}

impl CollapseRepeatedOp {
    pub fn mul() -> Self {
        Self { op: OpKind::Mul }
    }

    pub fn add() -> Self {
        Self { op: OpKind::Add }
    }
}

impl Pass for CollapseRepeatedOp {
    fn name(&self) -> &str {
        match self.op {
            OpKind::Mul => "collapse_repeated_mul",
            _ => "collapse_repeated_add",
        }
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut applied = false;
            for id in graph.topological_sort()? {
                let first = graph.node(id).expect("sorted id").clone();
                if first.op != self.op {
                    continue;
                }
                let Some((first_dyn, first_const)) = constant_operand(graph, &first) else {
                    continue;
                };
                let Some(second_id) = sole_consumer(graph, &first.outputs[0]) else {
                    continue;
                };
                let second = graph.node(second_id).expect("consumer id").clone();
                if second.op != self.op {
                    continue;
                }
                let Some((second_dyn, second_const)) = constant_operand(graph, &second) else {
                    continue;
                };
                if second.inputs[second_dyn] != first.outputs[0] {
                    continue;
                }

                let a = graph
                    .get_initializer(&first.inputs[first_const])
                    .expect("constant operand")
                    .clone();
                let b = graph
                    .get_initializer(&second.inputs[second_const])
                    .expect("constant operand")
                    .clone();
                // Combine through the operator's own kernel; shapes that
                // do not broadcast are a non-match, not an error.
                let Ok(mut combined) = execute_node(&Node::new(self.op), &[&a, &b]) else {
                    continue;
                };
                let combined = combined.remove(0);

                replace_constant_input(graph, second_id, second_const, combined)?;
                graph.set_node_input(second_id, second_dyn, &first.inputs[first_dyn])?;
                graph.remove_node(id)?;
                tracing::debug!(
                    first = %display_name(&first),
                    second = %display_name(&second),
                    "collapsed repeated {}", self.op
                );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;
    use crate::tensor::TensorData;

    fn chain(op: OpKind, a: f32, b: f32) -> QuantGraph {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer("a", TensorData::scalar(a));
        g.set_initializer("b", TensorData::scalar(b));
        g.add_op(op)
            .name("first")
            .input("x")
            .input("a")
            .output("t0")
            .finish()
            .unwrap();
        g.add_op(op)
            .name("second")
            .input("t0")
            .input("b")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");
        g
    }

    #[test]
    fn test_collapse_mul_chain() {
        let mut g = chain(OpKind::Mul, 2.0, 3.0);
        assert!(CollapseRepeatedOp::mul().run(&mut g).unwrap());
        g.verify().unwrap();
        assert_eq!(g.node_count(), 1);
        let second = g.node_by_name("second").unwrap();
        assert_eq!(g.node(second).unwrap().inputs[0], "x");
        assert_eq!(g.get_initializer("b").unwrap().data(), &[6.0]);
        assert!(!CollapseRepeatedOp::mul().run(&mut g).unwrap());
    }

    #[test]
    fn test_collapse_add_chain() {
        let mut g = chain(OpKind::Add, 1.5, -0.5);
        assert!(CollapseRepeatedOp::add().run(&mut g).unwrap());
        assert_eq!(g.get_initializer("b").unwrap().data(), &[1.0]);
    }

    #[test]
    fn test_mixed_chain_untouched() {
        // Mul feeding Add is not a repeated chain for either pass
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer("a", TensorData::scalar(2.0));
        g.set_initializer("b", TensorData::scalar(3.0));
        g.add_op(OpKind::Mul)
            .name("m")
            .input("x")
            .input("a")
            .output("t0")
            .finish()
            .unwrap();
        g.add_op(OpKind::Add)
            .name("a0")
            .input("t0")
            .input("b")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");

        assert!(!CollapseRepeatedOp::mul().run(&mut g).unwrap());
        assert!(!CollapseRepeatedOp::add().run(&mut g).unwrap());
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn test_exported_intermediate_untouched() {
        let mut g = chain(OpKind::Mul, 2.0, 3.0);
        g.add_graph_output("t0");
        assert!(!CollapseRepeatedOp::mul().run(&mut g).unwrap());
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn test_triple_chain_collapses_fully() {
        let mut g = chain(OpKind::Mul, 2.0, 3.0);
        g.set_initializer("c", TensorData::scalar(4.0));
        // extend: y -> Mul(c) -> z, re-pointing the graph output at z
        g.add_op(OpKind::Mul)
            .name("third")
            .input("y")
            .input("c")
            .output("z")
            .finish()
            .unwrap();
        g.replace_output("y", "z").unwrap();

        assert!(CollapseRepeatedOp::mul().run(&mut g).unwrap());
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.get_initializer("c").unwrap().data(), &[24.0]);
    }
}
