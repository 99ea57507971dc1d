//! Constant folding.

use super::Pass;
use crate::exec::{Executor, ReferenceExecutor, TensorMap};
use crate::graph::QuantGraph;
use crate::{Result, StreamlineError};

/// Evaluates any node whose inputs are all constants and replaces it
/// with an initializer holding the result.
///
/// Evaluation goes through the execution adapter on a single-node
/// subgraph, so the folded value is exactly what executing the original
/// node would have produced.
pub struct FoldConstants {
    executor: Box<dyn Executor>,
}

impl FoldConstants {
    pub fn new() -> Self {
        Self {
            executor: Box::new(ReferenceExecutor::new()),
        }
    }

    pub fn with_executor(executor: Box<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Default for FoldConstants {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for FoldConstants {
    fn name(&self) -> &str {
        "fold_constants"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut folded = false;
            for id in graph.topological_sort()? {
                let node = graph.node(id).expect("sorted id");
                if node.inputs.is_empty()
                    || !node
                        .inputs
                        .iter()
                        .all(|n| graph.get_initializer(n).is_some())
                {
                    continue;
                }
                let node_name = node.name.clone();
                let node_outputs = node.outputs.clone();

                let sub = graph.single_node_subgraph(id)?;
                let results = self.executor.execute(&sub, &TensorMap::new())?;
                for output in &node_outputs {
                    let value = results.get(output).ok_or_else(|| {
                        StreamlineError::Execution(format!(
                            "folding '{}' produced no value for '{}'",
                            node_name, output
                        ))
                    })?;
                    graph.set_initializer(output, value.clone());
                }
                graph.remove_node(id)?;
                tracing::debug!(node = %node_name, "folded constant node");
                folded = true;
                changed = true;
                // Rescan: folding may make a downstream node foldable.
                break;
            }
            if !folded {
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
    use crate::ops::OpKind;
    use crate::tensor::TensorData;

    #[test]
    fn test_folds_all_constant_node() {
        let mut g = QuantGraph::new("t");
        g.set_initializer("a", TensorData::new(vec![2], vec![1.0, 2.0]).unwrap());
        g.set_initializer("b", TensorData::new(vec![2], vec![10.0, 20.0]).unwrap());
        g.add_graph_input("x", Some(vec![2]), Some(DataType::Float32))
            .unwrap();
        g.add_op(OpKind::Add)
            .name("const_add")
            .input("a")
            .input("b")
            .output("sum")
            .finish()
            .unwrap();
        g.add_op(OpKind::Add)
            .name("dyn_add")
            .input("x")
            .input("sum")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");

        assert!(FoldConstants::new().run(&mut g).unwrap());
        g.verify().unwrap();
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.get_initializer("sum").unwrap().data(), &[11.0, 22.0]);
        // nothing left to fold
        assert!(!FoldConstants::new().run(&mut g).unwrap());
    }

    #[test]
    fn test_folds_chains() {
        let mut g = QuantGraph::new("t");
        g.set_initializer("a", TensorData::scalar(2.0));
        g.set_initializer("b", TensorData::scalar(3.0));
        g.add_op(OpKind::Mul)
            .name("m0")
            .input("a")
            .input("b")
            .output("p0")
            .finish()
            .unwrap();
        g.add_op(OpKind::Mul)
            .name("m1")
            .input("p0")
            .input("b")
            .output("p1")
            .finish()
            .unwrap();
        g.add_graph_output("p1");

        assert!(FoldConstants::new().run(&mut g).unwrap());
        assert_eq!(g.node_count(), 0);
        assert_eq!(g.get_initializer("p1").unwrap().data(), &[18.0]);
    }

    #[test]
    fn test_dynamic_node_untouched() {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer("k", TensorData::scalar(2.0));
        g.add_op(OpKind::Mul)
            .name("m0")
            .input("x")
            .input("k")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");

        assert!(!FoldConstants::new().run(&mut g).unwrap());
        assert_eq!(g.node_count(), 1);
    }
}
