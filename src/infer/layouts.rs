//! Data-layout inference.
//!
//! Labels activation tensors with their layout tag. Layout-sensitive ops
//! (Conv, AveragePool work channel-first, Im2Col channel-last) pin their
//! outputs; Transpose permutes the tag; everything else passes it
//! through. Seeding is rank-based at the graph inputs. Layout tags are a
//! best-effort annotation: a recomputed tag overwrites a stale one
//! instead of erroring.

use crate::graph::{Node, QuantGraph};
use crate::layout::DataLayout;
use crate::ops::OpKind;
use crate::passes::Pass;
use crate::Result;

/// Data-layout inference pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct InferDataLayouts;

impl InferDataLayouts {
    pub fn new() -> Self {
        InferDataLayouts
    }
}

impl Pass for InferDataLayouts {
    fn name(&self) -> &str {
        "infer_data_layouts"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed = false;

        for name in graph.graph_inputs().to_vec() {
            if graph.tensor_layout(&name).is_none() {
                if let Some(shape) = graph.tensor_shape(&name) {
                    if let Some(layout) = DataLayout::default_for_rank(shape.len()) {
                        graph.set_tensor_layout(&name, layout);
                        changed = true;
                    }
                }
            }
        }

        for id in graph.topological_sort()? {
            let node = graph.node(id).expect("sorted id").clone();
            let output_layouts = infer_node_layouts(&node, graph);
            for (name, layout) in node.outputs.iter().zip(output_layouts) {
                let Some(layout) = layout else { continue };
                match graph.tensor_layout(name) {
                    None => {
                        graph.set_tensor_layout(name, layout);
                        changed = true;
                    }
                    Some(existing) if existing != layout => {
                        tracing::debug!(
                            tensor = %name,
                            old = %existing,
                            new = %layout,
                            "overwriting stale layout tag"
                        );
                        graph.set_tensor_layout(name, layout);
                        changed = true;
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(changed)
    }
}

fn infer_node_layouts(node: &Node, graph: &QuantGraph) -> Vec<Option<DataLayout>> {
    let input_layout = node
        .inputs
        .first()
        .and_then(|n| graph.tensor_layout(n));
    match node.op {
        OpKind::Conv | OpKind::AveragePool => vec![Some(DataLayout::Nchw)],
        OpKind::Im2Col => vec![Some(DataLayout::Nhwc)],
        OpKind::Transpose => {
            let perm: Option<Vec<i64>> = node.ints_attr("perm").map(|p| p.to_vec());
            vec![match (input_layout, perm) {
                (Some(layout), Some(perm)) => layout.permute(&perm),
                _ => None,
            }]
        }
        OpKind::Reshape | OpKind::Flatten => {
            let rank = node
                .outputs
                .first()
                .and_then(|n| graph.tensor_shape(n))
                .map(|s| s.len());
            vec![rank.and_then(DataLayout::default_for_rank)]
        }
        OpKind::MatMul => {
            let rank = node
                .outputs
                .first()
                .and_then(|n| graph.tensor_shape(n))
                .map(|s| s.len());
            match rank {
                Some(2) => vec![Some(DataLayout::Nc)],
                _ => vec![input_layout],
            }
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::MultiThreshold => {
            vec![input_layout]
        }
        OpKind::TopK => vec![input_layout, input_layout],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;
    use crate::tensor::TensorData;

    #[test]
    fn test_conv_transpose_chain() {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 2, 4, 4]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer(
            "w",
            TensorData::new(vec![2, 2, 1, 1], vec![0.0; 4]).unwrap(),
        );
        g.add_op(OpKind::Conv)
            .name("conv0")
            .input("x")
            .input("w")
            .output("c0")
            .finish()
            .unwrap();
        g.add_op(OpKind::Transpose)
            .name("tr0")
            .input("c0")
            .output("y")
            .attr_is("perm", vec![0, 2, 3, 1])
            .finish()
            .unwrap();
        g.add_graph_output("y");

        assert!(InferDataLayouts.run(&mut g).unwrap());
        assert_eq!(g.tensor_layout("x"), Some(DataLayout::Nchw));
        assert_eq!(g.tensor_layout("c0"), Some(DataLayout::Nchw));
        assert_eq!(g.tensor_layout("y"), Some(DataLayout::Nhwc));
        assert!(!InferDataLayouts.run(&mut g).unwrap());
    }

    #[test]
    fn test_flatten_to_nc() {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 2, 4, 4]), Some(DataType::Float32))
            .unwrap();
        g.add_op(OpKind::Flatten)
            .name("fl0")
            .input("x")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");
        g.set_tensor_shape("y", vec![1, 32]);

        InferDataLayouts.run(&mut g).unwrap();
        assert_eq!(g.tensor_layout("y"), Some(DataLayout::Nc));
    }
}
