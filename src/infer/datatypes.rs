//! Datatype inference.
//!
//! Propagates quantization-aware datatypes forward from graph inputs and
//! initializers. Elementwise ops preserve integer types by widening to
//! the smallest containing type, any float operand widens the result to
//! FLOAT32, TopK's index output is integer regardless of its input, and
//! MultiThreshold takes its output type from its own attribute.
//!
//! A recomputed datatype overwrites a stale annotation: rewrites
//! legitimately narrow an activation's value set (an absorbed multiply
//! turns a float activation back into its quantized form), and the
//! single-producer invariant of the IR already rules out genuinely
//! ambiguous annotations.

use crate::datatype::DataType;
use crate::graph::{Node, QuantGraph};
use crate::ops::OpKind;
use crate::passes::Pass;
use crate::Result;

/// Integer accumulators are clamped to this width.
const MAX_ACC_BITS: u8 = 32;

/// Datatype inference pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct InferDataTypes;

impl InferDataTypes {
    pub fn new() -> Self {
        InferDataTypes
    }
}

impl Pass for InferDataTypes {
    fn name(&self) -> &str {
        "infer_datatypes"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed = false;

        // Unannotated constants default to the float container type.
        for name in graph.initializer_names() {
            if graph.tensor_dtype(&name).is_none() {
                graph.set_tensor_dtype(&name, DataType::Float32);
                changed = true;
            }
        }

        for id in graph.topological_sort()? {
            let node = graph.node(id).expect("sorted id").clone();
            let input_dtypes: Option<Vec<DataType>> = node
                .inputs
                .iter()
                .map(|n| graph.tensor_dtype(n))
                .collect();
            let Some(input_dtypes) = input_dtypes else {
                continue;
            };
            let output_dtypes = infer_node_dtypes(&node, &input_dtypes);
            for (name, dtype) in node.outputs.iter().zip(output_dtypes) {
                match graph.tensor_dtype(name) {
                    None => {
                        tracing::trace!(tensor = %name, %dtype, "inferred datatype");
                        graph.set_tensor_dtype(name, dtype);
                        changed = true;
                    }
                    Some(existing) if existing != dtype => {
                        tracing::debug!(
                            tensor = %name,
                            old = %existing,
                            new = %dtype,
                            "refreshing stale datatype annotation"
                        );
                        graph.set_tensor_dtype(name, dtype);
                        changed = true;
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(changed)
    }
}

fn infer_node_dtypes(node: &Node, inputs: &[DataType]) -> Vec<DataType> {
    match node.op {
        OpKind::Add | OpKind::Sub => vec![widen_sum(inputs[0], inputs[1])],
        OpKind::Mul => vec![widen_product(inputs[0], inputs[1])],
        OpKind::Div | OpKind::AveragePool => vec![DataType::Float32],
        OpKind::Conv | OpKind::MatMul => vec![accumulator(inputs[0], inputs[1])],
        OpKind::Reshape | OpKind::Transpose | OpKind::Flatten | OpKind::Im2Col => {
            vec![inputs[0]]
        }
        OpKind::MultiThreshold => {
            let dtype = node
                .string_attr("out_dtype")
                .and_then(DataType::from_name)
                .unwrap_or(DataType::Float32);
            vec![dtype]
        }
        OpKind::TopK => vec![inputs[0], DataType::Int { bits: 64 }],
    }
}

/// Smallest integer type containing the sum of two integer operands; any
/// float operand widens the result to FLOAT32.
fn widen_sum(a: DataType, b: DataType) -> DataType {
    if !a.is_integer() || !b.is_integer() {
        return DataType::Float32;
    }
    let bits = clamp_bits(a.bitwidth().max(b.bitwidth()) + 1);
    if a.signed() || b.signed() {
        DataType::Int { bits }
    } else {
        DataType::Uint { bits }
    }
}

fn widen_product(a: DataType, b: DataType) -> DataType {
    if !a.is_integer() || !b.is_integer() {
        return DataType::Float32;
    }
    let bits = clamp_bits(a.bitwidth() + b.bitwidth());
    if a.signed() || b.signed() {
        DataType::Int { bits }
    } else {
        DataType::Uint { bits }
    }
}

/// Dot-product accumulator type for Conv/MatMul.
fn accumulator(a: DataType, b: DataType) -> DataType {
    if !a.is_integer() || !b.is_integer() {
        DataType::Float32
    } else {
        DataType::Int { bits: MAX_ACC_BITS }
    }
}

fn clamp_bits(bits: u32) -> u8 {
    bits.min(u32::from(MAX_ACC_BITS)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorData;

    #[test]
    fn test_forward_propagation() {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Uint { bits: 4 }))
            .unwrap();
        g.set_initializer("k", TensorData::scalar(0.5));
        g.add_op(OpKind::Mul)
            .name("mul0")
            .input("x")
            .input("k")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");

        assert!(InferDataTypes.run(&mut g).unwrap());
        // float scale widens the product to the container type
        assert_eq!(g.tensor_dtype("y"), Some(DataType::Float32));
        assert_eq!(g.tensor_dtype("k"), Some(DataType::Float32));
        assert!(!InferDataTypes.run(&mut g).unwrap());
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(
            widen_sum(DataType::Uint { bits: 4 }, DataType::Uint { bits: 4 }),
            DataType::Uint { bits: 5 }
        );
        assert_eq!(
            widen_sum(DataType::Int { bits: 4 }, DataType::Uint { bits: 8 }),
            DataType::Int { bits: 9 }
        );
        assert_eq!(
            widen_product(DataType::Bipolar, DataType::Uint { bits: 3 }),
            DataType::Int { bits: 4 }
        );
    }

    #[test]
    fn test_multithreshold_and_topk() {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer(
            "thresh",
            TensorData::new(vec![1, 3], vec![0.0, 1.0, 2.0]).unwrap(),
        );
        g.add_op(OpKind::MultiThreshold)
            .name("mt0")
            .input("x")
            .input("thresh")
            .output("q")
            .attr_s("out_dtype", "UINT2")
            .finish()
            .unwrap();
        g.add_op(OpKind::TopK)
            .name("topk0")
            .input("q")
            .output("vals")
            .output("inds")
            .attr_i("k", 2)
            .finish()
            .unwrap();
        g.add_graph_output("inds");

        InferDataTypes.run(&mut g).unwrap();
        assert_eq!(g.tensor_dtype("q"), Some(DataType::Uint { bits: 2 }));
        assert_eq!(g.tensor_dtype("vals"), Some(DataType::Uint { bits: 2 }));
        assert_eq!(g.tensor_dtype("inds"), Some(DataType::Int { bits: 64 }));
    }

    #[test]
    fn test_stale_annotation_refreshed() {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer("k", TensorData::scalar(2.0));
        g.add_op(OpKind::Mul)
            .name("mul0")
            .input("x")
            .input("k")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");
        // stale annotation left behind by an earlier rewrite epoch
        g.set_tensor_dtype("y", DataType::Uint { bits: 4 });

        assert!(InferDataTypes.run(&mut g).unwrap());
        assert_eq!(g.tensor_dtype("y"), Some(DataType::Float32));
    }
}
