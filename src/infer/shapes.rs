//! Shape inference.
//!
//! Propagates tensor shapes through the graph in topological order using
//! per-operator rules: broadcasting for elementwise ops, the standard
//! convolution/pooling arithmetic, matrix-multiply dimension rules, TopK
//! replacing one axis with k. A node with unresolved input shapes is
//! skipped, not failed; resolution may arrive on a later sweep (e.g.
//! after constant folding materializes a reshape target).

use crate::exec::resolve_reshape;
use crate::graph::{Node, QuantGraph};
use crate::ops::OpKind;
use crate::passes::Pass;
use crate::tensor::broadcast_shapes;
use crate::{Result, StreamlineError};

/// Shape inference pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct InferShapes;

impl InferShapes {
    pub fn new() -> Self {
        InferShapes
    }
}

impl Pass for InferShapes {
    fn name(&self) -> &str {
        "infer_shapes"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed_any = false;
        // Termination bound: each round must resolve at least one more
        // tensor, and there are at most node-count rounds to go.
        let bound = graph.node_count() + 1;
        for _ in 0..bound {
            let mut changed = false;
            for id in graph.topological_sort()? {
                let node = graph.node(id).expect("sorted id").clone();
                let input_shapes: Option<Vec<Vec<i64>>> = node
                    .inputs
                    .iter()
                    .map(|n| graph.tensor_shape(n))
                    .collect();
                let Some(input_shapes) = input_shapes else {
                    continue;
                };
                let Some(output_shapes) = infer_node_shapes(&node, &input_shapes, graph)? else {
                    continue;
                };
                for (name, shape) in node.outputs.iter().zip(output_shapes) {
                    if graph.tensor_shape(name).as_ref() != Some(&shape) {
                        tracing::trace!(tensor = %name, ?shape, "inferred shape");
                        graph.set_tensor_shape(name, shape);
                        changed = true;
                    }
                }
            }
            if changed {
                changed_any = true;
            } else {
                break;
            }
        }
        Ok(changed_any)
    }
}

/// Output shapes of one node, or `None` if still unresolvable.
fn infer_node_shapes(
    node: &Node,
    input_shapes: &[Vec<i64>],
    graph: &QuantGraph,
) -> Result<Option<Vec<Vec<i64>>>> {
    let subject = || {
        if node.name.is_empty() {
            node.op.as_str().to_string()
        } else {
            node.name.clone()
        }
    };
    let shapes = match node.op {
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            vec![broadcast_shapes(&input_shapes[0], &input_shapes[1])?]
        }

        OpKind::Conv => {
            let (xs, ws) = (&input_shapes[0], &input_shapes[1]);
            if xs.len() != 4 || ws.len() != 4 {
                return Err(StreamlineError::structural(
                    subject(),
                    format!("Conv expects 4D data and weights, got {:?} / {:?}", xs, ws),
                ));
            }
            let strides = node.ints_attr("strides").unwrap_or(&[1, 1]);
            let pads = node.ints_attr("pads").unwrap_or(&[0, 0, 0, 0]);
            let dilations = node.ints_attr("dilations").unwrap_or(&[1, 1]);
            let oh = conv_dim(xs[2], ws[2], strides[0], pads[0] + pads[2], dilations[0]);
            let ow = conv_dim(xs[3], ws[3], strides[1], pads[1] + pads[3], dilations[1]);
            vec![vec![xs[0], ws[0], oh, ow]]
        }

        OpKind::MatMul => {
            let (a, b) = (&input_shapes[0], &input_shapes[1]);
            if a.len() < 2 || b.len() < 2 {
                return Err(StreamlineError::structural(
                    subject(),
                    format!("MatMul expects rank >= 2, got {:?} / {:?}", a, b),
                ));
            }
            if a[a.len() - 1] != b[b.len() - 2] {
                return Err(StreamlineError::structural(
                    subject(),
                    format!("MatMul inner dimensions differ: {:?} x {:?}", a, b),
                ));
            }
            let mut shape = a[..a.len() - 1].to_vec();
            shape.push(b[b.len() - 1]);
            vec![shape]
        }

        OpKind::AveragePool => {
            let xs = &input_shapes[0];
            if xs.len() != 4 {
                return Err(StreamlineError::structural(
                    subject(),
                    format!("AveragePool expects 4D data, got {:?}", xs),
                ));
            }
            let Some(kernel) = node.ints_attr("kernel_shape") else {
                return Err(StreamlineError::structural(
                    subject(),
                    "AveragePool missing kernel_shape",
                ));
            };
            let strides = node.ints_attr("strides").unwrap_or(&[1, 1]);
            let pads = node.ints_attr("pads").unwrap_or(&[0, 0, 0, 0]);
            let oh = conv_dim(xs[2], kernel[0], strides[0], pads[0] + pads[2], 1);
            let ow = conv_dim(xs[3], kernel[1], strides[1], pads[1] + pads[3], 1);
            vec![vec![xs[0], xs[1], oh, ow]]
        }

        OpKind::Reshape => {
            // Target shapes only resolve once they are constants.
            let Some(target) = graph.get_initializer(&node.inputs[1]) else {
                return Ok(None);
            };
            let requested: Vec<i64> = target.data().iter().map(|&v| v as i64).collect();
            vec![resolve_reshape(&input_shapes[0], &requested)?]
        }

        OpKind::Transpose => {
            let xs = &input_shapes[0];
            match node.ints_attr("perm") {
                Some(perm) => {
                    if perm.len() != xs.len()
                        || perm.iter().any(|&p| p < 0 || p as usize >= xs.len())
                    {
                        return Err(StreamlineError::structural(
                            subject(),
                            format!("Transpose perm {:?} invalid for rank {}", perm, xs.len()),
                        ));
                    }
                    vec![perm.iter().map(|&p| xs[p as usize]).collect()]
                }
                None => vec![xs.iter().rev().copied().collect()],
            }
        }

        OpKind::Flatten => {
            let xs = &input_shapes[0];
            let axis = node.int_attr("axis").unwrap_or(1);
            let rank = xs.len() as i64;
            let axis = if axis < 0 { axis + rank } else { axis };
            if !(0..=rank).contains(&axis) {
                return Err(StreamlineError::structural(
                    subject(),
                    format!("Flatten axis {} invalid for rank {}", axis, rank),
                ));
            }
            let outer: i64 = xs[..axis as usize].iter().product();
            let inner: i64 = xs[axis as usize..].iter().product();
            vec![vec![outer, inner]]
        }

        OpKind::MultiThreshold => vec![input_shapes[0].clone()],

        OpKind::Im2Col => {
            let xs = &input_shapes[0];
            if xs.len() != 4 {
                return Err(StreamlineError::structural(
                    subject(),
                    format!("Im2Col expects 4D channel-last data, got {:?}", xs),
                ));
            }
            let Some(kernel) = node.ints_attr("kernel_shape") else {
                return Err(StreamlineError::structural(
                    subject(),
                    "Im2Col missing kernel_shape",
                ));
            };
            let strides = node.ints_attr("strides").unwrap_or(&[1, 1]);
            let pads = node.ints_attr("pads").unwrap_or(&[0, 0, 0, 0]);
            let oh = conv_dim(xs[1], kernel[0], strides[0], pads[0] + pads[2], 1);
            let ow = conv_dim(xs[2], kernel[1], strides[1], pads[1] + pads[3], 1);
            vec![vec![xs[0], oh, ow, kernel[0] * kernel[1] * xs[3]]]
        }

        OpKind::TopK => {
            let xs = &input_shapes[0];
            let k = match node.int_attr("k") {
                Some(k) => k,
                None => match node.inputs.get(1).and_then(|n| graph.get_initializer(n)) {
                    Some(t) => t.data()[0] as i64,
                    None => return Ok(None),
                },
            };
            let axis = node.int_attr("axis").unwrap_or(-1);
            let rank = xs.len() as i64;
            let axis = if axis < 0 { axis + rank } else { axis };
            if !(0..rank).contains(&axis) {
                return Err(StreamlineError::structural(
                    subject(),
                    format!("TopK axis {} invalid for rank {}", axis, rank),
                ));
            }
            let mut shape = xs.clone();
            shape[axis as usize] = k;
            vec![shape.clone(), shape]
        }
    };
    Ok(Some(shapes))
}

fn conv_dim(input: i64, kernel: i64, stride: i64, pad_total: i64, dilation: i64) -> i64 {
    (input + pad_total - dilation * (kernel - 1) - 1) / stride + 1
}
