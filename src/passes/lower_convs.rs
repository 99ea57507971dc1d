//! Convolution lowering.

use super::Pass;
use crate::graph::{display_name, QuantGraph};
use crate::ops::OpKind;
use crate::tensor::TensorData;
use crate::{Result, StreamlineError};

/// Lowers convolutions to matrix multiplies for consumers that only
/// understand the general form.
///
/// Each convolution becomes `Transpose(NCHW->NHWC) -> Im2Col -> MatMul
/// -> Transpose(NHWC->NCHW)`, with the filter tensor rewritten into a
/// `(kH*kW*C, M)` matmul weight. Pointwise convolutions (1x1 kernel,
/// unit stride, no padding) skip the Im2Col step. Depthwise convolutions
/// lower through a block-sparse weight matrix with one live column
/// entry per channel. Grouped-but-not-depthwise convolutions, biased
/// convolutions and dilated convolutions are left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowerConvsToMatMul;

impl LowerConvsToMatMul {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for LowerConvsToMatMul {
    fn name(&self) -> &str {
        "lower_convs_to_matmul"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let mut changed = false;
        for id in graph.node_ids() {
            let node = match graph.node(id) {
                Some(n) if n.op == OpKind::Conv => n.clone(),
                _ => continue,
            };
            if node.inputs.len() != 2 {
                continue;
            }
            let Some(weight) = graph.get_initializer(&node.inputs[1]).cloned() else {
                continue;
            };
            if node.ints_attr("dilations").is_some_and(|d| d.iter().any(|&v| v != 1)) {
                continue;
            }

            let data_in = node.inputs[0].clone();
            // The rewrite keys off the activation geometry; unresolved
            // shapes here are an inference gap, not a non-match.
            let input_shape = graph.tensor_shape(&data_in).ok_or_else(|| {
                StreamlineError::InferenceIncomplete {
                    tensor: data_in.clone(),
                    missing: "shape",
                }
            })?;
            let channels = input_shape[1];

            let (m, c_per_group, kh, kw) = {
                let ws = weight.shape();
                (ws[0], ws[1], ws[2], ws[3])
            };
            let group = node.int_attr("group").unwrap_or(1);
            let depthwise = c_per_group == 1 && group == m && group == channels;
            let dense = group == 1 && c_per_group == channels;
            if !depthwise && !dense {
                continue;
            }

            let strides = node
                .ints_attr("strides")
                .map(|s| s.to_vec())
                .unwrap_or_else(|| vec![1, 1]);
            let pads = node
                .ints_attr("pads")
                .map(|p| p.to_vec())
                .unwrap_or_else(|| vec![0, 0, 0, 0]);
            let pointwise =
                kh == 1 && kw == 1 && strides == [1, 1] && pads.iter().all(|&p| p == 0);

            let matmul_weight = if depthwise {
                depthwise_matmul_weight(&weight, channels, kh, kw)?
            } else {
                dense_matmul_weight(&weight, channels, kh, kw)?
            };

            let conv_out = node.outputs[0].clone();
            let nhwc = graph.make_unique_tensor_name(&format!("{}_nhwc", data_in));
            graph
                .add_op(OpKind::Transpose)
                .input(data_in.as_str())
                .output(nhwc.as_str())
                .attr_is("perm", vec![0, 2, 3, 1])
                .finish()?;

            let patches = if pointwise {
                nhwc.clone()
            } else {
                let patches = graph.make_unique_tensor_name(&format!("{}_patches", conv_out));
                graph
                    .add_op(OpKind::Im2Col)
                    .input(nhwc.as_str())
                    .output(patches.as_str())
                    .attr_is("kernel_shape", vec![kh, kw])
                    .attr_is("strides", strides.clone())
                    .attr_is("pads", pads.clone())
                    .finish()?;
                patches
            };

            let weight_name =
                graph.make_unique_tensor_name(&format!("{}_matmul", node.inputs[1]));
            graph.set_initializer(&weight_name, matmul_weight);
            let product = graph.make_unique_tensor_name(&format!("{}_nhwc", conv_out));
            graph
                .add_op(OpKind::MatMul)
                .input(patches.as_str())
                .input(weight_name.as_str())
                .output(product.as_str())
                .finish()?;

            let lowered = graph.make_unique_tensor_name(&format!("{}_lowered", conv_out));
            graph
                .add_op(OpKind::Transpose)
                .input(product.as_str())
                .output(lowered.as_str())
                .attr_is("perm", vec![0, 3, 1, 2])
                .finish()?;

            for consumer in graph.consumers(&conv_out) {
                let slots: Vec<usize> = graph
                    .node(consumer)
                    .expect("consumer id")
                    .inputs
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| *n == &conv_out)
                    .map(|(i, _)| i)
                    .collect();
                for slot in slots {
                    graph.set_node_input(consumer, slot, &lowered)?;
                }
            }
            if graph.is_graph_output(&conv_out) {
                graph.replace_output(&conv_out, &lowered)?;
            }
            graph.remove_node(id)?;
            graph.rename_tensor(&lowered, &conv_out)?;
            let old_weight = node.inputs[1].clone();
            if graph.consumers(&old_weight).is_empty() && !graph.is_graph_output(&old_weight) {
                graph.remove_initializer(&old_weight)?;
            }

            tracing::debug!(node = %display_name(&node), "lowered conv to matmul");
            changed = true;
        }
        Ok(changed)
    }
}

/// `(kH*kW*C, M)` weight with `Wm[(ky*kW + kx)*C + c, m] = W[m, c, ky, kx]`,
/// matching the patch ordering Im2Col emits.
fn dense_matmul_weight(weight: &TensorData, channels: i64, kh: i64, kw: i64) -> Result<TensorData> {
    let (m, c, kh, kw) = (weight.shape()[0] as usize, channels as usize, kh as usize, kw as usize);
    let k = kh * kw * c;
    let mut data = vec![0f32; k * m];
    for mi in 0..m {
        for ci in 0..c {
            for ky in 0..kh {
                for kx in 0..kw {
                    let row = (ky * kw + kx) * c + ci;
                    data[row * m + mi] = weight.data()[((mi * c + ci) * kh + ky) * kw + kx];
                }
            }
        }
    }
    TensorData::new(vec![k as i64, m as i64], data)
}

/// Depthwise variant: each filter only sees its own channel, so the
/// matrix is zero except for one entry per (tap, channel) pair.
fn depthwise_matmul_weight(
    weight: &TensorData,
    channels: i64,
    kh: i64,
    kw: i64,
) -> Result<TensorData> {
    let (c, kh, kw) = (channels as usize, kh as usize, kw as usize);
    let k = kh * kw * c;
    let mut data = vec![0f32; k * c];
    for ci in 0..c {
        for ky in 0..kh {
            for kx in 0..kw {
                let row = (ky * kw + kx) * c + ci;
                data[row * c + ci] = weight.data()[(ci * kh + ky) * kw + kx];
            }
        }
    }
    TensorData::new(vec![k as i64, c as i64], data)
}
