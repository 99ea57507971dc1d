//! Naive reference interpreter.
//!
//! Straight-line per-operator kernels over flat f32 buffers. Correctness
//! is the only goal; the streamlining engine uses this to fold constants
//! and to check that rewrites preserve observable behavior.

use super::{Executor, TensorMap};
use crate::graph::{Node, QuantGraph};
use crate::ops::OpKind;
use crate::tensor::{broadcast_shapes, TensorData};
use crate::{Result, StreamlineError};
use ahash::AHashMap;
use ordered_float::OrderedFloat;

/// Reference interpreter for the supported operator set.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceExecutor;

impl ReferenceExecutor {
    pub fn new() -> Self {
        ReferenceExecutor
    }
}

impl Executor for ReferenceExecutor {
    fn execute(&self, graph: &QuantGraph, inputs: &TensorMap) -> Result<TensorMap> {
        let mut ctx: AHashMap<String, TensorData> = AHashMap::new();
        for name in graph.initializer_names() {
            let data = graph.get_initializer(&name).cloned().expect("listed name");
            ctx.insert(name, data);
        }
        for name in graph.graph_inputs() {
            let value = inputs.get(name).ok_or_else(|| {
                StreamlineError::Execution(format!("missing binding for graph input '{}'", name))
            })?;
            ctx.insert(name.clone(), value.clone());
        }

        for id in graph.topological_sort()? {
            let node = graph.node(id).expect("sorted id");
            let node_inputs: Vec<&TensorData> = node
                .inputs
                .iter()
                .map(|n| {
                    ctx.get(n).ok_or_else(|| {
                        StreamlineError::Execution(format!("tensor '{}' not materialized", n))
                    })
                })
                .collect::<Result<_>>()?;
            let outputs = execute_node(node, &node_inputs)?;
            if outputs.len() != node.outputs.len() {
                return Err(StreamlineError::Execution(format!(
                    "node '{}' produced {} outputs, expected {}",
                    node.name,
                    outputs.len(),
                    node.outputs.len()
                )));
            }
            for (name, value) in node.outputs.iter().zip(outputs) {
                ctx.insert(name.clone(), value);
            }
        }

        let mut result = TensorMap::new();
        for name in graph.graph_outputs() {
            let value = ctx.remove(name).ok_or_else(|| {
                StreamlineError::Execution(format!("graph output '{}' not materialized", name))
            })?;
            result.insert(name.clone(), value);
        }
        Ok(result)
    }
}

/// Evaluate one node on materialized inputs.
pub fn execute_node(node: &Node, inputs: &[&TensorData]) -> Result<Vec<TensorData>> {
    match node.op {
        OpKind::Add => Ok(vec![broadcast_binary(inputs[0], inputs[1], |a, b| a + b)?]),
        OpKind::Sub => Ok(vec![broadcast_binary(inputs[0], inputs[1], |a, b| a - b)?]),
        OpKind::Mul => Ok(vec![broadcast_binary(inputs[0], inputs[1], |a, b| a * b)?]),
        OpKind::Div => Ok(vec![broadcast_binary(inputs[0], inputs[1], |a, b| a / b)?]),
        OpKind::Conv => Ok(vec![conv(node, inputs[0], inputs[1])?]),
        OpKind::MatMul => Ok(vec![matmul(inputs[0], inputs[1])?]),
        OpKind::AveragePool => Ok(vec![average_pool(node, inputs[0])?]),
        OpKind::Reshape => Ok(vec![reshape(inputs[0], inputs[1])?]),
        OpKind::Transpose => Ok(vec![transpose(node, inputs[0])?]),
        OpKind::Flatten => Ok(vec![flatten(node, inputs[0])?]),
        OpKind::MultiThreshold => Ok(vec![multi_threshold(node, inputs[0], inputs[1])?]),
        OpKind::Im2Col => Ok(vec![im2col(node, inputs[0])?]),
        OpKind::TopK => top_k(node, inputs),
    }
}

fn broadcast_binary(
    a: &TensorData,
    b: &TensorData,
    f: impl Fn(f32, f32) -> f32,
) -> Result<TensorData> {
    let shape = broadcast_shapes(a.shape(), b.shape())?;
    let rank = shape.len();
    let out_strides = TensorData::strides(&shape);
    let numel: usize = shape.iter().map(|&d| d as usize).product();

    let pad = |s: &[i64]| -> Vec<i64> {
        let mut padded = vec![1i64; rank - s.len()];
        padded.extend_from_slice(s);
        padded
    };
    let a_shape = pad(a.shape());
    let b_shape = pad(b.shape());
    let a_strides = TensorData::strides(&a_shape);
    let b_strides = TensorData::strides(&b_shape);

    let mut data = Vec::with_capacity(numel);
    for flat in 0..numel {
        let mut a_off = 0usize;
        let mut b_off = 0usize;
        for d in 0..rank {
            let i = (flat / out_strides[d]) % shape[d] as usize;
            if a_shape[d] > 1 {
                a_off += i * a_strides[d];
            }
            if b_shape[d] > 1 {
                b_off += i * b_strides[d];
            }
        }
        data.push(f(a.data()[a_off], b.data()[b_off]));
    }
    TensorData::new(shape, data)
}

fn ints_or(node: &Node, attr: &str, default: Vec<i64>) -> Vec<i64> {
    node.ints_attr(attr).map(|v| v.to_vec()).unwrap_or(default)
}

fn conv(node: &Node, x: &TensorData, w: &TensorData) -> Result<TensorData> {
    let (xs, ws) = (x.shape(), w.shape());
    if xs.len() != 4 || ws.len() != 4 {
        return Err(StreamlineError::Execution(format!(
            "Conv expects 4D data and weights, got {:?} and {:?}",
            xs, ws
        )));
    }
    let (n, c, h, wd) = (xs[0] as usize, xs[1] as usize, xs[2] as usize, xs[3] as usize);
    let (m, c_per_group, kh, kw) = (ws[0] as usize, ws[1] as usize, ws[2] as usize, ws[3] as usize);
    let group = node.int_attr("group").unwrap_or(1) as usize;
    let strides = ints_or(node, "strides", vec![1, 1]);
    let pads = ints_or(node, "pads", vec![0, 0, 0, 0]);
    let dilations = ints_or(node, "dilations", vec![1, 1]);
    let (sh, sw) = (strides[0] as usize, strides[1] as usize);
    let (pt, pl, pb, pr) = (pads[0] as usize, pads[1] as usize, pads[2] as usize, pads[3] as usize);
    let (dh, dw) = (dilations[0] as usize, dilations[1] as usize);
    if group * c_per_group != c || m % group != 0 {
        return Err(StreamlineError::Execution(format!(
            "Conv grouping mismatch: {} groups of {} channels vs {} input channels",
            group, c_per_group, c
        )));
    }

    let oh = (h + pt + pb - dh * (kh - 1) - 1) / sh + 1;
    let ow = (wd + pl + pr - dw * (kw - 1) - 1) / sw + 1;
    let m_per_group = m / group;
    let mut out = vec![0f32; n * m * oh * ow];
    for ni in 0..n {
        for mi in 0..m {
            let g = mi / m_per_group;
            for ohi in 0..oh {
                for owi in 0..ow {
                    let mut acc = 0f32;
                    for ci in 0..c_per_group {
                        let xc = g * c_per_group + ci;
                        for khi in 0..kh {
                            let hi = (ohi * sh + khi * dh) as isize - pt as isize;
                            if hi < 0 || hi >= h as isize {
                                continue;
                            }
                            for kwi in 0..kw {
                                let wi = (owi * sw + kwi * dw) as isize - pl as isize;
                                if wi < 0 || wi >= wd as isize {
                                    continue;
                                }
                                let xv = x.data()
                                    [((ni * c + xc) * h + hi as usize) * wd + wi as usize];
                                let wv = w.data()[((mi * c_per_group + ci) * kh + khi) * kw + kwi];
                                acc += xv * wv;
                            }
                        }
                    }
                    out[((ni * m + mi) * oh + ohi) * ow + owi] = acc;
                }
            }
        }
    }
    TensorData::new(vec![n as i64, m as i64, oh as i64, ow as i64], out)
}

fn matmul(a: &TensorData, b: &TensorData) -> Result<TensorData> {
    let (ar, br) = (a.shape().len(), b.shape().len());
    if ar < 2 || br != 2 && br != ar {
        return Err(StreamlineError::Execution(format!(
            "MatMul unsupported ranks {} x {}",
            ar, br
        )));
    }
    let k = a.shape()[ar - 1];
    if b.shape()[br - 2] != k {
        return Err(StreamlineError::Execution(format!(
            "MatMul inner dimensions differ: {:?} x {:?}",
            a.shape(),
            b.shape()
        )));
    }
    if br == ar && br > 2 && a.shape()[..ar - 2] != b.shape()[..br - 2] {
        return Err(StreamlineError::Execution(format!(
            "MatMul batch dimensions differ: {:?} x {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let m = a.shape()[ar - 2] as usize;
    let kk = k as usize;
    let nn = b.shape()[br - 1] as usize;
    let batch: usize = a.shape()[..ar - 2].iter().map(|&d| d as usize).product();
    let b_batched = br == ar && br > 2;

    let mut out = vec![0f32; batch * m * nn];
    for bi in 0..batch {
        let a_base = bi * m * kk;
        let b_base = if b_batched { bi * kk * nn } else { 0 };
        for mi in 0..m {
            for ni in 0..nn {
                let mut acc = 0f32;
                for ki in 0..kk {
                    acc += a.data()[a_base + mi * kk + ki] * b.data()[b_base + ki * nn + ni];
                }
                out[(bi * m + mi) * nn + ni] = acc;
            }
        }
    }
    let mut shape: Vec<i64> = a.shape()[..ar - 2].to_vec();
    shape.push(m as i64);
    shape.push(nn as i64);
    TensorData::new(shape, out)
}

fn average_pool(node: &Node, x: &TensorData) -> Result<TensorData> {
    let xs = x.shape();
    if xs.len() != 4 {
        return Err(StreamlineError::Execution(format!(
            "AveragePool expects 4D data, got {:?}",
            xs
        )));
    }
    let kernel = node.ints_attr("kernel_shape").ok_or_else(|| {
        StreamlineError::Execution("AveragePool missing kernel_shape".to_string())
    })?;
    let (kh, kw) = (kernel[0] as usize, kernel[1] as usize);
    let strides = ints_or(node, "strides", vec![1, 1]);
    let pads = ints_or(node, "pads", vec![0, 0, 0, 0]);
    let (sh, sw) = (strides[0] as usize, strides[1] as usize);
    let (pt, pl, pb, pr) = (pads[0] as usize, pads[1] as usize, pads[2] as usize, pads[3] as usize);
    let (n, c, h, wd) = (xs[0] as usize, xs[1] as usize, xs[2] as usize, xs[3] as usize);
    let oh = (h + pt + pb - kh) / sh + 1;
    let ow = (wd + pl + pr - kw) / sw + 1;

    let mut out = vec![0f32; n * c * oh * ow];
    for ni in 0..n {
        for ci in 0..c {
            for ohi in 0..oh {
                for owi in 0..ow {
                    let mut acc = 0f32;
                    let mut count = 0usize;
                    for khi in 0..kh {
                        let hi = (ohi * sh + khi) as isize - pt as isize;
                        if hi < 0 || hi >= h as isize {
                            continue;
                        }
                        for kwi in 0..kw {
                            let wi = (owi * sw + kwi) as isize - pl as isize;
                            if wi < 0 || wi >= wd as isize {
                                continue;
                            }
                            acc += x.data()[((ni * c + ci) * h + hi as usize) * wd + wi as usize];
                            count += 1;
                        }
                    }
                    out[((ni * c + ci) * oh + ohi) * ow + owi] = acc / count.max(1) as f32;
                }
            }
        }
    }
    TensorData::new(vec![n as i64, c as i64, oh as i64, ow as i64], out)
}

fn reshape(x: &TensorData, target: &TensorData) -> Result<TensorData> {
    let requested: Vec<i64> = target.data().iter().map(|&v| v as i64).collect();
    let shape = resolve_reshape(x.shape(), &requested)?;
    x.reshaped(shape)
}

/// Resolve `0` (copy) and `-1` (infer) entries in a reshape target.
pub(crate) fn resolve_reshape(input: &[i64], requested: &[i64]) -> Result<Vec<i64>> {
    let numel: i64 = input.iter().product();
    let mut shape: Vec<i64> = Vec::with_capacity(requested.len());
    let mut infer_at = None;
    for (i, &d) in requested.iter().enumerate() {
        match d {
            0 => shape.push(*input.get(i).ok_or_else(|| {
                StreamlineError::InvalidModel("reshape copy dimension out of range".to_string())
            })?),
            -1 => {
                if infer_at.replace(i).is_some() {
                    return Err(StreamlineError::InvalidModel(
                        "reshape target has more than one -1".to_string(),
                    ));
                }
                shape.push(1);
            }
            d if d > 0 => shape.push(d),
            _ => {
                return Err(StreamlineError::InvalidModel(format!(
                    "invalid reshape dimension {}",
                    d
                )))
            }
        }
    }
    if let Some(i) = infer_at {
        let known: i64 = shape.iter().product();
        if known == 0 || numel % known != 0 {
            return Err(StreamlineError::InvalidModel(format!(
                "cannot infer reshape dimension for {:?} -> {:?}",
                input, requested
            )));
        }
        shape[i] = numel / known;
    }
    if shape.iter().product::<i64>() != numel {
        return Err(StreamlineError::InvalidModel(format!(
            "reshape changes element count: {:?} -> {:?}",
            input, shape
        )));
    }
    Ok(shape)
}

fn transpose(node: &Node, x: &TensorData) -> Result<TensorData> {
    let rank = x.shape().len();
    let perm: Vec<usize> = match node.ints_attr("perm") {
        Some(p) => p.iter().map(|&v| v as usize).collect(),
        None => (0..rank).rev().collect(),
    };
    if perm.len() != rank || perm.iter().any(|&p| p >= rank) {
        return Err(StreamlineError::Execution(format!(
            "Transpose perm {:?} invalid for rank {}",
            perm, rank
        )));
    }
    let out_shape: Vec<i64> = perm.iter().map(|&p| x.shape()[p]).collect();
    let in_strides = TensorData::strides(x.shape());
    let out_strides = TensorData::strides(&out_shape);
    let numel = x.num_elements();
    let mut out = vec![0f32; numel];
    for (flat, slot) in out.iter_mut().enumerate() {
        let mut src = 0usize;
        for d in 0..rank {
            let i = (flat / out_strides[d]) % out_shape[d] as usize;
            src += i * in_strides[perm[d]];
        }
        *slot = x.data()[src];
    }
    TensorData::new(out_shape, out)
}

fn flatten(node: &Node, x: &TensorData) -> Result<TensorData> {
    let axis = node.int_attr("axis").unwrap_or(1);
    let rank = x.shape().len() as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    if !(0..=rank).contains(&axis) {
        return Err(StreamlineError::Execution(format!(
            "Flatten axis {} invalid for rank {}",
            axis, rank
        )));
    }
    let outer: i64 = x.shape()[..axis as usize].iter().product();
    let inner: i64 = x.shape()[axis as usize..].iter().product();
    x.reshaped(vec![outer, inner])
}

fn multi_threshold(node: &Node, x: &TensorData, thresholds: &TensorData) -> Result<TensorData> {
    let ts = thresholds.shape();
    if ts.len() != 2 {
        return Err(StreamlineError::Execution(format!(
            "MultiThreshold expects 2D thresholds, got {:?}",
            ts
        )));
    }
    let (rows, steps) = (ts[0] as usize, ts[1] as usize);
    let out_scale = node.float_attr("out_scale").unwrap_or(1.0);
    let out_bias = node.float_attr("out_bias").unwrap_or(0.0);

    let channel_dim = if x.shape().len() >= 2 { 1 } else { 0 };
    let channels = x.shape()[channel_dim] as usize;
    if rows != 1 && rows != channels {
        return Err(StreamlineError::Execution(format!(
            "MultiThreshold has {} threshold rows for {} channels",
            rows, channels
        )));
    }
    let strides = TensorData::strides(x.shape());
    let data = x
        .data()
        .iter()
        .enumerate()
        .map(|(flat, &v)| {
            let c = (flat / strides[channel_dim]) % channels;
            let row = if rows == 1 { 0 } else { c };
            let count = (0..steps)
                .filter(|&t| v >= thresholds.data()[row * steps + t])
                .count();
            out_scale * count as f32 + out_bias
        })
        .collect();
    TensorData::new(x.shape().to_vec(), data)
}

fn im2col(node: &Node, x: &TensorData) -> Result<TensorData> {
    let xs = x.shape();
    if xs.len() != 4 {
        return Err(StreamlineError::Execution(format!(
            "Im2Col expects 4D channel-last data, got {:?}",
            xs
        )));
    }
    let kernel = node
        .ints_attr("kernel_shape")
        .ok_or_else(|| StreamlineError::Execution("Im2Col missing kernel_shape".to_string()))?;
    let (kh, kw) = (kernel[0] as usize, kernel[1] as usize);
    let strides = ints_or(node, "strides", vec![1, 1]);
    let pads = ints_or(node, "pads", vec![0, 0, 0, 0]);
    let (sh, sw) = (strides[0] as usize, strides[1] as usize);
    let (pt, pl, pb, pr) = (pads[0] as usize, pads[1] as usize, pads[2] as usize, pads[3] as usize);
    let (n, h, wd, c) = (xs[0] as usize, xs[1] as usize, xs[2] as usize, xs[3] as usize);
    let oh = (h + pt + pb - kh) / sh + 1;
    let ow = (wd + pl + pr - kw) / sw + 1;

    let mut out = Vec::with_capacity(n * oh * ow * kh * kw * c);
    for ni in 0..n {
        for ohi in 0..oh {
            for owi in 0..ow {
                for khi in 0..kh {
                    let hi = (ohi * sh + khi) as isize - pt as isize;
                    for kwi in 0..kw {
                        let wi = (owi * sw + kwi) as isize - pl as isize;
                        for ci in 0..c {
                            let v = if hi < 0 || hi >= h as isize || wi < 0 || wi >= wd as isize {
                                0.0
                            } else {
                                x.data()[((ni * h + hi as usize) * wd + wi as usize) * c + ci]
                            };
                            out.push(v);
                        }
                    }
                }
            }
        }
    }
    TensorData::new(
        vec![n as i64, oh as i64, ow as i64, (kh * kw * c) as i64],
        out,
    )
}

fn top_k(node: &Node, inputs: &[&TensorData]) -> Result<Vec<TensorData>> {
    let x = inputs[0];
    let rank = x.shape().len();
    let k = match node.int_attr("k") {
        Some(k) => k,
        None => {
            let kt = inputs.get(1).ok_or_else(|| {
                StreamlineError::Execution("TopK needs a k attribute or input".to_string())
            })?;
            kt.data()[0] as i64
        }
    };
    let axis = node.int_attr("axis").unwrap_or(-1);
    let axis = if axis < 0 { axis + rank as i64 } else { axis } as usize;
    let dim = x.shape()[axis] as usize;
    if k <= 0 || k as usize > dim {
        return Err(StreamlineError::Execution(format!(
            "TopK k={} invalid for axis length {}",
            k, dim
        )));
    }
    if axis != rank - 1 {
        return Err(StreamlineError::Execution(
            "TopK on a non-trailing axis is not supported".to_string(),
        ));
    }
    let k = k as usize;
    let largest = node.int_attr("largest").unwrap_or(1) != 0;

    let mut out_shape = x.shape().to_vec();
    out_shape[axis] = k as i64;
    let strides = TensorData::strides(x.shape());
    let axis_stride = strides[axis];
    let numel = x.num_elements();
    let lanes = numel / dim;

    let mut values = vec![0f32; lanes * k];
    let mut indices = vec![0f32; lanes * k];
    let mut lane = 0usize;
    // Iterate lane base offsets: every flat index whose axis coordinate is 0.
    for flat in 0..numel {
        if (flat / axis_stride) % dim != 0 {
            continue;
        }
        let mut entries: Vec<(usize, f32)> = (0..dim)
            .map(|i| (i, x.data()[flat + i * axis_stride]))
            .collect();
        if largest {
            entries.sort_by_key(|&(i, v)| (std::cmp::Reverse(OrderedFloat(v)), i));
        } else {
            entries.sort_by_key(|&(i, v)| (OrderedFloat(v), i));
        }
        for (slot, &(i, v)) in entries.iter().take(k).enumerate() {
            values[lane * k + slot] = v;
            indices[lane * k + slot] = i as f32;
        }
        lane += 1;
    }

    Ok(vec![
        TensorData::new(out_shape.clone(), values)?,
        TensorData::new(out_shape, indices)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::ops::OpKind;

    fn node(op: OpKind) -> Node {
        Node::new(op)
    }

    #[test]
    fn test_broadcast_binary() {
        let a = TensorData::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = TensorData::scalar(10.0);
        let r = broadcast_binary(&a, &b, |x, y| x * y).unwrap();
        assert_eq!(r.data(), &[10.0, 20.0, 30.0, 40.0]);

        let row = TensorData::new(vec![2], vec![1.0, -1.0]).unwrap();
        let r = broadcast_binary(&a, &row, |x, y| x + y).unwrap();
        assert_eq!(r.data(), &[2.0, 1.0, 4.0, 3.0]);
    }

    #[test]
    fn test_matmul_2d() {
        let a = TensorData::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = TensorData::new(vec![3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let r = matmul(&a, &b).unwrap();
        assert_eq!(r.shape(), &[2, 2]);
        assert_eq!(r.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_conv_identity_kernel() {
        // 1x1 kernel with weight 1.0 reproduces the input
        let x = TensorData::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let w = TensorData::new(vec![1, 1, 1, 1], vec![1.0]).unwrap();
        let r = conv(&node(OpKind::Conv), &x, &w).unwrap();
        assert_eq!(r.shape(), &[1, 1, 2, 2]);
        assert_eq!(r.data(), x.data());
    }

    #[test]
    fn test_conv_depthwise() {
        let mut n = node(OpKind::Conv);
        n.set_attr("group", crate::graph::Attribute::Int(2));
        // two channels, each with its own 1x1 weight
        let x = TensorData::new(vec![1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let w = TensorData::new(vec![2, 1, 1, 1], vec![10.0, 100.0]).unwrap();
        let r = conv(&n, &x, &w).unwrap();
        assert_eq!(r.data(), &[10.0, 20.0, 300.0, 400.0]);
    }

    #[test]
    fn test_average_pool() {
        let mut n = node(OpKind::AveragePool);
        n.set_attr("kernel_shape", crate::graph::Attribute::Ints(vec![2, 2]));
        n.set_attr("strides", crate::graph::Attribute::Ints(vec![2, 2]));
        let x = TensorData::new(vec![1, 1, 2, 2], vec![1.0, 3.0, 5.0, 7.0]).unwrap();
        let r = average_pool(&n, &x).unwrap();
        assert_eq!(r.shape(), &[1, 1, 1, 1]);
        assert_eq!(r.data(), &[4.0]);
    }

    #[test]
    fn test_flatten_default_axis() {
        let x = TensorData::new(vec![2, 2, 3], (0..12).map(|v| v as f32).collect()).unwrap();
        let r = flatten(&node(OpKind::Flatten), &x).unwrap();
        assert_eq!(r.shape(), &[2, 6]);
        assert_eq!(r.data(), x.data());
    }

    #[test]
    fn test_transpose() {
        let x = TensorData::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let r = transpose(&node(OpKind::Transpose), &x).unwrap();
        assert_eq!(r.shape(), &[3, 2]);
        assert_eq!(r.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_multi_threshold() {
        let mut n = node(OpKind::MultiThreshold);
        n.set_attr("out_scale", crate::graph::Attribute::Float(2.0));
        let x = TensorData::new(vec![1, 2], vec![0.5, 3.0]).unwrap();
        // channel 0 thresholds: 1, 2; channel 1 thresholds: 1, 2
        let t = TensorData::new(vec![2, 2], vec![1.0, 2.0, 1.0, 2.0]).unwrap();
        let r = multi_threshold(&n, &x, &t).unwrap();
        // 0.5 crosses none -> 0; 3.0 crosses both -> 2 * scale
        assert_eq!(r.data(), &[0.0, 4.0]);
    }

    #[test]
    fn test_top_k_largest() {
        let mut n = node(OpKind::TopK);
        n.set_attr("k", crate::graph::Attribute::Int(2));
        let x = TensorData::new(vec![1, 4], vec![0.3, 0.9, 0.1, 0.9]).unwrap();
        let outs = top_k(&n, &[&x]).unwrap();
        assert_eq!(outs[0].data(), &[0.9, 0.9]);
        // tie broken toward the lower index
        assert_eq!(outs[1].data(), &[1.0, 3.0]);
    }

    #[test]
    fn test_reshape_with_inference() {
        let x = TensorData::new(vec![2, 6], (0..12).map(|v| v as f32).collect()).unwrap();
        let t = TensorData::new(vec![3], vec![0.0, -1.0, 2.0]).unwrap();
        let r = reshape(&x, &t).unwrap();
        assert_eq!(r.shape(), &[2, 3, 2]);
    }

    #[test]
    fn test_im2col_2x2() {
        // single channel 2x2 input, 2x2 kernel, no pad -> one patch
        let x = TensorData::new(vec![1, 2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut n = node(OpKind::Im2Col);
        n.set_attr("kernel_shape", crate::graph::Attribute::Ints(vec![2, 2]));
        let r = im2col(&n, &x).unwrap();
        assert_eq!(r.shape(), &[1, 1, 1, 4]);
        assert_eq!(r.data(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
