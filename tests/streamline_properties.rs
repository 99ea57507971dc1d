//! Property tests for the rewrite passes.
//!
//! Every rewrite must preserve the function the graph computes, leave
//! non-matching graphs untouched, and keep the graph well-formed.

mod common;

use common::{assert_allclose, ramp, run_graph};
use quantir::{
    AbsorbMulIntoMultiThreshold, CollapseRepeatedOp, DataType, FoldConstants, InferDataLayouts,
    InferDataTypes, InferShapes, MoveMulPastConv, OpKind, Pass, QuantGraph, RemoveIdentityOps,
    TensorData,
};

/// `Mul(k) -> ConvDW(w)` must become `ConvDW(w * k)` with the multiply
/// removed and identical outputs.
#[test]
fn reorder_scalar_mul_past_depthwise_conv_preserves_outputs() {
    let mut g = QuantGraph::new("dw");
    g.add_graph_input("x", Some(vec![1, 2, 4, 4]), Some(DataType::Float32))
        .unwrap();
    g.set_initializer("k", TensorData::scalar(3.0));
    g.set_initializer(
        "w",
        TensorData::new(vec![2, 1, 3, 3], (0..18).map(|v| v as f32 - 9.0).collect()).unwrap(),
    );
    g.add_op(OpKind::Mul)
        .name("mul0")
        .input("x")
        .input("k")
        .output("t0")
        .finish()
        .unwrap();
    g.add_op(OpKind::Conv)
        .name("conv0")
        .input("t0")
        .input("w")
        .output("y")
        .attr_i("group", 2)
        .attr_is("pads", vec![1, 1, 1, 1])
        .finish()
        .unwrap();
    g.add_graph_output("y");

    let x = ramp(vec![1, 2, 4, 4], 16.0);
    let before = run_graph(&g, &[("x", x.clone())]);

    assert!(MoveMulPastConv::new().run(&mut g).unwrap());
    g.verify().unwrap();
    assert_eq!(g.node_count(), 1);
    assert_eq!(g.statistics().op_counts.get("Mul"), None);
    // integer-valued data: the rescale is exact
    let after = run_graph(&g, &[("x", x)]);
    assert_allclose(&after["y"], &before["y"], 0.0);
}

/// `Mul(2.0) -> Mul(3.0)` must collapse to a single `Mul(6.0)`.
#[test]
fn collapse_mul_chain_yields_combined_constant() {
    let mut g = QuantGraph::new("chain");
    g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Float32))
        .unwrap();
    g.set_initializer("two", TensorData::scalar(2.0));
    g.set_initializer("three", TensorData::scalar(3.0));
    g.add_op(OpKind::Mul)
        .name("mul0")
        .input("x")
        .input("two")
        .output("t0")
        .finish()
        .unwrap();
    g.add_op(OpKind::Mul)
        .name("mul1")
        .input("t0")
        .input("three")
        .output("y")
        .finish()
        .unwrap();
    g.add_graph_output("y");

    let x = ramp(vec![1, 4], 2.0);
    let before = run_graph(&g, &[("x", x.clone())]);

    assert!(CollapseRepeatedOp::mul().run(&mut g).unwrap());
    g.verify().unwrap();
    assert_eq!(g.node_count(), 1);
    assert_eq!(g.get_initializer("three").unwrap().data(), &[6.0]);

    let after = run_graph(&g, &[("x", x)]);
    assert_allclose(&after["y"], &before["y"], 0.0);
}

/// A node whose inputs are all constants folds into a single
/// initializer equal to its evaluation.
#[test]
fn fold_constant_add_produces_sum_initializer() {
    let mut g = QuantGraph::new("fold");
    g.add_graph_input("x", Some(vec![3]), Some(DataType::Float32))
        .unwrap();
    g.set_initializer(
        "constant_a",
        TensorData::new(vec![3], vec![1.0, 2.0, 3.0]).unwrap(),
    );
    g.set_initializer(
        "constant_b",
        TensorData::new(vec![3], vec![10.0, 20.0, 30.0]).unwrap(),
    );
    g.add_op(OpKind::Add)
        .name("const_add")
        .input("constant_a")
        .input("constant_b")
        .output("sum")
        .finish()
        .unwrap();
    g.add_op(OpKind::Add)
        .name("apply")
        .input("x")
        .input("sum")
        .output("y")
        .finish()
        .unwrap();
    g.add_graph_output("y");

    assert!(FoldConstants::new().run(&mut g).unwrap());
    g.verify().unwrap();
    assert_eq!(g.node_count(), 1);
    assert_eq!(
        g.get_initializer("sum").unwrap().data(),
        &[11.0, 22.0, 33.0]
    );
}

/// Numeric preservation through threshold absorption, checked by
/// executing both versions.
#[test]
fn absorb_mul_into_thresholds_preserves_outputs() {
    let mut g = QuantGraph::new("absorb");
    g.add_graph_input("x", Some(vec![1, 2]), Some(DataType::Float32))
        .unwrap();
    g.set_initializer("k", TensorData::scalar(4.0));
    g.set_initializer(
        "thresh",
        TensorData::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 8.0, 12.0]).unwrap(),
    );
    g.add_op(OpKind::Mul)
        .name("mul0")
        .input("x")
        .input("k")
        .output("t0")
        .finish()
        .unwrap();
    g.add_op(OpKind::MultiThreshold)
        .name("mt0")
        .input("t0")
        .input("thresh")
        .output("y")
        .attr_s("out_dtype", "UINT2")
        .finish()
        .unwrap();
    g.add_graph_output("y");

    let x = TensorData::new(vec![1, 2], vec![0.6, 1.1]).unwrap();
    let before = run_graph(&g, &[("x", x.clone())]);

    assert!(AbsorbMulIntoMultiThreshold::new().run(&mut g).unwrap());
    g.verify().unwrap();
    assert_eq!(g.node_count(), 1);
    // integer threshold counts: exact preservation
    let after = run_graph(&g, &[("x", x)]);
    assert_allclose(&after["y"], &before["y"], 0.0);
}

/// Precondition safety: a violated algebraic precondition leaves the
/// graph structurally untouched and reports no change.
#[test]
fn violated_preconditions_leave_graph_unchanged() {
    // negative scalar before thresholds: sign flip breaks the identity
    let mut g = QuantGraph::new("neg");
    g.add_graph_input("x", Some(vec![1, 2]), Some(DataType::Float32))
        .unwrap();
    g.set_initializer("k", TensorData::scalar(-4.0));
    g.set_initializer(
        "thresh",
        TensorData::new(vec![1, 2], vec![1.0, 2.0]).unwrap(),
    );
    g.add_op(OpKind::Mul)
        .name("mul0")
        .input("x")
        .input("k")
        .output("t0")
        .finish()
        .unwrap();
    g.add_op(OpKind::MultiThreshold)
        .name("mt0")
        .input("t0")
        .input("thresh")
        .output("y")
        .finish()
        .unwrap();
    g.add_graph_output("y");

    let before = g.to_proto().unwrap();
    assert!(!AbsorbMulIntoMultiThreshold::new().run(&mut g).unwrap());
    assert_eq!(g.to_proto().unwrap(), before);
}

/// Inference idempotence: a second run of each inference pass reports no
/// change and leaves annotations identical.
#[test]
fn inference_passes_are_idempotent() {
    let mut g = QuantGraph::new("infer");
    g.add_graph_input("x", Some(vec![1, 2, 4, 4]), Some(DataType::Uint { bits: 8 }))
        .unwrap();
    g.set_initializer(
        "w",
        TensorData::new(vec![2, 2, 3, 3], vec![1.0; 36]).unwrap(),
    );
    g.add_op(OpKind::Conv)
        .name("conv0")
        .input("x")
        .input("w")
        .output("c0")
        .attr_is("pads", vec![1, 1, 1, 1])
        .finish()
        .unwrap();
    g.add_op(OpKind::Flatten)
        .name("fl0")
        .input("c0")
        .output("y")
        .finish()
        .unwrap();
    g.add_graph_output("y");

    assert!(InferShapes::new().run(&mut g).unwrap());
    assert!(InferDataTypes::new().run(&mut g).unwrap());
    assert!(InferDataLayouts::new().run(&mut g).unwrap());

    let annotated = g.to_proto().unwrap();
    assert!(!InferShapes::new().run(&mut g).unwrap());
    assert!(!InferDataTypes::new().run(&mut g).unwrap());
    assert!(!InferDataLayouts::new().run(&mut g).unwrap());
    assert_eq!(g.to_proto().unwrap(), annotated);
}

/// Identity removal preserves outputs while shrinking the graph.
#[test]
fn identity_removal_preserves_outputs() {
    let mut g = QuantGraph::new("ident");
    g.add_graph_input("x", Some(vec![2, 3]), Some(DataType::Float32))
        .unwrap();
    g.set_initializer("one", TensorData::scalar(1.0));
    g.set_initializer("k", TensorData::scalar(5.0));
    g.set_initializer(
        "same_shape",
        TensorData::new(vec![2], vec![2.0, 3.0]).unwrap(),
    );
    g.add_op(OpKind::Mul)
        .name("noop_mul")
        .input("x")
        .input("one")
        .output("t0")
        .finish()
        .unwrap();
    g.add_op(OpKind::Reshape)
        .name("noop_reshape")
        .input("t0")
        .input("same_shape")
        .output("t1")
        .finish()
        .unwrap();
    g.add_op(OpKind::Mul)
        .name("scale")
        .input("t1")
        .input("k")
        .output("y")
        .finish()
        .unwrap();
    g.add_graph_output("y");
    InferShapes::new().run(&mut g).unwrap();

    let x = ramp(vec![2, 3], 3.0);
    let before = run_graph(&g, &[("x", x.clone())]);

    assert!(RemoveIdentityOps::new().run(&mut g).unwrap());
    g.verify().unwrap();
    assert_eq!(g.node_count(), 1);
    let after = run_graph(&g, &[("x", x)]);
    assert_allclose(&after["y"], &before["y"], 0.0);
}
