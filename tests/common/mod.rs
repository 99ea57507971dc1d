//! Shared helpers for the integration suites.

#![allow(dead_code)]

use quantir::{Executor, QuantGraph, ReferenceExecutor, TensorData, TensorMap};

/// Execute `graph` on named input bindings and return the output map.
pub fn run_graph(graph: &QuantGraph, inputs: &[(&str, TensorData)]) -> TensorMap {
    let mut bindings = TensorMap::new();
    for (name, value) in inputs {
        bindings.insert((*name).to_string(), value.clone());
    }
    ReferenceExecutor::new()
        .execute(graph, &bindings)
        .expect("execution should succeed")
}

/// Assert two tensors match in shape and element values within `tol`.
pub fn assert_allclose(actual: &TensorData, expected: &TensorData, tol: f32) {
    assert_eq!(actual.shape(), expected.shape(), "shapes differ");
    for (i, (a, e)) in actual.data().iter().zip(expected.data()).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {}: {} vs {} (tol {})",
            i,
            a,
            e,
            tol
        );
    }
}

/// Deterministic integer-valued test data, centered so activations cross
/// zero.
pub fn ramp(shape: Vec<i64>, offset: f32) -> TensorData {
    let numel: i64 = shape.iter().product();
    let data = (0..numel).map(|v| v as f32 - offset).collect();
    TensorData::new(shape, data).unwrap()
}
