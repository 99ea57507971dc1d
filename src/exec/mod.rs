//! Execution adapter.
//!
//! The core never executes tensor math at scale; it consumes this
//! capability. [`Executor`] is the interface constant folding and the
//! verification harness depend on, [`ReferenceExecutor`] a naive
//! interpreter supplied so both have a backend to run against.

mod reference;

pub use reference::{execute_node, ReferenceExecutor};
pub(crate) use reference::resolve_reshape;

use crate::graph::QuantGraph;
use crate::tensor::TensorData;
use crate::Result;
use std::collections::HashMap;

/// Named tensor bindings passed into and out of an execution.
pub type TensorMap = HashMap<String, TensorData>;

/// Something that can evaluate a graph on concrete inputs.
pub trait Executor {
    /// Execute the graph on the given input bindings and return one
    /// binding per graph output.
    fn execute(&self, graph: &QuantGraph, inputs: &TensorMap) -> Result<TensorMap>;
}
