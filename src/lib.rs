//! # quantir
//!
//! Quantized tensor-graph IR and streamlining compiler.
//!
//! This crate rewrites a quantized neural-network computation graph into
//! a semantically equivalent but structurally simplified form for
//! downstream hardware synthesis:
//!
//! - **Graph IR**: [`QuantGraph`] (petgraph-based computation graph with
//!   a name-resolved tensor table)
//! - **Inference passes**: shape, datatype and data-layout propagation
//! - **Rewrite passes**: constant folding, reordering, absorption,
//!   collapsing, identity removal, convolution lowering
//! - **Orchestration**: [`Pipeline`] fixed-point driver and the
//!   [`Streamliner`] facade
//! - **Execution adapter**: the [`Executor`] interface plus a naive
//!   [`ReferenceExecutor`] used for folding and verification
//!
//! Graphs load from and save to the ONNX exchange format; quantization
//! datatypes and layout tags ride along as tensor annotations.

pub mod datatype;
pub mod error;
pub mod exec;
pub mod graph;
pub mod infer;
pub mod layout;
pub mod ops;
pub mod passes;
pub mod pipeline;
pub mod proto;
pub mod tensor;

// Re-exports
pub use datatype::DataType;
pub use error::{Result, StreamlineError};
pub use exec::{Executor, ReferenceExecutor, TensorMap};
pub use graph::{Attribute, GraphStatistics, Node, NodeId, QuantGraph, ValueInfo};
pub use infer::{InferDataLayouts, InferDataTypes, InferShapes};
pub use layout::DataLayout;
pub use ops::OpKind;
pub use passes::{
    AbsorbAddIntoMultiThreshold, AbsorbMulIntoMultiThreshold, AbsorbScalarMulIntoTopK,
    CollapseRepeatedOp, FoldConstants, GiveUniqueNodeNames, LowerConvsToMatMul, MoveMulPastConv,
    Pass, RemoveIdentityOps,
};
pub use pipeline::{
    Pipeline, PipelineReport, PipelineState, StreamlineStats, Streamliner, SweepReport,
};
pub use tensor::TensorData;
