//! Graph intermediate representation.
//!
//! The node/tensor data structures and their mutation primitives, plus
//! serialization to and from the ONNX exchange format.

mod ir;

pub use ir::{
    Attribute, GraphStatistics, NewOp, Node, NodeId, QuantGraph, ValueInfo,
};
pub(crate) use ir::display_name;
