//! Metadata inference passes.
//!
//! Shape, datatype and data-layout propagation over the graph. All three
//! share one contract: annotations only ever move from unresolved to
//! resolved, unknowns propagate instead of failing, and re-running on a
//! fully annotated graph changes nothing.

mod datatypes;
mod layouts;
mod shapes;

pub use datatypes::InferDataTypes;
pub use layouts::InferDataLayouts;
pub use shapes::InferShapes;
