// Quantized-graph intermediate representation.
//
// Graph representation of quantized tensor computations using petgraph
// for analysis and rewriting. Nodes reference tensors by name; the graph
// owns the tensor table and resolves every reference through it, so
// passes can rewire freely without holding structural pointers.

use crate::datatype::DataType;
use crate::layout::DataLayout;
use crate::ops::OpKind;
use crate::proto::{
    attribute_proto::AttributeType, tensor_proto::DataType as ProtoDataType,
    tensor_shape_proto::dimension, tensor_shape_proto::Dimension, type_proto, AttributeProto,
    GraphProto, ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto,
    TensorAnnotation, TensorShapeProto, TypeProto, ValueInfoProto,
};
use crate::tensor::TensorData;
use crate::{Result, StreamlineError};
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use prost::Message as ProstMessage;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

const DTYPE_ANNOTATION_KEY: &str = "quant_dtype";
const LAYOUT_ANNOTATION_KEY: &str = "tensor_layout";

/// A typed attribute value on a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Floats(Vec<f32>),
    String(String),
    Tensor(TensorData),
}

/// An operator instance in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node name, unique within the graph when non-empty.
    pub name: String,
    /// Operator kind.
    pub op: OpKind,
    /// Ordered input tensor names.
    pub inputs: Vec<String>,
    /// Ordered output tensor names.
    pub outputs: Vec<String>,
    /// Operator-specific attributes.
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new(op: OpKind) -> Self {
        Self {
            name: String::new(),
            op,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn ints_attr(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(Attribute::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn float_attr(&self, name: &str) -> Option<f32> {
        match self.attributes.get(name) {
            Some(Attribute::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn string_attr(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name) {
            Some(Attribute::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: Attribute) {
        self.attributes.insert(name.into(), value);
    }
}

/// Per-tensor metadata: shape, quantization datatype and data layout.
///
/// A `None` field means the annotation is unresolved; inference passes
/// only ever move fields from `None` to `Some`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub shape: Option<Vec<i64>>,
    pub dtype: Option<DataType>,
    pub layout: Option<DataLayout>,
}

/// Quantized computation graph.
///
/// Owns all nodes and tensor metadata exclusively. Every mutation leaves
/// the graph well-formed (all references resolve, single producer per
/// tensor, acyclic) or fails with a structural error without mutating.
#[derive(Clone)]
pub struct QuantGraph {
    /// The underlying petgraph structure; edges are data dependencies.
    graph: StableGraph<Node, ()>,

    /// Tensor name to metadata.
    values: FxHashMap<String, ValueInfo>,

    /// Constant tensors owned by the graph.
    initializers: FxHashMap<String, TensorData>,

    /// Tensor name to producing node.
    producers: FxHashMap<String, NodeId>,

    /// Node name to node ID (non-empty names only).
    name_to_id: FxHashMap<String, NodeId>,

    /// Ordered graph input tensor names.
    inputs: Vec<String>,

    /// Ordered graph output tensor names.
    outputs: Vec<String>,

    name: String,
}

impl QuantGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: StableGraph::new(),
            values: FxHashMap::default(),
            initializers: FxHashMap::default(),
            producers: FxHashMap::default(),
            name_to_id: FxHashMap::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id)
    }

    /// Mutable node access, for attribute updates. Input/output rewiring
    /// must go through [`set_node_input`](Self::set_node_input) and
    /// friends so the tensor table stays consistent.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.graph.node_weight_mut(id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Snapshot of all node IDs, safe to hold across mutations.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().collect()
    }

    pub fn graph_inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn graph_outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_graph_input(&self, tensor: &str) -> bool {
        self.inputs.iter().any(|n| n == tensor)
    }

    pub fn is_graph_output(&self, tensor: &str) -> bool {
        self.outputs.iter().any(|n| n == tensor)
    }

    /// Whether `tensor` resolves to anything in the graph.
    pub fn tensor_exists(&self, tensor: &str) -> bool {
        self.is_graph_input(tensor)
            || self.initializers.contains_key(tensor)
            || self.producers.contains_key(tensor)
    }

    pub fn value_info(&self, tensor: &str) -> Option<&ValueInfo> {
        self.values.get(tensor)
    }

    /// Metadata entry for `tensor`, created on first access.
    pub fn ensure_value(&mut self, tensor: &str) -> &mut ValueInfo {
        self.values.entry(tensor.to_string()).or_insert_with(|| ValueInfo {
            name: tensor.to_string(),
            ..Default::default()
        })
    }

    pub fn tensor_shape(&self, tensor: &str) -> Option<Vec<i64>> {
        if let Some(info) = self.values.get(tensor) {
            if info.shape.is_some() {
                return info.shape.clone();
            }
        }
        self.initializers.get(tensor).map(|t| t.shape().to_vec())
    }

    pub fn set_tensor_shape(&mut self, tensor: &str, shape: Vec<i64>) {
        self.ensure_value(tensor).shape = Some(shape);
    }

    pub fn tensor_dtype(&self, tensor: &str) -> Option<DataType> {
        self.values.get(tensor).and_then(|v| v.dtype)
    }

    pub fn set_tensor_dtype(&mut self, tensor: &str, dtype: DataType) {
        self.ensure_value(tensor).dtype = Some(dtype);
    }

    pub fn tensor_layout(&self, tensor: &str) -> Option<DataLayout> {
        self.values.get(tensor).and_then(|v| v.layout)
    }

    pub fn set_tensor_layout(&mut self, tensor: &str, layout: DataLayout) {
        self.ensure_value(tensor).layout = Some(layout);
    }

    pub fn get_initializer(&self, tensor: &str) -> Option<&TensorData> {
        self.initializers.get(tensor)
    }

    pub fn initializer_names(&self) -> Vec<String> {
        self.initializers.keys().cloned().collect()
    }

    /// Install or overwrite a constant tensor. The tensor table entry
    /// picks up the constant's shape.
    pub fn set_initializer(&mut self, tensor: &str, value: TensorData) {
        self.ensure_value(tensor).shape = Some(value.shape().to_vec());
        self.initializers.insert(tensor.to_string(), value);
    }

    /// Drop a constant. Fails if any node still reads it.
    pub fn remove_initializer(&mut self, tensor: &str) -> Result<Option<TensorData>> {
        if !self.consumers(tensor).is_empty() || self.is_graph_output(tensor) {
            return Err(StreamlineError::structural(
                tensor,
                "cannot remove initializer that is still referenced",
            ));
        }
        self.values.remove(tensor);
        Ok(self.initializers.remove(tensor))
    }

    pub fn producer(&self, tensor: &str) -> Option<NodeId> {
        self.producers.get(tensor).copied()
    }

    /// Nodes reading `tensor`, in arbitrary order.
    pub fn consumers(&self, tensor: &str) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&id| self.graph[id].inputs.iter().any(|n| n == tensor))
            .collect()
    }

    /// Register a graph input tensor.
    pub fn add_graph_input(
        &mut self,
        tensor: &str,
        shape: Option<Vec<i64>>,
        dtype: Option<DataType>,
    ) -> Result<()> {
        if self.tensor_exists(tensor) {
            return Err(StreamlineError::structural(
                tensor,
                "graph input name already in use",
            ));
        }
        self.inputs.push(tensor.to_string());
        let info = self.ensure_value(tensor);
        info.shape = shape;
        info.dtype = dtype;
        Ok(())
    }

    /// Mark a tensor as a graph output. Resolution is checked by
    /// [`verify`](Self::verify), not here, so outputs may be declared
    /// before their producer is added.
    pub fn add_graph_output(&mut self, tensor: &str) {
        if !self.is_graph_output(tensor) {
            self.outputs.push(tensor.to_string());
        }
    }

    /// Point a graph output at a different tensor.
    pub fn replace_output(&mut self, old: &str, new: &str) -> Result<()> {
        if !self.tensor_exists(new) {
            return Err(StreamlineError::structural(new, "unknown tensor"));
        }
        match self.outputs.iter_mut().find(|n| n.as_str() == old) {
            Some(slot) => {
                *slot = new.to_string();
                Ok(())
            }
            None => Err(StreamlineError::structural(old, "not a graph output")),
        }
    }

    /// Start building a new operation (builder style).
    pub fn add_op(&mut self, op: OpKind) -> NewOp<'_> {
        NewOp::new(self, op)
    }

    /// Insert a node, keeping the graph well-formed.
    ///
    /// All inputs must already resolve, outputs must be fresh tensor
    /// names, and the insertion must not create a cycle.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let sig = node.op.signature();
        if !sig.inputs.contains(&node.inputs.len()) {
            return Err(StreamlineError::structural(
                display_name(&node),
                format!(
                    "{} expects {:?} inputs, got {}",
                    node.op,
                    sig.inputs,
                    node.inputs.len()
                ),
            ));
        }
        if !sig.outputs.contains(&node.outputs.len()) {
            return Err(StreamlineError::structural(
                display_name(&node),
                format!(
                    "{} expects {:?} outputs, got {}",
                    node.op,
                    sig.outputs,
                    node.outputs.len()
                ),
            ));
        }
        for input in &node.inputs {
            if !self.tensor_exists(input) {
                return Err(StreamlineError::structural(
                    input.clone(),
                    format!("dangling input reference on node '{}'", display_name(&node)),
                ));
            }
        }
        for output in &node.outputs {
            if self.producers.contains_key(output)
                || self.is_graph_input(output)
                || self.initializers.contains_key(output)
            {
                return Err(StreamlineError::structural(
                    output.clone(),
                    "output tensor already has a producer",
                ));
            }
        }
        if !node.name.is_empty() && self.name_to_id.contains_key(&node.name) {
            return Err(StreamlineError::structural(
                node.name.clone(),
                "duplicate node name",
            ));
        }

        let id = self.insert_node_unchecked(node);
        self.rebuild_node_edges(id);

        // Connect to pre-existing consumers of the new outputs (only
        // possible when re-producing a tensor during a rewrite).
        let outputs = self.graph[id].outputs.clone();
        let consumer_ids: Vec<NodeId> = self
            .graph
            .node_indices()
            .filter(|&c| c != id && self.graph[c].inputs.iter().any(|n| outputs.contains(n)))
            .collect();
        for c in consumer_ids {
            self.graph.add_edge(id, c, ());
        }

        if toposort(&self.graph, None).is_err() {
            let node = self.detach_node(id);
            return Err(StreamlineError::structural(
                display_name(&node),
                "insertion would create a cycle",
            ));
        }
        Ok(id)
    }

    /// Remove a node.
    ///
    /// Fails if any of its outputs is still consumed or exported and not
    /// backed by an initializer — removal must never dangle a reference.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let outputs = match self.graph.node_weight(id) {
            Some(n) => n.outputs.clone(),
            None => {
                return Err(StreamlineError::GraphError(format!(
                    "node {:?} not found",
                    id
                )))
            }
        };
        for output in &outputs {
            if self.initializers.contains_key(output) {
                continue;
            }
            let consumed = self
                .graph
                .node_indices()
                .any(|c| c != id && self.graph[c].inputs.iter().any(|n| n == output));
            if consumed || self.is_graph_output(output) {
                return Err(StreamlineError::structural(
                    output.clone(),
                    "removal would dangle a consumed tensor",
                ));
            }
        }
        let node = self.detach_node(id);
        for output in &node.outputs {
            if !self.initializers.contains_key(output) {
                self.values.remove(output);
            }
        }
        Ok(node)
    }

    /// Swap one node for another producing-compatible node.
    ///
    /// The whole graph is re-verified afterwards; on any failure the
    /// original graph is restored untouched.
    pub fn replace_node(&mut self, id: NodeId, new: Node) -> Result<NodeId> {
        if self.graph.node_weight(id).is_none() {
            return Err(StreamlineError::GraphError(format!(
                "node {:?} not found",
                id
            )));
        }
        let snapshot = self.clone();
        self.detach_node(id);
        match self.add_node(new).and_then(|new_id| {
            self.verify()?;
            Ok(new_id)
        }) {
            Ok(new_id) => Ok(new_id),
            Err(err) => {
                *self = snapshot;
                Err(err)
            }
        }
    }

    /// Rewire one input slot of a node to a different tensor.
    pub fn set_node_input(&mut self, id: NodeId, index: usize, tensor: &str) -> Result<()> {
        if !self.tensor_exists(tensor) {
            return Err(StreamlineError::structural(tensor, "unknown tensor"));
        }
        let old = {
            let node = self.graph.node_weight_mut(id).ok_or_else(|| {
                StreamlineError::GraphError(format!("node {:?} not found", id))
            })?;
            if index >= node.inputs.len() {
                return Err(StreamlineError::structural(
                    display_name(node),
                    format!("input index {} out of range", index),
                ));
            }
            std::mem::replace(&mut node.inputs[index], tensor.to_string())
        };
        self.rebuild_node_edges(id);
        if toposort(&self.graph, None).is_err() {
            // Revert: re-point the input and restore the edge set.
            if let Some(node) = self.graph.node_weight_mut(id) {
                node.inputs[index] = old;
            }
            self.rebuild_node_edges(id);
            return Err(StreamlineError::structural(
                tensor,
                "rewiring would create a cycle",
            ));
        }
        Ok(())
    }

    /// Rename a node, keeping the name index consistent.
    pub fn set_node_name(&mut self, id: NodeId, name: &str) -> Result<()> {
        if let Some(&other) = self.name_to_id.get(name) {
            if other != id {
                return Err(StreamlineError::structural(name, "duplicate node name"));
            }
            return Ok(());
        }
        let node = self
            .graph
            .node_weight_mut(id)
            .ok_or_else(|| StreamlineError::GraphError(format!("node {:?} not found", id)))?;
        let old = std::mem::replace(&mut node.name, name.to_string());
        if !old.is_empty() {
            self.name_to_id.remove(&old);
        }
        if !name.is_empty() {
            self.name_to_id.insert(name.to_string(), id);
        }
        Ok(())
    }

    /// Rename a tensor everywhere it is referenced.
    pub fn rename_tensor(&mut self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if !self.tensor_exists(old) && !self.values.contains_key(old) {
            return Err(StreamlineError::structural(old, "unknown tensor"));
        }
        if self.tensor_exists(new) || self.values.contains_key(new) {
            return Err(StreamlineError::structural(new, "tensor name already in use"));
        }
        for node in self.graph.node_weights_mut() {
            for name in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if name == old {
                    *name = new.to_string();
                }
            }
        }
        if let Some(mut info) = self.values.remove(old) {
            info.name = new.to_string();
            self.values.insert(new.to_string(), info);
        }
        if let Some(data) = self.initializers.remove(old) {
            self.initializers.insert(new.to_string(), data);
        }
        if let Some(id) = self.producers.remove(old) {
            self.producers.insert(new.to_string(), id);
        }
        for name in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if name == old {
                *name = new.to_string();
            }
        }
        Ok(())
    }

    /// Fresh tensor name derived from `base`.
    pub fn make_unique_tensor_name(&self, base: &str) -> String {
        if !self.tensor_exists(base) && !self.values.contains_key(base) {
            return base.to_string();
        }
        for i in 0.. {
            let candidate = format!("{}_{}", base, i);
            if !self.tensor_exists(&candidate) && !self.values.contains_key(&candidate) {
                return candidate;
            }
        }
        unreachable!()
    }

    /// Compute a topological ordering of the nodes.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        toposort(&self.graph, None).map_err(|cycle| {
            let subject = self
                .node(cycle.node_id())
                .map(display_name)
                .unwrap_or_else(|| format!("{:?}", cycle.node_id()));
            StreamlineError::structural(subject, "graph contains a cycle")
        })
    }

    /// Check the graph's structural invariants: every reference resolves,
    /// one producer per tensor, unique node names, acyclic, outputs live.
    pub fn verify(&self) -> Result<()> {
        let mut seen_names: FxHashMap<&str, NodeId> = FxHashMap::default();
        for id in self.graph.node_indices() {
            let node = &self.graph[id];
            let sig = node.op.signature();
            if !sig.inputs.contains(&node.inputs.len())
                || !sig.outputs.contains(&node.outputs.len())
            {
                return Err(StreamlineError::structural(
                    display_name(node),
                    format!("arity violates {} signature", node.op),
                ));
            }
            for input in &node.inputs {
                if !self.tensor_exists(input) {
                    return Err(StreamlineError::structural(
                        input.clone(),
                        format!("dangling reference from node '{}'", display_name(node)),
                    ));
                }
            }
            for output in &node.outputs {
                if self.producers.get(output) != Some(&id) {
                    return Err(StreamlineError::structural(
                        output.clone(),
                        "producer table out of sync",
                    ));
                }
            }
            if !node.name.is_empty() {
                if let Some(&first) = seen_names.get(node.name.as_str()) {
                    if first != id {
                        return Err(StreamlineError::structural(
                            node.name.clone(),
                            "duplicate node name",
                        ));
                    }
                }
                seen_names.insert(&node.name, id);
            }
        }
        for output in &self.outputs {
            if !self.tensor_exists(output) {
                return Err(StreamlineError::structural(
                    output.clone(),
                    "graph output does not resolve",
                ));
            }
        }
        self.topological_sort()?;
        Ok(())
    }

    /// Extract a single node plus everything needed to execute it.
    ///
    /// Constant inputs are carried over as initializers, dynamic inputs
    /// become graph inputs; the node's outputs become graph outputs.
    pub fn single_node_subgraph(&self, id: NodeId) -> Result<QuantGraph> {
        let node = self
            .node(id)
            .cloned()
            .ok_or_else(|| StreamlineError::GraphError(format!("node {:?} not found", id)))?;
        let mut sub = QuantGraph::new(format!("{}_single", display_name(&node)));
        for input in &node.inputs {
            if sub.tensor_exists(input) {
                // a tensor fed into more than one slot is carried once
                continue;
            }
            if let Some(data) = self.initializers.get(input) {
                sub.set_initializer(input, data.clone());
            } else {
                sub.add_graph_input(input, self.tensor_shape(input), self.tensor_dtype(input))?;
            }
            if let Some(dtype) = self.tensor_dtype(input) {
                sub.set_tensor_dtype(input, dtype);
            }
        }
        for output in &node.outputs {
            sub.add_graph_output(output);
            if let Some(dtype) = self.tensor_dtype(output) {
                sub.set_tensor_dtype(output, dtype);
            }
        }
        sub.add_node(node)?;
        Ok(sub)
    }

    /// Get graph statistics
    pub fn statistics(&self) -> GraphStatistics {
        let mut op_counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.graph.node_weights() {
            *op_counts.entry(node.op.as_str().to_string()).or_insert(0) += 1;
        }
        GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            num_inputs: self.inputs.len(),
            num_outputs: self.outputs.len(),
            num_initializers: self.initializers.len(),
            op_counts,
        }
    }

    // ------------------------------------------------------------------
    // Internal plumbing
    // ------------------------------------------------------------------

    /// Insert without invariant checks; callers re-validate.
    fn insert_node_unchecked(&mut self, node: Node) -> NodeId {
        let id = self.graph.add_node(node);
        let node = &self.graph[id];
        for output in node.outputs.clone() {
            self.producers.insert(output, id);
        }
        if !self.graph[id].name.is_empty() {
            let name = self.graph[id].name.clone();
            self.name_to_id.insert(name, id);
        }
        id
    }

    /// Remove a node from the petgraph and side tables without dangling
    /// checks. Used inside staged rewrites that restore well-formedness
    /// before returning.
    fn detach_node(&mut self, id: NodeId) -> Node {
        let node = self.graph.remove_node(id).expect("node must exist");
        for output in &node.outputs {
            if self.producers.get(output) == Some(&id) {
                self.producers.remove(output);
            }
        }
        if !node.name.is_empty() && self.name_to_id.get(&node.name) == Some(&id) {
            self.name_to_id.remove(&node.name);
        }
        node
    }

    /// Recompute the incoming edges of `id` from its input names.
    fn rebuild_node_edges(&mut self, id: NodeId) {
        let incoming: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for edge in incoming {
            self.graph.remove_edge(edge);
        }
        let inputs = self.graph[id].inputs.clone();
        for input in inputs {
            if let Some(&src) = self.producers.get(&input) {
                if src != id {
                    self.graph.add_edge(src, id, ());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Build a graph from the exchange-format model.
    pub fn from_proto(model: &ModelProto) -> Result<Self> {
        let proto = model
            .graph
            .as_ref()
            .ok_or_else(|| StreamlineError::InvalidModel("model has no graph".to_string()))?;
        let mut graph = QuantGraph::new(proto.name.clone());

        for init in &proto.initializer {
            graph.set_initializer(&init.name, TensorData::from_proto(init)?);
        }
        for vi in &proto.input {
            if graph.initializers.contains_key(&vi.name) {
                continue;
            }
            let (shape, dtype) = parse_type(vi.r#type.as_ref());
            graph.add_graph_input(&vi.name, shape, dtype)?;
        }
        for vi in proto.value_info.iter().chain(proto.output.iter()) {
            let (shape, dtype) = parse_type(vi.r#type.as_ref());
            let info = graph.ensure_value(&vi.name);
            if info.shape.is_none() {
                info.shape = shape;
            }
            if info.dtype.is_none() {
                info.dtype = dtype;
            }
        }
        for annotation in &proto.quantization_annotation {
            for entry in &annotation.quant_parameter_tensor_names {
                match entry.key.as_str() {
                    DTYPE_ANNOTATION_KEY => {
                        if let Some(dtype) = DataType::from_name(&entry.value) {
                            graph.ensure_value(&annotation.tensor_name).dtype = Some(dtype);
                        }
                    }
                    LAYOUT_ANNOTATION_KEY => {
                        if let Some(layout) = DataLayout::from_name(&entry.value) {
                            graph.ensure_value(&annotation.tensor_name).layout = Some(layout);
                        }
                    }
                    _ => {}
                }
            }
        }
        for node_proto in &proto.node {
            let op = OpKind::from_str(&node_proto.op_type)
                .ok_or_else(|| StreamlineError::UnsupportedOp(node_proto.op_type.clone()))?;
            let mut node = Node::new(op);
            node.name = node_proto.name.clone();
            node.inputs = node_proto.input.clone();
            node.outputs = node_proto.output.clone();
            for attr in &node_proto.attribute {
                node.attributes
                    .insert(attr.name.clone(), attribute_from_proto(attr)?);
            }
            // Edges are rebuilt after all nodes exist; node lists need
            // not be topologically sorted on disk.
            graph.insert_node_unchecked(node);
        }
        for id in graph.node_ids() {
            graph.rebuild_node_edges(id);
        }
        for vi in &proto.output {
            graph.add_graph_output(&vi.name);
        }
        graph.verify()?;
        Ok(graph)
    }

    /// Serialize to the exchange-format model.
    pub fn to_proto(&self) -> Result<ModelProto> {
        let mut proto = GraphProto {
            name: self.name.clone(),
            ..Default::default()
        };

        for id in self.topological_sort()? {
            let node = &self.graph[id];
            proto.node.push(NodeProto {
                input: node.inputs.clone(),
                output: node.outputs.clone(),
                name: node.name.clone(),
                op_type: node.op.as_str().to_string(),
                domain: node.op.domain().to_string(),
                attribute: node
                    .attributes
                    .iter()
                    .map(|(name, value)| attribute_to_proto(name, value))
                    .collect(),
                ..Default::default()
            });
        }

        let mut init_names: Vec<&String> = self.initializers.keys().collect();
        init_names.sort();
        for name in init_names {
            proto.initializer.push(self.initializers[name].to_proto(name));
        }

        for input in &self.inputs {
            proto.input.push(self.value_info_proto(input));
        }
        for output in &self.outputs {
            proto.output.push(self.value_info_proto(output));
        }
        let mut value_names: Vec<&String> = self
            .values
            .keys()
            .filter(|n| {
                !self.is_graph_input(n)
                    && !self.is_graph_output(n)
                    && !self.initializers.contains_key(*n)
            })
            .collect();
        value_names.sort();
        for name in value_names {
            proto.value_info.push(self.value_info_proto(name));
        }

        let mut annotated: Vec<&ValueInfo> = self
            .values
            .values()
            .filter(|v| v.dtype.is_some() || v.layout.is_some())
            .collect();
        annotated.sort_by(|a, b| a.name.cmp(&b.name));
        for info in annotated {
            let mut entries = Vec::new();
            if let Some(dtype) = info.dtype {
                entries.push(StringStringEntryProto {
                    key: DTYPE_ANNOTATION_KEY.to_string(),
                    value: dtype.name(),
                });
            }
            if let Some(layout) = info.layout {
                entries.push(StringStringEntryProto {
                    key: LAYOUT_ANNOTATION_KEY.to_string(),
                    value: layout.name().to_string(),
                });
            }
            proto.quantization_annotation.push(TensorAnnotation {
                tensor_name: info.name.clone(),
                quant_parameter_tensor_names: entries,
            });
        }

        Ok(ModelProto {
            ir_version: 8,
            producer_name: "quantir".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(proto),
            opset_import: vec![
                OperatorSetIdProto {
                    domain: String::new(),
                    version: 13,
                },
                OperatorSetIdProto {
                    domain: crate::ops::CUSTOM_DOMAIN.to_string(),
                    version: i64::from(crate::ops::OPSET_VERSION),
                },
            ],
            ..Default::default()
        })
    }

    /// Load a model file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let model = ModelProto::decode(&bytes[..])?;
        Self::from_proto(&model)
    }

    /// Save as a model file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let model = self.to_proto()?;
        std::fs::write(path, model.encode_to_vec())?;
        Ok(())
    }

    fn value_info_proto(&self, tensor: &str) -> ValueInfoProto {
        let shape = self.tensor_shape(tensor);
        let dtype = self.tensor_dtype(tensor);
        ValueInfoProto {
            name: tensor.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: proto_elem_type(dtype) as i32,
                    shape: shape.map(|dims| TensorShapeProto {
                        dim: dims
                            .into_iter()
                            .map(|d| Dimension {
                                value: Some(dimension::Value::DimValue(d)),
                                denotation: String::new(),
                            })
                            .collect(),
                    }),
                })),
                denotation: String::new(),
            }),
            doc_string: String::new(),
        }
    }
}

pub(crate) fn display_name(node: &Node) -> String {
    if node.name.is_empty() {
        format!("<unnamed {}>", node.op)
    } else {
        node.name.clone()
    }
}

fn parse_type(type_proto: Option<&TypeProto>) -> (Option<Vec<i64>>, Option<DataType>) {
    let Some(TypeProto {
        value: Some(type_proto::Value::TensorType(tensor)),
        ..
    }) = type_proto
    else {
        return (None, None);
    };
    let dtype = match ProtoDataType::try_from(tensor.elem_type) {
        Ok(ProtoDataType::Float) => Some(DataType::Float32),
        Ok(ProtoDataType::Int64) => Some(DataType::Int { bits: 64 }),
        Ok(ProtoDataType::Int32) => Some(DataType::Int { bits: 32 }),
        Ok(ProtoDataType::Int8) => Some(DataType::Int { bits: 8 }),
        Ok(ProtoDataType::Uint8) => Some(DataType::Uint { bits: 8 }),
        _ => None,
    };
    let shape = tensor.shape.as_ref().and_then(|s| {
        s.dim
            .iter()
            .map(|d| match &d.value {
                Some(dimension::Value::DimValue(v)) if *v >= 0 => Some(*v),
                _ => None,
            })
            .collect::<Option<Vec<i64>>>()
    });
    (shape, dtype)
}

fn proto_elem_type(dtype: Option<DataType>) -> ProtoDataType {
    // Quantized values travel in float containers; the precise datatype
    // lives in the quantization annotation.
    match dtype {
        Some(DataType::Int { bits: 64 }) => ProtoDataType::Int64,
        _ => ProtoDataType::Float,
    }
}

fn attribute_from_proto(attr: &AttributeProto) -> Result<Attribute> {
    match AttributeType::try_from(attr.r#type) {
        Ok(AttributeType::Int) => Ok(Attribute::Int(attr.i)),
        Ok(AttributeType::Ints) => Ok(Attribute::Ints(attr.ints.clone())),
        Ok(AttributeType::Float) => Ok(Attribute::Float(attr.f)),
        Ok(AttributeType::Floats) => Ok(Attribute::Floats(attr.floats.clone())),
        Ok(AttributeType::String) => Ok(Attribute::String(
            String::from_utf8_lossy(&attr.s).into_owned(),
        )),
        Ok(AttributeType::Tensor) => {
            let t = attr.t.as_ref().ok_or_else(|| {
                StreamlineError::InvalidModel(format!("attribute '{}' missing tensor", attr.name))
            })?;
            Ok(Attribute::Tensor(TensorData::from_proto(t)?))
        }
        _ => Err(StreamlineError::InvalidModel(format!(
            "attribute '{}' has unsupported type {}",
            attr.name, attr.r#type
        ))),
    }
}

fn attribute_to_proto(name: &str, value: &Attribute) -> AttributeProto {
    let mut proto = AttributeProto {
        name: name.to_string(),
        ..Default::default()
    };
    match value {
        Attribute::Int(v) => {
            proto.r#type = AttributeType::Int as i32;
            proto.i = *v;
        }
        Attribute::Ints(v) => {
            proto.r#type = AttributeType::Ints as i32;
            proto.ints = v.clone();
        }
        Attribute::Float(v) => {
            proto.r#type = AttributeType::Float as i32;
            proto.f = *v;
        }
        Attribute::Floats(v) => {
            proto.r#type = AttributeType::Floats as i32;
            proto.floats = v.clone();
        }
        Attribute::String(v) => {
            proto.r#type = AttributeType::String as i32;
            proto.s = v.as_bytes().to_vec();
        }
        Attribute::Tensor(v) => {
            proto.r#type = AttributeType::Tensor as i32;
            proto.t = Some(v.to_proto(""));
        }
    }
    proto
}

/// Builder for adding operations to the graph
pub struct NewOp<'a> {
    graph: &'a mut QuantGraph,
    node: Node,
}

impl<'a> NewOp<'a> {
    fn new(graph: &'a mut QuantGraph, op: OpKind) -> Self {
        Self {
            graph,
            node: Node::new(op),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node.name = name.into();
        self
    }

    pub fn input(mut self, tensor: impl Into<String>) -> Self {
        self.node.inputs.push(tensor.into());
        self
    }

    pub fn output(mut self, tensor: impl Into<String>) -> Self {
        self.node.outputs.push(tensor.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: Attribute) -> Self {
        self.node.attributes.insert(name.into(), value);
        self
    }

    pub fn attr_i(self, name: impl Into<String>, value: i64) -> Self {
        self.attr(name, Attribute::Int(value))
    }

    pub fn attr_is(self, name: impl Into<String>, value: Vec<i64>) -> Self {
        self.attr(name, Attribute::Ints(value))
    }

    pub fn attr_f(self, name: impl Into<String>, value: f32) -> Self {
        self.attr(name, Attribute::Float(value))
    }

    pub fn attr_s(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attr(name, Attribute::String(value.into()))
    }

    /// Finish building and add to graph
    pub fn finish(self) -> Result<NodeId> {
        self.graph.add_node(self.node)
    }
}

/// Graph statistics
#[derive(Debug, Clone)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub num_initializers: usize,
    pub op_counts: BTreeMap<String, usize>,
}

impl fmt::Display for GraphStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph statistics:")?;
        writeln!(f, "  Total nodes: {}", self.total_nodes)?;
        writeln!(f, "  Total edges: {}", self.total_edges)?;
        writeln!(f, "  Graph inputs: {}", self.num_inputs)?;
        writeln!(f, "  Graph outputs: {}", self.num_outputs)?;
        writeln!(f, "  Initializers: {}", self.num_initializers)?;
        writeln!(f, "  Operation kinds:")?;
        for (op, count) in &self.op_counts {
            writeln!(f, "    {}: {}", op, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpKind;

    fn two_mul_chain() -> QuantGraph {
        let mut g = QuantGraph::new("chain");
        g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer("a", TensorData::scalar(2.0));
        g.set_initializer("b", TensorData::scalar(3.0));
        g.add_op(OpKind::Mul)
            .name("mul0")
            .input("x")
            .input("a")
            .output("t0")
            .finish()
            .unwrap();
        g.add_op(OpKind::Mul)
            .name("mul1")
            .input("t0")
            .input("b")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");
        g
    }

    #[test]
    fn test_builder_and_verify() {
        let g = two_mul_chain();
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.statistics().total_edges, 1);
        g.verify().unwrap();
    }

    #[test]
    fn test_dangling_input_rejected() {
        let mut g = QuantGraph::new("t");
        let err = g
            .add_op(OpKind::Mul)
            .input("nope")
            .input("nope2")
            .output("y")
            .finish()
            .unwrap_err();
        assert!(matches!(err, StreamlineError::Structural { .. }));
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let mut g = two_mul_chain();
        let err = g
            .add_op(OpKind::Mul)
            .input("x")
            .input("a")
            .output("y")
            .finish()
            .unwrap_err();
        assert!(matches!(err, StreamlineError::Structural { .. }));
    }

    #[test]
    fn test_remove_guard() {
        let mut g = two_mul_chain();
        let mul0 = g.node_by_name("mul0").unwrap();
        // t0 is still consumed by mul1
        assert!(g.remove_node(mul0).is_err());
        let mul1 = g.node_by_name("mul1").unwrap();
        // y is a graph output
        assert!(g.remove_node(mul1).is_err());
        // folding t0 into an initializer makes mul0 removable
        g.set_initializer("t0", TensorData::new(vec![1, 4], vec![2.0; 4]).unwrap());
        g.remove_node(mul0).unwrap();
        g.verify().unwrap();
    }

    #[test]
    fn test_set_node_input_rewires() {
        let mut g = two_mul_chain();
        let mul1 = g.node_by_name("mul1").unwrap();
        g.set_node_input(mul1, 0, "x").unwrap();
        // t0 now unconsumed, mul0 removable
        let mul0 = g.node_by_name("mul0").unwrap();
        g.remove_node(mul0).unwrap();
        g.verify().unwrap();
        assert_eq!(g.statistics().total_edges, 0);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut g = two_mul_chain();
        let mul0 = g.node_by_name("mul0").unwrap();
        let err = g.set_node_input(mul0, 0, "y").unwrap_err();
        assert!(matches!(err, StreamlineError::Structural { .. }));
        // graph restored
        g.verify().unwrap();
        assert_eq!(g.node(mul0).unwrap().inputs[0], "x");
    }

    #[test]
    fn test_rename_tensor() {
        let mut g = two_mul_chain();
        g.rename_tensor("t0", "hidden").unwrap();
        g.verify().unwrap();
        let mul1 = g.node_by_name("mul1").unwrap();
        assert_eq!(g.node(mul1).unwrap().inputs[0], "hidden");
        assert!(g.rename_tensor("hidden", "y").is_err());
    }

    #[test]
    fn test_replace_node() {
        let mut g = two_mul_chain();
        let mul1 = g.node_by_name("mul1").unwrap();
        let mut new = Node::new(OpKind::Add);
        new.name = "add1".to_string();
        new.inputs = vec!["t0".to_string(), "b".to_string()];
        new.outputs = vec!["y".to_string()];
        g.replace_node(mul1, new).unwrap();
        g.verify().unwrap();
        let id = g.node_by_name("add1").unwrap();
        assert_eq!(g.node(id).unwrap().op, OpKind::Add);
    }

    #[test]
    fn test_single_node_subgraph() {
        let g = two_mul_chain();
        let mul0 = g.node_by_name("mul0").unwrap();
        let sub = g.single_node_subgraph(mul0).unwrap();
        sub.verify().unwrap();
        assert_eq!(sub.node_count(), 1);
        assert_eq!(sub.graph_inputs(), &["x".to_string()]);
        assert_eq!(sub.graph_outputs(), &["t0".to_string()]);
        assert!(sub.get_initializer("a").is_some());
    }

    #[test]
    fn test_proto_round_trip() {
        let mut g = two_mul_chain();
        g.set_tensor_dtype("x", DataType::Int { bits: 4 });
        g.set_tensor_layout("x", DataLayout::Nc);
        let model = g.to_proto().unwrap();
        let back = QuantGraph::from_proto(&model).unwrap();
        back.verify().unwrap();
        assert_eq!(back.node_count(), 2);
        assert_eq!(back.tensor_dtype("x"), Some(DataType::Int { bits: 4 }));
        assert_eq!(back.tensor_layout("x"), Some(DataLayout::Nc));
        assert_eq!(back.get_initializer("a").unwrap().data(), &[2.0]);
        assert_eq!(back.graph_outputs(), &["y".to_string()]);
    }
}
