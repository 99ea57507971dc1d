//! Housekeeping passes.

use super::Pass;
use crate::graph::QuantGraph;
use crate::Result;

/// Gives every node a unique, stable name of the form `<Op>_<index>`,
/// numbered in topological order. Useful after rewrites that insert
/// unnamed nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct GiveUniqueNodeNames;

impl GiveUniqueNodeNames {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for GiveUniqueNodeNames {
    fn name(&self) -> &str {
        "give_unique_node_names"
    }

    fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
        let order = graph.topological_sort()?;
        let desired: Vec<String> = order
            .iter()
            .enumerate()
            .map(|(i, &id)| format!("{}_{}", graph.node(id).expect("sorted id").op, i))
            .collect();
        let current: Vec<String> = order
            .iter()
            .map(|&id| graph.node(id).expect("sorted id").name.clone())
            .collect();
        if current == desired {
            return Ok(false);
        }
        // Two phases so a desired name currently held by another node
        // never collides mid-rename.
        for (i, &id) in order.iter().enumerate() {
            graph.set_node_name(id, &format!("__renaming_{}", i))?;
        }
        for (i, &id) in order.iter().enumerate() {
            graph.set_node_name(id, &desired[i])?;
        }
        Ok(true)
    }
}
