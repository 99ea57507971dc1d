//! Pipeline orchestration.
//!
//! # Architecture
//!
//! ```text
//! model bytes
//!     ↓
//! 1. Load → QuantGraph (petgraph structure)
//!     ↓
//! 2. Prepare → unique names, shape/datatype/layout inference, constant folding
//!     ↓
//! 3. Streamline → reorder/absorb/collapse/remove to a fixed point
//!     ↓
//! 4. Lower → convolutions to matrix multiplies
//!     ↓
//! 5. Save → streamlined model bytes
//! ```
//!
//! The [`Pipeline`] state machine owns the fixed-point loop; the
//! [`Streamliner`] facade wires the standard pass schedule through it.

use crate::graph::QuantGraph;
use crate::infer::{InferDataLayouts, InferDataTypes, InferShapes};
use crate::passes::{
    AbsorbAddIntoMultiThreshold, AbsorbMulIntoMultiThreshold, AbsorbScalarMulIntoTopK,
    CollapseRepeatedOp, FoldConstants, GiveUniqueNodeNames, LowerConvsToMatMul, MoveMulPastConv,
    Pass, RemoveIdentityOps,
};
use crate::{Result, StreamlineError};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Running,
    Converged,
    Failed,
}

/// Change flag reported by one pass application.
#[derive(Debug, Clone, Serialize)]
pub struct PassOutcome {
    pub pass: String,
    pub changed: bool,
}

/// Outcome of one full sweep over the pass list.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub iteration: usize,
    pub outcomes: Vec<PassOutcome>,
}

impl SweepReport {
    pub fn changed(&self) -> bool {
        self.outcomes.iter().any(|o| o.changed)
    }
}

/// Full record of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub sweeps: Vec<SweepReport>,
    pub converged: bool,
}

impl PipelineReport {
    pub fn iterations(&self) -> usize {
        self.sweeps.len()
    }
}

/// Apply one pass atomically: on error the graph is rolled back to the
/// held-aside copy, so a failed match never leaves partial mutations.
pub fn apply(graph: &mut QuantGraph, pass: &dyn Pass) -> Result<bool> {
    let snapshot = graph.clone();
    match pass.run(graph) {
        Ok(changed) => {
            tracing::debug!(pass = pass.name(), changed, "pass applied");
            Ok(changed)
        }
        Err(err) => {
            *graph = snapshot;
            Err(err)
        }
    }
}

/// Fixed-point pass orchestrator.
///
/// Sweeps an ordered pass list until no pass reports a change
/// (Converged) or the iteration bound is exhausted (Failed, surfaced as
/// [`StreamlineError::NonConvergence`] rather than silently accepted).
/// The graph's invariants are re-validated after every sweep.
pub struct Pipeline {
    max_iterations: usize,
    validate: bool,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            validate: true,
            state: PipelineState::Idle,
        }
    }

    /// Disable per-sweep invariant validation.
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn run(
        &mut self,
        graph: &mut QuantGraph,
        passes: &[Box<dyn Pass>],
    ) -> Result<PipelineReport> {
        self.state = PipelineState::Running;
        let mut sweeps = Vec::new();
        for iteration in 0..self.max_iterations {
            let mut outcomes = Vec::with_capacity(passes.len());
            for pass in passes {
                let changed = match apply(graph, pass.as_ref()) {
                    Ok(changed) => changed,
                    Err(err) => {
                        self.state = PipelineState::Failed;
                        return Err(err);
                    }
                };
                outcomes.push(PassOutcome {
                    pass: pass.name().to_string(),
                    changed,
                });
            }
            if self.validate {
                if let Err(err) = graph.verify() {
                    self.state = PipelineState::Failed;
                    return Err(err);
                }
            }
            let sweep = SweepReport {
                iteration,
                outcomes,
            };
            let changed = sweep.changed();
            sweeps.push(sweep);
            if !changed {
                self.state = PipelineState::Converged;
                return Ok(PipelineReport {
                    sweeps,
                    converged: true,
                });
            }
        }
        self.state = PipelineState::Failed;
        Err(StreamlineError::NonConvergence {
            iterations: self.max_iterations,
            max_iterations: self.max_iterations,
        })
    }
}

/// High-level streamlining driver.
///
/// Runs the standard schedule: prepare (names, inference, constant
/// folding), streamline to a fixed point (reorder, absorb, collapse,
/// remove, fold), then lower convolutions and refresh annotations.
///
/// # Example
///
/// ```no_run
/// use quantir::Streamliner;
///
/// let streamliner = Streamliner::new()
///     .with_max_iterations(32)
///     .with_verbose(true);
///
/// streamliner.streamline_file("model.onnx", "model_streamlined.onnx")?;
/// # Ok::<(), quantir::StreamlineError>(())
/// ```
pub struct Streamliner {
    max_iterations: usize,
    verbose: bool,
    validate: bool,
}

impl Streamliner {
    pub fn new() -> Self {
        Self {
            max_iterations: 32,
            verbose: false,
            validate: true,
        }
    }

    /// Bound on full sweeps of the streamlining pass list.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Enable stage summaries on stdout.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Disable per-sweep invariant validation.
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Load, streamline and save a model file.
    pub fn streamline_file(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<StreamlineStats> {
        let mut graph = QuantGraph::load(input_path)?;
        let stats = self.run(&mut graph)?;
        graph.save(output_path)?;
        Ok(stats)
    }

    /// Streamline a graph in place.
    pub fn run(&self, graph: &mut QuantGraph) -> Result<StreamlineStats> {
        let start = Instant::now();
        let original_nodes = graph.node_count();

        if self.verbose {
            println!("\n┌─────────────────────────────────────────────┐");
            println!("│ Quantized Graph Streamliner                 │");
            println!("└─────────────────────────────────────────────┘\n");
            println!("📂 Stage 1: Preparing graph...");
        }

        let prepare: Vec<Box<dyn Pass>> = vec![
            Box::new(GiveUniqueNodeNames::new()),
            Box::new(InferShapes::new()),
            Box::new(InferDataTypes::new()),
            Box::new(InferDataLayouts::new()),
            Box::new(FoldConstants::new()),
        ];
        for pass in &prepare {
            apply(graph, pass.as_ref())?;
        }
        graph.verify()?;

        if self.verbose {
            println!("   ✓ {} nodes after preparation", graph.node_count());
            println!("\n🔧 Stage 2: Streamlining to a fixed point...");
        }

        let streamline: Vec<Box<dyn Pass>> = vec![
            Box::new(MoveMulPastConv::new()),
            Box::new(AbsorbAddIntoMultiThreshold::new()),
            Box::new(AbsorbMulIntoMultiThreshold::new()),
            Box::new(AbsorbScalarMulIntoTopK::new()),
            Box::new(CollapseRepeatedOp::mul()),
            Box::new(CollapseRepeatedOp::add()),
            Box::new(RemoveIdentityOps::new()),
            Box::new(FoldConstants::new()),
            Box::new(InferShapes::new()),
            Box::new(InferDataTypes::new()),
        ];
        let mut pipeline = Pipeline::new(self.max_iterations).with_validate(self.validate);
        let report = pipeline.run(graph, &streamline)?;

        if self.verbose {
            println!(
                "   ✓ Converged after {} sweep(s), {} nodes remain",
                report.iterations(),
                graph.node_count()
            );
            println!("\n⚙️  Stage 3: Lowering convolutions...");
        }

        let lower: Vec<Box<dyn Pass>> = vec![
            Box::new(LowerConvsToMatMul::new()),
            Box::new(InferShapes::new()),
            Box::new(InferDataTypes::new()),
            Box::new(InferDataLayouts::new()),
            Box::new(GiveUniqueNodeNames::new()),
        ];
        for pass in &lower {
            apply(graph, pass.as_ref())?;
        }
        graph.verify()?;

        let stats = StreamlineStats {
            original_nodes,
            final_nodes: graph.node_count(),
            sweeps: report.iterations(),
            duration: start.elapsed(),
        };

        if self.verbose {
            println!("\n✅ Streamlining complete!");
            println!(
                "   {} → {} nodes in {:?}",
                stats.original_nodes, stats.final_nodes, stats.duration
            );
        }
        Ok(stats)
    }
}

impl Default for Streamliner {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one streamlining run.
#[derive(Debug, Clone, Serialize)]
pub struct StreamlineStats {
    /// Node count before any pass ran.
    pub original_nodes: usize,

    /// Node count in the final graph.
    pub final_nodes: usize,

    /// Sweeps the fixed-point stage needed to converge.
    pub sweeps: usize,

    /// Total wall-clock time.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;
    use crate::ops::OpKind;
    use crate::tensor::TensorData;

    fn mul_chain() -> QuantGraph {
        let mut g = QuantGraph::new("t");
        g.add_graph_input("x", Some(vec![1, 4]), Some(DataType::Float32))
            .unwrap();
        g.set_initializer("a", TensorData::scalar(2.0));
        g.set_initializer("b", TensorData::scalar(3.0));
        g.add_op(OpKind::Mul)
            .name("m0")
            .input("x")
            .input("a")
            .output("t0")
            .finish()
            .unwrap();
        g.add_op(OpKind::Mul)
            .name("m1")
            .input("t0")
            .input("b")
            .output("y")
            .finish()
            .unwrap();
        g.add_graph_output("y");
        g
    }

    #[test]
    fn test_pipeline_converges() {
        let mut g = mul_chain();
        let passes: Vec<Box<dyn Pass>> = vec![
            Box::new(CollapseRepeatedOp::mul()),
            Box::new(RemoveIdentityOps::new()),
        ];
        let mut pipeline = Pipeline::new(10);
        let report = pipeline.run(&mut g, &passes).unwrap();
        assert!(report.converged);
        assert_eq!(pipeline.state(), PipelineState::Converged);
        // sweep 1 collapses, sweep 2 observes the fixed point
        assert_eq!(report.iterations(), 2);
        assert!(report.sweeps[0].changed());
        assert!(!report.sweeps[1].changed());
        assert_eq!(g.node_count(), 1);
    }

    struct AlwaysChanges;

    impl Pass for AlwaysChanges {
        fn name(&self) -> &str {
            "always_changes"
        }

        fn run(&self, _graph: &mut QuantGraph) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_non_convergence_reported() {
        let mut g = mul_chain();
        let passes: Vec<Box<dyn Pass>> = vec![Box::new(AlwaysChanges)];
        let mut pipeline = Pipeline::new(3);
        let err = pipeline.run(&mut g, &passes).unwrap_err();
        assert!(matches!(
            err,
            StreamlineError::NonConvergence { iterations: 3, .. }
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    struct MutatesThenFails;

    impl Pass for MutatesThenFails {
        fn name(&self) -> &str {
            "mutates_then_fails"
        }

        fn run(&self, graph: &mut QuantGraph) -> Result<bool> {
            graph.set_initializer("junk", TensorData::scalar(1.0));
            Err(StreamlineError::Execution("boom".to_string()))
        }
    }

    #[test]
    fn test_failed_pass_rolls_back() {
        let mut g = mul_chain();
        assert!(apply(&mut g, &MutatesThenFails).is_err());
        // the partial mutation was rolled back
        assert!(g.get_initializer("junk").is_none());
        g.verify().unwrap();
    }

    #[test]
    fn test_streamliner_collapses_chain() {
        let mut g = mul_chain();
        let stats = Streamliner::new().run(&mut g).unwrap();
        assert_eq!(stats.original_nodes, 2);
        assert_eq!(stats.final_nodes, 1);
        g.verify().unwrap();
    }

    #[test]
    fn test_report_serializes() {
        let mut g = mul_chain();
        let passes: Vec<Box<dyn Pass>> = vec![Box::new(CollapseRepeatedOp::mul())];
        let report = Pipeline::new(10).run(&mut g, &passes).unwrap();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("collapse_repeated_mul"));
    }
}
