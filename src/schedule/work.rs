use crate::compute::ChunkPlan;
use crate::error::ConformError;
use crate::io::VariableHeader;
use serde_json::Value;
use crate::resolve::ResolvedVariable;
use ndarray::ArrayD;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A variable that passed planning and is ready to evaluate.
#[derive(Debug, Clone)]
pub struct Job {
    pub var: ResolvedVariable,
    pub plan: ChunkPlan,
    pub header: VariableHeader,
}

/// Attribute holding the canonical text of the definition.
pub const PROVENANCE_ATTRIBUTE: &str = "conform_provenance";

impl Job {
    pub fn new(var: ResolvedVariable, plan: ChunkPlan, provenance: bool) -> Self {
        let mut attributes = var.standard.attributes.clone();
        if provenance {
            attributes.insert(PROVENANCE_ATTRIBUTE.to_string(), Value::String(var.expression.to_string()));
        }
        let header = VariableHeader {
            name: var.name.clone(),
            dims: var.root_annotation().map(|a| a.dims.clone()).unwrap_or_else(|| var.standard.signature()),
            unit: var.standard.units.clone(),
            attributes,
            chunk_dimension: if plan.root_streamed() { plan.dimension.clone() } else { None },
        };
        Self { var, plan, header }
    }

    pub fn name(&self) -> &str { &self.var.name }
}

/// Unit of dispatch: a whole variable, or one chunk of a variable whose
/// chunks are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    Whole { job: usize },
    Chunk { job: usize, chunk: usize },
}

impl WorkItem {
    pub fn job(&self) -> usize {
        match *self {
            WorkItem::Whole { job } | WorkItem::Chunk { job, .. } => job,
        }
    }
}

/// Splits jobs into work items. A variable with independent chunks is split
/// once its chunk count reaches `threshold`.
pub fn work_items(jobs: &[Job], threshold: Option<usize>) -> Vec<WorkItem> {
    let mut items = Vec::new();
    for (job, j) in jobs.iter().enumerate() {
        let count = j.plan.chunk_count();
        if j.plan.chunks_independent() && threshold.is_some_and(|t| count >= t) {
            items.extend((0..count).map(|chunk| WorkItem::Chunk { job, chunk }));
        } else {
            items.push(WorkItem::Whole { job });
        }
    }
    items
}

/// Sent from workers to the coordinator.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Chunk { job: usize, index: usize, data: ArrayD<f64> },
    Failed { job: usize, error: ConformError },
    /// The item was not started because the run was cancelled.
    Cancelled { job: usize },
}

/// Shared cancellation switch. Checked before each work item starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}
