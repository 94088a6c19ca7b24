//! Chunked, multi-pass evaluation of one resolved variable.
use super::ledger::ChunkLedger;
use super::plan::ChunkPlan;
use crate::analysis::units::UnitConverter;
use crate::error::ConformError;
use crate::functions::{Accumulator, Kernel, ScanState};
use crate::io::{ChunkBounds, InputSource};
use crate::resolve::ResolvedVariable;
use crate::store::{option_text, Annotation, CallOptions, DimensionSignature, NodeId, NodeKind, Operation};
use ndarray::{arr0, ArrayD, Axis, CowArray, IxDyn};
use tracing::{debug, trace};

/// Which streamed nodes run in one pass, and what they feed.
struct PassSchedule {
    /// Streamed nodes evaluated for every chunk, parents first.
    steps: Vec<NodeId>,
    /// Reductions along the chunk dimension finalized at the end of the pass.
    sinks: Vec<NodeId>,
    emit_root: bool,
    uses: Vec<usize>,
}

struct RunState {
    /// Values that do not depend on the chunk, computed once.
    settled: Vec<Option<ArrayD<f64>>>,
    scans: Vec<Option<Box<dyn ScanState>>>,
}

impl RunState {
    fn new(n: usize) -> Self {
        Self { settled: vec![None; n], scans: (0..n).map(|_| None).collect() }
    }
}

pub struct Engine<'a> {
    var: &'a ResolvedVariable,
    plan: &'a ChunkPlan,
    source: &'a dyn InputSource,
    converter: &'a dyn UnitConverter,
}

impl<'a> Engine<'a> {
    pub fn new(
        var: &'a ResolvedVariable,
        plan: &'a ChunkPlan,
        source: &'a dyn InputSource,
        converter: &'a dyn UnitConverter,
    ) -> Self {
        Self { var, plan, source, converter }
    }

    /// Evaluates the variable, handing each finished output chunk to `emit`
    /// in increasing order. Returns the number of chunks emitted.
    ///
    /// A chunk is only emitted once it is fully computed; a failure stops the
    /// run with `ChunkEvaluation` and leaves earlier chunks with the caller.
    pub fn run(
        &self,
        emit: &mut dyn FnMut(usize, ArrayD<f64>) -> Result<(), ConformError>,
    ) -> Result<usize, ConformError> {
        let mut state = RunState::new(self.var.registry.count());
        let last_chunk = self.plan.chunks.len().saturating_sub(1);
        let mut emitted = 0;

        for pass in 0..self.plan.passes {
            let schedule = self.schedule(pass);
            debug!(
                variable = %self.var.name,
                pass,
                steps = schedule.steps.len(),
                sinks = schedule.sinks.len(),
                "streaming pass"
            );

            let mut accumulators = schedule
                .sinks
                .iter()
                .map(|&sink| self.accumulator(sink).map(|acc| (sink, acc)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConformError::chunk(0, e))?;
            for &id in &schedule.steps {
                if self.plan.carried[id.index()].is_some() {
                    state.scans[id.index()] = None;
                }
            }

            for chunk in 0..self.plan.chunks.len() {
                let mut ledger = ChunkLedger::new(&schedule.uses);
                self.step_chunk(chunk, &schedule.steps, &mut ledger, &mut state)
                    .and_then(|()| self.feed(&mut accumulators, &mut ledger))
                    .map_err(|e| ConformError::chunk(chunk, e))?;
                trace!(variable = %self.var.name, pass, chunk, peak = ledger.peak(), "chunk evaluated");

                if schedule.emit_root {
                    let value = ledger
                        .take(self.plan.root)
                        .ok_or_else(|| ConformError::chunk(chunk, "output value was not computed"))?;
                    emit(chunk, value)?;
                    emitted += 1;
                }
            }

            for (sink, acc) in accumulators {
                let value = acc.finish().map_err(|e| ConformError::chunk(last_chunk, e))?;
                state.settled[sink.index()] = Some(value);
            }
        }

        if !self.plan.root_streamed() {
            let root = self.plan.root;
            self.settle(root, &mut state.settled).map_err(|e| ConformError::chunk(0, e))?;
            let value = state.settled[root.index()]
                .take()
                .ok_or_else(|| ConformError::chunk(0, "output value was not computed"))?;
            emit(0, value)?;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Evaluates a single output chunk in isolation. Only valid when the
    /// plan reports independent chunks.
    pub fn run_chunk(&self, index: usize) -> Result<ArrayD<f64>, ConformError> {
        if !self.plan.chunks_independent() {
            return Err(ConformError::chunk(index, "chunks of this variable depend on each other"));
        }
        if index >= self.plan.chunks.len() {
            return Err(ConformError::chunk(index, format!("only {} chunks", self.plan.chunks.len())));
        }
        let schedule = self.schedule(0);
        let mut state = RunState::new(self.var.registry.count());
        let mut ledger = ChunkLedger::new(&schedule.uses);
        self.step_chunk(index, &schedule.steps, &mut ledger, &mut state)
            .map_err(|e| ConformError::chunk(index, e))?;
        ledger.take(self.plan.root).ok_or_else(|| ConformError::chunk(index, "output value was not computed"))
    }

    fn schedule(&self, pass: usize) -> PassSchedule {
        let reg = &self.var.registry;
        let plan = self.plan;
        let n = reg.count();

        let sinks: Vec<NodeId> = (0..n)
            .map(NodeId::new)
            .filter(|&id| plan.is_accumulating(id) && plan.level[id.index()] == pass + 1)
            .collect();
        let emit_root = plan.root_streamed() && plan.level[plan.root.index()] == pass;

        let mut needed = vec![false; n];
        let mut stack: Vec<NodeId> = sinks.iter().flat_map(|&s| reg.get_parents(s).iter().copied()).collect();
        if emit_root {
            stack.push(plan.root);
        }
        while let Some(id) = stack.pop() {
            if !plan.streamed[id.index()] || needed[id.index()] {
                continue;
            }
            needed[id.index()] = true;
            stack.extend_from_slice(reg.get_parents(id));
        }
        let steps: Vec<NodeId> = (0..n).filter(|&i| needed[i]).map(NodeId::new).collect();

        let mut uses = vec![0; n];
        for &id in steps.iter().chain(&sinks) {
            for p in reg.get_parents(id) {
                if plan.streamed[p.index()] {
                    uses[p.index()] += 1;
                }
            }
        }
        if emit_root {
            uses[plan.root.index()] += 1;
        }
        PassSchedule { steps, sinks, emit_root, uses }
    }

    fn step_chunk(
        &self,
        chunk: usize,
        steps: &[NodeId],
        ledger: &mut ChunkLedger,
        state: &mut RunState,
    ) -> Result<(), String> {
        let reg = &self.var.registry;
        for &id in steps {
            let parents = reg.get_parents(id);
            for &p in parents {
                if !self.plan.streamed[p.index()] {
                    self.settle(p, &mut state.settled)?;
                }
            }

            let inputs: Vec<&ArrayD<f64>> = parents
                .iter()
                .map(|&p| {
                    let slot = if self.plan.streamed[p.index()] { ledger.get(p) } else { state.settled[p.index()].as_ref() };
                    slot.ok_or_else(|| format!("value of node {} is not available", p.index()))
                })
                .collect::<Result<_, _>>()?;

            let value = match self.plan.carried[id.index()] {
                Some(axis) => {
                    let Some(Kernel::Scan(factory)) = &self.plan.kernels[id.index()] else {
                        return Err(format!("node {} carries state but is not a scan", id.index()));
                    };
                    let input = inputs.first().ok_or("scan without operand")?;
                    state.scans[id.index()].get_or_insert_with(|| factory()).step(input.view(), axis)
                }
                None => self.evaluate(id, &inputs, Some(chunk))?,
            };

            for &p in parents {
                if self.plan.streamed[p.index()] {
                    ledger.release(p);
                }
            }
            ledger.insert(id, value);
        }
        Ok(())
    }

    fn feed(&self, accumulators: &mut [(NodeId, Box<dyn Accumulator>)], ledger: &mut ChunkLedger) -> Result<(), String> {
        for (sink, acc) in accumulators.iter_mut() {
            let parent = self.first_parent(*sink)?;
            let axis = self.plan.carried[sink.index()].ok_or("reduction without a carried axis")?;
            let value = ledger.get(parent).ok_or("reduction input was not computed")?;
            acc.update(value.view(), axis);
            ledger.release(parent);
        }
        Ok(())
    }

    fn settle(&self, id: NodeId, settled: &mut Vec<Option<ArrayD<f64>>>) -> Result<(), String> {
        if settled[id.index()].is_some() {
            return Ok(());
        }
        if self.plan.is_accumulating(id) {
            return Err(format!("reduction at node {} was not finalized", id.index()));
        }
        let parents = self.var.registry.get_parents(id);
        for &p in parents {
            self.settle(p, settled)?;
        }
        let inputs: Vec<&ArrayD<f64>> = parents
            .iter()
            .map(|p| settled[p.index()].as_ref().ok_or_else(|| format!("node {} has no value", p.index())))
            .collect::<Result<_, _>>()?;
        let value = self.evaluate(id, &inputs, None)?;
        settled[id.index()] = Some(value);
        Ok(())
    }

    fn evaluate(&self, id: NodeId, inputs: &[&ArrayD<f64>], chunk: Option<usize>) -> Result<ArrayD<f64>, String> {
        match self.var.registry.kind(id) {
            NodeKind::Literal(v) => Ok(arr0(v.0).into_dyn()),
            NodeKind::Operand(name) => self.read(id, name, chunk),
            NodeKind::Formula(Operation::UnitConvert { from, to }) => {
                let input = inputs.first().ok_or("conversion without operand")?;
                self.converter.convert(input.view(), from, to).map_err(|e| e.to_string())
            }
            NodeKind::Formula(Operation::Transpose { permutation }) => {
                let input = inputs.first().ok_or("transpose without operand")?;
                Ok(input.view().permuted_axes(permutation.axes()).as_standard_layout().into_owned())
            }
            NodeKind::Formula(Operation::Call { function, options }) => match &self.plan.kernels[id.index()] {
                Some(Kernel::Map(f)) => {
                    let aligned = self.align_all(id, inputs)?;
                    let views: Vec<_> = aligned.iter().map(|a| a.view()).collect();
                    f(&views, options)
                }
                Some(Kernel::Reduce(factory)) => {
                    let (input, axis) = self.along(id, inputs, options)?;
                    let mut acc = factory();
                    acc.update(input.view(), axis);
                    acc.finish()
                }
                Some(Kernel::Scan(factory)) => {
                    let (input, axis) = self.along(id, inputs, options)?;
                    Ok(factory().step(input.view(), axis))
                }
                Some(Kernel::Convert) | None => Err(format!("'{}' has no executable kernel", function)),
            },
        }
    }

    fn read(&self, id: NodeId, name: &str, chunk: Option<usize>) -> Result<ArrayD<f64>, String> {
        let dims = &self.annotation(id)?.dims;
        let bounds = match (chunk, &self.plan.dimension) {
            (Some(c), Some(dim)) if self.plan.streamed[id.index()] => {
                let pos = dims.position(dim).ok_or_else(|| format!("'{}' has no dimension '{}'", name, dim))?;
                // Sources know their dimensions by native name.
                let native = self
                    .var
                    .native_dims
                    .get(name)
                    .and_then(|d| d.iter().nth(pos))
                    .map_or_else(|| dim.clone(), |d| d.name.clone());
                let (start, end) = self.plan.chunks[c];
                Some(ChunkBounds { dimension: native, start, end })
            }
            _ => None,
        };
        let value = self.source.read_slice(name, bounds.as_ref()).map_err(|e| e.to_string())?;
        if value.ndim() != dims.len() {
            return Err(format!("'{}' has {} axes, expected {}", name, value.ndim(), dims.len()));
        }
        Ok(value)
    }

    fn along<'v>(
        &self,
        id: NodeId,
        inputs: &[&'v ArrayD<f64>],
        options: &CallOptions,
    ) -> Result<(&'v ArrayD<f64>, usize), String> {
        let input = *inputs.first().ok_or("missing operand")?;
        let dim = option_text(options, "dim").ok_or("missing 'dim' option")?;
        let parent = self.first_parent(id)?;
        let axis = self.annotation(parent)?.dims.position(dim).ok_or_else(|| format!("no dimension '{}'", dim))?;
        Ok((input, axis))
    }

    // Lines every operand up with the output's dimension order and shape.
    fn align_all<'v>(&self, id: NodeId, inputs: &[&'v ArrayD<f64>]) -> Result<Vec<CowArray<'v, f64, IxDyn>>, String> {
        let out = &self.annotation(id)?.dims;
        let parent_dims: Vec<&DimensionSignature> = self
            .var
            .registry
            .get_parents(id)
            .iter()
            .map(|&p| self.annotation(p).map(|a| &a.dims))
            .collect::<Result<_, _>>()?;

        let mut shape = Vec::with_capacity(out.len());
        for d in out.iter() {
            let len = parent_dims
                .iter()
                .zip(inputs)
                .find_map(|(dims, v)| dims.position(&d.name).and_then(|i| v.shape().get(i).copied()))
                .ok_or_else(|| format!("no operand provides dimension '{}'", d.name))?;
            shape.push(len);
        }
        parent_dims.iter().zip(inputs).map(|(dims, v)| align(v, dims, out, &shape)).collect()
    }

    fn annotation(&self, id: NodeId) -> Result<&Annotation, String> {
        self.var.registry.annotation(id).ok_or_else(|| format!("node {} is not annotated", id.index()))
    }

    fn first_parent(&self, id: NodeId) -> Result<NodeId, String> {
        self.var.registry.get_parents(id).first().copied().ok_or_else(|| format!("node {} has no operand", id.index()))
    }

    fn accumulator(&self, id: NodeId) -> Result<Box<dyn Accumulator>, String> {
        match &self.plan.kernels[id.index()] {
            Some(Kernel::Reduce(factory)) => Ok(factory()),
            _ => Err(format!("node {} is not a reduction", id.index())),
        }
    }
}

fn align<'v>(
    value: &'v ArrayD<f64>,
    from: &DimensionSignature,
    to: &DimensionSignature,
    shape: &[usize],
) -> Result<CowArray<'v, f64, IxDyn>, String> {
    if value.ndim() != from.len() {
        return Err(format!("operand has {} axes but dimensions {}", value.ndim(), from));
    }
    let order: Vec<usize> = to.iter().filter_map(|d| from.position(&d.name)).collect();
    if order.len() != from.len() {
        return Err(format!("operand dimensions {} are not contained in {}", from, to));
    }
    let mut view = value.view().permuted_axes(order);
    for (i, d) in to.iter().enumerate() {
        if !from.contains(&d.name) {
            view = view.insert_axis(Axis(i));
        }
    }
    if view.shape() == shape {
        return Ok(CowArray::from(view));
    }
    match view.broadcast(IxDyn(shape)) {
        Some(b) => Ok(CowArray::from(b.to_owned())),
        None => Err(format!("cannot broadcast {:?} to {:?}", view.shape(), shape)),
    }
}
