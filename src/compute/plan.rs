use crate::config::RunConfig;
use crate::error::ConformError;
use crate::functions::{FunctionRegistry, Kernel, ShapeRule};
use crate::resolve::ResolvedVariable;
use crate::store::{option_text, NodeId, NodeKind, Operation};
use tracing::debug;

const BYTES_PER_VALUE: usize = 8;

/// How one variable is cut into chunks and scheduled over passes.
///
/// A node is *streamed* when it carries the chunk dimension and is therefore
/// evaluated once per chunk; everything else is settled once and cached.
/// A reduction along the chunk dimension consumes a whole pass, so anything
/// downstream of it runs in a later pass (its *level*).
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// Chunk dimension, named as in the output.
    pub dimension: Option<String>,
    pub domain: usize,
    pub chunk_len: usize,
    /// Half-open `[start, end)` bounds along `dimension`.
    pub chunks: Vec<(usize, usize)>,
    pub streamed: Vec<bool>,
    pub level: Vec<usize>,
    /// Number of streaming passes over the chunks.
    pub passes: usize,
    pub(crate) kernels: Vec<Option<Kernel>>,
    /// `Some(axis)` for reductions and scans that carry state across chunks.
    pub(crate) carried: Vec<Option<usize>>,
    pub(crate) root: NodeId,
}

impl ChunkPlan {
    pub fn build(var: &ResolvedVariable, functions: &FunctionRegistry, config: &RunConfig) -> Result<Self, ConformError> {
        let reg = &var.registry;
        let n = reg.count();

        let annotations: Vec<_> = (0..n)
            .map(|i| {
                reg.annotation(NodeId::new(i))
                    .cloned()
                    .ok_or_else(|| ConformError::incompatible(&var.name, "graph is not resolved"))
            })
            .collect::<Result<_, _>>()?;

        let operands: Vec<usize> =
            (0..n).filter(|&i| matches!(reg.kind(NodeId::new(i)), NodeKind::Operand(_))).collect();

        // 1. Chunk dimension: first preference present in an input, else the
        //    outermost dimension of the largest input.
        let dimension = config
            .chunk_dimensions
            .iter()
            .find(|d| operands.iter().any(|&i| annotations[i].dims.contains(d)))
            .cloned()
            .or_else(|| {
                operands
                    .iter()
                    .filter(|&&i| !annotations[i].dims.is_empty())
                    .max_by_key(|&&i| annotations[i].dims.elements_excluding(None))
                    .and_then(|&i| annotations[i].dims.iter().next().map(|d| d.name.clone()))
            });

        let domain = dimension
            .as_deref()
            .and_then(|d| operands.iter().find_map(|&i| annotations[i].dims.get(d).and_then(|x| x.len)));
        let (dimension, domain) = match (dimension, domain) {
            (Some(d), Some(len)) => (Some(d), len),
            _ => (None, 1),
        };

        // 2. Per-node roles.
        let mut kernels = Vec::with_capacity(n);
        let mut streamed = Vec::with_capacity(n);
        let mut level = Vec::with_capacity(n);
        let mut carried = Vec::with_capacity(n);
        let mut blocking: Option<String> = None;

        for i in 0..n {
            let id = NodeId::new(i);
            let parents = reg.get_parents(id);
            let is_streamed = dimension.as_deref().is_some_and(|d| annotations[i].dims.contains(d));
            let mut node_level = parents.iter().map(|p| level[p.index()]).max().unwrap_or(0);
            let mut carry = None;
            let mut kernel = None;

            if let NodeKind::Formula(Operation::Call { function, options }) = reg.kind(id) {
                let spec = functions
                    .get(function, parents.len())
                    .ok_or_else(|| ConformError::UnknownFunction { name: function.clone(), arity: parents.len() })?;
                kernel = Some(spec.kernel.clone());

                let along = option_text(options, "dim");
                let on_chunk_axis = along.is_some() && along == dimension.as_deref();
                let parent_streamed = parents.first().is_some_and(|p| streamed[p.index()]);
                if matches!(spec.shape, ShapeRule::Reduce | ShapeRule::Scan) && parent_streamed && on_chunk_axis {
                    let parent = parents[0].index();
                    carry = along.and_then(|d| annotations[parent].dims.position(d));
                    if spec.shape == ShapeRule::Reduce {
                        node_level = level[parent] + 1;
                        if !spec.chunk_associative {
                            blocking.get_or_insert_with(|| function.clone());
                        }
                    }
                }
            }

            kernels.push(kernel);
            streamed.push(is_streamed);
            level.push(node_level);
            carried.push(carry);
        }

        // 3. Chunk length from the per-step footprint of streamed nodes.
        let per_step = (0..n)
            .filter(|&i| streamed[i])
            .map(|i| annotations[i].dims.elements_excluding(dimension.as_deref()))
            .max()
            .unwrap_or(1)
            .max(1);
        let chunk_len = match config.chunk_length {
            Some(len) => len,
            None => config.memory_budget_bytes / (BYTES_PER_VALUE * per_step),
        }
        .clamp(1, domain.max(1));

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < domain {
            let end = (start + chunk_len).min(domain);
            chunks.push((start, end));
            start = end;
        }
        if chunks.is_empty() {
            chunks.push((0, domain));
        }

        if let (Some(function), Some(dim)) = (&blocking, &dimension) {
            if chunks.len() > 1 {
                return Err(ConformError::NonAssociativeReduction { function: function.clone(), dimension: dim.clone() });
            }
        }

        let root = var.root;
        let passes = level[root.index()] + usize::from(streamed[root.index()]);

        debug!(
            variable = %var.name,
            dimension = ?dimension,
            domain,
            chunk_len,
            chunks = chunks.len(),
            passes,
            "chunk plan"
        );

        Ok(Self { dimension, domain, chunk_len, chunks, streamed, level, passes, kernels, carried, root })
    }

    pub fn chunk_count(&self) -> usize { self.chunks.len() }

    /// Whether the output is produced chunk by chunk (as opposed to once at the end).
    pub fn root_streamed(&self) -> bool { self.streamed[self.root.index()] }

    /// Chunks can be evaluated in any order, on any worker, when the root
    /// streams in the first pass and no scan carries state along the chunk axis.
    pub fn chunks_independent(&self) -> bool {
        self.root_streamed() && self.passes == 1 && self.carried.iter().all(Option::is_none)
    }

    /// Output chunk count as seen by the writer.
    pub fn output_chunks(&self) -> usize {
        if self.root_streamed() { self.chunks.len() } else { 1 }
    }

    pub(crate) fn is_accumulating(&self, id: NodeId) -> bool {
        self.carried[id.index()].is_some() && !self.streamed[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::units::LinearUnitConverter;
    use crate::graph::GraphBuilder;
    use crate::io::MemorySource;
    use crate::parse::Definitions;
    use crate::resolve::Resolver;
    use crate::standard::StandardVariable;
    use crate::store::Unit;
    use ndarray::ArrayD;
    use std::collections::BTreeMap;

    fn resolved(expr: &str, dims: &[&str], source: &MemorySource) -> ResolvedVariable {
        let functions = FunctionRegistry::with_builtins();
        let mut defs = Definitions::new();
        defs.insert("out".into(), expr.into());
        let graph = GraphBuilder::new(&functions, source).build(&defs);
        let conv = LinearUnitConverter::new();
        let map = BTreeMap::new();
        Resolver::new(&functions, source, &conv, &map)
            .resolve(graph.get("out").unwrap(), &StandardVariable::new(dims, "K"))
            .unwrap()
    }

    fn source() -> MemorySource {
        let mut s = MemorySource::new();
        s.insert("tas", &[("time", 10), ("lat", 4)], Unit::new("K"), ArrayD::zeros(vec![10, 4]));
        s.insert("orog", &[("lat", 4)], Unit::new("K"), ArrayD::zeros(vec![4]));
        s
    }

    fn plan(expr: &str, dims: &[&str], config: &RunConfig) -> Result<ChunkPlan, ConformError> {
        let var = resolved(expr, dims, &source());
        ChunkPlan::build(&var, &FunctionRegistry::with_builtins(), config)
    }

    #[test]
    fn test_fixed_chunk_length_bounds() {
        let cfg = RunConfig { chunk_length: Some(3), ..Default::default() };
        let p = plan("mean(tas, dim='time')", &["lat"], &cfg).unwrap();
        assert_eq!(p.dimension.as_deref(), Some("time"));
        assert_eq!(p.chunks, vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
        assert_eq!(p.passes, 1);
        assert!(!p.root_streamed());
        assert_eq!(p.output_chunks(), 1);
    }

    #[test]
    fn test_budget_sets_chunk_length() {
        // 4 lat values per step * 8 bytes = 32 bytes per step.
        let cfg = RunConfig { memory_budget_bytes: 32 * 4, ..Default::default() };
        let p = plan("tas * 2", &["time", "lat"], &cfg).unwrap();
        assert_eq!(p.chunk_len, 4);
        assert_eq!(p.chunk_count(), 3);
        assert!(p.chunks_independent());

        let tiny = RunConfig { memory_budget_bytes: 1, ..Default::default() };
        assert_eq!(plan("tas", &["time", "lat"], &tiny).unwrap().chunk_len, 1);
        let huge = RunConfig { memory_budget_bytes: usize::MAX / 16, ..Default::default() };
        assert_eq!(plan("tas", &["time", "lat"], &huge).unwrap().chunk_len, 10);
    }

    #[test]
    fn test_anomaly_needs_two_passes() {
        let cfg = RunConfig { chunk_length: Some(4), ..Default::default() };
        let p = plan("tas - mean(tas, dim='time')", &["time", "lat"], &cfg).unwrap();
        assert_eq!(p.passes, 2);
        assert!(p.root_streamed());
        assert!(!p.chunks_independent());
    }

    #[test]
    fn test_cumsum_along_chunks_is_not_independent() {
        let cfg = RunConfig { chunk_length: Some(4), ..Default::default() };
        let p = plan("cumsum(tas, dim='time')", &["time", "lat"], &cfg).unwrap();
        assert_eq!(p.passes, 1);
        assert!(!p.chunks_independent());
        let q = plan("cumsum(tas, dim='lat')", &["time", "lat"], &cfg).unwrap();
        assert!(q.chunks_independent());
    }

    #[test]
    fn test_median_over_chunk_dimension_fails_fast() {
        let cfg = RunConfig { chunk_length: Some(3), ..Default::default() };
        let err = plan("median(tas, dim='time')", &["lat"], &cfg).unwrap_err();
        assert_eq!(
            err,
            ConformError::NonAssociativeReduction { function: "median".into(), dimension: "time".into() }
        );
        let whole = RunConfig { chunk_length: Some(10), ..Default::default() };
        assert!(plan("median(tas, dim='time')", &["lat"], &whole).is_ok());
        assert!(plan("median(tas, dim='lat')", &["time"], &cfg).is_ok());
    }

    #[test]
    fn test_fallback_to_outermost_dimension_of_largest_input() {
        let cfg = RunConfig { chunk_dimensions: vec!["plev".into()], chunk_length: Some(5), ..Default::default() };
        let p = plan("tas + orog", &["time", "lat"], &cfg).unwrap();
        assert_eq!(p.dimension.as_deref(), Some("time"));
        assert_eq!(p.chunk_count(), 2);
    }

    #[test]
    fn test_unchunked_variable_has_one_chunk() {
        let p = plan("orog * 2", &["lat"], &RunConfig { chunk_length: Some(1), ..Default::default() }).unwrap();
        assert_eq!(p.dimension.as_deref(), Some("lat"));
        let q = plan("mean(orog, dim='lat')", &[], &RunConfig::default()).unwrap();
        assert_eq!(q.chunk_count(), 1);
    }
}
