//! The end-to-end pipeline: compile definitions, resolve them against the
//! standard, plan chunks and schedule evaluation.
use crate::analysis::units::{LinearUnitConverter, UnitConverter};
use crate::compute::ChunkPlan;
use crate::config::{OverwritePolicy, RunConfig};
use crate::error::ConformError;
use crate::functions::FunctionRegistry;
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::io::{InputSource, OutputWriter};
use crate::parse::Definitions;
use crate::resolve::{ResolvedVariable, Resolver};
use crate::schedule::{CancelFlag, Job, RunReport, Scheduler};
use crate::standard::{Standard, StandardVariable};
use std::collections::BTreeMap;
use tracing::{debug, info, info_span};

pub struct Conformer<'a> {
    standard: &'a Standard,
    definitions: &'a Definitions,
    source: &'a dyn InputSource,
    config: RunConfig,
    functions: FunctionRegistry,
    converter: Box<dyn UnitConverter>,
    cancel: CancelFlag,
}

impl<'a> Conformer<'a> {
    pub fn new(standard: &'a Standard, definitions: &'a Definitions, source: &'a dyn InputSource, config: RunConfig) -> Self {
        Self {
            standard,
            definitions,
            source,
            config,
            functions: FunctionRegistry::with_builtins(),
            converter: Box::new(LinearUnitConverter::new()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_converter(mut self, converter: Box<dyn UnitConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Cancelling stops dispatch of work not yet started.
    pub fn cancel_flag(&self) -> CancelFlag { self.cancel.clone() }

    pub fn config(&self) -> &RunConfig { &self.config }

    pub fn functions(&self) -> &FunctionRegistry { &self.functions }

    /// Output variables this run is responsible for.
    pub fn selected(&self) -> Vec<String> {
        match &self.config.variables {
            Some(subset) => subset.clone(),
            None => self.standard.names().cloned().collect(),
        }
    }

    pub fn compile(&self) -> DependencyGraph {
        GraphBuilder::new(&self.functions, self.source).build(self.definitions)
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.functions, self.source, self.converter.as_ref(), &self.config.dimension_map)
    }

    /// Compiles and resolves a single variable.
    pub fn resolve(&self, name: &str) -> Result<ResolvedVariable, ConformError> {
        let graph = self.compile();
        let target = self.target(name)?;
        self.resolve_in(&graph, name, target)
    }

    fn target(&self, name: &str) -> Result<&'a StandardVariable, ConformError> {
        self.standard.get(name).ok_or_else(|| ConformError::UnresolvedReference { name: name.to_string() })
    }

    fn resolve_in(&self, graph: &DependencyGraph, name: &str, target: &StandardVariable) -> Result<ResolvedVariable, ConformError> {
        if let Some(error) = graph.failure(name) {
            return Err(error.clone());
        }
        let var = graph.get(name).ok_or_else(|| ConformError::UnresolvedReference { name: name.to_string() })?;
        self.resolver().resolve(var, target)
    }

    /// Raw inputs each selected variable reads.
    pub fn dependencies(&self) -> BTreeMap<String, Result<Vec<String>, ConformError>> {
        let graph = self.compile();
        self.selected()
            .into_iter()
            .filter(|name| self.definitions.contains_key(name))
            .map(|name| {
                let inputs = match (graph.failure(&name), graph.get(&name)) {
                    (Some(error), _) => Err(error.clone()),
                    (None, Some(var)) => Ok(var.inputs()),
                    (None, None) => Err(ConformError::UnresolvedReference { name: name.clone() }),
                };
                (name, inputs)
            })
            .collect()
    }

    pub fn run(&self, writer: &mut dyn OutputWriter) -> RunReport {
        let span = info_span!("conform");
        let _guard = span.enter();

        let graph = self.compile();
        let mut report = RunReport::new();
        let mut jobs = Vec::new();

        for name in self.selected() {
            let Some(target) = self.standard.get(&name) else {
                report.skipped(&name, "not in the standard");
                continue;
            };
            if !self.definitions.contains_key(&name) {
                report.skipped(&name, "no definition");
                continue;
            }
            if writer.exists(&name) {
                match self.config.overwrite {
                    OverwritePolicy::Replace => {}
                    OverwritePolicy::Skip => {
                        report.skipped(&name, "output exists");
                        continue;
                    }
                    OverwritePolicy::Fail => {
                        report.fail(&name, &ConformError::OutputExists { variable: name.clone() });
                        continue;
                    }
                }
            }

            let prepared = self
                .resolve_in(&graph, &name, target)
                .and_then(|var| ChunkPlan::build(&var, &self.functions, &self.config).map(|plan| (var, plan)));
            match prepared {
                Ok((var, plan)) => {
                    debug!(variable = %name, chunks = plan.chunk_count(), passes = plan.passes, "planned");
                    jobs.push(Job::new(var, plan, self.config.provenance));
                }
                Err(error) => {
                    report.fail(&name, &error);
                }
            }
        }

        Scheduler::new(self.source, self.converter.as_ref(), &self.config, self.cancel.clone()).run(&jobs, writer, &mut report);

        let (succeeded, failed, skipped) = report.counts();
        info!(succeeded, failed, skipped, "run finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemorySource, MemoryWriter};
    use crate::schedule::{VariableStatus, PROVENANCE_ATTRIBUTE};
    use crate::store::Unit;
    use ndarray::{ArrayD, IxDyn};

    fn tas() -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(&[10, 2]), |ix| 270.0 + ix[0] as f64 + ix[1] as f64 * 0.5)
    }

    fn source() -> MemorySource {
        let mut s = MemorySource::new();
        s.insert("tas", &[("time", 10), ("lat", 2)], Unit::new("K"), tas());
        s
    }

    fn standard(vars: &[(&str, &[&str], &str)]) -> Standard {
        let mut std = Standard::new();
        for (name, dims, unit) in vars {
            std.insert(name, StandardVariable::new(dims, unit));
        }
        std
    }

    fn defs(pairs: &[(&str, &str)]) -> Definitions {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_malformed_definition_only_fails_itself() {
        let std = standard(&[("bad", &["time", "lat"], "K"), ("tas_k", &["time", "lat"], "K")]);
        let defs = defs(&[("bad", "tas +* 2"), ("tas_k", "tas")]);
        let src = source();
        let mut writer = MemoryWriter::new();
        let report = Conformer::new(&std, &defs, &src, RunConfig::default()).run(&mut writer);

        assert_eq!(report.failure_kind("bad"), Some("SyntaxError"));
        assert_eq!(report.get("tas_k"), Some(&VariableStatus::Succeeded { chunks: 1 }));
        assert_eq!(writer.get("tas_k").unwrap().data, tas());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_cycle_writes_nothing() {
        let std = standard(&[("A", &["time", "lat"], "K"), ("B", &["time", "lat"], "K")]);
        let defs = defs(&[("A", "B + 1"), ("B", "A * 2")]);
        let src = source();
        let mut writer = MemoryWriter::new();
        let report = Conformer::new(&std, &defs, &src, RunConfig::default()).run(&mut writer);

        for name in ["A", "B"] {
            assert_eq!(report.failure_kind(name), Some("CycleError"));
        }
        match report.get("A") {
            Some(VariableStatus::Failed { message, .. }) => assert_eq!(message, "cycle detected: A -> B -> A"),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(writer.events().is_empty());
        assert!(src.reads().is_empty());
    }

    #[test]
    fn test_kelvin_to_celsius() {
        let std = standard(&[("tas_c", &["time", "lat"], "degC")]);
        let defs = defs(&[("tas_c", "tas")]);
        let src = source();
        let mut writer = MemoryWriter::new();
        let cfg = RunConfig { chunk_length: Some(4), ..Default::default() };
        let report = Conformer::new(&std, &defs, &src, cfg).run(&mut writer);

        assert_eq!(report.get("tas_c"), Some(&VariableStatus::Succeeded { chunks: 3 }));
        let out = writer.get("tas_c").unwrap();
        assert_eq!(out.header.unit, Unit::new("degC"));
        assert_eq!(out.header.chunk_dimension.as_deref(), Some("time"));
        for (got, k) in out.data.iter().zip(tas().iter()) {
            assert!((got - (k - 273.15)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_average_reads_chunks_and_matches_direct_mean() {
        let std = standard(&[("tas_mean", &["lat"], "K")]);
        let defs = defs(&[("tas_mean", "average(tas, dim='time')")]);
        let src = source();
        let mut writer = MemoryWriter::new();
        let cfg = RunConfig { chunk_length: Some(3), ..Default::default() };
        Conformer::new(&std, &defs, &src, cfg).run(&mut writer);

        let lens: Vec<usize> = src.reads().iter().filter_map(|(_, b)| b.as_ref().map(|b| b.len())).collect();
        assert_eq!(lens, vec![3, 3, 3, 1]);
        let out = &writer.get("tas_mean").unwrap().data;
        let direct = tas().mean_axis(ndarray::Axis(0)).unwrap();
        for (a, b) in out.iter().zip(direct.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_overwrite_policies() {
        let std = standard(&[("tas_k", &["time", "lat"], "K")]);
        let defs = defs(&[("tas_k", "tas")]);
        let src = source();

        let mut writer = MemoryWriter::new();
        writer.mark_existing("tas_k");
        let cfg = RunConfig { overwrite: OverwritePolicy::Skip, ..Default::default() };
        let report = Conformer::new(&std, &defs, &src, cfg).run(&mut writer);
        assert!(matches!(report.get("tas_k"), Some(VariableStatus::Skipped { .. })));
        assert!(writer.events().is_empty());

        let cfg = RunConfig { overwrite: OverwritePolicy::Fail, ..Default::default() };
        let report = Conformer::new(&std, &defs, &src, cfg).run(&mut writer);
        assert_eq!(report.failure_kind("tas_k"), Some("OutputExistsError"));

        let report = Conformer::new(&std, &defs, &src, RunConfig::default()).run(&mut writer);
        assert!(matches!(report.get("tas_k"), Some(VariableStatus::Succeeded { .. })));
    }

    #[test]
    fn test_subset_missing_definition_and_upstream_failure() {
        let std = standard(&[
            ("base", &["time", "lat"], "K"),
            ("derived", &["time", "lat"], "K"),
            ("orphan", &["time"], "K"),
            ("tas_k", &["time", "lat"], "K"),
        ]);
        let defs = defs(&[("base", "nope + 1"), ("derived", "base * 2"), ("tas_k", "tas")]);
        let src = source();

        let mut writer = MemoryWriter::new();
        let report = Conformer::new(&std, &defs, &src, RunConfig::default()).run(&mut writer);
        assert_eq!(report.failure_kind("base"), Some("UnresolvedReferenceError"));
        assert_eq!(report.failure_kind("derived"), Some("UpstreamFailedError"));
        assert_eq!(report.get("orphan"), Some(&VariableStatus::Skipped { reason: "no definition".into() }));

        let cfg = RunConfig { variables: Some(vec!["tas_k".into()]), ..Default::default() };
        let report = Conformer::new(&std, &defs, &src, cfg).run(&mut MemoryWriter::new());
        assert_eq!(report.variables.keys().collect::<Vec<_>>(), vec!["tas_k"]);
    }

    #[test]
    fn test_provenance_and_dependencies() {
        let std = standard(&[("anom", &["time", "lat"], "K")]);
        let defs = defs(&[("clim", "mean(tas, dim='time')"), ("anom", "tas - clim")]);
        let src = source();
        let cfg = RunConfig { provenance: true, ..Default::default() };
        let conformer = Conformer::new(&std, &defs, &src, cfg);

        let mut writer = MemoryWriter::new();
        conformer.run(&mut writer);
        let header = &writer.get("anom").unwrap().header;
        assert_eq!(header.attributes[PROVENANCE_ATTRIBUTE], "(tas - clim)");

        let deps = conformer.dependencies();
        assert_eq!(deps["anom"], Ok(vec!["tas".to_string()]));
    }
}
