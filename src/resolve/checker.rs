//! Bottom-up annotation of a compiled variable with dimensions and units.
use super::rules::{infer_dims, infer_unit, OperandInfo};
use super::ResolvedVariable;
use crate::analysis::units::{units_equal, UnitConverter};
use crate::error::ConformError;
use crate::functions::{FunctionRegistry, Kernel};
use crate::graph::VariableGraph;
use crate::io::InputSource;
use crate::standard::StandardVariable;
use crate::store::{
    option_text, Annotation, CallOptions, DimensionSignature, NodeId, NodeKind, Operation, Registry, Unit,
};
use std::collections::BTreeMap;

/// Walks a variable's registry in topological order and rebuilds it with
/// every node annotated. Unit conversions and transposes are inserted where
/// the operands or the required output layout call for them.
pub struct Resolver<'a> {
    functions: &'a FunctionRegistry,
    source: &'a dyn InputSource,
    converter: &'a dyn UnitConverter,
    dimension_map: &'a BTreeMap<String, String>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        functions: &'a FunctionRegistry,
        source: &'a dyn InputSource,
        converter: &'a dyn UnitConverter,
        dimension_map: &'a BTreeMap<String, String>,
    ) -> Self {
        Self { functions, source, converter, dimension_map }
    }

    pub fn resolve(&self, var: &VariableGraph, target: &StandardVariable) -> Result<ResolvedVariable, ConformError> {
        let src = &var.registry;
        let mut out = Registry::new();
        let mut remap: Vec<NodeId> = Vec::with_capacity(src.count());
        let mut native_dims = BTreeMap::new();

        for idx in 0..src.count() {
            let id = NodeId::new(idx);
            let parents: Vec<NodeId> = src.get_parents(id).iter().map(|p| remap[p.index()]).collect();
            let new_id = match src.kind(id) {
                NodeKind::Literal(v) => out.add_annotated(
                    NodeKind::Literal(*v),
                    &[],
                    Annotation { dims: DimensionSignature::scalar(), unit: Unit::dimensionless() },
                ),
                NodeKind::Operand(name) => {
                    let meta = self
                        .source
                        .metadata(name)
                        .ok_or_else(|| ConformError::UnresolvedReference { name: name.clone() })?;
                    let dims = meta.dims.renamed(self.dimension_map);
                    native_dims.insert(name.clone(), meta.dims);
                    out.add_annotated(NodeKind::Operand(name.clone()), &[], Annotation { dims, unit: meta.unit })
                }
                NodeKind::Formula(Operation::Call { function, options }) => {
                    self.check_call(&mut out, function, options, &parents)?
                }
                NodeKind::Formula(op) => {
                    // Already-resolved structural nodes pass through unchanged.
                    let annotation = src
                        .annotation(id)
                        .cloned()
                        .ok_or_else(|| ConformError::incompatible("graph", "unannotated structural node"))?;
                    out.add_annotated(NodeKind::Formula(op.clone()), &parents, annotation)
                }
            };
            remap.push(new_id);
        }

        let root = self.conform_root(&mut out, remap[var.root.index()], target)?;
        let registry = compact(&out, root);
        Ok(ResolvedVariable {
            name: var.name.clone(),
            expression: var.expression.clone(),
            root: NodeId::new(registry.count() - 1),
            registry,
            native_dims,
            standard: target.clone(),
        })
    }

    fn check_call(
        &self,
        out: &mut Registry,
        function: &str,
        options: &CallOptions,
        parents: &[NodeId],
    ) -> Result<NodeId, ConformError> {
        let spec = self
            .functions
            .get(function, parents.len())
            .ok_or_else(|| ConformError::UnknownFunction { name: function.to_string(), arity: parents.len() })?;

        let annotations: Vec<Annotation> = parents.iter().map(|&p| annotation_of(out, p)).collect::<Result<_, _>>()?;
        let operands: Vec<OperandInfo> = parents
            .iter()
            .zip(&annotations)
            .map(|(&p, a)| OperandInfo {
                dims: &a.dims,
                unit: &a.unit,
                is_literal: matches!(out.kind(p), NodeKind::Literal(_)),
            })
            .collect();

        if let Kernel::Convert = spec.kernel {
            let to = option_text(options, "units")
                .ok_or_else(|| ConformError::incompatible(function, "missing 'units' option"))?;
            return self.convert_node(out, parents[0], &Unit::new(to));
        }

        let dims = infer_dims(spec.shape, function, &operands, options)?;
        let outcome = infer_unit(spec.unit, function, &operands, options, |a, b| self.converter.is_convertible(a, b))?;

        let mut inputs = parents.to_vec();
        for (pos, to) in &outcome.conversions {
            inputs[*pos] = self.convert_node(out, inputs[*pos], to)?;
        }

        let op = Operation::Call { function: function.to_string(), options: options.clone() };
        Ok(out.add_annotated(NodeKind::Formula(op), &inputs, Annotation { dims, unit: outcome.unit }))
    }

    fn convert_node(&self, out: &mut Registry, node: NodeId, to: &Unit) -> Result<NodeId, ConformError> {
        let ann = annotation_of(out, node)?;
        if units_equal(&ann.unit, to) {
            return Ok(node);
        }
        if !self.converter.is_convertible(&ann.unit, to) {
            return Err(ConformError::UnconvertibleUnit { from: ann.unit.to_string(), to: to.to_string() });
        }
        let op = Operation::UnitConvert { from: ann.unit.clone(), to: to.clone() };
        Ok(out.add_annotated(NodeKind::Formula(op), &[node], Annotation { dims: ann.dims, unit: to.clone() }))
    }

    // Renames, transposes and converts the root into the required layout.
    fn conform_root(&self, out: &mut Registry, root: NodeId, target: &StandardVariable) -> Result<NodeId, ConformError> {
        let ann = annotation_of(out, root)?;
        let found: Vec<String> = ann.dims.names().iter().map(|s| s.to_string()).collect();

        let mut node = root;
        if found != target.dimensions {
            let perm = ann.dims.permutation_to(&target.dimensions).ok_or_else(|| ConformError::DimensionMismatch {
                found: found.clone(),
                required: target.dimensions.clone(),
            })?;
            let dims = perm.apply(&ann.dims);
            let op = Operation::Transpose { permutation: perm };
            node = out.add_annotated(NodeKind::Formula(op), &[node], Annotation { dims, unit: ann.unit.clone() });
        }

        if !units_equal(&ann.unit, &target.units) {
            if !self.converter.is_convertible(&ann.unit, &target.units) {
                return Err(ConformError::UnconvertibleUnit {
                    from: ann.unit.to_string(),
                    to: target.units.to_string(),
                });
            }
            node = self.convert_node(out, node, &target.units)?;
        }
        Ok(node)
    }
}

fn annotation_of(reg: &Registry, id: NodeId) -> Result<Annotation, ConformError> {
    reg.annotation(id)
        .cloned()
        .ok_or_else(|| ConformError::incompatible("graph", format!("node {} has no annotation", id.index())))
}

// Keeps only nodes reachable from `root`, preserving order. The root ends up last.
fn compact(reg: &Registry, root: NodeId) -> Registry {
    let keep = reg.reachable_from(root);
    let mut remap = vec![NodeId::default(); reg.count()];
    let mut out = Registry::new();
    for id in keep {
        let parents: Vec<NodeId> = reg.get_parents(id).iter().map(|p| remap[p.index()]).collect();
        let new_id = match reg.annotation(id) {
            Some(ann) => out.add_annotated(reg.kind(id).clone(), &parents, ann.clone()),
            None => out.add_node(reg.kind(id).clone(), &parents),
        };
        remap[id.index()] = new_id;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::units::LinearUnitConverter;
    use crate::graph::GraphBuilder;
    use crate::io::MemorySource;
    use crate::parse::Definitions;
    use ndarray::ArrayD;

    fn source() -> MemorySource {
        let mut s = MemorySource::new();
        s.insert("tas", &[("time", 4), ("lat", 3)], Unit::new("K"), ArrayD::zeros(vec![4, 3]));
        s.insert("ps", &[("time", 4), ("lat", 3)], Unit::new("hPa"), ArrayD::zeros(vec![4, 3]));
        s.insert("z", &[("lat", 3), ("time", 4)], Unit::new("m"), ArrayD::zeros(vec![3, 4]));
        s.insert("t2m", &[("t", 4), ("lat", 3)], Unit::new("K"), ArrayD::zeros(vec![4, 3]));
        s
    }

    fn resolve_with(
        expr: &str,
        target: StandardVariable,
        dimension_map: &BTreeMap<String, String>,
    ) -> Result<ResolvedVariable, ConformError> {
        let functions = FunctionRegistry::with_builtins();
        let src = source();
        let mut defs = Definitions::new();
        defs.insert("out".into(), expr.into());
        let graph = GraphBuilder::new(&functions, &src).build(&defs);
        if let Some(e) = graph.failure("out") {
            return Err(e.clone());
        }
        let conv = LinearUnitConverter::new();
        Resolver::new(&functions, &src, &conv, dimension_map).resolve(graph.get("out").unwrap(), &target)
    }

    fn resolve(expr: &str, target: StandardVariable) -> Result<ResolvedVariable, ConformError> {
        resolve_with(expr, target, &BTreeMap::new())
    }

    fn root_kind(r: &ResolvedVariable) -> &NodeKind {
        r.registry.kind(r.root)
    }

    #[test]
    fn test_kelvin_to_celsius_inserts_conversion() {
        let r = resolve("tas", StandardVariable::new(&["time", "lat"], "degC")).unwrap();
        assert_eq!(
            root_kind(&r),
            &NodeKind::Formula(Operation::UnitConvert { from: Unit::new("K"), to: Unit::new("degC") })
        );
        assert_eq!(r.registry.annotation(r.root).unwrap().unit, Unit::new("degC"));
    }

    #[test]
    fn test_permuted_dimensions_get_a_transpose() {
        let r = resolve("z", StandardVariable::new(&["time", "lat"], "m")).unwrap();
        match root_kind(&r) {
            NodeKind::Formula(Operation::Transpose { permutation }) => assert_eq!(permutation.axes(), &[1, 0]),
            other => panic!("expected transpose, got {:?}", other),
        }
        assert_eq!(r.registry.annotation(r.root).unwrap().dims.names(), vec!["time", "lat"]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = resolve("mean(tas, dim='time')", StandardVariable::new(&["time", "lat"], "K")).unwrap_err();
        assert_eq!(
            err,
            ConformError::DimensionMismatch { found: vec!["lat".into()], required: vec!["time".into(), "lat".into()] }
        );
    }

    #[test]
    fn test_unconvertible_root_unit() {
        let err = resolve("tas", StandardVariable::new(&["time", "lat"], "m")).unwrap_err();
        assert_eq!(err, ConformError::UnconvertibleUnit { from: "K".into(), to: "m".into() });
    }

    #[test]
    fn test_incompatible_operand_units() {
        let err = resolve("tas + z", StandardVariable::new(&["time", "lat"], "K")).unwrap_err();
        assert_eq!(err.kind(), "IncompatibleOperandsError");
    }

    #[test]
    fn test_convertible_operand_gets_converted() {
        // hPa + Pa-convertible operand: second operand converted to the first's unit.
        let r = resolve("ps + convert(ps, units='Pa')", StandardVariable::new(&["time", "lat"], "hPa")).unwrap();
        let converts = r
            .registry
            .kinds
            .iter()
            .filter(|k| matches!(k, NodeKind::Formula(Operation::UnitConvert { .. })))
            .count();
        assert_eq!(converts, 2);
        assert_eq!(r.registry.annotation(r.root).unwrap().unit, Unit::new("hPa"));
    }

    #[test]
    fn test_literal_adopts_sibling_unit() {
        let r = resolve("tas - 273.15", StandardVariable::new(&["time", "lat"], "K")).unwrap();
        assert_eq!(r.registry.annotation(r.root).unwrap().unit, Unit::new("K"));
    }

    #[test]
    fn test_dimension_map_renames_inputs() {
        let map = BTreeMap::from([("t".to_string(), "time".to_string())]);
        let r = resolve_with("t2m", StandardVariable::new(&["time", "lat"], "K"), &map).unwrap();
        assert_eq!(r.registry.annotation(r.root).unwrap().dims.names(), vec!["time", "lat"]);
        assert_eq!(r.native_dims["t2m"].names(), vec!["t", "lat"]);
        assert!(resolve("t2m", StandardVariable::new(&["time", "lat"], "K")).is_err());
    }
}
