use super::dag::{DependencyGraph, VariableGraph};
use super::operand::{OperandResolver, OperandTarget};
use crate::analysis::topology;
use crate::error::ConformError;
use crate::functions::FunctionRegistry;
use crate::io::InputSource;
use crate::parse::{Definitions, Expr, ExprParser};
use crate::store::{Literal, NodeId, NodeKind, Operation, Registry};
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Compiles definitions into per-variable operation graphs.
///
/// Works in two phases: every definition is parsed first, then references are
/// resolved and ordered. A failure in one definition is recorded against that
/// variable (and anything inlining it) without stopping the others.
pub struct GraphBuilder<'a> {
    functions: &'a FunctionRegistry,
    source: &'a dyn InputSource,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(functions: &'a FunctionRegistry, source: &'a dyn InputSource) -> Self {
        Self { functions, source }
    }

    pub fn build(&self, definitions: &Definitions) -> DependencyGraph {
        let resolver = OperandResolver::new(self.source, definitions);
        let mut out = DependencyGraph::default();

        // Phase 1: parse everything.
        let mut parsed: BTreeMap<String, Expr> = BTreeMap::new();
        for (name, text) in definitions {
            match ExprParser::parse_str(text) {
                Ok(expr) => {
                    parsed.insert(name.clone(), expr);
                }
                Err(e) => {
                    out.failures.insert(name.clone(), e.into());
                }
            }
        }

        // Phase 2: variable-level edges, consumer -> referenced definition.
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for name in definitions.keys() {
            index.insert(name.clone(), graph.add_node(name.clone()));
        }
        for (name, expr) in &parsed {
            for operand in expr.operand_names() {
                match resolver.resolve(&operand) {
                    Ok(OperandTarget::Input(_)) => {}
                    Ok(OperandTarget::Definition(dep)) => {
                        graph.add_edge(index[name], index[&dep], ());
                    }
                    Err(e) => {
                        out.failures.entry(name.clone()).or_insert(e);
                    }
                }
            }
        }

        for component in topology::cyclic_components(&graph) {
            let path: Vec<String> =
                topology::cycle_walk(&graph, &component).into_iter().map(|n| graph[n].clone()).collect();
            debug!(cycle = %path.join(" -> "), "definition cycle");
            for member in component {
                out.failures.insert(graph[member].clone(), ConformError::Cycle { path: path.clone() });
            }
        }

        let sorted = topology::sort(&graph);
        out.order = sorted
            .order
            .iter()
            .map(|&n| graph[n].clone())
            .filter(|n| !matches!(out.failures.get(n), Some(ConformError::Cycle { .. })))
            .collect();

        // Compile in dependency order so upstream failures are already known.
        for name in out.order.clone() {
            if out.failures.contains_key(&name) {
                continue;
            }
            let upstream = graph
                .neighbors(index[&name])
                .map(|n| graph[n].clone())
                .filter(|dep| out.failures.contains_key(dep))
                .min();
            if let Some(dependency) = upstream {
                out.failures.insert(name.clone(), ConformError::UpstreamFailed { dependency });
                continue;
            }
            let Some(expr) = parsed.get(&name) else { continue };
            let mut registry = Registry::new();
            match self.lower(expr, &parsed, &resolver, &mut registry) {
                Ok(root) => {
                    debug!(variable = %name, nodes = registry.count(), "compiled definition");
                    out.variables.insert(
                        name.clone(),
                        VariableGraph { name: name.clone(), expression: expr.clone(), registry, root },
                    );
                }
                Err(e) => {
                    out.failures.insert(name.clone(), e);
                }
            }
        }

        out.graph = graph;
        out.index = index;
        out
    }

    // Lowers an expression into `registry`, inlining referenced definitions.
    fn lower(
        &self,
        expr: &Expr,
        parsed: &BTreeMap<String, Expr>,
        resolver: &OperandResolver,
        registry: &mut Registry,
    ) -> Result<NodeId, ConformError> {
        match expr {
            Expr::Number(n) => Ok(registry.add_node(NodeKind::Literal(Literal(*n)), &[])),
            Expr::Text(s) => {
                Err(ConformError::incompatible("definition", format!("string '{}' is not an array expression", s)))
            }
            Expr::Operand(name) => match resolver.resolve(name)? {
                OperandTarget::Input(_) => Ok(registry.add_node(NodeKind::Operand(name.clone()), &[])),
                OperandTarget::Definition(dep) => {
                    let inner = parsed.get(&dep).ok_or_else(|| ConformError::UpstreamFailed { dependency: dep.clone() })?;
                    self.lower(inner, parsed, resolver, registry)
                }
            },
            Expr::Call { name, args, kwargs } => {
                let bound = self.functions.bind(name, args, kwargs)?;
                let mut parents = Vec::with_capacity(bound.arrays.len());
                for arg in &bound.arrays {
                    parents.push(self.lower(arg, parsed, resolver, registry)?);
                }
                let op = Operation::Call { function: name.clone(), options: bound.options };
                Ok(registry.add_node(NodeKind::Formula(op), &parents))
            }
        }
    }
}
