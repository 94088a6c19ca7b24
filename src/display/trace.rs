use crate::compute::ChunkPlan;
use crate::resolve::ResolvedVariable;
use crate::store::{NodeId, NodeKind, Operation};
use std::collections::HashMap;
use std::fmt::Write;

/// Renders a resolved variable as an indented tree, root first. Shared
/// subexpressions are printed once and referenced by level afterwards.
/// With a plan, streamed nodes are marked and the chunking is summarized.
pub fn format_trace(var: &ResolvedVariable, plan: Option<&ChunkPlan>) -> String {
    let mut tracer = Tracer { var, plan, visited_at_level: HashMap::new(), output: String::new() };

    let _ = writeln!(tracer.output, "EXPLAIN '{}' = {}", var.name, var.expression);
    if let Some(plan) = plan {
        match &plan.dimension {
            Some(dim) => {
                let _ = writeln!(
                    tracer.output,
                    "chunked along '{}': {} chunk(s) of {}, {} pass(es)",
                    dim,
                    plan.chunk_count(),
                    plan.chunk_len,
                    plan.passes
                );
            }
            None => {
                let _ = writeln!(tracer.output, "not chunked");
            }
        }
    }
    let _ = writeln!(tracer.output, "--------------------------------------------------");
    if var.root.index() < var.registry.count() {
        tracer.trace_node(var.root, 1, "");
    } else {
        let _ = writeln!(tracer.output, "Error: Invalid Node ID {:?}", var.root);
    }
    tracer.output
}

struct Tracer<'a> {
    var: &'a ResolvedVariable,
    plan: Option<&'a ChunkPlan>,
    visited_at_level: HashMap<NodeId, usize>,
    output: String,
}

impl<'a> Tracer<'a> {
    fn trace_node(&mut self, node_id: NodeId, level: usize, prefix: &str) {
        if let Some(&first_seen) = self.visited_at_level.get(&node_id) {
            let _ = writeln!(self.output, "{}-> (Ref to L{})", prefix, first_seen);
            return;
        }
        self.visited_at_level.insert(node_id, level);

        let reg = &self.var.registry;
        let line_header = format!("[L{}] {}", level, self.describe(node_id));
        let annotation = match reg.annotation(node_id) {
            Some(a) => format!(" {} [{}]", a.dims, a.unit),
            None => String::new(),
        };
        let _ = writeln!(self.output, "{}{}{}{}", prefix, line_header, annotation, self.roles(node_id));

        let parents = reg.get_parents(node_id).to_vec();
        self.recurse_children(prefix, &parents, level);
    }

    fn recurse_children(&mut self, prefix: &str, children: &[NodeId], level: usize) {
        let stem = self.build_child_stem(prefix);
        for (i, &child) in children.iter().enumerate() {
            let connector = if i == children.len() - 1 { "`--" } else { "|--" };
            let full_prefix = format!("{}{}", stem, connector);
            self.trace_node(child, level + 1, &full_prefix);
        }
    }

    fn describe(&self, id: NodeId) -> String {
        match self.var.registry.kind(id) {
            NodeKind::Literal(v) => format!("{}", v.0),
            NodeKind::Operand(name) => {
                let renamed = self.var.registry.annotation(id).map(|a| &a.dims);
                match self.var.native_dims.get(name) {
                    Some(native) if Some(native) != renamed => format!("input {} read as {}", name, native),
                    _ => format!("input {}", name),
                }
            }
            NodeKind::Formula(Operation::Call { function, options }) => {
                if options.is_empty() {
                    function.clone()
                } else {
                    let opts: Vec<String> = options.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                    format!("{}({})", function, opts.join(", "))
                }
            }
            NodeKind::Formula(Operation::UnitConvert { from, to }) => format!("convert {} -> {}", from, to),
            NodeKind::Formula(Operation::Transpose { permutation }) => format!("transpose {:?}", permutation.axes()),
        }
    }

    fn roles(&self, id: NodeId) -> String {
        let Some(plan) = self.plan else { return String::new() };
        let mut tags = Vec::new();
        if plan.streamed[id.index()] {
            tags.push("streamed".to_string());
        }
        if plan.is_accumulating(id) {
            tags.push(format!("accumulates in pass {}", plan.level[id.index()] - 1));
        }
        if tags.is_empty() { String::new() } else { format!(" <{}>", tags.join(", ")) }
    }

    fn build_child_stem(&self, current_prefix: &str) -> String {
        current_prefix.replace("`--", "   ").replace("|--", "|  ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::units::LinearUnitConverter;
    use crate::config::RunConfig;
    use crate::functions::FunctionRegistry;
    use crate::graph::GraphBuilder;
    use crate::io::MemorySource;
    use crate::parse::Definitions;
    use crate::resolve::Resolver;
    use crate::standard::StandardVariable;
    use crate::store::Unit;
    use ndarray::ArrayD;
    use std::collections::BTreeMap;

    #[test]
    fn test_trace_shows_conversions_and_shared_nodes() {
        let mut src = MemorySource::new();
        src.insert("tas", &[("time", 6), ("lat", 2)], Unit::new("K"), ArrayD::zeros(vec![6, 2]));
        let functions = FunctionRegistry::with_builtins();
        let mut defs = Definitions::new();
        defs.insert("anom".into(), "tas - mean(tas, dim='time')".into());
        let graph = GraphBuilder::new(&functions, &src).build(&defs);
        let conv = LinearUnitConverter::new();
        let map = BTreeMap::new();
        let var = Resolver::new(&functions, &src, &conv, &map)
            .resolve(graph.get("anom").unwrap(), &StandardVariable::new(&["lat", "time"], "degC"))
            .unwrap();
        let cfg = RunConfig { chunk_length: Some(2), ..Default::default() };
        let plan = ChunkPlan::build(&var, &functions, &cfg).unwrap();

        let text = format_trace(&var, Some(&plan));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "EXPLAIN 'anom' = (tas - mean(tas, dim='time'))");
        assert_eq!(lines[1], "chunked along 'time': 3 chunk(s) of 2, 2 pass(es)");
        assert!(lines[3].starts_with("[L1] convert K -> degC (lat=2, time=6) [degC]"));
        assert!(text.contains("`--[L2] transpose [1, 0]"));
        assert!(text.contains("mean(dim='time') (lat=2) [K] <accumulates in pass 0>"));
        assert!(text.contains("|--[L4] input tas (time=6, lat=2) [K] <streamed>"));
        assert!(text.contains("-> (Ref to L4)"));
    }
}
