//! Compiled definitions: one private operation graph per output variable plus
//! the variable-level dependency structure between definitions.

use crate::error::ConformError;
use crate::parse::Expr;
use crate::store::{NodeId, Registry};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};

/// A single output variable compiled into its own registry. Definitions it
/// references are inlined, so nothing is shared with other variables.
#[derive(Debug, Clone)]
pub struct VariableGraph {
    pub name: String,
    pub expression: Expr,
    pub registry: Registry,
    pub root: NodeId,
}

impl VariableGraph {
    /// Raw input variables this output reads, directly or through inlined
    /// definitions.
    pub fn inputs(&self) -> Vec<String> {
        self.registry.operands(self.root)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub variables: BTreeMap<String, VariableGraph>,
    pub failures: BTreeMap<String, ConformError>,
    /// Definitions, dependencies first. Variables on a cycle are left out.
    pub order: Vec<String>,
    pub(crate) graph: DiGraph<String, ()>,
    pub(crate) index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn get(&self, name: &str) -> Option<&VariableGraph> { self.variables.get(name) }

    pub fn failure(&self, name: &str) -> Option<&ConformError> { self.failures.get(name) }

    /// Definitions referenced directly by `name`'s expression.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Definitions whose expressions reference `name`.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<String> {
        let Some(&idx) = self.index.get(name) else { return Vec::new() };
        let mut out: Vec<String> = self.graph.neighbors_directed(idx, dir).map(|n| self.graph[n].clone()).collect();
        out.sort();
        out.dedup();
        out
    }
}
