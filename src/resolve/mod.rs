//! Dimension and unit resolution against the standard.
pub mod checker;
pub mod rules;

pub use checker::Resolver;

use crate::parse::Expr;
use crate::standard::StandardVariable;
use crate::store::{Annotation, DimensionSignature, NodeId, Registry};
use std::collections::BTreeMap;

/// A variable whose graph is fully annotated and whose root already has the
/// required dimension order and unit.
#[derive(Debug, Clone)]
pub struct ResolvedVariable {
    pub name: String,
    pub expression: Expr,
    pub registry: Registry,
    pub root: NodeId,
    /// Input variable -> its dimensions as named in the source.
    pub native_dims: BTreeMap<String, DimensionSignature>,
    pub standard: StandardVariable,
}

impl ResolvedVariable {
    pub fn root_annotation(&self) -> Option<&Annotation> {
        self.registry.annotation(self.root)
    }
}
