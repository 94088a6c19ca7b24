use crate::error::ConformError;
use crate::io::{InputMetadata, InputSource};
use crate::parse::Definitions;

/// What a bare identifier in a definition refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum OperandTarget {
    Input(InputMetadata),
    Definition(String),
}

/// Resolves identifiers against the input dataset first, then against the
/// other definitions.
pub struct OperandResolver<'a> {
    source: &'a dyn InputSource,
    definitions: &'a Definitions,
}

impl<'a> OperandResolver<'a> {
    pub fn new(source: &'a dyn InputSource, definitions: &'a Definitions) -> Self {
        Self { source, definitions }
    }

    pub fn resolve(&self, name: &str) -> Result<OperandTarget, ConformError> {
        if let Some(meta) = self.source.metadata(name) {
            return Ok(OperandTarget::Input(meta));
        }
        if self.definitions.contains_key(name) {
            return Ok(OperandTarget::Definition(name.to_string()));
        }
        Err(ConformError::UnresolvedReference { name: name.to_string() })
    }
}
