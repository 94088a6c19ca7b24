//! Seams to the outside world: lazy input reading and chunked output writing.
pub mod jsonl;
pub mod memory;

use crate::error::{SourceError, WriterError};
use crate::store::{DimensionSignature, Unit};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use jsonl::JsonLinesWriter;
pub use memory::{MemorySource, MemoryWriter};

pub type Attributes = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMetadata {
    pub dims: DimensionSignature,
    pub unit: Unit,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Half-open range `[start, end)` along one dimension of an input variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBounds {
    pub dimension: String,
    pub start: usize,
    pub end: usize,
}

impl ChunkBounds {
    pub fn len(&self) -> usize { self.end - self.start }
    pub fn is_empty(&self) -> bool { self.end <= self.start }
}

/// Read-only access to raw input variables. Reads are lazy and side-effect free.
pub trait InputSource: Sync {
    fn names(&self) -> Vec<String>;
    fn metadata(&self, name: &str) -> Option<InputMetadata>;

    /// Reads the whole variable, or only `bounds` along the named dimension.
    /// A bound on a dimension the variable lacks reads the whole variable.
    fn read_slice(&self, name: &str, bounds: Option<&ChunkBounds>) -> Result<ArrayD<f64>, SourceError>;
}

/// Everything a writer needs to create an output variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableHeader {
    pub name: String,
    pub dims: DimensionSignature,
    pub unit: Unit,
    pub attributes: Attributes,
    /// Axis along which chunks are concatenated, if the output is chunked.
    pub chunk_dimension: Option<String>,
}

/// Destination for standardized variables. Only the coordinator calls it,
/// chunk indices arrive in increasing order.
pub trait OutputWriter {
    /// Whether a complete output for `name` is already present.
    fn exists(&self, _name: &str) -> bool {
        false
    }
    fn open(&mut self, header: &VariableHeader) -> Result<(), WriterError>;
    fn write_chunk(&mut self, name: &str, index: usize, data: &ArrayD<f64>) -> Result<(), WriterError>;
    fn close(&mut self, name: &str) -> Result<(), WriterError>;
    /// Called instead of `close` for a variable that failed after `open`.
    fn abandon(&mut self, _name: &str) -> Result<(), WriterError> {
        Ok(())
    }
}
