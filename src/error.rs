//! Error taxonomy for the conform pipeline.
//!
//! Every failure is attributed to exactly one output variable. The run itself
//! only stops on cancellation; everything else ends up in the `RunReport`.
use thiserror::Error;

/// A malformed definition string.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("syntax error at position {position}: {message} (found '{token}')")]
pub struct SyntaxError {
    pub message: String,
    /// The offending token as it appeared in the source text.
    pub token: String,
    /// Byte offset into the definition string.
    pub position: usize,
}

/// I/O failure reported by an output writer.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("writer failed for '{variable}': {message}")]
pub struct WriterError {
    pub variable: String,
    pub message: String,
}

impl WriterError {
    pub fn new(variable: impl Into<String>, message: impl Into<String>) -> Self {
        Self { variable: variable.into(), message: message.into() }
    }
}

/// Failure reported by an input source while reading a slice.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot read '{variable}': {message}")]
pub struct SourceError {
    pub variable: String,
    pub message: String,
}

impl SourceError {
    pub fn new(variable: impl Into<String>, message: impl Into<String>) -> Self {
        Self { variable: variable.into(), message: message.into() }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConformError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error("unresolved reference '{name}': not an input variable nor a definition")]
    UnresolvedReference { name: String },
    #[error("no function '{name}' accepting {arity} argument(s)")]
    UnknownFunction { name: String, arity: usize },
    #[error("cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("depends on definition '{dependency}', which failed")]
    UpstreamFailed { dependency: String },
    #[error("incompatible operands in '{function}': {reason}")]
    IncompatibleOperands { function: String, reason: String },
    #[error("dimensions {found:?} cannot be mapped onto required dimensions {required:?}")]
    DimensionMismatch { found: Vec<String>, required: Vec<String> },
    #[error("no conversion path from '{from}' to '{to}'")]
    UnconvertibleUnit { from: String, to: String },
    #[error("'{function}' is not chunk-associative and cannot be chunked along '{dimension}'")]
    NonAssociativeReduction { function: String, dimension: String },
    #[error("evaluation of chunk {chunk} failed: {reason}")]
    ChunkEvaluation { chunk: usize, reason: String },
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("output for '{variable}' already exists")]
    OutputExists { variable: String },
    #[error("run cancelled before the output was complete")]
    Cancelled,
}

impl ConformError {
    /// Stable, machine-readable name used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ConformError::Syntax(_) => "SyntaxError",
            ConformError::UnresolvedReference { .. } => "UnresolvedReferenceError",
            ConformError::UnknownFunction { .. } => "UnknownFunctionError",
            ConformError::Cycle { .. } => "CycleError",
            ConformError::UpstreamFailed { .. } => "UpstreamFailedError",
            ConformError::IncompatibleOperands { .. } => "IncompatibleOperandsError",
            ConformError::DimensionMismatch { .. } => "DimensionMismatchError",
            ConformError::UnconvertibleUnit { .. } => "UnconvertibleUnitError",
            ConformError::NonAssociativeReduction { .. } => "NonAssociativeReductionError",
            ConformError::ChunkEvaluation { .. } => "ChunkEvaluationError",
            ConformError::Writer(_) => "WriterError",
            ConformError::OutputExists { .. } => "OutputExistsError",
            ConformError::Cancelled => "Cancelled",
        }
    }

    pub(crate) fn incompatible(function: impl Into<String>, reason: impl Into<String>) -> Self {
        ConformError::IncompatibleOperands { function: function.into(), reason: reason.into() }
    }

    pub(crate) fn chunk(chunk: usize, reason: impl Into<String>) -> Self {
        ConformError::ChunkEvaluation { chunk, reason: reason.into() }
    }
}
