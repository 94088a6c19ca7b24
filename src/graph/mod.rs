//! Definition-to-graph compilation.
pub mod builder;
pub mod dag;
pub mod operand;

pub use builder::GraphBuilder;
pub use dag::{DependencyGraph, VariableGraph};
pub use operand::{OperandResolver, OperandTarget};
