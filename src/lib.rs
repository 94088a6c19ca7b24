//! Compiles variable definitions into dimension- and unit-annotated graphs
//! and evaluates them chunk by chunk into a standardized output layout.
//!
//! The pipeline runs in stages: `parse` turns definition strings into
//! expressions, `graph` links them into per-variable registries, `resolve`
//! annotates every node against the standard, `compute` plans and streams
//! chunks, and `schedule` spreads the work over a thread pool while a single
//! coordinator feeds the output writer.

pub mod analysis;
pub mod compute;
pub mod config;
pub mod conform;
pub mod display;
pub mod error;
pub mod functions;
pub mod graph;
pub mod io;
pub mod parse;
pub mod resolve;
pub mod schedule;
pub mod standard;
pub mod store;

pub use config::{OverwritePolicy, RunConfig};
pub use conform::Conformer;
pub use error::ConformError;
pub use io::{InputSource, OutputWriter};
pub use schedule::{RunReport, VariableStatus};
pub use standard::{Standard, StandardVariable};
