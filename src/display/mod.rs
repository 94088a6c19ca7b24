//! Human-readable renderings of compiled variables.
pub mod trace;

pub use trace::format_trace;
