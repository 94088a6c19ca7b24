//! Chunk planning and streaming evaluation.
pub mod checks;
pub mod engine;
pub mod kernel;
pub mod ledger;
pub mod plan;

pub use engine::Engine;
pub use ledger::ChunkLedger;
pub use plan::ChunkPlan;
