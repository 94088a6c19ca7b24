//! Work dispatch, chunk coordination and run reporting.
pub mod report;
pub mod scheduler;
pub mod work;

pub use report::{RunReport, VariableStatus};
pub use scheduler::Scheduler;
pub use work::{CancelFlag, Job, WorkItem, PROVENANCE_ATTRIBUTE};
