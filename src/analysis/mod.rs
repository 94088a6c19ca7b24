//! Static analysis helpers shared by the compiler stages.
pub mod topology;
pub mod units;
