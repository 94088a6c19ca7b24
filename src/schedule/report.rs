use crate::error::ConformError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal state of one output variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariableStatus {
    Succeeded { chunks: usize },
    Failed { kind: String, message: String },
    Skipped { reason: String },
}

impl VariableStatus {
    pub fn failed(error: &ConformError) -> Self {
        VariableStatus::Failed { kind: error.kind().to_string(), message: error.to_string() }
    }

    pub fn is_failure(&self) -> bool { matches!(self, VariableStatus::Failed { .. }) }
}

/// Outcome of a run. Each variable is recorded exactly once; later records
/// for the same variable are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub variables: BTreeMap<String, VariableStatus>,
}

impl RunReport {
    pub fn new() -> Self { Self::default() }

    /// Returns `false` if the variable already had a status.
    pub fn record(&mut self, name: &str, status: VariableStatus) -> bool {
        if self.variables.contains_key(name) {
            return false;
        }
        self.variables.insert(name.to_string(), status);
        true
    }

    pub fn succeeded(&mut self, name: &str, chunks: usize) -> bool {
        self.record(name, VariableStatus::Succeeded { chunks })
    }

    pub fn fail(&mut self, name: &str, error: &ConformError) -> bool {
        self.record(name, VariableStatus::failed(error))
    }

    pub fn skipped(&mut self, name: &str, reason: impl Into<String>) -> bool {
        self.record(name, VariableStatus::Skipped { reason: reason.into() })
    }

    pub fn get(&self, name: &str) -> Option<&VariableStatus> { self.variables.get(name) }

    pub fn contains(&self, name: &str) -> bool { self.variables.contains_key(name) }

    pub fn has_failures(&self) -> bool { self.variables.values().any(VariableStatus::is_failure) }

    pub fn exit_code(&self) -> i32 { i32::from(self.has_failures()) }

    /// `(succeeded, failed, skipped)`
    pub fn counts(&self) -> (usize, usize, usize) {
        self.variables.values().fold((0, 0, 0), |(s, f, k), status| match status {
            VariableStatus::Succeeded { .. } => (s + 1, f, k),
            VariableStatus::Failed { .. } => (s, f + 1, k),
            VariableStatus::Skipped { .. } => (s, f, k + 1),
        })
    }

    pub fn failure_kind(&self, name: &str) -> Option<&str> {
        match self.variables.get(name)? {
            VariableStatus::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }
}
