use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What to do when an output variable already exists at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    #[default]
    Replace,
    Skip,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Per-worker bound on a chunk's largest intermediate, in bytes.
    pub memory_budget_bytes: usize,
    /// Fixed chunk length; overrides the budget when set.
    pub chunk_length: Option<usize>,
    /// Preferred chunking dimensions, first match wins.
    pub chunk_dimensions: Vec<String>,
    pub workers: usize,
    /// Split a variable into per-chunk work items once it has this many
    /// independent chunks. `None` never splits.
    pub chunk_granularity_threshold: Option<usize>,
    /// Restrict the run to these output variables.
    pub variables: Option<Vec<String>>,
    pub overwrite: OverwritePolicy,
    pub writer_retries: u32,
    /// Input dimension name -> output dimension name.
    pub dimension_map: BTreeMap<String, String>,
    /// Record the parsed definition in each output's attributes.
    pub provenance: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * 1024 * 1024,
            chunk_length: None,
            chunk_dimensions: vec!["time".to_string()],
            workers: 1,
            chunk_granularity_threshold: None,
            variables: None,
            overwrite: OverwritePolicy::Replace,
            writer_retries: 3,
            dimension_map: BTreeMap::new(),
            provenance: false,
        }
    }
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_budget_bytes == 0 {
            return Err(ConfigError::Invalid("memory_budget_bytes must be positive".into()));
        }
        if self.chunk_length == Some(0) {
            return Err(ConfigError::Invalid("chunk_length must be positive".into()));
        }
        if self.chunk_granularity_threshold == Some(0) {
            return Err(ConfigError::Invalid("chunk_granularity_threshold must be positive".into()));
        }
        Ok(())
    }
}
