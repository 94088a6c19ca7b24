use crate::io::Attributes;
use crate::store::{DimensionSignature, Unit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandardError {
    #[error("failed to read standard: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid standard JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Required layout of one output variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardVariable {
    /// Dimension names in required order.
    pub dimensions: Vec<String>,
    pub units: Unit,
    #[serde(default)]
    pub attributes: Attributes,
}

impl StandardVariable {
    pub fn new(dimensions: &[&str], units: &str) -> Self {
        Self {
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            units: Unit::new(units),
            attributes: Attributes::new(),
        }
    }

    pub fn signature(&self) -> DimensionSignature {
        DimensionSignature::from_names(&self.dimensions)
    }

    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(|v| v.as_f64())
    }
}

/// The catalog of output variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Standard {
    pub variables: BTreeMap<String, StandardVariable>,
}

impl Standard {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, name: &str, var: StandardVariable) {
        self.variables.insert(name.to_string(), var);
    }

    pub fn get(&self, name: &str) -> Option<&StandardVariable> { self.variables.get(name) }

    pub fn names(&self) -> impl Iterator<Item = &String> { self.variables.keys() }

    /// Accepts either `{"variables": {...}}` or a bare `{name: {...}}` map.
    pub fn from_json(text: &str) -> Result<Self, StandardError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("variables").is_some() {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(Self { variables: serde_json::from_value(value)? })
        }
    }

    pub fn load(path: &Path) -> Result<Self, StandardError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
