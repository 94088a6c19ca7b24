//! In-memory source and writer, used for embedding and in tests.
use super::{Attributes, ChunkBounds, InputMetadata, InputSource, OutputWriter, VariableHeader};
use crate::error::{SourceError, WriterError};
use crate::store::{DimensionSignature, Unit};
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

/// One variable of a JSON dataset file.
#[derive(Debug, Deserialize)]
struct DatasetVariable {
    dimensions: Vec<String>,
    units: String,
    values: Vec<f64>,
    #[serde(default)]
    shape: Option<Vec<usize>>,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct Dataset {
    variables: BTreeMap<String, DatasetVariable>,
}

/// Input variables held as dense arrays.
///
/// Every `read_slice` call is recorded so callers can observe the access
/// pattern of a run.
#[derive(Debug, Default)]
pub struct MemorySource {
    variables: BTreeMap<String, (InputMetadata, ArrayD<f64>)>,
    reads: Mutex<Vec<(String, Option<ChunkBounds>)>>,
}

impl MemorySource {
    pub fn new() -> Self { Self::default() }

    /// Adds a variable. Dimension lengths are taken from `dims`; `data` must match them.
    pub fn insert(&mut self, name: &str, dims: &[(&str, usize)], unit: Unit, data: ArrayD<f64>) {
        let meta = InputMetadata { dims: DimensionSignature::from_sized(dims), unit, attributes: Attributes::new() };
        self.variables.insert(name.to_string(), (meta, data));
    }

    /// Parses `{"variables": {name: {dimensions, units, values, shape?, attributes?}}}`.
    /// Without `shape` a variable must be one-dimensional.
    pub fn from_json(text: &str) -> Result<Self, SourceError> {
        let dataset: Dataset = serde_json::from_str(text).map_err(|e| SourceError::new("<dataset>", e.to_string()))?;
        let mut source = Self::new();
        for (name, var) in dataset.variables {
            let shape = var.shape.unwrap_or_else(|| vec![var.values.len()]);
            if shape.len() != var.dimensions.len() {
                return Err(SourceError::new(
                    &name,
                    format!("{} dimensions but shape {:?}", var.dimensions.len(), shape),
                ));
            }
            let data = ArrayD::from_shape_vec(IxDyn(&shape), var.values).map_err(|e| SourceError::new(&name, e.to_string()))?;
            let dims: Vec<(&str, usize)> = var.dimensions.iter().map(String::as_str).zip(shape.iter().copied()).collect();
            let meta = InputMetadata {
                dims: DimensionSignature::from_sized(&dims),
                unit: Unit::new(var.units),
                attributes: var.attributes,
            };
            source.variables.insert(name, (meta, data));
        }
        Ok(source)
    }

    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let text = std::fs::read_to_string(path).map_err(|e| SourceError::new(path.display().to_string(), e.to_string()))?;
        Self::from_json(&text)
    }

    /// Every read so far, in call order.
    pub fn reads(&self) -> Vec<(String, Option<ChunkBounds>)> {
        self.reads.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

impl InputSource for MemorySource {
    fn names(&self) -> Vec<String> { self.variables.keys().cloned().collect() }

    fn metadata(&self, name: &str) -> Option<InputMetadata> {
        self.variables.get(name).map(|(meta, _)| meta.clone())
    }

    fn read_slice(&self, name: &str, bounds: Option<&ChunkBounds>) -> Result<ArrayD<f64>, SourceError> {
        if let Ok(mut log) = self.reads.lock() {
            log.push((name.to_string(), bounds.cloned()));
        }
        let (meta, data) = self.variables.get(name).ok_or_else(|| SourceError::new(name, "no such variable"))?;
        let Some(b) = bounds else { return Ok(data.clone()) };
        let Some(axis) = meta.dims.position(&b.dimension) else { return Ok(data.clone()) };
        let len = data.len_of(Axis(axis));
        if b.start > b.end || b.end > len {
            return Err(SourceError::new(
                name,
                format!("slice {}..{} out of range for '{}' of length {}", b.start, b.end, b.dimension, len),
            ));
        }
        Ok(data.slice_axis(Axis(axis), Slice::from(b.start..b.end)).to_owned())
    }
}

/// A variable assembled by `MemoryWriter::close`.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenVariable {
    pub header: VariableHeader,
    pub data: ArrayD<f64>,
    pub chunks: usize,
}

/// Collects written variables in memory. Failures can be injected per
/// variable to exercise retry and isolation paths.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    pending: BTreeMap<String, (VariableHeader, Vec<ArrayD<f64>>)>,
    finished: BTreeMap<String, WrittenVariable>,
    existing: BTreeSet<String>,
    failing_writes: BTreeMap<String, u32>,
    abandoned: Vec<String>,
    events: Vec<String>,
}

impl MemoryWriter {
    pub fn new() -> Self { Self::default() }

    /// Pretends a complete output for `name` is already present.
    pub fn mark_existing(&mut self, name: &str) {
        self.existing.insert(name.to_string());
    }

    /// The next `times` calls to `write_chunk` for `name` fail.
    pub fn fail_writes(&mut self, name: &str, times: u32) {
        self.failing_writes.insert(name.to_string(), times);
    }

    pub fn get(&self, name: &str) -> Option<&WrittenVariable> { self.finished.get(name) }

    pub fn names(&self) -> Vec<&str> { self.finished.keys().map(String::as_str).collect() }

    pub fn abandoned(&self) -> &[String] { &self.abandoned }

    /// `open`/`chunk`/`close`/`abandon` calls in the order received.
    pub fn events(&self) -> &[String] { &self.events }
}

impl OutputWriter for MemoryWriter {
    fn exists(&self, name: &str) -> bool {
        self.existing.contains(name) || self.finished.contains_key(name)
    }

    fn open(&mut self, header: &VariableHeader) -> Result<(), WriterError> {
        self.events.push(format!("open {}", header.name));
        self.pending.insert(header.name.clone(), (header.clone(), Vec::new()));
        Ok(())
    }

    fn write_chunk(&mut self, name: &str, index: usize, data: &ArrayD<f64>) -> Result<(), WriterError> {
        if let Some(left) = self.failing_writes.get_mut(name).filter(|n| **n > 0) {
            *left -= 1;
            return Err(WriterError::new(name, "injected write failure"));
        }
        let (_, chunks) = self.pending.get_mut(name).ok_or_else(|| WriterError::new(name, "variable is not open"))?;
        if index != chunks.len() {
            return Err(WriterError::new(name, format!("chunk {} arrived, expected {}", index, chunks.len())));
        }
        chunks.push(data.clone());
        self.events.push(format!("chunk {} {}", name, index));
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<(), WriterError> {
        let (header, mut chunks) =
            self.pending.remove(name).ok_or_else(|| WriterError::new(name, "variable is not open"))?;
        let count = chunks.len();
        let axis = header.chunk_dimension.as_deref().and_then(|d| header.dims.position(d));
        let data = match (axis, count) {
            (_, 0) => return Err(WriterError::new(name, "no chunks written")),
            (None, 1) => chunks.pop().ok_or_else(|| WriterError::new(name, "no chunks written"))?,
            (None, n) => return Err(WriterError::new(name, format!("{} chunks without a chunk dimension", n))),
            (Some(axis), _) => {
                let views: Vec<ArrayViewD<f64>> = chunks.iter().map(|c| c.view()).collect();
                concatenate(Axis(axis), &views).map_err(|e| WriterError::new(name, e.to_string()))?
            }
        };
        self.events.push(format!("close {}", name));
        self.finished.insert(name.to_string(), WrittenVariable { header, data, chunks: count });
        Ok(())
    }

    fn abandon(&mut self, name: &str) -> Result<(), WriterError> {
        self.pending.remove(name);
        self.abandoned.push(name.to_string());
        self.events.push(format!("abandon {}", name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn header(name: &str, chunked: bool) -> VariableHeader {
        VariableHeader {
            name: name.into(),
            dims: DimensionSignature::from_names(&["time", "lat"]),
            unit: Unit::new("K"),
            attributes: Attributes::new(),
            chunk_dimension: chunked.then(|| "time".to_string()),
        }
    }

    #[test]
    fn test_read_slice_along_named_dimension() {
        let mut src = MemorySource::new();
        src.insert("tas", &[("t", 3), ("lat", 2)], Unit::new("K"), arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn());
        let b = ChunkBounds { dimension: "t".into(), start: 1, end: 3 };
        assert_eq!(src.read_slice("tas", Some(&b)).unwrap(), arr2(&[[3.0, 4.0], [5.0, 6.0]]).into_dyn());

        // A dimension the variable lacks reads everything.
        let other = ChunkBounds { dimension: "lev".into(), start: 0, end: 1 };
        assert_eq!(src.read_slice("tas", Some(&other)).unwrap().shape(), &[3, 2]);

        let bad = ChunkBounds { dimension: "t".into(), start: 2, end: 5 };
        assert!(src.read_slice("tas", Some(&bad)).is_err());
        assert_eq!(src.reads().len(), 3);
    }

    #[test]
    fn test_dataset_json() {
        let src = MemorySource::from_json(
            r#"{"variables": {
                "tas": {"dimensions": ["time", "lat"], "units": "K", "shape": [2, 2], "values": [1, 2, 3, 4]},
                "orog": {"dimensions": ["lat"], "units": "m", "values": [10, 20], "attributes": {"long_name": "height"}}
            }}"#,
        )
        .unwrap();
        assert_eq!(src.names(), vec!["orog".to_string(), "tas".to_string()]);
        let meta = src.metadata("tas").unwrap();
        assert_eq!(meta.dims, DimensionSignature::from_sized(&[("time", 2), ("lat", 2)]));
        assert_eq!(src.metadata("orog").unwrap().attributes["long_name"], "height");

        let mismatch = r#"{"variables": {"x": {"dimensions": ["a"], "units": "1", "shape": [2, 2], "values": [1, 2, 3, 4]}}}"#;
        assert!(MemorySource::from_json(mismatch).is_err());
    }

    #[test]
    fn test_writer_concatenates_chunks() {
        let mut w = MemoryWriter::new();
        w.open(&header("tas", true)).unwrap();
        w.write_chunk("tas", 0, &arr2(&[[1.0, 2.0]]).into_dyn()).unwrap();
        w.write_chunk("tas", 1, &arr2(&[[3.0, 4.0], [5.0, 6.0]]).into_dyn()).unwrap();
        w.close("tas").unwrap();
        let out = w.get("tas").unwrap();
        assert_eq!(out.chunks, 2);
        assert_eq!(out.data, arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn());
        assert!(w.exists("tas"));
    }

    #[test]
    fn test_writer_rejects_out_of_order_and_injects_failures() {
        let mut w = MemoryWriter::new();
        w.open(&header("tas", true)).unwrap();
        assert!(w.write_chunk("tas", 1, &arr1(&[1.0]).into_dyn()).is_err());

        w.fail_writes("tas", 1);
        let chunk = arr2(&[[1.0, 2.0]]).into_dyn();
        assert!(w.write_chunk("tas", 0, &chunk).is_err());
        assert!(w.write_chunk("tas", 0, &chunk).is_ok());

        w.abandon("tas").unwrap();
        assert_eq!(w.abandoned(), ["tas".to_string()]);
        assert!(w.get("tas").is_none());
    }
}
