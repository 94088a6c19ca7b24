//! Line-delimited JSON output, one file per variable.
//!
//! A variable is streamed into `<name>.jsonl.partial` and renamed to
//! `<name>.jsonl` on close, so a complete file is never half-written.
//! Abandoned variables keep their partial file for inspection.
use super::{OutputWriter, VariableHeader};
use crate::error::WriterError;
use ndarray::ArrayD;
use serde_json::json;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct JsonLinesWriter {
    dir: PathBuf,
    open: HashMap<String, BufWriter<File>>,
}

impl JsonLinesWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, WriterError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| WriterError::new(dir.display().to_string(), e.to_string()))?;
        Ok(Self { dir, open: HashMap::new() })
    }

    pub fn final_path(&self, name: &str) -> PathBuf { self.dir.join(format!("{}.jsonl", name)) }

    pub fn partial_path(&self, name: &str) -> PathBuf { self.dir.join(format!("{}.jsonl.partial", name)) }

    fn line(&mut self, name: &str, value: serde_json::Value) -> Result<(), WriterError> {
        let file = self.open.get_mut(name).ok_or_else(|| WriterError::new(name, "variable is not open"))?;
        append_record(file, &value).map_err(|e| WriterError::new(name, e.to_string()))
    }
}

/// Writes `value` and its newline with a single `write_all`, so a record is
/// either handed to `out` whole or not at all.
fn append_record(out: &mut impl Write, value: &serde_json::Value) -> std::io::Result<()> {
    let mut record = serde_json::to_vec(value)?;
    record.push(b'\n');
    out.write_all(&record)
}

fn io_err(name: &str, path: &Path, e: std::io::Error) -> WriterError {
    WriterError::new(name, format!("{}: {}", path.display(), e))
}

impl OutputWriter for JsonLinesWriter {
    fn exists(&self, name: &str) -> bool { self.final_path(name).exists() }

    fn open(&mut self, header: &VariableHeader) -> Result<(), WriterError> {
        let path = self.partial_path(&header.name);
        let file = File::create(&path).map_err(|e| io_err(&header.name, &path, e))?;
        self.open.insert(header.name.clone(), BufWriter::new(file));
        self.line(&header.name, json!({ "header": header }))
    }

    fn write_chunk(&mut self, name: &str, index: usize, data: &ArrayD<f64>) -> Result<(), WriterError> {
        let values: Vec<f64> = data.iter().copied().collect();
        self.line(name, json!({ "chunk": index, "shape": data.shape(), "values": values }))
    }

    // The handle stays registered until the rename succeeds, so a failed
    // close can be retried.
    fn close(&mut self, name: &str) -> Result<(), WriterError> {
        let partial = self.partial_path(name);
        let final_path = self.final_path(name);
        let file = self.open.get_mut(name).ok_or_else(|| WriterError::new(name, "variable is not open"))?;
        file.flush().map_err(|e| io_err(name, &partial, e))?;
        fs::rename(&partial, &final_path).map_err(|e| io_err(name, &partial, e))?;
        self.open.remove(name);
        Ok(())
    }

    fn abandon(&mut self, name: &str) -> Result<(), WriterError> {
        if let Some(mut file) = self.open.remove(name) {
            file.flush().map_err(|e| io_err(name, &self.partial_path(name), e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Attributes;
    use crate::store::{DimensionSignature, Unit};
    use ndarray::arr2;

    fn header(name: &str) -> VariableHeader {
        VariableHeader {
            name: name.into(),
            dims: DimensionSignature::from_names(&["time", "lat"]),
            unit: Unit::new("degC"),
            attributes: Attributes::new(),
            chunk_dimension: Some("time".into()),
        }
    }

    #[test]
    fn test_close_renames_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = JsonLinesWriter::new(dir.path()).unwrap();
        w.open(&header("tas")).unwrap();
        w.write_chunk("tas", 0, &arr2(&[[1.0, 2.0]]).into_dyn()).unwrap();
        assert!(w.partial_path("tas").exists());
        assert!(!w.exists("tas"));
        w.close("tas").unwrap();

        assert!(w.exists("tas"));
        assert!(!w.partial_path("tas").exists());
        let text = fs::read_to_string(w.final_path("tas")).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["header"]["unit"], "degC");
        assert_eq!(lines[1]["chunk"], 0);
        assert_eq!(lines[1]["values"], json!([1.0, 2.0]));
    }

    #[test]
    fn test_abandon_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = JsonLinesWriter::new(dir.path().join("out")).unwrap();
        w.open(&header("pr")).unwrap();
        w.abandon("pr").unwrap();
        assert!(w.partial_path("pr").exists());
        assert!(!w.exists("pr"));
        assert!(w.write_chunk("pr", 0, &arr2(&[[1.0]]).into_dyn()).is_err());
    }

    #[test]
    fn test_failed_close_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = JsonLinesWriter::new(dir.path()).unwrap();
        w.open(&header("tas")).unwrap();
        w.write_chunk("tas", 0, &arr2(&[[1.0, 2.0]]).into_dyn()).unwrap();

        // A directory in the way makes the rename fail.
        fs::create_dir(w.final_path("tas")).unwrap();
        let err = w.close("tas").unwrap_err();
        assert!(err.message.contains("tas.jsonl.partial"), "{}", err.message);

        fs::remove_dir(w.final_path("tas")).unwrap();
        w.close("tas").unwrap();
        let text = fs::read_to_string(w.final_path("tas")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    /// Rejects the first `failures` writes without consuming any bytes.
    struct Refusing {
        failures: usize,
        written: Vec<u8>,
    }

    impl Write for Refusing {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "device busy"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
    }

    #[test]
    fn test_retried_record_is_written_once() {
        let mut out = Refusing { failures: 1, written: Vec::new() };
        let record = json!({ "chunk": 3, "shape": [1, 2], "values": [1.5, 2.5] });
        assert!(append_record(&mut out, &record).is_err());
        append_record(&mut out, &record).unwrap();

        let text = String::from_utf8(out.written).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(serde_json::from_str::<serde_json::Value>(lines[0]).unwrap(), record);
        assert!(text.ends_with('\n'));
    }
}
