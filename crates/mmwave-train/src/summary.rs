//! Append-only scalar summary stream.
//!
//! Every scalar becomes one JSON line in `<dir>/scalars.jsonl`:
//!
//! ```text
//! {"tag":"source_train_acc","step":5,"value":0.91,"wall_time":1760000000.12}
//! ```
//!
//! Existing files are appended to, never truncated.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{TrainError, TrainResult};

/// File name of the stream inside the summary directory.
pub const SCALARS_FILE: &str = "scalars.jsonl";

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Scalar name.
    pub tag: String,
    /// Epoch the value belongs to.
    pub step: u64,
    /// Logged value.
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

/// Writer for the scalar stream.
#[derive(Debug)]
pub struct ScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ScalarWriter {
    /// Open (or create) `<dir>/scalars.jsonl` for appending.
    pub fn create(dir: &Path) -> TrainResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;
        let path = dir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrainError::io(&path, e))?;
        Ok(ScalarWriter { path, out: BufWriter::new(file) })
    }

    /// Path of the JSON-lines file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one scalar and flush.
    pub fn scalar(&mut self, tag: &str, value: f64, step: u64) -> TrainResult<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let record = ScalarRecord { tag: tag.to_string(), step, value, wall_time };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out
            .write_all(b"\n")
            .and_then(|_| self.out.flush())
            .map_err(|e| TrainError::io(&self.path, e))
    }
}

/// Read every record of a scalar stream file.
pub fn read_scalars(path: &Path) -> TrainResult<Vec<ScalarRecord>> {
    let file = File::open(path).map_err(|e| TrainError::io(path, e))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| TrainError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_are_appended_across_writers() {
        let tmp = tempdir().unwrap();
        {
            let mut w = ScalarWriter::create(tmp.path()).unwrap();
            w.scalar("val", 0.5, 0).unwrap();
        }
        {
            let mut w = ScalarWriter::create(tmp.path()).unwrap();
            w.scalar("val", 0.75, 5).unwrap();
            w.scalar("source_train_acc", 0.9, 5).unwrap();
        }
        let records = read_scalars(&tmp.path().join(SCALARS_FILE)).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].tag, "val");
        assert_eq!(records[1].step, 5);
        assert_eq!(records[2].value, 0.9);
        assert!(records[2].wall_time > 0.0);
    }
}
