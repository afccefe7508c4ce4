//! CSV persistence for per-source measurement records.
//!
//! Layout of `{dir}/{run_name}_{label}.csv`:
//!
//! ```text
//! # {
//! #   "run_name": "RFTtest",
//! #   ...
//! # }
//! voltage,current,resistance,time,status
//! 0.5,1.2e-6,416666.6,0.31,19400
//! ```
//!
//! Rows are appended as each combination completes and the file is flushed
//! every time, so an aborted run keeps everything measured before the failure.

use crate::{
    data::format::{Channel, MeasurementRecord},
    error::{AppResult, SweepError},
    metadata::RunMetadata,
};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Path of the CSV holding `label`'s samples for `run_name`.
pub fn record_path(dir: &Path, run_name: &str, label: &str) -> PathBuf {
    dir.join(format!("{}_{}.csv", run_name, label))
}

/// Append-only CSV writer for one bias source.
pub struct CsvRecordWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows_written: usize,
}

impl CsvRecordWriter {
    /// Creates (truncating) the CSV for `metadata.source_label` in `dir` and
    /// writes the metadata block and column header.
    pub fn create(dir: &Path, metadata: &RunMetadata) -> AppResult<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        let path = record_path(dir, &metadata.run_name, &metadata.source_label);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let json_string = serde_json::to_string_pretty(metadata)?;
        for line in json_string.lines() {
            file.write_all(b"# ")
                .and_then(|_| file.write_all(line.as_bytes()))
                .and_then(|_| file.write_all(b"\n"))?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(Channel::ALL.map(Channel::name))?;
        writer.flush()?;

        info!(path = %path.display(), "Saving {} data", metadata.source_label);
        Ok(Self {
            path,
            writer,
            rows_written: 0,
        })
    }

    /// Appends every sample of `record` and flushes.
    pub fn append(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        for row in record.rows() {
            self.writer.write_record(row.map(|v| v.to_string()))?;
        }
        self.writer.flush()?;
        self.rows_written += record.len();
        Ok(())
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples written so far.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }
}

/// Reads the samples of a CSV written by [`CsvRecordWriter`].
pub fn read_record(path: &Path) -> AppResult<MeasurementRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .has_headers(true)
        .from_path(path)?;

    let mut record = MeasurementRecord::new();
    for row in reader.deserialize() {
        let (v, i, r, t, s): (f64, f64, f64, f64, f64) = row?;
        record.push_row([v, i, r, t, s]);
    }
    Ok(record)
}

/// Reads the metadata block at the top of a CSV written by [`CsvRecordWriter`].
pub fn read_metadata(path: &Path) -> AppResult<RunMetadata> {
    let reader = BufReader::new(File::open(path)?);
    let mut json = String::new();
    for line in reader.lines() {
        let line = line?;
        match line.strip_prefix("# ") {
            Some(body) => {
                json.push_str(body);
                json.push('\n');
            }
            None => break,
        }
    }
    if json.is_empty() {
        return Err(SweepError::Configuration(format!(
            "no metadata header in {}",
            path.display()
        )));
    }
    Ok(serde_json::from_str(&json)?)
}
