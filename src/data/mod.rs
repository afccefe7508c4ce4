//! Record formatting and storage.

pub mod format;
pub mod storage;

pub use format::{format_record, Channel, MeasurementRecord, CHANNELS};
pub use storage::{read_metadata, read_record, record_path, CsvRecordWriter};
