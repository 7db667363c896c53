//! Detector event conversion and indexed dataset access.
//!
//! Event files are paired with their calibration file, every physics record
//! is run through a chain of extractors, and the resulting tables are written
//! to SQLite or Parquet. A [`Dataset`] then reads them back by sequential
//! index for training pipelines.

pub mod calibration;
pub mod config;
pub mod convert;
pub mod dataset;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod frame;
pub mod selection;
pub mod sink;
pub mod table;

pub use config::{ConversionConfig, DatasetConfig, OutputFormat};
pub use convert::{ConversionOrchestrator, ConversionReport};
pub use dataset::{Dataset, EventKey, EventSample, TableRows};
pub use discovery::{find_event_files, FilePair, FilePairs};
pub use error::{Error, Result};
pub use sink::Sink;
pub use table::{Column, ExtractedTable, Value};
