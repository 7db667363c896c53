use std::fmt;
use std::path::PathBuf;

/// Why a single record was skipped while reading an event file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipReason {
    /// The underlying stream failed mid-file; nothing after it can be read.
    Unreadable,
    /// The line is not a valid frame.
    Malformed,
    /// No extractor produced a table for the record.
    Extraction,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unreadable => write!(f, "unreadable"),
            SkipReason::Malformed => write!(f, "malformed"),
            SkipReason::Extraction => write!(f, "extraction"),
        }
    }
}

/// A record that could not be read. Recovered locally by skipping it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("record {line} skipped ({reason}): {detail}")]
pub struct RecordReadError {
    pub reason: SkipReason,
    pub line: u64,
    pub detail: String,
}

impl RecordReadError {
    pub fn new(reason: SkipReason, line: u64, detail: impl Into<String>) -> Self {
        Self {
            reason,
            line,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("column `{column}` does not exist in table `{table}`")]
    ColumnMissing { table: String, column: String },
    #[error("table `{0}` does not exist in the backing store")]
    TableMissing(String),
    #[error("event {event_no} has no row in table `{table}`")]
    UnknownEvent { table: String, event_no: i64 },
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("schema violation: {0}")]
    Schema(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("{} calibration files found in {}: {candidates:?}", candidates.len(), directory.display())]
    PairingInvariant {
        directory: PathBuf,
        candidates: Vec<PathBuf>,
    },
    #[error("no event files found in {roots:?}")]
    NoInput { roots: Vec<PathBuf> },
    #[error("calibration error: {0}")]
    Calibration(String),
    #[error(transparent)]
    RecordRead(#[from] RecordReadError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "columnar")]
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[cfg(feature = "columnar")]
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl Error {
    /// True for a requested column absent from a table's schema. Callers use
    /// this to treat optional columns separately from other query failures.
    pub fn is_column_missing(&self) -> bool {
        matches!(self, Error::ColumnMissing { .. })
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
