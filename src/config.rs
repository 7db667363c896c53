//! Conversion and dataset configuration.
//!
//! Both configs deserialize from JSON, with defaults for every optional
//! field, so runs can be described in a file and overridden from the CLI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::table::EVENT_NO;

/// Output backend for a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Sqlite,
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Sqlite => "db",
            OutputFormat::Parquet => "parquet",
        }
    }
}

/// Configuration for one conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Pulse series extracted into the feature table.
    /// Default: `SRTInIcePulses`
    pub pulsemap: String,

    /// Calibration file used for directories without their own.
    pub rescue_calibration: PathBuf,

    /// Output backend.
    /// Default: sqlite
    pub format: OutputFormat,

    /// Shuffle file pairs before processing.
    /// Default: false
    pub shuffle: bool,

    /// Seed for the shuffle; unseeded shuffles differ between runs.
    pub seed: Option<u64>,

    /// Number of cooperating worker processes.
    /// Default: 1
    pub workers: usize,

    /// This process's worker slot, in `0..workers`.
    /// Default: 0
    pub worker: usize,

    /// Identifier given to the first converted event.
    /// Default: 0
    pub first_event_no: i64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            pulsemap: "SRTInIcePulses".to_string(),
            rescue_calibration: PathBuf::new(),
            format: OutputFormat::Sqlite,
            shuffle: false,
            seed: None,
            workers: 1,
            worker: 0,
            first_event_no: 0,
        }
    }
}

impl ConversionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pulsemap.is_empty() {
            return Err(Error::config("pulsemap must not be empty"));
        }
        if self.workers == 0 || self.worker >= self.workers {
            return Err(Error::config(format!(
                "worker {} is not in 0..{}",
                self.worker, self.workers
            )));
        }
        Ok(())
    }
}

/// Arguments for opening a [`Dataset`](crate::dataset::Dataset).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Backing files. Parquet accepts exactly one.
    pub paths: Vec<PathBuf>,

    /// Per-hit feature table.
    pub pulsemap_table: String,

    /// Columns read from the feature table.
    pub features: Vec<String>,

    /// Per-event truth table; also the source of the index when no
    /// selection is given.
    /// Default: `truth`
    pub truth_table: String,

    /// Columns read from the truth table.
    pub truth: Vec<String>,

    /// Event identifier column shared by every table.
    /// Default: `event_no`
    pub index_column: String,

    /// Explicit event identifiers, in dataset order.
    pub selection: Option<Vec<i64>>,

    /// Optional per-hit truth table. SQLite only.
    pub node_truth_table: Option<String>,

    /// Columns read from the node-truth table.
    pub node_truth: Vec<String>,

    /// Detector strings whose hits are kept. SQLite only.
    pub string_selection: Option<Vec<i64>>,

    /// Column holding the string number in the feature table.
    /// Default: `string`
    pub string_column: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            pulsemap_table: "SRTInIcePulses".to_string(),
            features: ["dom_x", "dom_y", "dom_z", "time", "charge"]
                .into_iter()
                .map(String::from)
                .collect(),
            truth_table: "truth".to_string(),
            truth: ["energy", "position_x", "position_y", "position_z", "azimuth", "zenith", "pid"]
                .into_iter()
                .map(String::from)
                .collect(),
            index_column: EVENT_NO.to_string(),
            selection: None,
            node_truth_table: None,
            node_truth: Vec::new(),
            string_selection: None,
            string_column: "string".to_string(),
        }
    }
}

impl DatasetConfig {
    pub fn new(path: impl Into<PathBuf>, pulsemap_table: impl Into<String>) -> Self {
        Self {
            paths: vec![path.into()],
            pulsemap_table: pulsemap_table.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_features<S: Into<String>>(mut self, features: impl IntoIterator<Item = S>) -> Self {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_truth<S: Into<String>>(mut self, truth: impl IntoIterator<Item = S>) -> Self {
        self.truth = truth.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_selection(mut self, selection: Vec<i64>) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn with_node_truth<S: Into<String>>(
        mut self,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.node_truth_table = Some(table.into());
        self.node_truth = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_string_selection(mut self, strings: Vec<i64>) -> Self {
        self.string_selection = Some(strings);
        self
    }

    /// Checks that hold for every backend.
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::config("at least one dataset path is required"));
        }
        for (what, value) in [
            ("truth_table", &self.truth_table),
            ("pulsemap_table", &self.pulsemap_table),
            ("index_column", &self.index_column),
        ] {
            if value.is_empty() {
                return Err(Error::config(format!("{what} must not be empty")));
            }
        }
        if self.features.is_empty() || self.truth.is_empty() {
            return Err(Error::config("features and truth need at least one column each"));
        }
        match (&self.node_truth_table, self.node_truth.is_empty()) {
            (None, false) => Err(Error::config(
                "node_truth columns given without node_truth_table",
            )),
            (Some(table), true) => Err(Error::config(format!(
                "node_truth_table `{table}` given without columns"
            ))),
            _ => Ok(()),
        }
    }
}
