//! Destinations for extracted event tables.

#[cfg(feature = "columnar")]
pub mod parquet;
pub mod sqlite;

use std::path::Path;

use crate::error::Result;
use crate::table::EventTables;

#[cfg(feature = "columnar")]
pub use self::parquet::ParquetSink;
pub use self::sqlite::SqliteSink;

/// Persists the tables of each event into one output target.
///
/// The orchestrator calls `initialize` once, `save` per event, and
/// `finalize` once after the last file.
pub trait Sink {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn save(&mut self, event: &EventTables) -> Result<()>;

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Where the output lands; for logs and reports.
    fn destination(&self) -> &Path;
}

/// Sink that collects events in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    events: Vec<EventTables>,
    initialized: bool,
    finalized: bool,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[EventTables] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EventTables> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl Sink for VecSink {
    fn initialize(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn save(&mut self, event: &EventTables) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.finalized = true;
        Ok(())
    }

    fn destination(&self) -> &Path {
        Path::new("<memory>")
    }
}
