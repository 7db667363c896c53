//! Per-record table extraction.
//!
//! An [`Extractor`] turns one physics frame into one named table. The
//! [`ExtractorChain`] runs its extractors in registration order and collects
//! whatever tables apply to the frame.

pub mod extractors;
pub mod pipeline;

use std::path::Path;

use crate::calibration::Calibration;
use crate::error::Result;
use crate::frame::Frame;
use crate::table::ExtractedTable;

pub use extractors::{FeatureExtractor, RetroExtractor, TruthExtractor};
pub use pipeline::{EventExtractionPipeline, ExtractionStats};

pub trait Extractor {
    /// Name of the table this extractor produces.
    fn name(&self) -> &str;

    /// Called once per event file, before any of its records.
    fn set_files(&mut self, _event_file: &Path, _calibration_file: &Path) {}

    /// Table for this record, or `None` when the extractor does not apply.
    fn extract(&mut self, frame: &Frame, calibration: &Calibration) -> Option<ExtractedTable>;
}

/// Ordered registry of extractors sharing one calibration context.
pub struct ExtractorChain {
    extractors: Vec<Box<dyn Extractor>>,
    calibration: Calibration,
}

impl ExtractorChain {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
            calibration: Calibration::default(),
        }
    }

    /// Truth, pulse features for `pulsemap`, and reconstruction tables.
    pub fn standard(pulsemap: &str) -> Self {
        Self::new()
            .add(TruthExtractor::default())
            .add(FeatureExtractor::new(pulsemap))
            .add(RetroExtractor::default())
    }

    pub fn add<E: Extractor + 'static>(mut self, extractor: E) -> Self {
        self.extractors.push(Box::new(extractor));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Loads the calibration file and hands both paths to every extractor.
    pub fn set_files(&mut self, event_file: &Path, calibration_file: &Path) -> Result<()> {
        let calibration = Calibration::load(calibration_file)?;
        self.set_calibration(event_file, calibration);
        Ok(())
    }

    /// Same as [`set_files`](Self::set_files) with an already loaded context.
    pub fn set_calibration(&mut self, event_file: &Path, calibration: Calibration) {
        for extractor in &mut self.extractors {
            extractor.set_files(event_file, calibration.path());
        }
        self.calibration = calibration;
    }

    pub fn extract(&mut self, frame: &Frame) -> Vec<ExtractedTable> {
        let calibration = &self.calibration;
        self.extractors
            .iter_mut()
            .filter_map(|e| e.extract(frame, calibration))
            .collect()
    }
}

impl Default for ExtractorChain {
    fn default() -> Self {
        Self::new()
    }
}
