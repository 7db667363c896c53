use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::ExtractorChain;
use crate::discovery::FilePair;
use crate::error::{RecordReadError, Result, SkipReason};
use crate::frame::{FrameSource, JsonFrameSource};
use crate::sink::Sink;
use crate::table::EventTables;

const PROGRESS_EVERY: u64 = 10_000;

/// Statistics for one or more extracted files.
#[derive(Debug, Clone, Default)]
pub struct ExtractionStats {
    pub frames_read: u64,
    pub physics_frames: u64,
    pub events_written: u64,
    pub skipped: BTreeMap<SkipReason, u64>,
    pub duration: Duration,
}

impl ExtractionStats {
    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }

    pub fn throughput(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.frames_read as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn merge(&mut self, other: &ExtractionStats) {
        self.frames_read += other.frames_read;
        self.physics_frames += other.physics_frames;
        self.events_written += other.events_written;
        for (reason, count) in &other.skipped {
            *self.skipped.entry(*reason).or_default() += count;
        }
        self.duration += other.duration;
    }

    fn record_skip(&mut self, err: &RecordReadError) {
        *self.skipped.entry(err.reason).or_default() += 1;
    }
}

/// Reads one event file at a time and feeds each physics record's tables to
/// a sink.
pub struct EventExtractionPipeline {
    extractors: ExtractorChain,
    source: Box<dyn FrameSource>,
}

impl EventExtractionPipeline {
    pub fn new(extractors: ExtractorChain) -> Self {
        Self {
            extractors,
            source: Box::new(JsonFrameSource),
        }
    }

    /// Reads event files through a different frame format.
    pub fn with_source<S: FrameSource + 'static>(mut self, source: S) -> Self {
        self.source = Box::new(source);
        self
    }

    pub fn extractors(&self) -> &ExtractorChain {
        &self.extractors
    }

    /// Extracts every physics record of `pair.event_file` into `sink`.
    ///
    /// Events are numbered from `*next_event_no` upwards; the counter is left
    /// one past the last number used. Unreadable records are skipped and
    /// counted, never fatal.
    pub fn process_file<S: Sink + ?Sized>(
        &mut self,
        pair: &FilePair,
        sink: &mut S,
        next_event_no: &mut i64,
    ) -> Result<ExtractionStats> {
        let start = Instant::now();
        let mut stats = ExtractionStats::default();

        self.extractors
            .set_files(&pair.event_file, &pair.calibration_file)?;
        let mut frames = self.source.open(&pair.event_file)?;
        debug!(
            "extracting {} with {}",
            pair.event_file.display(),
            pair.calibration_file.display()
        );

        while let Some(frame) = frames.next_frame() {
            stats.frames_read += 1;
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("{}: {err}", pair.event_file.display());
                    stats.record_skip(&err);
                    continue;
                }
            };
            if !frame.is_physics() {
                continue;
            }
            stats.physics_frames += 1;

            let tables = self.extractors.extract(&frame);
            if tables.is_empty() {
                let err = RecordReadError::new(
                    SkipReason::Extraction,
                    stats.frames_read,
                    "no extractor applies to this record",
                );
                warn!("{}: {err}", pair.event_file.display());
                stats.record_skip(&err);
                continue;
            }

            let event_no = *next_event_no;
            *next_event_no += 1;
            let event = EventTables {
                event_no,
                tables: tables.into_iter().map(|t| t.with_event_no(event_no)).collect(),
            };
            sink.save(&event)?;
            stats.events_written += 1;

            if stats.frames_read % PROGRESS_EVERY == 0 {
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    "{}: {} frames ({:.0} frames/sec)",
                    pair.event_file.display(),
                    stats.frames_read,
                    stats.frames_read as f64 / elapsed
                );
            }
        }

        stats.duration = start.elapsed();
        Ok(stats)
    }
}
