//! Conversion driver: discovery, extraction, persistence.

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ConversionConfig;
use crate::discovery::{find_event_files, FilePairs};
use crate::error::{Error, Result};
use crate::extract::{EventExtractionPipeline, ExtractionStats, ExtractorChain};
use crate::sink::Sink;

/// Summary of one conversion run.
#[derive(Debug, Clone, Default)]
pub struct ConversionReport {
    pub files_discovered: usize,
    pub files_processed: usize,
    pub destination: PathBuf,
    pub stats: ExtractionStats,
    /// Identifier the next run should start from to keep ids unique.
    pub next_event_no: i64,
}

/// Walks event files, runs the extraction pipeline on each and streams the
/// results into one sink. The sink's storage format is opaque here.
pub struct ConversionOrchestrator<S: Sink> {
    config: ConversionConfig,
    pipeline: EventExtractionPipeline,
    sink: S,
}

impl<S: Sink> ConversionOrchestrator<S> {
    /// Standard extractors for `config.pulsemap`.
    pub fn new(config: ConversionConfig, sink: S) -> Self {
        let pipeline = EventExtractionPipeline::new(ExtractorChain::standard(&config.pulsemap));
        Self::with_pipeline(config, pipeline, sink)
    }

    pub fn with_pipeline(
        config: ConversionConfig,
        pipeline: EventExtractionPipeline,
        sink: S,
    ) -> Self {
        Self {
            config,
            pipeline,
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Discovers files under `roots` and converts this worker's share.
    ///
    /// Zero discovered files is reported as [`Error::NoInput`] without
    /// touching the sink.
    pub fn run<P: AsRef<Path>>(&mut self, roots: &[P]) -> Result<ConversionReport> {
        self.config.validate()?;
        let pairs = find_event_files(roots, &self.config.rescue_calibration)?;
        if pairs.is_empty() {
            let roots: Vec<PathBuf> = roots.iter().map(|r| r.as_ref().to_path_buf()).collect();
            error!("no event files found in {roots:?}");
            return Err(Error::NoInput { roots });
        }
        self.run_pairs(pairs)
    }

    /// Converts already discovered pairs, applying the configured shuffle
    /// and worker share.
    pub fn run_pairs(&mut self, mut pairs: FilePairs) -> Result<ConversionReport> {
        self.config.validate()?;
        let start = Instant::now();
        let files_discovered = pairs.len();

        if self.config.shuffle {
            match self.config.seed {
                Some(seed) => pairs.shuffle(&mut StdRng::seed_from_u64(seed)),
                None => pairs.shuffle(&mut rand::rng()),
            }
        }
        let share = pairs.worker_share(self.config.worker, self.config.workers)?;
        info!(
            "worker {}/{}: converting {} of {} files into {}",
            self.config.worker,
            self.config.workers,
            share.len(),
            files_discovered,
            self.sink.destination().display()
        );

        let mut report = ConversionReport {
            files_discovered,
            destination: self.sink.destination().to_path_buf(),
            ..ConversionReport::default()
        };
        let mut next_event_no = self.config.first_event_no;

        self.sink.initialize()?;
        for pair in &share {
            let stats = self
                .pipeline
                .process_file(pair, &mut self.sink, &mut next_event_no)?;
            info!(
                "{}: {} events, {} skipped records",
                pair.event_file.display(),
                stats.events_written,
                stats.skipped_total()
            );
            report.stats.merge(&stats);
            report.files_processed += 1;
        }
        self.sink.finalize()?;

        report.next_event_no = next_event_no;
        report.stats.duration = start.elapsed();
        info!(
            "converted {} files, {} events in {:.1}s",
            report.files_processed,
            report.stats.events_written,
            report.stats.duration.as_secs_f64()
        );
        Ok(report)
    }
}
