use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use pulsegraph::selection::{
    balanced_neutrino_indices, balanced_signal_background_indices, TruthLabels,
};
use pulsegraph::sink::SqliteSink;
use pulsegraph::{
    ConversionConfig, ConversionOrchestrator, ConversionReport, Dataset, DatasetConfig,
    OutputFormat, Sink,
};

#[derive(Parser)]
#[command(name = "pulsegraph")]
#[command(about = "Convert detector event files and read them back as datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert event files under one or more directories
    Convert {
        /// Directories searched recursively for event files
        #[arg(long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Output directory
        #[arg(long)]
        outdir: PathBuf,

        /// Output file name without extension
        #[arg(long, default_value = "events")]
        name: String,

        /// JSON conversion config; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        /// Pulse series to extract
        #[arg(long)]
        pulsemap: Option<String>,

        /// Calibration file for directories without one
        #[arg(long)]
        rescue_calibration: Option<PathBuf>,

        /// Shuffle file pairs before splitting them between workers
        #[arg(long)]
        shuffle: bool,

        #[arg(long)]
        seed: Option<u64>,

        /// Number of cooperating workers
        #[arg(long)]
        workers: Option<usize>,

        /// This worker's slot
        #[arg(long)]
        worker: Option<usize>,

        /// Identifier of the first converted event
        #[arg(long)]
        first_event_no: Option<i64>,
    },
    /// Print one event of a converted dataset as JSON
    Inspect {
        /// Converted file(s)
        #[arg(long, required = true, num_args = 1..)]
        path: Vec<PathBuf>,

        #[arg(long, default_value = "SRTInIcePulses")]
        pulsemap_table: String,

        /// JSON dataset config; `--path` and `--pulsemap-table` override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Dataset index to print
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
    /// Write a class-balanced selection of event identifiers
    Balance {
        /// Converted file
        #[arg(long)]
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = BalanceMode::Neutrino)]
        mode: BalanceMode,

        #[arg(long, default_value = "pid")]
        pid_column: String,

        #[arg(long)]
        seed: Option<u64>,

        /// Output JSON file; stdout if omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BalanceMode {
    /// Equal numbers of each neutrino flavour
    Neutrino,
    /// Equal numbers of muons and balanced neutrinos
    SignalBackground,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            outdir,
            name,
            config,
            format,
            pulsemap,
            rescue_calibration,
            shuffle,
            seed,
            workers,
            worker,
            first_event_no,
        } => {
            let mut config = match config {
                Some(path) => ConversionConfig::from_json_file(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => ConversionConfig::default(),
            };
            if let Some(format) = format {
                config.format = format;
            }
            if let Some(pulsemap) = pulsemap {
                config.pulsemap = pulsemap;
            }
            if let Some(rescue) = rescue_calibration {
                config.rescue_calibration = rescue;
            }
            config.shuffle |= shuffle;
            config.seed = seed.or(config.seed);
            config.workers = workers.unwrap_or(config.workers);
            config.worker = worker.unwrap_or(config.worker);
            config.first_event_no = first_event_no.unwrap_or(config.first_event_no);

            let output = output_path(&outdir, &name, &config);
            let report = match config.format {
                OutputFormat::Sqlite => convert(config, SqliteSink::new(&output), &input)?,
                OutputFormat::Parquet => convert_parquet(config, &output, &input)?,
            };
            info!(
                "{} of {} files, {} events, {} skipped records, {:.0} records/s",
                report.files_processed,
                report.files_discovered,
                report.stats.events_written,
                report.stats.skipped_total(),
                report.stats.throughput()
            );
            println!("{}", report.destination.display());
        }
        Commands::Inspect {
            path,
            pulsemap_table,
            config,
            index,
        } => {
            let mut config = match config {
                Some(file) => DatasetConfig::from_json_file(&file)
                    .with_context(|| format!("reading {}", file.display()))?,
                None => DatasetConfig::default(),
            };
            config.paths = path;
            config.pulsemap_table = pulsemap_table;
            let dataset = Dataset::open(config)?;
            info!("{} events", dataset.len());
            let sample = dataset.get(index)?;
            println!("{}", serde_json::to_string_pretty(&sample)?);
        }
        Commands::Balance {
            path,
            mode,
            pid_column,
            seed,
            output,
        } => {
            let dataset = Dataset::open(DatasetConfig {
                paths: vec![path],
                ..DatasetConfig::default()
            })?;
            let labels = TruthLabels::load(&dataset, &pid_column)?;
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let json = match mode {
                BalanceMode::Neutrino => {
                    serde_json::to_value(balanced_neutrino_indices(&labels, &mut rng))?
                }
                BalanceMode::SignalBackground => {
                    serde_json::to_value(balanced_signal_background_indices(&labels, &mut rng))?
                }
            };
            match output {
                Some(file) => {
                    let out = File::create(&file)
                        .with_context(|| format!("creating {}", file.display()))?;
                    let mut writer = BufWriter::new(out);
                    serde_json::to_writer_pretty(&mut writer, &json)?;
                    writer.flush()?;
                }
                None => println!("{}", serde_json::to_string_pretty(&json)?),
            }
        }
    }

    Ok(())
}

/// `<outdir>/<name>[_<worker>].<ext>`; workers write separate files.
fn output_path(outdir: &Path, name: &str, config: &ConversionConfig) -> PathBuf {
    let stem = if config.workers > 1 {
        format!("{name}_{}", config.worker)
    } else {
        name.to_string()
    };
    outdir.join(format!("{stem}.{}", config.format.extension()))
}

fn convert<S: Sink>(
    config: ConversionConfig,
    sink: S,
    input: &[PathBuf],
) -> Result<ConversionReport> {
    let mut orchestrator = ConversionOrchestrator::new(config, sink);
    Ok(orchestrator.run(input)?)
}

#[cfg(feature = "columnar")]
fn convert_parquet(
    config: ConversionConfig,
    output: &Path,
    input: &[PathBuf],
) -> Result<ConversionReport> {
    convert(config, pulsegraph::sink::ParquetSink::new(output), input)
}

#[cfg(not(feature = "columnar"))]
fn convert_parquet(
    _config: ConversionConfig,
    _output: &Path,
    _input: &[PathBuf],
) -> Result<ConversionReport> {
    anyhow::bail!("parquet output requires the `columnar` feature")
}
