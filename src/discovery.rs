//! Event file discovery and calibration pairing.
//!
//! Roots are walked recursively for files matching `*.i3.*`. Each directory
//! holding such files contributes its event files, each paired with the one
//! calibration-like file in the same directory, or with the rescue file when
//! the directory has none. Two calibration-like files in one directory make
//! the pairing ambiguous and abort discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};

/// Name patterns used to classify discovered files.
#[derive(Debug, Clone)]
pub struct PairingPatterns {
    /// Applied to the raw file name; selects candidate files.
    pub glob: Regex,
    /// Applied case-insensitively; marks geometry/calibration files.
    pub calibration: Regex,
    /// Applied case-insensitively to non-calibration candidates.
    pub event: Regex,
}

impl PairingPatterns {
    pub fn new(glob: &str, calibration: &str, event: &str) -> Result<Self> {
        let build = |pattern: &str, insensitive: bool| {
            RegexBuilder::new(pattern)
                .case_insensitive(insensitive)
                .build()
                .map_err(|err| Error::config(format!("invalid pattern `{pattern}`: {err}")))
        };
        Ok(Self {
            glob: build(glob, false)?,
            calibration: build(calibration, true)?,
            event: build(event, true)?,
        })
    }

    pub fn is_candidate(&self, name: &str) -> bool {
        self.glob.is_match(name)
    }

    pub fn is_calibration(&self, name: &str) -> bool {
        self.calibration.is_match(name)
    }

    pub fn is_event(&self, name: &str) -> bool {
        !self.is_calibration(name) && self.event.is_match(name)
    }
}

impl Default for PairingPatterns {
    fn default() -> Self {
        Self {
            glob: Regex::new(r"\.i3\.").expect("static pattern"),
            calibration: RegexBuilder::new("(gcd|geo)")
                .case_insensitive(true)
                .build()
                .expect("static pattern"),
            event: RegexBuilder::new(r"\.i3\.")
                .case_insensitive(true)
                .build()
                .expect("static pattern"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub event_file: PathBuf,
    pub calibration_file: PathBuf,
}

/// Event files with their calibration files, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePairs {
    pairs: Vec<FilePair>,
}

impl FilePairs {
    pub fn from_pairs(pairs: Vec<FilePair>) -> Self {
        Self { pairs }
    }

    /// Builds pairs from two parallel lists.
    pub fn from_parallel(
        event_files: Vec<PathBuf>,
        calibration_files: Vec<PathBuf>,
    ) -> Result<Self> {
        if event_files.len() != calibration_files.len() {
            return Err(Error::config(format!(
                "{} event files but {} calibration files",
                event_files.len(),
                calibration_files.len()
            )));
        }
        Ok(Self {
            pairs: event_files
                .into_iter()
                .zip(calibration_files)
                .map(|(event_file, calibration_file)| FilePair {
                    event_file,
                    calibration_file,
                })
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FilePair> {
        self.pairs.iter()
    }

    pub fn event_files(&self) -> Vec<PathBuf> {
        self.pairs.iter().map(|p| p.event_file.clone()).collect()
    }

    pub fn calibration_files(&self) -> Vec<PathBuf> {
        self.pairs.iter().map(|p| p.calibration_file.clone()).collect()
    }

    /// Splits into the two parallel lists.
    pub fn into_parallel(self) -> (Vec<PathBuf>, Vec<PathBuf>) {
        self.pairs
            .into_iter()
            .map(|p| (p.event_file, p.calibration_file))
            .unzip()
    }

    /// Applies one random permutation to both lists, so index `i` still pairs
    /// an event file with its own calibration file. Spreads heavy directories
    /// across workers.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.pairs.shuffle(rng);
    }

    /// Every `workers`-th pair starting at `worker`. Shares for
    /// `0..workers` are disjoint and together cover all pairs.
    pub fn worker_share(&self, worker: usize, workers: usize) -> Result<FilePairs> {
        if workers == 0 || worker >= workers {
            return Err(Error::config(format!(
                "worker {worker} is not in 0..{workers}"
            )));
        }
        Ok(Self {
            pairs: self
                .pairs
                .iter()
                .skip(worker)
                .step_by(workers)
                .cloned()
                .collect(),
        })
    }
}

impl IntoIterator for FilePairs {
    type Item = FilePair;
    type IntoIter = std::vec::IntoIter<FilePair>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.into_iter()
    }
}

impl<'a> IntoIterator for &'a FilePairs {
    type Item = &'a FilePair;
    type IntoIter = std::slice::Iter<'a, FilePair>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

/// Finds event files under `roots` and pairs each with a calibration file,
/// using the default name patterns.
pub fn find_event_files<P: AsRef<Path>>(
    roots: &[P],
    rescue: impl AsRef<Path>,
) -> Result<FilePairs> {
    find_event_files_with(roots, rescue, &PairingPatterns::default())
}

pub fn find_event_files_with<P: AsRef<Path>>(
    roots: &[P],
    rescue: impl AsRef<Path>,
    patterns: &PairingPatterns,
) -> Result<FilePairs> {
    let rescue = rescue.as_ref();
    let mut pairs = Vec::new();

    for root in roots {
        let by_dir = candidates_by_directory(root.as_ref(), patterns)?;
        for (directory, files) in by_dir {
            let (calibration, events): (Vec<PathBuf>, Vec<PathBuf>) =
                files.into_iter().partition(|path| patterns.is_calibration(&file_name(path)));
            let events: Vec<PathBuf> = events
                .into_iter()
                .filter(|path| patterns.is_event(&file_name(path)))
                .collect();

            if calibration.len() > 1 {
                return Err(Error::PairingInvariant {
                    directory,
                    candidates: calibration,
                });
            }
            let calibration_file = match calibration.into_iter().next() {
                Some(path) => path,
                None => rescue.to_path_buf(),
            };
            debug!(
                "{}: {} event files paired with {}",
                directory.display(),
                events.len(),
                calibration_file.display()
            );

            pairs.extend(events.into_iter().map(|event_file| FilePair {
                event_file,
                calibration_file: calibration_file.clone(),
            }));
        }
    }

    Ok(FilePairs { pairs })
}

/// Candidate files under `root`, grouped by directory. Both directories and
/// the files inside them come out sorted.
fn candidates_by_directory(
    root: &Path,
    patterns: &PairingPatterns,
) -> Result<BTreeMap<PathBuf, Vec<PathBuf>>> {
    let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    if !root.exists() {
        warn!("{}: no such directory, skipping", root.display());
        return Ok(by_dir);
    }
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !patterns.is_candidate(&file_name(path)) {
            continue;
        }
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        by_dir.entry(directory).or_default().push(path.to_path_buf());
    }
    for files in by_dir.values_mut() {
        files.sort();
    }
    Ok(by_dir)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
