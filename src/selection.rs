//! Class-balanced event selections built from the truth table.
//!
//! Particle types are PDG codes; the sign (particle vs antiparticle) is
//! ignored. Electron, muon and tau neutrinos (12, 14, 16) are the signal
//! classes, muons (13) the background.

use std::collections::HashSet;

use log::{info, warn};
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use serde::Serialize;

use crate::dataset::Dataset;
use crate::error::{Error, Result};

pub const NEUTRINO_PIDS: [i64; 3] = [12, 14, 16];
pub const MUON_PID: i64 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruthLabel {
    pub event_no: i64,
    pub pid: i64,
}

/// Event identifiers paired with their particle type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruthLabels {
    labels: Vec<TruthLabel>,
}

impl TruthLabels {
    pub fn new(labels: Vec<TruthLabel>) -> Self {
        Self { labels }
    }

    /// Reads `(index_column, pid_column)` from the dataset's whole truth
    /// table. Rows with a null identifier or type are skipped.
    ///
    /// Only single-store datasets are accepted: identifiers repeat across
    /// files, and the returned ids are meant to be used as a selection.
    pub fn load(dataset: &Dataset, pid_column: &str) -> Result<Self> {
        if dataset.stores() > 1 {
            return Err(Error::config(format!(
                "truth labels need a single store, dataset has {}",
                dataset.stores()
            )));
        }
        let config = dataset.config();
        let columns = [config.index_column.clone(), pid_column.to_string()];
        let rows = dataset.query_table(&config.truth_table, &columns, None, None)?;
        let mut labels = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in &rows.rows {
            match (row[0].as_i64(), row[1].as_i64()) {
                (Some(event_no), Some(pid)) => labels.push(TruthLabel { event_no, pid }),
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("{skipped} truth rows without {pid_column} ignored");
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TruthLabel> {
        self.labels.iter()
    }

    /// Identifiers whose `|pid|` equals `pid`, in table order.
    pub fn with_abs_pid(&self, pid: i64) -> Vec<i64> {
        self.labels
            .iter()
            .filter(|l| l.pid.abs() == pid)
            .map(|l| l.event_no)
            .collect()
    }
}

impl FromIterator<(i64, i64)> for TruthLabels {
    fn from_iter<I: IntoIterator<Item = (i64, i64)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(event_no, pid)| TruthLabel { event_no, pid })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BalancedSplit {
    /// Equal numbers of each neutrino flavour, shuffled.
    pub selected: Vec<i64>,
    /// Every non-muon event not in `selected`.
    pub complement: Vec<i64>,
}

/// Downsamples each neutrino flavour to the size of the smallest one.
///
/// A flavour with no events makes the selection empty.
pub fn balanced_neutrino_indices<R: Rng + ?Sized>(
    labels: &TruthLabels,
    rng: &mut R,
) -> BalancedSplit {
    let classes: Vec<Vec<i64>> = NEUTRINO_PIDS
        .iter()
        .map(|&pid| labels.with_abs_pid(pid))
        .collect();
    let smallest = classes.iter().map(Vec::len).min().unwrap_or(0);
    info!(
        "neutrino classes {:?}, keeping {smallest} of each",
        classes.iter().map(Vec::len).collect::<Vec<_>>()
    );

    let mut selected = Vec::with_capacity(smallest * classes.len());
    for class in &classes {
        selected.extend(class.choose_multiple(rng, smallest).copied());
    }
    selected.shuffle(rng);

    let chosen: HashSet<i64> = selected.iter().copied().collect();
    let complement = labels
        .iter()
        .filter(|l| l.pid.abs() != MUON_PID && !chosen.contains(&l.event_no))
        .map(|l| l.event_no)
        .collect();
    BalancedSplit {
        selected,
        complement,
    }
}

/// Equal numbers of muons and balanced neutrinos, shuffled together.
pub fn balanced_signal_background_indices<R: Rng + ?Sized>(
    labels: &TruthLabels,
    rng: &mut R,
) -> Vec<i64> {
    let muons = labels.with_abs_pid(MUON_PID);
    let neutrinos = balanced_neutrino_indices(labels, rng).selected;
    let n = muons.len().min(neutrinos.len());
    info!(
        "{} muons, {} balanced neutrinos, keeping {n} of each",
        muons.len(),
        neutrinos.len()
    );

    let mut selection: Vec<i64> = muons.choose_multiple(rng, n).copied().collect();
    selection.extend(neutrinos.choose_multiple(rng, n).copied());
    selection.shuffle(rng);
    selection
}
