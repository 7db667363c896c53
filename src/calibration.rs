//! Geometry/calibration context for one event file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::frame::{FrameReader, JsonFrameReader, Stop};

/// Key under which a geometry frame stores sensor positions.
pub const GEOMETRY_KEY: &str = "I3Geometry";

/// Sensor identity: (string, optical module).
pub type OmKey = (i64, i64);

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
struct OmGeo {
    string: i64,
    om: i64,
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    omgeo: Vec<OmGeo>,
}

#[derive(Debug, Clone, Default)]
pub struct Calibration {
    path: PathBuf,
    positions: HashMap<OmKey, [f64; 3]>,
}

impl Calibration {
    /// Loads sensor positions from the first geometry frame in `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut frames = JsonFrameReader::open(path)?;
        while let Some(frame) = frames.next_frame() {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("{}: {err}", path.display());
                    continue;
                }
            };
            if frame.stop != Stop::Geometry {
                continue;
            }
            let Some(raw) = frame.objects.get(GEOMETRY_KEY) else {
                continue;
            };
            let geometry: Geometry = serde_json::from_value(raw.clone())?;
            return Ok(Self::from_positions(
                path,
                geometry
                    .omgeo
                    .into_iter()
                    .map(|g| ((g.string, g.om), [g.x, g.y, g.z])),
            ));
        }
        Err(Error::Calibration(format!(
            "no geometry frame in {}",
            path.display()
        )))
    }

    pub fn from_positions(
        path: impl Into<PathBuf>,
        positions: impl IntoIterator<Item = (OmKey, [f64; 3])>,
    ) -> Self {
        Self {
            path: path.into(),
            positions: positions.into_iter().collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self, key: OmKey) -> Option<[f64; 3]> {
        self.positions.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
