//! Event file framing.
//!
//! Event and calibration files are sequences of frames, one JSON object per
//! line, optionally gzip-compressed:
//!
//! ```text
//! {"stop": "P", "objects": {"I3EventHeader": {...}, "SRTInIcePulses": [...]}}
//! ```
//!
//! Only `P` (physics) frames carry events. A line that fails to parse is
//! reported as a [`RecordReadError`] and the reader moves on to the next one.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use serde::Deserialize;

use crate::error::{RecordReadError, Result, SkipReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Stop {
    #[serde(rename = "G")]
    Geometry,
    #[serde(rename = "C")]
    Calibration,
    #[serde(rename = "D")]
    DetectorStatus,
    #[serde(rename = "Q")]
    Daq,
    #[serde(rename = "P")]
    Physics,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    pub stop: Stop,
    #[serde(default)]
    pub objects: serde_json::Map<String, serde_json::Value>,
}

impl Frame {
    pub fn is_physics(&self) -> bool {
        self.stop == Stop::Physics
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.objects.get(key)
    }
}

/// Sequential source of frames from one file.
pub trait FrameReader {
    /// Next frame, a per-record failure, or `None` at end of input.
    fn next_frame(&mut self) -> Option<std::result::Result<Frame, RecordReadError>>;
}

/// Opens event files. Lets the pipeline run against formats other than the
/// bundled line-framed JSON.
pub trait FrameSource {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameReader>>;
}

/// Line-framed JSON frames, gzip-decoded when the file starts with the gzip
/// magic bytes.
pub struct JsonFrameReader<R: BufRead> {
    lines: R,
    line_no: u64,
    buf: Vec<u8>,
    exhausted: bool,
}

impl JsonFrameReader<BufReader<Box<dyn Read>>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = BufReader::new(File::open(path)?);
        let gzipped = file.fill_buf()?.starts_with(&[0x1f, 0x8b]);
        let inner: Box<dyn Read> = if gzipped {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(Self::new(BufReader::new(inner)))
    }
}

impl<R: BufRead> JsonFrameReader<R> {
    pub fn new(lines: R) -> Self {
        Self {
            lines,
            line_no: 0,
            buf: Vec::new(),
            exhausted: false,
        }
    }
}

impl<R: BufRead> FrameReader for JsonFrameReader<R> {
    fn next_frame(&mut self) -> Option<std::result::Result<Frame, RecordReadError>> {
        loop {
            if self.exhausted {
                return None;
            }
            self.buf.clear();
            self.line_no += 1;
            match self.lines.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.exhausted = true;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    // A broken stream cannot be resynchronised.
                    self.exhausted = true;
                    return Some(Err(RecordReadError::new(
                        SkipReason::Unreadable,
                        self.line_no,
                        err.to_string(),
                    )));
                }
            }
            let line = self.buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            // Undecodable bytes are a record problem; the stream is still aligned.
            return Some(serde_json::from_slice::<Frame>(line).map_err(|err| {
                RecordReadError::new(SkipReason::Malformed, self.line_no, err.to_string())
            }));
        }
    }
}

/// [`FrameSource`] for [`JsonFrameReader`] files.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFrameSource;

impl FrameSource for JsonFrameSource {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameReader>> {
        Ok(Box::new(JsonFrameReader::open(path)?))
    }
}
