use serde_json::Value as Json;

use super::Extractor;
use crate::calibration::Calibration;
use crate::frame::Frame;
use crate::table::{ExtractedTable, Value};

pub const HEADER_KEY: &str = "I3EventHeader";
pub const PRIMARY_KEY: &str = "MCPrimary";
pub const WEIGHT_DICT_KEY: &str = "I3MCWeightDict";
pub const RETRO_KEY: &str = "retro_crs_prefit";
pub const CLASSIFIER_KEY: &str = "L7_MuonClassifier_ProbNu";

/// Event header and Monte Carlo primary, one row per event.
#[derive(Debug, Clone)]
pub struct TruthExtractor {
    table: String,
}

impl TruthExtractor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Default for TruthExtractor {
    fn default() -> Self {
        Self::new("truth")
    }
}

impl Extractor for TruthExtractor {
    fn name(&self) -> &str {
        &self.table
    }

    fn extract(&mut self, frame: &Frame, _calibration: &Calibration) -> Option<ExtractedTable> {
        let header = frame.get(HEADER_KEY);
        let primary = frame.get(PRIMARY_KEY);
        if header.is_none() && primary.is_none() {
            return None;
        }
        let position = primary.and_then(|p| p.get("pos"));
        let direction = primary.and_then(|p| p.get("dir"));

        Some(
            ExtractedTable::new(&self.table)
                .scalar("run_id", field(header, "run_id"))
                .scalar("sub_run_id", field(header, "sub_run_id"))
                .scalar("event_id", field(header, "event_id"))
                .scalar("sub_event_id", field(header, "sub_event_id"))
                .scalar("energy", field(primary, "energy"))
                .scalar("position_x", field(position, "x"))
                .scalar("position_y", field(position, "y"))
                .scalar("position_z", field(position, "z"))
                .scalar("azimuth", field(direction, "azimuth"))
                .scalar("zenith", field(direction, "zenith"))
                .scalar("pid", field(primary, "pdg_encoding"))
                .scalar(
                    "interaction_type",
                    field(frame.get(WEIGHT_DICT_KEY), "InteractionType"),
                ),
        )
    }
}

/// Per-pulse features of one pulse series, with sensor positions taken from
/// the calibration geometry.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    pulsemap: String,
}

impl FeatureExtractor {
    pub fn new(pulsemap: impl Into<String>) -> Self {
        Self {
            pulsemap: pulsemap.into(),
        }
    }
}

impl Extractor for FeatureExtractor {
    fn name(&self) -> &str {
        &self.pulsemap
    }

    fn extract(&mut self, frame: &Frame, calibration: &Calibration) -> Option<ExtractedTable> {
        let pulses = frame.get(&self.pulsemap)?.as_array()?;

        let mut dom_x = Vec::with_capacity(pulses.len());
        let mut dom_y = Vec::with_capacity(pulses.len());
        let mut dom_z = Vec::with_capacity(pulses.len());
        let mut time = Vec::with_capacity(pulses.len());
        let mut charge = Vec::with_capacity(pulses.len());
        let mut width = Vec::with_capacity(pulses.len());
        let mut string = Vec::with_capacity(pulses.len());
        let mut dom_number = Vec::with_capacity(pulses.len());

        for pulse in pulses {
            let pulse = Some(pulse);
            let s = field(pulse, "string");
            let om = field(pulse, "om");
            let position = match (s.as_i64(), om.as_i64()) {
                (Some(s), Some(om)) => calibration.position((s, om)),
                _ => None,
            };
            dom_x.push(Value::from(position.map(|p| p[0])));
            dom_y.push(Value::from(position.map(|p| p[1])));
            dom_z.push(Value::from(position.map(|p| p[2])));
            time.push(field(pulse, "time"));
            charge.push(field(pulse, "charge"));
            width.push(field(pulse, "width"));
            string.push(s);
            dom_number.push(om);
        }

        Some(
            ExtractedTable::new(&self.pulsemap)
                .array("dom_x", dom_x)
                .array("dom_y", dom_y)
                .array("dom_z", dom_z)
                .array("time", time)
                .array("charge", charge)
                .array("width", width)
                .array("string", string)
                .array("dom_number", dom_number),
        )
    }
}

/// Reconstruction estimates and classifier score, when present.
#[derive(Debug, Clone)]
pub struct RetroExtractor {
    table: String,
}

impl Default for RetroExtractor {
    fn default() -> Self {
        Self {
            table: "retro".to_string(),
        }
    }
}

impl Extractor for RetroExtractor {
    fn name(&self) -> &str {
        &self.table
    }

    fn extract(&mut self, frame: &Frame, _calibration: &Calibration) -> Option<ExtractedTable> {
        let reco = frame.get(RETRO_KEY);
        let classifier = frame.get(CLASSIFIER_KEY);
        if reco.is_none() && classifier.is_none() {
            return None;
        }
        let position = reco.and_then(|r| r.get("pos"));
        let direction = reco.and_then(|r| r.get("dir"));
        let prob_nu = classifier
            .and_then(|c| c.get("value").or(Some(c)))
            .map(Value::from)
            .unwrap_or(Value::Null);

        Some(
            ExtractedTable::new(&self.table)
                .scalar("energy_retro", field(reco, "energy"))
                .scalar("position_x_retro", field(position, "x"))
                .scalar("position_y_retro", field(position, "y"))
                .scalar("position_z_retro", field(position, "z"))
                .scalar("azimuth_retro", field(direction, "azimuth"))
                .scalar("zenith_retro", field(direction, "zenith"))
                .scalar("prob_nu", prob_nu),
        )
    }
}

fn field(object: Option<&Json>, key: &str) -> Value {
    object
        .and_then(|o| o.get(key))
        .map(Value::from)
        .unwrap_or(Value::Null)
}
