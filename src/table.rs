//! Per-event table model shared by extractors, sinks and dataset backends.
//!
//! An [`ExtractedTable`] holds the columns one extractor produced for one
//! event. Each column is either a per-event scalar or a per-hit array; when
//! both kinds appear together [`broadcast_rows`] repeats the scalars so the
//! result is rectangular.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the column every persisted table is keyed by.
pub const EVENT_NO: &str = "event_no";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(ValueKind::Int),
            Value::Float(_) => Some(ValueKind::Float),
            Value::Text(_) => Some(ValueKind::Text),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::Bool(b) => Value::Int(i64::from(*b)),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Storage class of a non-null value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Text,
}

impl ValueKind {
    /// Widest kind able to hold both. Integers widen to floats; text mixes
    /// with nothing else.
    pub fn unify(self, other: ValueKind) -> Option<ValueKind> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (ValueKind::Int, ValueKind::Float) | (ValueKind::Float, ValueKind::Int) => {
                Some(ValueKind::Float)
            }
            _ => None,
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            ValueKind::Int => "INTEGER",
            ValueKind::Float => "REAL",
            ValueKind::Text => "TEXT",
        }
    }
}

/// One column of one event: a scalar or a per-hit sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Scalar(Value),
    Array(Vec<Value>),
}

impl Column {
    /// Kind of the first non-null value.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Column::Scalar(v) => v.kind(),
            Column::Array(values) => values.iter().find_map(Value::kind),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Column::Array(_))
    }
}

pub type Row = Vec<Value>;

/// Named, ordered set of columns produced by one extractor for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTable {
    name: String,
    columns: Vec<(String, Column)>,
}

impl ExtractedTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scalar(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, Column::Scalar(value.into()));
        self
    }

    pub fn array(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(column, Column::Array(values));
        self
    }

    /// Adds or replaces a column, keeping first-insertion order.
    pub fn push(&mut self, column: impl Into<String>, value: Column) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Puts the event identifier in front of the other columns.
    pub fn with_event_no(mut self, event_no: i64) -> Self {
        self.columns.retain(|(name, _)| name != EVENT_NO);
        self.columns
            .insert(0, (EVENT_NO.to_string(), Column::Scalar(Value::Int(event_no))));
        self
    }

    /// Flattens the table into rectangular rows, broadcasting scalars.
    pub fn rows(&self) -> Result<Vec<Row>> {
        broadcast_rows(&self.name, self.columns.iter().map(|(_, c)| c.clone()).collect())
    }
}

/// All tables extracted from one event, tagged with its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTables {
    pub event_no: i64,
    pub tables: Vec<ExtractedTable>,
}

impl EventTables {
    pub fn table(&self, name: &str) -> Option<&ExtractedTable> {
        self.tables.iter().find(|t| t.name() == name)
    }
}

/// Builds rows from one event's cells.
///
/// All-scalar input yields a single row. Otherwise every array must share
/// one length and scalars are repeated to that length.
pub fn broadcast_rows(table: &str, cells: Vec<Column>) -> Result<Vec<Row>> {
    let lengths: BTreeSet<usize> = cells
        .iter()
        .filter_map(|c| match c {
            Column::Array(values) => Some(values.len()),
            Column::Scalar(_) => None,
        })
        .collect();

    let Some(&nb_elements) = lengths.iter().next() else {
        let row = cells
            .into_iter()
            .filter_map(|c| match c {
                Column::Scalar(v) => Some(v),
                Column::Array(_) => None,
            })
            .collect();
        return Ok(vec![row]);
    };
    if lengths.len() > 1 {
        return Err(Error::schema(format!(
            "arrays in table `{table}` have differing lengths {lengths:?}"
        )));
    }

    let mut rows: Vec<Row> = (0..nb_elements)
        .map(|_| Vec::with_capacity(cells.len()))
        .collect();
    for cell in cells {
        match cell {
            Column::Scalar(v) => {
                for row in rows.iter_mut() {
                    row.push(v.clone());
                }
            }
            Column::Array(values) => {
                for (row, v) in rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_broadcast_to_array_length() {
        let rows = broadcast_rows(
            "pulses",
            vec![
                Column::Scalar(Value::Int(7)),
                Column::Array(vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]),
            ],
        )
        .unwrap();
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row[0], Value::Int(7));
            assert_eq!(row[1], Value::Float(i as f64 + 1.0));
        }
    }

    #[test]
    fn all_scalars_yield_one_row() {
        let rows = broadcast_rows(
            "truth",
            vec![Column::Scalar(Value::Int(1)), Column::Scalar(Value::Text("nu".into()))],
        )
        .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1), Value::Text("nu".into())]]);
    }

    #[test]
    fn ragged_arrays_are_rejected() {
        let err = broadcast_rows(
            "pulses",
            vec![
                Column::Array(vec![Value::Int(1)]),
                Column::Array(vec![Value::Int(1), Value::Int(2)]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn empty_arrays_yield_no_rows() {
        let rows = broadcast_rows(
            "pulses",
            vec![Column::Scalar(Value::Int(1)), Column::Array(Vec::new())],
        )
        .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn event_no_is_first_column() {
        let table = ExtractedTable::new("truth")
            .scalar("energy", 10.0)
            .scalar(EVENT_NO, 3i64)
            .with_event_no(42);
        assert_eq!(table.column_names(), vec!["event_no", "energy"]);
        assert_eq!(table.get(EVENT_NO), Some(&Column::Scalar(Value::Int(42))));
    }

    #[test]
    fn kinds_widen_int_to_float() {
        assert_eq!(ValueKind::Int.unify(ValueKind::Float), Some(ValueKind::Float));
        assert_eq!(ValueKind::Text.unify(ValueKind::Int), None);
    }
}
