use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{Array, ArrayRef, AsArray, StructArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use log::debug;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::{Backend, BackendKind, Scope, TableQuery};
use crate::error::{Error, Result};
use crate::table::{broadcast_rows, Column, Row, Value};

/// Reads a file written by [`ParquetSink`](crate::sink::ParquetSink): one
/// row per event, one struct column per table.
///
/// The file is loaded whole at open. Event identifiers are resolved to row
/// positions through the index column of the truth table.
pub struct ParquetBackend {
    path: PathBuf,
    batch: RecordBatch,
    rows_by_event: HashMap<i64, usize>,
    /// Identifiers in the truth table, ascending.
    event_ids: Vec<i64>,
    truth_table: String,
}

impl ParquetBackend {
    pub fn open(path: impl AsRef<Path>, truth_table: &str, index_column: &str) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let reader = builder.build()?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        let batch = concat_batches(&schema, &batches)?;

        let truth = table_struct(&batch, truth_table)?;
        let index = child(truth, truth_table, index_column)?;
        let mut rows_by_event = HashMap::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let Some(event_no) = scalar(index.as_ref(), row)?.as_i64() else {
                continue;
            };
            if rows_by_event.insert(event_no, row).is_some() {
                return Err(Error::schema(format!(
                    "event {event_no} appears twice in `{truth_table}`"
                )));
            }
        }
        let mut event_ids: Vec<i64> = rows_by_event.keys().copied().collect();
        event_ids.sort_unstable();
        debug!(
            "{}: {} rows, {} events",
            path.display(),
            batch.num_rows(),
            event_ids.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            batch,
            rows_by_event,
            event_ids,
            truth_table: truth_table.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Rows of one table at one file row; `None` when the table was absent
    /// for that event, which shows as a null index value.
    fn rows_at(
        &self,
        query: &TableQuery<'_>,
        arrays: &[&ArrayRef],
        index: Option<&ArrayRef>,
        row: usize,
    ) -> Result<Option<Vec<Row>>> {
        if let Some(index) = index {
            if index.is_null(row) {
                return Ok(None);
            }
        }
        let cells = arrays
            .iter()
            .map(|array| cell(array, row))
            .collect::<Result<Vec<_>>>()?;
        broadcast_rows(query.table, cells).map(Some)
    }
}

impl Backend for ParquetBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Parquet
    }

    fn stores(&self) -> usize {
        1
    }

    fn event_ids(&self, store: usize, table: &str, index_column: &str) -> Result<Vec<i64>> {
        if store != 0 {
            return Err(Error::IndexOutOfRange { index: store, len: 1 });
        }
        if table == self.truth_table {
            return Ok(self.event_ids.clone());
        }
        let index = child(table_struct(&self.batch, table)?, table, index_column)?;
        let mut ids = Vec::new();
        for row in 0..self.batch.num_rows() {
            if let Some(id) = scalar(index.as_ref(), row)?.as_i64() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn query(&self, query: &TableQuery<'_>) -> Result<Vec<Row>> {
        if query.predicate.is_some() {
            return Err(Error::config(
                "row predicates are not supported by the parquet backend",
            ));
        }
        let table = table_struct(&self.batch, query.table)?;
        let arrays = query
            .columns
            .iter()
            .map(|column| child(table, query.table, column))
            .collect::<Result<Vec<_>>>()?;
        let fetched: Vec<&str> = query
            .columns
            .iter()
            .filter_map(|c| table.fields().find(c).map(|(_, f)| f.name().as_str()))
            .collect();
        if fetched != query.columns {
            return Err(Error::schema(format!(
                "`{}` resolved columns {fetched:?}, expected {:?}",
                query.table, query.columns
            )));
        }
        let index = table.column_by_name(query.index_column);

        match query.scope {
            Scope::Event(key) => {
                let unknown = || Error::UnknownEvent {
                    table: query.table.to_string(),
                    event_no: key.event_no,
                };
                let row = *self.rows_by_event.get(&key.event_no).ok_or_else(unknown)?;
                if let Some(index) = index {
                    match scalar(index.as_ref(), row)?.as_i64() {
                        Some(found) if found != key.event_no => return Err(unknown()),
                        _ => {}
                    }
                }
                Ok(self.rows_at(query, &arrays, index, row)?.unwrap_or_default())
            }
            Scope::All => {
                let mut rows = Vec::new();
                for row in 0..self.batch.num_rows() {
                    if let Some(found) = self.rows_at(query, &arrays, index, row)? {
                        rows.extend(found);
                    }
                }
                Ok(rows)
            }
        }
    }
}

fn table_struct<'a>(batch: &'a RecordBatch, table: &str) -> Result<&'a StructArray> {
    batch
        .column_by_name(table)
        .ok_or_else(|| Error::TableMissing(table.to_string()))?
        .as_struct_opt()
        .ok_or_else(|| Error::schema(format!("column `{table}` is not a table struct")))
}

fn child<'a>(table: &'a StructArray, name: &str, column: &str) -> Result<&'a ArrayRef> {
    table.column_by_name(column).ok_or_else(|| Error::ColumnMissing {
        table: name.to_string(),
        column: column.to_string(),
    })
}

/// One cell: a scalar, or the values of a list.
fn cell(array: &ArrayRef, row: usize) -> Result<Column> {
    match array.data_type() {
        DataType::List(_) => {
            let list = array.as_list::<i32>();
            if list.is_null(row) {
                return Ok(Column::Array(Vec::new()));
            }
            let values = list.value(row);
            let values = (0..values.len())
                .map(|i| scalar(values.as_ref(), i))
                .collect::<Result<Vec<_>>>()?;
            Ok(Column::Array(values))
        }
        DataType::LargeList(_) => {
            let list = array.as_list::<i64>();
            if list.is_null(row) {
                return Ok(Column::Array(Vec::new()));
            }
            let values = list.value(row);
            let values = (0..values.len())
                .map(|i| scalar(values.as_ref(), i))
                .collect::<Result<Vec<_>>>()?;
            Ok(Column::Array(values))
        }
        _ => Ok(Column::Scalar(scalar(array.as_ref(), row)?)),
    }
}

fn scalar(array: &dyn Array, row: usize) -> Result<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(row).into()),
        DataType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(row).into()),
        DataType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(row).into()),
        DataType::UInt32 => Value::Int(array.as_primitive::<UInt32Type>().value(row).into()),
        DataType::UInt16 => Value::Int(array.as_primitive::<UInt16Type>().value(row).into()),
        DataType::UInt8 => Value::Int(array.as_primitive::<UInt8Type>().value(row).into()),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Float32 => Value::Float(array.as_primitive::<Float32Type>().value(row).into()),
        DataType::Boolean => Value::Int(array.as_boolean().value(row).into()),
        DataType::Utf8 => Value::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::Text(array.as_string::<i64>().value(row).to_string()),
        other => {
            return Err(Error::schema(format!(
                "unsupported column type {other}"
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::EventKey;
    use crate::sink::{ParquetSink, Sink};
    use crate::table::{EventTables, ExtractedTable};
    use tempfile::TempDir;

    fn write(path: &Path) {
        let mut sink = ParquetSink::new(path);
        sink.initialize().unwrap();
        for (event_no, hits) in [(5i64, 3usize), (2, 1)] {
            sink.save(&EventTables {
                event_no,
                tables: vec![
                    ExtractedTable::new("truth")
                        .scalar("energy", event_no as f64)
                        .with_event_no(event_no),
                    ExtractedTable::new("pulses")
                        .array(
                            "charge",
                            (0..hits).map(|h| Value::Float(h as f64)).collect(),
                        )
                        .with_event_no(event_no),
                ],
            })
            .unwrap();
        }
        sink.save(&EventTables {
            event_no: 9,
            tables: vec![ExtractedTable::new("truth")
                .scalar("energy", 9.0)
                .with_event_no(9)],
        })
        .unwrap();
        sink.finalize().unwrap();
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn broadcasts_event_scalar_over_hits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.parquet");
        write(&path);
        let backend = ParquetBackend::open(&path, "truth", "event_no").unwrap();
        assert_eq!(backend.event_ids(0, "truth", "event_no").unwrap(), vec![2, 5, 9]);

        let cols = columns(&["event_no", "charge"]);
        let rows = backend
            .query(&TableQuery {
                table: "pulses",
                columns: &cols,
                index_column: "event_no",
                scope: Scope::Event(EventKey { store: 0, event_no: 5 }),
                predicate: None,
            })
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Int(5), Value::Float(0.0)],
                vec![Value::Int(5), Value::Float(1.0)],
                vec![Value::Int(5), Value::Float(2.0)],
            ]
        );
    }

    #[test]
    fn event_without_table_has_no_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.parquet");
        write(&path);
        let backend = ParquetBackend::open(&path, "truth", "event_no").unwrap();
        let cols = columns(&["charge"]);
        let mut query = TableQuery {
            table: "pulses",
            columns: &cols,
            index_column: "event_no",
            scope: Scope::Event(EventKey { store: 0, event_no: 9 }),
            predicate: None,
        };
        assert!(backend.query(&query).unwrap().is_empty());
        query.scope = Scope::Event(EventKey { store: 0, event_no: 4 });
        assert!(matches!(
            backend.query(&query),
            Err(Error::UnknownEvent { event_no: 4, .. })
        ));
    }

    #[test]
    fn missing_column_and_predicate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.parquet");
        write(&path);
        let backend = ParquetBackend::open(&path, "truth", "event_no").unwrap();
        let cols = columns(&["zenith"]);
        let mut query = TableQuery {
            table: "truth",
            columns: &cols,
            index_column: "event_no",
            scope: Scope::All,
            predicate: None,
        };
        assert!(backend.query(&query).unwrap_err().is_column_missing());
        query.table = "retro";
        assert!(matches!(backend.query(&query), Err(Error::TableMissing(_))));
        query.predicate = Some("string IN (1)");
        assert!(matches!(backend.query(&query), Err(Error::Configuration(_))));
    }
}
