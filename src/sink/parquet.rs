//! Parquet output.
//!
//! The whole run lands in one file with one row per event. Every extracted
//! table becomes a top-level struct column; its scalar fields become
//! primitive children and its per-hit fields become list children:
//!
//! ```text
//! truth:          struct<event_no: int64, energy: double, pid: int64, ...>
//! SRTInIcePulses: struct<event_no: int64, dom_x: list<double>, ...>
//! ```
//!
//! Events are buffered and written every `batch_events` events through one
//! open [`ArrowWriter`]. The first write settles the schema: tables, columns
//! and value kinds seen in the first batch are fixed for the rest of the run.
//! Afterwards a new table or column, or a value needing a wider kind (a float
//! in an integer column), is a schema error. Columns that were all null in the
//! first batch are settled as doubles. Events lacking a table, or a table
//! lacking a column, get nulls.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float64Builder, Int64Builder, ListBuilder, StringBuilder, StructArray,
};
use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use log::{debug, info, warn};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use super::Sink;
use crate::error::{Error, Result};
use crate::table::{Column, EventTables, ValueKind};

/// Events buffered before a batch is handed to the writer.
pub const DEFAULT_BATCH_EVENTS: usize = 1024;

pub struct ParquetSink {
    path: PathBuf,
    props: Option<WriterProperties>,
    batch_events: usize,
    tables: Vec<TableBuffer>,
    buffered: usize,
    written: usize,
    writer: Option<ArrowWriter<File>>,
    schema: Option<SchemaRef>,
}

impl ParquetSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            props: None,
            batch_events: DEFAULT_BATCH_EVENTS,
            tables: Vec::new(),
            buffered: 0,
            written: 0,
            writer: None,
            schema: None,
        }
    }

    pub fn with_properties(mut self, props: WriterProperties) -> Self {
        self.props = Some(props);
        self
    }

    /// Events per written batch, at least one.
    pub fn with_batch_events(mut self, batch_events: usize) -> Self {
        self.batch_events = batch_events.max(1);
        self
    }

    /// Events saved so far, written or buffered.
    pub fn len(&self) -> usize {
        self.written + self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events still waiting for the next batch.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    fn is_settled(&self) -> bool {
        self.schema.is_some()
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableBuffer> {
        let idx = match self.tables.iter().position(|t| t.name == name) {
            Some(idx) => idx,
            None if self.schema.is_some() => {
                return Err(Error::schema(format!(
                    "table `{name}` first seen after {} events were written",
                    self.written
                )));
            }
            None => {
                self.tables.push(TableBuffer {
                    name: name.to_string(),
                    columns: Vec::new(),
                });
                self.tables.len() - 1
            }
        };
        Ok(&mut self.tables[idx])
    }

    fn open_writer(&mut self) -> Result<()> {
        for table in &mut self.tables {
            table.settle();
        }
        let fields: Vec<Field> = self.tables.iter().map(TableBuffer::field).collect();
        let schema = Arc::new(Schema::new(fields));
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&self.path)?;
        self.writer = Some(ArrowWriter::try_new(
            file,
            Arc::clone(&schema),
            self.props.clone(),
        )?);
        self.schema = Some(schema);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }
        if !self.is_settled() {
            self.open_writer()?;
        }
        let batch = self.record_batch()?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(Error::schema("parquet sink is closed"));
        };
        writer.write(&batch)?;
        debug!("{}: wrote batch of {} events", self.path.display(), self.buffered);
        self.written += self.buffered;
        self.buffered = 0;
        for table in &mut self.tables {
            table.clear();
        }
        Ok(())
    }

    fn record_batch(&self) -> Result<RecordBatch> {
        let Some(schema) = &self.schema else {
            return Err(Error::schema("parquet schema is not settled"));
        };
        let arrays = self
            .tables
            .iter()
            .map(|table| table.finish(self.buffered))
            .collect::<Result<Vec<ArrayRef>>>()?;
        Ok(RecordBatch::try_new(Arc::clone(schema), arrays)?)
    }
}

impl Sink for ParquetSink {
    fn save(&mut self, event: &EventTables) -> Result<()> {
        let row = self.buffered;
        let settled = self.is_settled();
        for table in &event.tables {
            let buffer = self.table_mut(table.name())?;
            for (name, cell) in table.columns() {
                buffer
                    .column_mut(name, row, settled)?
                    .push(table.name(), cell, settled)?;
            }
        }
        self.buffered += 1;
        for table in &mut self.tables {
            for column in &mut table.columns {
                column.pad_to(self.buffered);
            }
        }
        if self.buffered >= self.batch_events {
            self.flush()?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.flush()?;
        let Some(writer) = self.writer.take() else {
            warn!("no events to write to {}", self.path.display());
            return Ok(());
        };
        writer.close()?;
        info!("wrote {} events to {}", self.written, self.path.display());
        self.tables.clear();
        self.schema = None;
        self.written = 0;
        Ok(())
    }

    fn destination(&self) -> &Path {
        &self.path
    }
}

struct TableBuffer {
    name: String,
    columns: Vec<ColumnBuffer>,
}

impl TableBuffer {
    /// Column `name`, created with `rows` leading nulls when new.
    fn column_mut(
        &mut self,
        name: &str,
        rows: usize,
        settled: bool,
    ) -> Result<&mut ColumnBuffer> {
        let idx = match self.columns.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None if settled => {
                return Err(Error::schema(format!(
                    "column `{}.{name}` first seen after the schema was settled",
                    self.name
                )));
            }
            None => {
                self.columns.push(ColumnBuffer {
                    name: name.to_string(),
                    kind: None,
                    list: None,
                    cells: vec![None; rows],
                });
                self.columns.len() - 1
            }
        };
        Ok(&mut self.columns[idx])
    }

    fn settle(&mut self) {
        for column in &mut self.columns {
            column.kind.get_or_insert(ValueKind::Float);
            column.list.get_or_insert(false);
        }
    }

    fn fields(&self) -> Fields {
        self.columns
            .iter()
            .map(|column| {
                Field::new(
                    &column.name,
                    data_type(
                        column.kind.unwrap_or(ValueKind::Float),
                        column.list.unwrap_or(false),
                    ),
                    true,
                )
            })
            .collect()
    }

    fn field(&self) -> Field {
        Field::new(&self.name, DataType::Struct(self.fields()), false)
    }

    fn finish(&self, rows: usize) -> Result<ArrayRef> {
        let mut arrays = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let mut builder = ColumnBuilder::new(
                column.kind.unwrap_or(ValueKind::Float),
                column.list.unwrap_or(false),
                rows,
            );
            for cell in &column.cells {
                builder.append(cell.as_ref());
            }
            arrays.push(builder.finish());
        }
        let array = StructArray::try_new(self.fields(), arrays, None)?;
        Ok(Arc::new(array))
    }

    fn clear(&mut self) {
        for column in &mut self.columns {
            column.cells.clear();
        }
    }
}

struct ColumnBuffer {
    name: String,
    kind: Option<ValueKind>,
    list: Option<bool>,
    cells: Vec<Option<Column>>,
}

impl ColumnBuffer {
    fn push(&mut self, table: &str, cell: &Column, settled: bool) -> Result<()> {
        match self.list {
            Some(list) if list != cell.is_array() => {
                return Err(Error::schema(format!(
                    "column `{table}.{}` mixes scalar and array values",
                    self.name
                )));
            }
            _ => self.list = Some(cell.is_array()),
        }
        if let Some(kind) = cell.kind() {
            self.kind = match self.kind {
                None => Some(kind),
                Some(current) => {
                    let unified = current
                        .unify(kind)
                        .filter(|unified| !settled || *unified == current);
                    Some(unified.ok_or_else(|| {
                        Error::schema(format!(
                            "column `{table}.{}` mixes {current:?} and {kind:?} values",
                            self.name
                        ))
                    })?)
                }
            };
        }
        self.cells.push(Some(cell.clone()));
        Ok(())
    }

    fn pad_to(&mut self, rows: usize) {
        if self.cells.len() < rows {
            self.cells.resize(rows, None);
        }
    }
}

fn data_type(kind: ValueKind, list: bool) -> DataType {
    let item = match kind {
        ValueKind::Int => DataType::Int64,
        ValueKind::Float => DataType::Float64,
        ValueKind::Text => DataType::Utf8,
    };
    if list {
        DataType::List(Arc::new(Field::new("item", item, true)))
    } else {
        item
    }
}

enum ColumnBuilder {
    I64(Int64Builder),
    F64(Float64Builder),
    Text(StringBuilder),
    I64List(ListBuilder<Int64Builder>),
    F64List(ListBuilder<Float64Builder>),
    TextList(ListBuilder<StringBuilder>),
}

impl ColumnBuilder {
    fn new(kind: ValueKind, list: bool, capacity: usize) -> Self {
        match (kind, list) {
            (ValueKind::Int, false) => Self::I64(Int64Builder::with_capacity(capacity)),
            (ValueKind::Float, false) => Self::F64(Float64Builder::with_capacity(capacity)),
            (ValueKind::Text, false) => Self::Text(StringBuilder::new()),
            (ValueKind::Int, true) => Self::I64List(ListBuilder::new(Int64Builder::new())),
            (ValueKind::Float, true) => Self::F64List(ListBuilder::new(Float64Builder::new())),
            (ValueKind::Text, true) => Self::TextList(ListBuilder::new(StringBuilder::new())),
        }
    }

    fn append(&mut self, cell: Option<&Column>) {
        match (self, cell) {
            (ColumnBuilder::I64(b), Some(Column::Scalar(v))) => b.append_option(v.as_i64()),
            (ColumnBuilder::F64(b), Some(Column::Scalar(v))) => b.append_option(v.as_f64()),
            (ColumnBuilder::Text(b), Some(Column::Scalar(v))) => b.append_option(text(v)),
            (ColumnBuilder::I64(b), _) => b.append_null(),
            (ColumnBuilder::F64(b), _) => b.append_null(),
            (ColumnBuilder::Text(b), _) => b.append_null(),
            (ColumnBuilder::I64List(b), Some(Column::Array(values))) => {
                for v in values {
                    b.values().append_option(v.as_i64());
                }
                b.append(true);
            }
            (ColumnBuilder::F64List(b), Some(Column::Array(values))) => {
                for v in values {
                    b.values().append_option(v.as_f64());
                }
                b.append(true);
            }
            (ColumnBuilder::TextList(b), Some(Column::Array(values))) => {
                for v in values {
                    b.values().append_option(text(v));
                }
                b.append(true);
            }
            (ColumnBuilder::I64List(b), _) => b.append(false),
            (ColumnBuilder::F64List(b), _) => b.append(false),
            (ColumnBuilder::TextList(b), _) => b.append(false),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::I64(b) => Arc::new(b.finish()),
            ColumnBuilder::F64(b) => Arc::new(b.finish()),
            ColumnBuilder::Text(b) => Arc::new(b.finish()),
            ColumnBuilder::I64List(b) => Arc::new(b.finish()),
            ColumnBuilder::F64List(b) => Arc::new(b.finish()),
            ColumnBuilder::TextList(b) => Arc::new(b.finish()),
        }
    }
}

fn text(value: &crate::table::Value) -> Option<&str> {
    match value {
        crate::table::Value::Text(s) => Some(s.as_str()),
        _ => None,
    }
}
