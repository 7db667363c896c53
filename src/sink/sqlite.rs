use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use super::Sink;
use crate::error::{Error, Result};
use crate::table::{EventTables, ExtractedTable, Value, EVENT_NO};

const DEFAULT_COMMIT_EVERY: usize = 1_000;

/// Writes every extracted table into a same-named SQLite table, one row per
/// scalar table and one row per hit for array tables.
///
/// New columns seen mid-run are added with `ALTER TABLE`; an index on
/// `event_no` is created for each table at finalize.
pub struct SqliteSink {
    path: PathBuf,
    conn: Option<Connection>,
    columns: HashMap<String, Vec<String>>,
    commit_every: usize,
    pending: usize,
    events: u64,
}

impl SqliteSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
            columns: HashMap::new(),
            commit_every: DEFAULT_COMMIT_EVERY,
            pending: 0,
            events: 0,
        }
    }

    /// Events per transaction.
    pub fn commit_every(mut self, events: usize) -> Self {
        self.commit_every = events.max(1);
        self
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::config("sqlite sink used before initialize"))
    }

    /// Creates `table` or widens it so it holds every column of `extracted`.
    fn ensure_table(&mut self, extracted: &ExtractedTable) -> Result<()> {
        let name = extracted.name().to_string();
        if !self.columns.contains_key(&name) {
            let existing = table_columns(self.conn()?, &name)?;
            if existing.is_empty() {
                let defs: Vec<String> = extracted
                    .columns()
                    .map(|(column, value)| column_def(column, value.kind().map(|k| k.sql_type())))
                    .collect();
                self.conn()?.execute_batch(&format!(
                    "CREATE TABLE {} ({});",
                    quote_ident(&name),
                    defs.join(", ")
                ))?;
                debug!("created table {name} in {}", self.path.display());
                self.columns.insert(name.clone(), extracted.column_names());
                return Ok(());
            }
            self.columns.insert(name.clone(), existing);
        }

        let known = self.columns.get(&name).cloned().unwrap_or_default();
        for (column, value) in extracted.columns() {
            if known.iter().any(|k| k == column) {
                continue;
            }
            self.conn()?.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {};",
                quote_ident(&name),
                column_def(column, value.kind().map(|k| k.sql_type()))
            ))?;
            debug!("added column {column} to {name}");
            if let Some(columns) = self.columns.get_mut(&name) {
                columns.push(column.to_string());
            }
        }
        Ok(())
    }

    fn insert(&self, extracted: &ExtractedTable) -> Result<()> {
        let names = extracted.column_names();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(extracted.name()),
            names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        for row in extracted.rows()? {
            stmt.execute(params_from_iter(row.iter()))?;
        }
        Ok(())
    }
}

impl Sink for SqliteSink {
    fn initialize(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch("BEGIN;")?;
        self.conn = Some(conn);
        Ok(())
    }

    fn save(&mut self, event: &EventTables) -> Result<()> {
        for table in &event.tables {
            self.ensure_table(table)?;
            self.insert(table)?;
        }
        self.events += 1;
        self.pending += 1;
        if self.pending >= self.commit_every {
            self.conn()?.execute_batch("COMMIT; BEGIN;")?;
            self.pending = 0;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.execute_batch("COMMIT;")?;
        let mut tables: Vec<&String> = self.columns.keys().collect();
        tables.sort();
        for table in tables {
            conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({});",
                quote_ident(&format!("{table}_{EVENT_NO}")),
                quote_ident(table),
                quote_ident(EVENT_NO)
            ))?;
        }
        // Readers open the file read-only, which WAL mode does not allow
        // without the side files.
        conn.pragma_update(None, "journal_mode", "DELETE")?;
        info!("wrote {} events to {}", self.events, self.path.display());
        conn.close().map_err(|(_, err)| Error::Sqlite(err))?;
        Ok(())
    }

    fn destination(&self) -> &Path {
        &self.path
    }
}

/// Column names of `table`, empty if it does not exist.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_def(column: &str, sql_type: Option<&str>) -> String {
    match sql_type {
        Some(ty) => format!("{} {ty}", quote_ident(column)),
        None => quote_ident(column),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Int(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Value::Null),
            ValueRef::Integer(v) => Ok(Value::Int(v)),
            ValueRef::Real(v) => Ok(Value::Float(v)),
            ValueRef::Text(text) => Ok(Value::Text(String::from_utf8_lossy(text).into_owned())),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(event_no: i64, energy: f64, charges: &[f64]) -> EventTables {
        EventTables {
            event_no,
            tables: vec![
                ExtractedTable::new("truth")
                    .scalar("energy", energy)
                    .with_event_no(event_no),
                ExtractedTable::new("pulses")
                    .array("charge", charges.iter().map(|c| Value::Float(*c)).collect())
                    .with_event_no(event_no),
            ],
        }
    }

    #[test]
    fn writes_one_row_per_hit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("events.db");
        let mut sink = SqliteSink::new(&path).commit_every(1);
        sink.initialize().unwrap();
        sink.save(&event(0, 1.5, &[0.5, 1.0, 2.0])).unwrap();
        sink.save(&event(1, 3.0, &[4.0])).unwrap();
        sink.finalize().unwrap();

        let conn = Connection::open(&path).unwrap();
        let pulses: i64 = conn
            .query_row("SELECT COUNT(*) FROM pulses", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pulses, 4);
        let hits_for_zero: i64 = conn
            .query_row("SELECT COUNT(*) FROM pulses WHERE event_no = 0", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hits_for_zero, 3);
        assert_eq!(
            table_columns(&conn, "truth").unwrap(),
            vec!["event_no".to_string(), "energy".to_string()]
        );
    }

    #[test]
    fn late_columns_are_added() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        let mut sink = SqliteSink::new(&path);
        sink.initialize().unwrap();
        sink.save(&event(0, 1.0, &[])).unwrap();
        sink.save(&EventTables {
            event_no: 1,
            tables: vec![ExtractedTable::new("truth")
                .scalar("energy", 2.0)
                .scalar("pid", 14i64)
                .with_event_no(1)],
        })
        .unwrap();
        sink.finalize().unwrap();

        let conn = Connection::open(&path).unwrap();
        assert_eq!(
            table_columns(&conn, "truth").unwrap(),
            vec!["event_no", "energy", "pid"]
        );
        let pid: Value = conn
            .query_row("SELECT pid FROM truth WHERE event_no = 0", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pid, Value::Null);
    }

    #[test]
    fn save_before_initialize_fails() {
        let mut sink = SqliteSink::new("unused.db");
        assert!(matches!(
            sink.save(&event(0, 1.0, &[1.0])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
