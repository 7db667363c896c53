use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;
use rusqlite::{Connection, OpenFlags};

use super::{Backend, BackendKind, Scope, TableQuery};
use crate::error::{Error, Result};
use crate::sink::sqlite::{quote_ident, table_columns};
use crate::table::{Row, Value};

struct Store {
    path: PathBuf,
    conn: Connection,
    /// Table name to column names, read once at open.
    schema: HashMap<String, Vec<String>>,
}

impl Store {
    fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let tables: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
        };
        let mut schema = HashMap::with_capacity(tables.len());
        for table in tables {
            let columns = table_columns(&conn, &table)?;
            schema.insert(table, columns);
        }
        debug!("{}: tables {:?}", path.display(), schema.keys().collect::<Vec<_>>());
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            schema,
        })
    }

    /// Fails with `TableMissing` or `ColumnMissing` unless every name exists.
    fn check<'a>(&self, table: &str, columns: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let known = self
            .schema
            .get(table)
            .ok_or_else(|| Error::TableMissing(table.to_string()))?;
        for column in columns {
            if !known.iter().any(|k| k == column) {
                return Err(Error::ColumnMissing {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }

    fn query(&self, query: &TableQuery<'_>, event_no: Option<i64>) -> Result<Vec<Row>> {
        self.check(
            query.table,
            query
                .columns
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(query.index_column)),
        )?;

        let mut conditions = Vec::new();
        if event_no.is_some() {
            conditions.push(format!("{} = ?1", quote_ident(query.index_column)));
        }
        if let Some(predicate) = query.predicate {
            conditions.push(format!("({predicate})"));
        }
        let mut sql = format!(
            "SELECT {} FROM {}",
            query
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            quote_ident(query.table)
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let failed = |err: rusqlite::Error| {
            Error::Query(format!("{} on {}: {err}", sql, self.path.display()))
        };
        let mut stmt = self.conn.prepare_cached(&sql).map_err(failed)?;
        if stmt.column_names() != query.columns {
            return Err(Error::schema(format!(
                "`{}` returned columns {:?}, expected {:?}",
                query.table,
                stmt.column_names(),
                query.columns
            )));
        }
        let width = query.columns.len();
        let map_row = |row: &rusqlite::Row<'_>| {
            (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Row>>()
        };
        let rows = match event_no {
            Some(event_no) => stmt
                .query_map([event_no], map_row)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>()),
            None => stmt
                .query_map([], map_row)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>()),
        };
        rows.map_err(failed)
    }
}

/// Reads datasets written by [`SqliteSink`](crate::sink::SqliteSink). Each
/// file is a separate store; files are opened read-only.
pub struct SqliteBackend {
    stores: Vec<Store>,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::config("at least one sqlite file is required"));
        }
        let stores = paths
            .iter()
            .map(|p| Store::open(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stores })
    }

    fn store(&self, store: usize) -> Result<&Store> {
        self.stores.get(store).ok_or(Error::IndexOutOfRange {
            index: store,
            len: self.stores.len(),
        })
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn stores(&self) -> usize {
        self.stores.len()
    }

    fn event_ids(&self, store: usize, table: &str, index_column: &str) -> Result<Vec<i64>> {
        let store = self.store(store)?;
        store.check(table, [index_column])?;
        let sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL ORDER BY {col}",
            col = quote_ident(index_column),
            table = quote_ident(table)
        );
        let mut stmt = store.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn query(&self, query: &TableQuery<'_>) -> Result<Vec<Row>> {
        match query.scope {
            Scope::Event(key) => self.store(key.store)?.query(query, Some(key.event_no)),
            Scope::All => {
                let mut rows = Vec::new();
                for store in &self.stores {
                    rows.extend(store.query(query, None)?);
                }
                Ok(rows)
            }
        }
    }
}
