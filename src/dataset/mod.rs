//! Indexed, read-only access to converted event stores.
//!
//! A [`Dataset`] maps a sequential index `0..len` onto event identifiers and
//! answers "give me event `i`" by querying the configured tables of the
//! backing store. Two stores are supported, picked by file extension:
//!
//! * SQLite (`.db`, `.sqlite`, `.sqlite3`): one table per extracted table,
//!   one row per hit. Several files may be combined into one dataset.
//! * Parquet (`.parquet`): one row per event, one struct column per table.
//!   Exactly one file; node truth and string selection are not available.
//!
//! Per-event scalars are repeated across the rows of per-hit columns, so
//! every query returns a uniform list of rows.
//!
//! A `Dataset` is `Send` but not `Sync`: each reader thread opens its own.

#[cfg(feature = "columnar")]
pub mod parquet;
pub mod sqlite;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use crate::config::DatasetConfig;
use crate::error::{Error, Result};
use crate::sink::sqlite::quote_ident;
use crate::table::{Row, Value};

#[cfg(feature = "columnar")]
pub use self::parquet::ParquetBackend;
pub use self::sqlite::SqliteBackend;

/// Identifies one event: the backing file it lives in and its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventKey {
    pub store: usize,
    pub event_no: i64,
}

/// Which rows of a table a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Event(EventKey),
    All,
}

/// One table read.
#[derive(Debug, Clone, Copy)]
pub struct TableQuery<'a> {
    pub table: &'a str,
    pub columns: &'a [String],
    pub index_column: &'a str,
    pub scope: Scope,
    /// Backend-specific row filter. Only the SQLite backend accepts one.
    pub predicate: Option<&'a str>,
}

/// A backing store the dataset reads from.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Number of backing files.
    fn stores(&self) -> usize;

    /// Distinct identifiers present in `table` of one store, ascending.
    fn event_ids(&self, store: usize, table: &str, index_column: &str) -> Result<Vec<i64>>;

    /// Rows of `query.columns`, in that order. Scalars are broadcast over
    /// per-hit columns.
    fn query(&self, query: &TableQuery<'_>) -> Result<Vec<Row>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Parquet,
}

impl BackendKind {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "db" | "sqlite" | "sqlite3" => Ok(BackendKind::Sqlite),
            "parquet" => Ok(BackendKind::Parquet),
            _ => Err(Error::config(format!(
                "cannot infer a backend from {}",
                path.display()
            ))),
        }
    }

    /// Backend shared by every path in `paths`.
    pub fn detect(paths: &[PathBuf]) -> Result<Self> {
        let mut kinds = paths.iter().map(|p| Self::from_path(p));
        let first = kinds
            .next()
            .ok_or_else(|| Error::config("at least one dataset path is required"))??;
        for kind in kinds {
            if kind? != first {
                return Err(Error::config("dataset paths mix backends"));
            }
        }
        Ok(first)
    }

    /// Backend-specific argument checks, run before any file is opened.
    pub fn validate(self, config: &DatasetConfig) -> Result<()> {
        match self {
            BackendKind::Sqlite => {
                if config.selection.is_some() && config.paths.len() > 1 {
                    return Err(Error::config(
                        "an explicit selection needs a single sqlite file",
                    ));
                }
            }
            BackendKind::Parquet => {
                if config.paths.len() != 1 {
                    return Err(Error::config("parquet datasets read exactly one file"));
                }
                if config.node_truth_table.is_some() {
                    return Err(Error::config("node truth is not supported for parquet"));
                }
                if config.string_selection.is_some() {
                    return Err(Error::config(
                        "string selection is not supported for parquet",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Ordered list of event keys; position `i` is dataset index `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMapping {
    keys: Vec<EventKey>,
}

impl IndexMapping {
    pub fn new(keys: Vec<EventKey>) -> Self {
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<EventKey> {
        self.keys.get(index).copied().ok_or(Error::IndexOutOfRange {
            index,
            len: self.keys.len(),
        })
    }

    pub fn keys(&self) -> &[EventKey] {
        &self.keys
    }
}

/// Rows of one table, with the column names they follow.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl TableRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column across all rows.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

/// Everything read for one dataset index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSample {
    pub event: EventKey,
    pub tables: BTreeMap<String, TableRows>,
}

impl EventSample {
    pub fn table(&self, name: &str) -> Option<&TableRows> {
        self.tables.get(name)
    }
}

pub struct Dataset {
    config: DatasetConfig,
    backend: Box<dyn Backend>,
    mapping: IndexMapping,
    string_predicate: Option<String>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("backend", &self.backend.kind())
            .field("paths", &self.config.paths)
            .field("len", &self.mapping.len())
            .finish()
    }
}

impl Dataset {
    /// Validates `config`, opens the backend its paths call for and builds
    /// the index mapping.
    pub fn open(config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        let kind = BackendKind::detect(&config.paths)?;
        kind.validate(&config)?;
        let backend: Box<dyn Backend> = match kind {
            BackendKind::Sqlite => Box::new(SqliteBackend::open(&config.paths)?),
            #[cfg(feature = "columnar")]
            BackendKind::Parquet => Box::new(ParquetBackend::open(
                &config.paths[0],
                &config.truth_table,
                &config.index_column,
            )?),
            #[cfg(not(feature = "columnar"))]
            BackendKind::Parquet => {
                return Err(Error::config(
                    "parquet support requires the `columnar` feature",
                ))
            }
        };
        Self::with_backend(config, backend)
    }

    /// Builds a dataset over an already opened backend.
    pub fn with_backend(config: DatasetConfig, backend: Box<dyn Backend>) -> Result<Self> {
        config.validate()?;
        backend.kind().validate(&config)?;
        let mapping = build_mapping(&config, backend.as_ref())?;
        let string_predicate = config.string_selection.as_ref().map(|strings| {
            let list: Vec<String> = strings.iter().map(i64::to_string).collect();
            format!("{} IN ({})", quote_ident(&config.string_column), list.join(", "))
        });
        debug!(
            "opened {:?} dataset with {} events",
            backend.kind(),
            mapping.len()
        );
        Ok(Self {
            config,
            backend,
            mapping,
            string_predicate,
        })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn mapping(&self) -> &IndexMapping {
        &self.mapping
    }

    /// Number of backing files; event ids are only unique within one.
    pub fn stores(&self) -> usize {
        self.backend.stores()
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn event_key(&self, index: usize) -> Result<EventKey> {
        self.mapping.get(index)
    }

    /// Features, truth and, if configured, node truth of event `index`.
    pub fn get(&self, index: usize) -> Result<EventSample> {
        let event = self.mapping.get(index)?;
        let predicate = self.string_predicate.as_deref();
        let mut tables = BTreeMap::new();

        let features = self.read(
            &self.config.pulsemap_table,
            &self.config.features,
            Scope::Event(event),
            predicate,
        )?;
        tables.insert(self.config.pulsemap_table.clone(), features);

        let truth = self.read(
            &self.config.truth_table,
            &self.config.truth,
            Scope::Event(event),
            None,
        )?;
        tables.insert(self.config.truth_table.clone(), truth);

        if let Some(node_truth_table) = &self.config.node_truth_table {
            let node_truth = self.read(
                node_truth_table,
                &self.config.node_truth,
                Scope::Event(event),
                predicate,
            )?;
            tables.insert(node_truth_table.clone(), node_truth);
        }

        Ok(EventSample { event, tables })
    }

    /// Reads `columns` of `table`, either for one dataset index or for every
    /// row of the table.
    pub fn query_table(
        &self,
        table: &str,
        columns: &[String],
        index: Option<usize>,
        predicate: Option<&str>,
    ) -> Result<TableRows> {
        let scope = match index {
            Some(index) => Scope::Event(self.mapping.get(index)?),
            None => Scope::All,
        };
        self.read(table, columns, scope, predicate)
    }

    fn read(
        &self,
        table: &str,
        columns: &[String],
        scope: Scope,
        predicate: Option<&str>,
    ) -> Result<TableRows> {
        if columns.is_empty() {
            return Err(Error::config(format!("no columns requested from `{table}`")));
        }
        let rows = self.backend.query(&TableQuery {
            table,
            columns,
            index_column: &self.config.index_column,
            scope,
            predicate,
        })?;
        if let Some(row) = rows.iter().find(|row| row.len() != columns.len()) {
            return Err(Error::schema(format!(
                "`{table}` returned {} values for {} columns",
                row.len(),
                columns.len()
            )));
        }
        Ok(TableRows {
            columns: columns.to_vec(),
            rows,
        })
    }
}

fn build_mapping(config: &DatasetConfig, backend: &dyn Backend) -> Result<IndexMapping> {
    let truth = config.truth_table.as_str();
    let index = config.index_column.as_str();

    let Some(selection) = &config.selection else {
        let mut keys = Vec::new();
        for store in 0..backend.stores() {
            let ids = backend.event_ids(store, truth, index)?;
            keys.extend(ids.into_iter().map(|event_no| EventKey { store, event_no }));
        }
        return Ok(IndexMapping::new(keys));
    };

    let known: HashSet<i64> = backend.event_ids(0, truth, index)?.into_iter().collect();
    let mut seen = HashSet::with_capacity(selection.len());
    let mut keys = Vec::with_capacity(selection.len());
    for &event_no in selection {
        if !seen.insert(event_no) {
            warn!("dropping duplicate event {event_no} from selection");
            continue;
        }
        if !known.contains(&event_no) {
            return Err(Error::UnknownEvent {
                table: truth.to_string(),
                event_no,
            });
        }
        keys.push(EventKey { store: 0, event_no });
    }
    Ok(IndexMapping::new(keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory backend: per store, per table, a list of (event_no, row).
    struct MemoryBackend {
        tables: Vec<BTreeMap<String, (Vec<String>, Vec<(i64, Row)>)>>,
        predicates: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    impl MemoryBackend {
        fn single(truth_ids: &[i64]) -> Self {
            let mut tables = BTreeMap::new();
            tables.insert(
                "truth".to_string(),
                (
                    vec!["event_no".to_string(), "energy".to_string()],
                    truth_ids
                        .iter()
                        .map(|&id| (id, vec![Value::Int(id), Value::Float(id as f64 * 10.0)]))
                        .collect(),
                ),
            );
            tables.insert(
                "pulses".to_string(),
                (
                    vec!["event_no".to_string(), "charge".to_string()],
                    truth_ids
                        .iter()
                        .flat_map(|&id| {
                            (0..id).map(move |hit| {
                                (id, vec![Value::Int(id), Value::Float(hit as f64)])
                            })
                        })
                        .collect(),
                ),
            );
            Self {
                tables: vec![tables],
                predicates: Arc::default(),
            }
        }
    }

    impl Backend for MemoryBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Sqlite
        }

        fn stores(&self) -> usize {
            self.tables.len()
        }

        fn event_ids(&self, store: usize, table: &str, _index_column: &str) -> Result<Vec<i64>> {
            let (_, rows) = self.tables[store]
                .get(table)
                .ok_or_else(|| Error::TableMissing(table.to_string()))?;
            let mut ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
            ids.sort_unstable();
            ids.dedup();
            Ok(ids)
        }

        fn query(&self, query: &TableQuery<'_>) -> Result<Vec<Row>> {
            self.predicates
                .lock()
                .unwrap()
                .push((query.table.to_string(), query.predicate.map(String::from)));
            let store = match query.scope {
                Scope::Event(key) => key.store,
                Scope::All => 0,
            };
            let (names, rows) = self.tables[store]
                .get(query.table)
                .ok_or_else(|| Error::TableMissing(query.table.to_string()))?;
            let positions = query
                .columns
                .iter()
                .map(|c| {
                    names.iter().position(|n| n == c).ok_or_else(|| Error::ColumnMissing {
                        table: query.table.to_string(),
                        column: c.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(rows
                .iter()
                .filter(|(id, _)| match query.scope {
                    Scope::Event(key) => *id == key.event_no,
                    Scope::All => true,
                })
                .map(|(_, row)| positions.iter().map(|&p| row[p].clone()).collect())
                .collect())
        }
    }

    fn config() -> DatasetConfig {
        DatasetConfig::new("memory.db", "pulses")
            .with_features(["charge"])
            .with_truth(["energy"])
    }

    #[test]
    fn mapping_follows_sorted_truth_ids() {
        let backend = Box::new(MemoryBackend::single(&[3, 1, 2]));
        let dataset = Dataset::with_backend(config(), backend).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.event_key(0).unwrap().event_no, 1);
        assert_eq!(dataset.event_key(2).unwrap().event_no, 3);

        let sample = dataset.get(1).unwrap();
        assert_eq!(sample.event.event_no, 2);
        assert_eq!(sample.table("pulses").unwrap().len(), 2);
        assert_eq!(
            sample.table("truth").unwrap().rows,
            vec![vec![Value::Float(20.0)]]
        );
    }

    #[test]
    fn selection_order_is_kept_and_duplicates_dropped() {
        let config = config().with_selection(vec![3, 1, 3]);
        let backend = Box::new(MemoryBackend::single(&[1, 2, 3]));
        let dataset = Dataset::with_backend(config, backend).unwrap();
        let ids: Vec<i64> = dataset.mapping().keys().iter().map(|k| k.event_no).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn unknown_selection_id_is_rejected() {
        let config = config().with_selection(vec![1, 9]);
        match Dataset::with_backend(config, Box::new(MemoryBackend::single(&[1, 2]))) {
            Err(Error::UnknownEvent { event_no, .. }) => assert_eq!(event_no, 9),
            other => panic!("expected UnknownEvent, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_index() {
        let backend = Box::new(MemoryBackend::single(&[1]));
        let dataset = Dataset::with_backend(config(), backend).unwrap();
        assert!(matches!(
            dataset.get(1),
            Err(Error::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn missing_column_stays_distinguishable() {
        let config = config().with_truth(["energy", "zenith"]);
        let dataset = Dataset::with_backend(config, Box::new(MemoryBackend::single(&[1]))).unwrap();
        let err = dataset.get(0).unwrap_err();
        assert!(err.is_column_missing(), "{err}");
    }

    #[test]
    fn string_selection_filters_feature_reads_only() {
        let config = config().with_string_selection(vec![1, 2]);
        let backend = MemoryBackend::single(&[1]);
        let predicates = Arc::clone(&backend.predicates);
        let dataset = Dataset::with_backend(config, Box::new(backend)).unwrap();
        dataset.get(0).unwrap();
        let seen = predicates.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("pulses".to_string(), Some("\"string\" IN (1, 2)".to_string())),
                ("truth".to_string(), None),
            ]
        );
    }

    #[test]
    fn query_whole_table() {
        let backend = Box::new(MemoryBackend::single(&[1, 2]));
        let dataset = Dataset::with_backend(config(), backend).unwrap();
        let rows = dataset
            .query_table("pulses", &["event_no".to_string()], None, None)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows.column("event_no").unwrap(),
            vec![&Value::Int(1), &Value::Int(2), &Value::Int(2)]
        );
    }

    #[test]
    fn backend_detection() {
        assert_eq!(BackendKind::from_path(Path::new("a/b.DB")).unwrap(), BackendKind::Sqlite);
        assert_eq!(BackendKind::from_path(Path::new("b.parquet")).unwrap(), BackendKind::Parquet);
        assert!(BackendKind::from_path(Path::new("b.csv")).is_err());
        assert!(BackendKind::detect(&[PathBuf::from("a.db"), PathBuf::from("b.parquet")]).is_err());
    }

    #[test]
    fn parquet_arguments_rejected_before_io() {
        let config = DatasetConfig::new("missing.parquet", "pulses").with_string_selection(vec![1]);
        assert!(matches!(Dataset::open(config), Err(Error::Configuration(_))));

        let mut config = DatasetConfig::new("a.parquet", "pulses");
        config.paths.push(PathBuf::from("b.parquet"));
        assert!(matches!(Dataset::open(config), Err(Error::Configuration(_))));
    }
}
