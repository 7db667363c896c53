use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;

use pulsegraph::error::SkipReason;
use pulsegraph::selection::{balanced_signal_background_indices, TruthLabels, MUON_PID};
use pulsegraph::sink::{ParquetSink, SqliteSink};
use pulsegraph::{
    ConversionConfig, ConversionOrchestrator, ConversionReport, Dataset, DatasetConfig, Error,
    Sink, Value,
};

const GEOMETRY: &str = r#"{"stop": "G", "objects": {"I3Geometry": {"omgeo": [
    {"string": 1, "om": 1, "x": 0.5, "y": 1.5, "z": -10.25},
    {"string": 2, "om": 7, "x": -3.0, "y": 4.0, "z": -20.5}
]}}}"#;

fn physics(run: i64, pid: i64, energy: f64, pulses: &str) -> String {
    format!(
        r#"{{"stop": "P", "objects": {{
            "I3EventHeader": {{"run_id": {run}, "sub_run_id": 0, "event_id": {run}, "sub_event_id": 0}},
            "MCPrimary": {{"energy": {energy}, "pdg_encoding": {pid},
                "pos": {{"x": 1.25, "y": -2.5, "z": -300.75}},
                "dir": {{"azimuth": 0.25, "zenith": 1.5}}}},
            "SRTInIcePulses": [{pulses}]
        }}}}"#
    )
    .replace('\n', " ")
}

fn write_gz(path: &Path, lines: &[String]) {
    let mut encoder = GzEncoder::new(File::create(path).expect("create"), Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").expect("write");
    }
    encoder.finish().expect("finish");
}

/// One directory holding a calibration file and an event file with two good
/// events, one header-only event and three records that are skipped.
fn write_inputs(root: &Path) {
    let dir = root.join("run_0001");
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("GeoCalibDetectorStatus.i3.json"), format!("{GEOMETRY}\n"))
        .expect("geometry");
    write_gz(
        &dir.join("events_0001.i3.json.gz"),
        &[
            r#"{"stop": "Q", "objects": {}}"#.to_string(),
            physics(
                11,
                14,
                12.5,
                r#"{"string": 1, "om": 1, "time": 10000.5, "charge": 1.25, "width": 8.0},
                   {"string": 2, "om": 7, "time": 10010.0, "charge": 0.75, "width": 8.0},
                   {"string": 9, "om": 9, "time": 10020.0, "charge": 2.5, "width": 8.0}"#,
            ),
            "{not json".to_string(),
            physics(
                12,
                -12,
                3.75,
                r#"{"string": 2, "om": 7, "time": 9000.25, "charge": 4.5, "width": 4.0}"#,
            ),
            r#"{"stop": "P", "objects": {"I3EventHeader": {"run_id": 13, "sub_run_id": 0, "event_id": 1, "sub_event_id": 0}}}"#.to_string(),
            r#"{"stop": "P", "objects": {"Unrelated": 1}}"#.to_string(),
        ],
    );
}

fn convert<S: Sink>(root: &Path, sink: S) -> ConversionReport {
    let mut orchestrator = ConversionOrchestrator::new(ConversionConfig::default(), sink);
    orchestrator.run(&[root]).expect("convert")
}

#[test]
fn conversion_skips_bad_records_and_numbers_events() {
    let dir = tempdir().expect("tempdir");
    write_inputs(dir.path());
    let db = dir.path().join("out").join("events.db");
    let report = convert(dir.path(), SqliteSink::new(&db));

    assert_eq!(report.files_discovered, 1);
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.stats.events_written, 3);
    assert_eq!(report.stats.skipped.get(&SkipReason::Malformed), Some(&1));
    assert_eq!(report.stats.skipped.get(&SkipReason::Extraction), Some(&1));
    assert_eq!(report.next_event_no, 3);

    let dataset = Dataset::open(DatasetConfig::new(&db, "SRTInIcePulses")).expect("open");
    assert_eq!(dataset.len(), 3);

    let first = dataset.get(0).expect("get");
    let pulses = first.table("SRTInIcePulses").expect("pulses");
    assert_eq!(pulses.len(), 3);
    assert_eq!(
        pulses.column("dom_x").expect("dom_x"),
        vec![&Value::Float(0.5), &Value::Float(-3.0), &Value::Null]
    );
    let truth = first.table("truth").expect("truth");
    assert_eq!(truth.len(), 1);
    assert_eq!(truth.column("pid").expect("pid"), vec![&Value::Int(14)]);

    let header_only = dataset.get(2).expect("get");
    assert!(header_only.table("SRTInIcePulses").expect("pulses").is_empty());
    assert_eq!(
        header_only.table("truth").expect("truth").column("energy").expect("energy"),
        vec![&Value::Null]
    );
}

#[test]
fn sqlite_and_parquet_read_back_identically() {
    let dir = tempdir().expect("tempdir");
    write_inputs(dir.path());
    let db = dir.path().join("events.db");
    let parquet = dir.path().join("events.parquet");
    let batched = dir.path().join("batched.parquet");
    convert(dir.path(), SqliteSink::new(&db));
    convert(dir.path(), ParquetSink::new(&parquet));
    convert(dir.path(), ParquetSink::new(&batched).with_batch_events(1));

    let from_sqlite = Dataset::open(DatasetConfig::new(&db, "SRTInIcePulses")).expect("sqlite");
    for path in [parquet, batched] {
        let from_parquet =
            Dataset::open(DatasetConfig::new(&path, "SRTInIcePulses")).expect("parquet");
        assert_eq!(from_sqlite.len(), from_parquet.len());
        for i in 0..from_sqlite.len() {
            let a = from_sqlite.get(i).expect("sqlite get");
            let b = from_parquet.get(i).expect("parquet get");
            assert_eq!(a.event.event_no, b.event.event_no);
            assert_eq!(a.tables, b.tables, "{} event {i}", path.display());
        }
    }
}

#[test]
fn scalar_columns_broadcast_over_hits() {
    let dir = tempdir().expect("tempdir");
    write_inputs(dir.path());
    let db = dir.path().join("events.db");
    convert(dir.path(), SqliteSink::new(&db));

    let config = DatasetConfig::new(&db, "SRTInIcePulses").with_features(["event_no", "charge"]);
    let dataset = Dataset::open(config).expect("open");
    let pulses = dataset.get(0).expect("get");
    let pulses = pulses.table("SRTInIcePulses").expect("pulses");
    assert_eq!(pulses.columns, vec!["event_no", "charge"]);
    assert!(pulses.rows.iter().all(|row| row[0] == Value::Int(0)));
}

#[test]
fn missing_column_is_reported_as_such() {
    let dir = tempdir().expect("tempdir");
    write_inputs(dir.path());
    let db = dir.path().join("events.db");
    convert(dir.path(), SqliteSink::new(&db));

    let config = DatasetConfig::new(&db, "SRTInIcePulses").with_truth(["energy", "no_such_column"]);
    let dataset = Dataset::open(config).expect("open");
    let err = dataset.get(0).expect_err("missing column");
    assert!(err.is_column_missing());
    match err {
        Error::ColumnMissing { table, column } => {
            assert_eq!(table, "truth");
            assert_eq!(column, "no_such_column");
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn string_selection_keeps_matching_hits() {
    let dir = tempdir().expect("tempdir");
    write_inputs(dir.path());
    let db = dir.path().join("events.db");
    convert(dir.path(), SqliteSink::new(&db));

    let config = DatasetConfig::new(&db, "SRTInIcePulses")
        .with_features(["string", "charge"])
        .with_string_selection(vec![2]);
    let dataset = Dataset::open(config).expect("open");
    let sample = dataset.get(0).expect("get");
    assert_eq!(
        sample.table("SRTInIcePulses").expect("pulses").rows,
        vec![vec![Value::Int(2), Value::Float(0.75)]]
    );
}

#[test]
fn selection_defines_dataset_order() {
    let dir = tempdir().expect("tempdir");
    write_inputs(dir.path());
    let db = dir.path().join("events.db");
    convert(dir.path(), SqliteSink::new(&db));

    let config = DatasetConfig::new(&db, "SRTInIcePulses").with_selection(vec![2, 0]);
    let dataset = Dataset::open(config).expect("open");
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.get(0).expect("get").event.event_no, 2);
    assert_eq!(dataset.get(1).expect("get").event.event_no, 0);
    assert!(matches!(
        dataset.get(2),
        Err(Error::IndexOutOfRange { index: 2, len: 2 })
    ));
}

#[test]
fn several_sqlite_files_form_one_dataset() {
    let dir = tempdir().expect("tempdir");
    write_inputs(dir.path());
    let a = dir.path().join("a.db");
    let b = dir.path().join("b.db");
    convert(dir.path(), SqliteSink::new(&a));
    convert(dir.path(), SqliteSink::new(&b));

    let mut config = DatasetConfig::new(&a, "SRTInIcePulses");
    config.paths.push(b);
    let dataset = Dataset::open(config).expect("open");
    assert_eq!(dataset.len(), 6);
    let key = dataset.event_key(4).expect("key");
    assert_eq!((key.store, key.event_no), (1, 1));
}

/// Two nu_e, three nu_mu, three nu_tau and five muons, one pulse each.
fn write_labelled_inputs(root: &Path) {
    let dir = root.join("run_0002");
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("GeoCalibDetectorStatus.i3.json"), format!("{GEOMETRY}\n"))
        .expect("geometry");
    let pulse = r#"{"string": 1, "om": 1, "time": 100.0, "charge": 1.0, "width": 8.0}"#;
    let lines: Vec<String> = [12, -12, 14, -14, 14, 16, 16, -16, 13, -13, 13, 13, 13]
        .iter()
        .enumerate()
        .map(|(run, &pid)| physics(run as i64, pid, 1.5, pulse))
        .collect();
    write_gz(&dir.join("events_0002.i3.json.gz"), &lines);
}

#[test]
fn balanced_selection_comes_from_the_stored_truth_table() {
    let dir = tempdir().expect("tempdir");
    write_labelled_inputs(dir.path());
    let db = dir.path().join("events.db");
    let parquet = dir.path().join("events.parquet");
    convert(dir.path(), SqliteSink::new(&db));
    convert(dir.path(), ParquetSink::new(&parquet).with_batch_events(4));

    for path in [db, parquet] {
        let before = std::fs::read(&path).expect("read store");
        let dataset = Dataset::open(DatasetConfig::new(&path, "SRTInIcePulses")).expect("open");
        let labels = TruthLabels::load(&dataset, "pid").expect("labels");
        assert_eq!(labels.len(), 13);

        let selection =
            balanced_signal_background_indices(&labels, &mut StdRng::seed_from_u64(7));
        // min(5 muons, 3 flavours x 2) of each
        assert_eq!(selection.len(), 10);
        let known: HashSet<i64> = dataset.mapping().keys().iter().map(|k| k.event_no).collect();
        assert!(selection.iter().all(|id| known.contains(id)));
        let muons: HashSet<i64> = labels.with_abs_pid(MUON_PID).into_iter().collect();
        assert_eq!(selection.iter().filter(|id| muons.contains(id)).count(), 5);

        drop(dataset);
        assert_eq!(std::fs::read(&path).expect("reread store"), before, "{}", path.display());
    }
}

#[test]
fn truth_labels_refuse_several_stores() {
    let dir = tempdir().expect("tempdir");
    write_labelled_inputs(dir.path());
    let a = dir.path().join("a.db");
    let b = dir.path().join("b.db");
    convert(dir.path(), SqliteSink::new(&a));
    convert(dir.path(), SqliteSink::new(&b));

    let mut config = DatasetConfig::new(&a, "SRTInIcePulses");
    config.paths.push(b);
    let dataset = Dataset::open(config).expect("open");
    assert_eq!(dataset.stores(), 2);
    assert!(matches!(
        TruthLabels::load(&dataset, "pid"),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn missing_input_root_is_no_input() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("nowhere");
    let db = dir.path().join("events.db");
    let mut orchestrator =
        ConversionOrchestrator::new(ConversionConfig::default(), SqliteSink::new(&db));
    assert!(matches!(
        orchestrator.run(&[missing.as_path()]),
        Err(Error::NoInput { .. })
    ));
    assert!(!db.exists());
}
