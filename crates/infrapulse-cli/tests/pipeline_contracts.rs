#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};

use infrapulse_cli::{inspect_batch, load_config, read_failures_csv, run_batch, run_etl};
use infrapulse_core::{PipelineConfig, PipelineError, RawFailureRecord, RunStatus};
use infrapulse_warehouse_sqlite::{SqliteWarehouse, WarehouseCounts};
use rusqlite::Connection;
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn fixture_warehouse() -> SqliteWarehouse {
    let warehouse = must(SqliteWarehouse::open(Path::new(":memory:")));
    must(warehouse.ensure_schema());
    warehouse
}

fn temp_file(extension: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "infrapulse-pipeline-{}.{extension}",
        Ulid::new()
    ));
    if let Err(err) = fs::write(&path, body) {
        panic!("failed to write fixture {}: {err}", path.display());
    }
    path
}

fn raw(asset_id: Option<&str>, start: &str, end: &str) -> RawFailureRecord {
    RawFailureRecord {
        asset_id: asset_id.map(ToString::to_string),
        start_time: start.to_string(),
        end_time: end.to_string(),
        failure_type: "power".to_string(),
        resolved: false,
    }
}

fn counts(warehouse: &SqliteWarehouse) -> WarehouseCounts {
    must(warehouse.counts())
}

fn assert_no_star_rows(warehouse: &SqliteWarehouse) {
    let counts = counts(warehouse);
    assert_eq!(counts.fact_rows, 0);
    assert_eq!(counts.asset_rows, 0);
    assert_eq!(counts.date_rows, 0);
}

#[test]
fn clean_batch_loads_and_records_success() {
    let mut warehouse = fixture_warehouse();
    let record = raw(Some("A-1"), "2026-02-17T10:00:00", "2026-02-17T10:45:00");
    let report = must(run_batch(
        &mut warehouse,
        &[
            record.clone(),
            record,
            raw(Some("A-2"), "2026-02-18T08:00:00", "2026-02-18T09:30:00"),
        ],
        &PipelineConfig::default(),
    ));

    assert_eq!(report.records_received, 3);
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(report.records_loaded, 2);
    assert_eq!(report.assets_inserted, 2);
    assert_eq!(report.dates_inserted, 2);
    assert!(report.quality.passed());

    let runs = must(warehouse.run_metadata().list(None, None));
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].run_uid, report.run_uid);
    assert_eq!(runs[0].records_received, 3);
}

#[test]
fn null_asset_aborts_before_any_warehouse_write() {
    let mut warehouse = fixture_warehouse();
    let result = run_batch(
        &mut warehouse,
        &[
            raw(None, "2026-02-17T10:00:00", "2026-02-17T10:45:00"),
            raw(Some("A-1"), "2026-02-17T10:00:00", "2026-02-17T10:45:00"),
        ],
        &PipelineConfig::default(),
    );

    match result {
        Err(PipelineError::QualityViolation(report)) => {
            assert_eq!(report.null_asset_count, 1);
            assert_eq!(report.negative_outage_count, 0);
        }
        other => panic!("expected quality violation, got {other:?}"),
    }

    assert_no_star_rows(&warehouse);
    let failed = must(warehouse.run_metadata().list(Some(RunStatus::Failure), None));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].records_loaded, 0);
    assert_eq!(failed[0].records_staged, 0);
    assert_eq!(failed[0].error_kind.as_deref(), Some("quality_violation"));
}

#[test]
fn negative_outage_aborts_identically() {
    let mut warehouse = fixture_warehouse();
    let result = run_batch(
        &mut warehouse,
        &[raw(Some("A-1"), "2026-02-17T10:45:00", "2026-02-17T10:00:00")],
        &PipelineConfig::default(),
    );

    match result {
        Err(PipelineError::QualityViolation(report)) => {
            assert!(report.negative_outage_count >= 1);
        }
        other => panic!("expected quality violation, got {other:?}"),
    }

    assert_no_star_rows(&warehouse);
    assert_eq!(counts(&warehouse).runs.successful_runs, 0);
    assert_eq!(counts(&warehouse).runs.failed_runs, 1);
}

#[test]
fn unparseable_timestamp_aborts_and_is_recorded() {
    let mut warehouse = fixture_warehouse();
    let result = run_batch(
        &mut warehouse,
        &[
            raw(Some("A-1"), "2026-02-17T10:00:00", "2026-02-17T10:45:00"),
            raw(Some("A-2"), "2026-02-17T10:00:00", "not-a-time"),
        ],
        &PipelineConfig::default(),
    );

    match result {
        Err(PipelineError::Transformation { row, field, .. }) => {
            assert_eq!(row, 2);
            assert_eq!(field, "end_time");
        }
        other => panic!("expected transformation error, got {other:?}"),
    }

    assert_no_star_rows(&warehouse);
    let failed = must(warehouse.run_metadata().list(Some(RunStatus::Failure), None));
    assert_eq!(failed[0].error_kind.as_deref(), Some("transformation"));
    assert_eq!(failed[0].records_received, 2);
}

#[test]
fn constraint_violation_mid_batch_leaves_no_partial_run() {
    let db_path = temp_file("sqlite3", "");
    must(must(SqliteWarehouse::open(&db_path)).ensure_schema());
    let conn = must(Connection::open(&db_path));
    must(conn.execute_batch(
        "CREATE TRIGGER trg_reject_fact BEFORE INSERT ON fact_service_failure
         WHEN NEW.failure_type = 'rejected'
         BEGIN SELECT RAISE(ABORT, 'fact rejected'); END;",
    ));
    drop(conn);
    let mut warehouse = must(SqliteWarehouse::open(&db_path));

    let mut records: Vec<_> = (0..10)
        .map(|index| {
            raw(
                Some(format!("A-{index}").as_str()),
                "2026-02-17T10:00:00",
                "2026-02-17T10:45:00",
            )
        })
        .collect();
    let mut bad = raw(Some("A-ORPHAN"), "2026-04-01T10:00:00", "2026-04-01T10:45:00");
    bad.failure_type = "rejected".to_string();
    records.push(bad);

    let result = run_batch(&mut warehouse, &records, &PipelineConfig::default());
    match result {
        Err(PipelineError::Load(message)) => assert!(!message.is_empty()),
        other => panic!("expected load error, got {other:?}"),
    }

    assert_no_star_rows(&warehouse);
    assert!(must(warehouse.asset_key("A-ORPHAN")).is_none());

    let runs = must(warehouse.run_metadata().list(None, None));
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failure);
    assert_eq!(runs[0].records_loaded, 0);
    assert_eq!(runs[0].records_received, 11);
    assert_eq!(runs[0].records_staged, 10);
    assert_eq!(runs[0].error_kind.as_deref(), Some("load"));
}

#[test]
fn blank_failure_type_passes_the_gate_and_loads() {
    let mut warehouse = fixture_warehouse();
    let mut record = raw(Some("A-1"), "2026-02-17T10:00:00", "2026-02-17T10:45:00");
    record.failure_type = String::new();

    let report = must(run_batch(&mut warehouse, &[record], &PipelineConfig::default()));
    assert_eq!(report.records_loaded, 1);
    assert_eq!(must(warehouse.verify()).sample[0].failure_type, "");
}

#[test]
fn offset_timestamps_keep_the_date_they_were_written_with() {
    let mut warehouse = fixture_warehouse();
    let report = must(run_batch(
        &mut warehouse,
        &[raw(
            Some("A-1"),
            "2026-02-17T01:30:00+02:00",
            "2026-02-17T02:30:00+02:00",
        )],
        &PipelineConfig::default(),
    ));

    assert_eq!(report.transform.earliest_date_key, Some(20_260_217));
    let sample = must(warehouse.verify()).sample;
    assert_eq!(sample[0].full_date, "2026-02-17");
    assert_eq!(sample[0].outage_minutes, 60);
}

#[test]
fn failed_run_rows_can_be_disabled() {
    let mut warehouse = fixture_warehouse();
    let config = PipelineConfig {
        record_failed_runs: false,
        ..PipelineConfig::default()
    };
    let result = run_batch(
        &mut warehouse,
        &[raw(None, "2026-02-17T10:00:00", "2026-02-17T10:45:00")],
        &config,
    );

    assert!(matches!(result, Err(PipelineError::QualityViolation(_))));
    assert!(must(warehouse.run_metadata().list(None, None)).is_empty());
}

#[test]
fn repeated_asset_across_runs_keeps_one_dimension_row() {
    let mut warehouse = fixture_warehouse();
    let config = PipelineConfig::default();
    let first = must(run_batch(
        &mut warehouse,
        &[raw(Some("A-1"), "2026-02-17T10:00:00", "2026-02-17T10:45:00")],
        &config,
    ));
    let second = must(run_batch(
        &mut warehouse,
        &[raw(Some("A-1"), "2026-02-19T10:00:00", "2026-02-19T10:15:00")],
        &config,
    ));

    assert_eq!(first.assets_inserted, 1);
    assert_eq!(second.assets_inserted, 0);
    assert_eq!(second.dates_inserted, 1);

    let counts = counts(&warehouse);
    assert_eq!(counts.asset_rows, 1);
    assert_eq!(counts.fact_rows, 2);
    assert_eq!(counts.orphaned_asset_facts, 0);
    assert_eq!(counts.orphaned_date_facts, 0);
    assert!(must(warehouse.verify()).healthy);
}

#[test]
fn csv_run_reads_transforms_and_loads() {
    let mut warehouse = fixture_warehouse();
    let input = temp_file(
        "csv",
        "asset_id,start_time,end_time,failure_type,resolved\n\
         A-1,2026-02-17 10:00:00,2026-02-17 10:45:00,power,True\n\
         A-1,2026-02-17 10:00:00,2026-02-17 10:45:00,power,True\n\
         A-2,2026-02-17 11:00:00,2026-02-17 11:20:30,network,false\n",
    );

    let report = must(run_etl(&mut warehouse, &input, &PipelineConfig::default()));
    assert_eq!(report.records_received, 3);
    assert_eq!(report.records_loaded, 2);
    assert_eq!(report.transform.earliest_date_key, Some(20_260_217));

    let sample = must(warehouse.verify()).sample;
    assert_eq!(sample[0].outage_minutes, 45);
    assert_eq!(sample[1].outage_minutes, 20);
}

#[test]
fn missing_input_is_an_extraction_failure() {
    let mut warehouse = fixture_warehouse();
    let missing = std::env::temp_dir().join(format!("infrapulse-missing-{}.csv", Ulid::new()));

    let result = run_etl(&mut warehouse, &missing, &PipelineConfig::default());
    assert!(matches!(result, Err(PipelineError::Extraction(_))));

    let failed = must(warehouse.run_metadata().list(Some(RunStatus::Failure), None));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_kind.as_deref(), Some("extraction"));
}

#[test]
fn reader_treats_empty_asset_as_null_and_rejects_missing_columns() {
    let input = temp_file(
        "csv",
        "asset_id,start_time,end_time,failure_type,resolved\n\
         ,2026-02-17T10:00:00,2026-02-17T10:45:00,power,1\n",
    );
    let records = must(read_failures_csv(&input));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].asset_id, None);
    assert!(records[0].resolved);

    let report = must(inspect_batch(&records));
    assert!(!report.loadable);
    assert_eq!(report.quality.null_asset_count, 1);

    let missing_column = temp_file("csv", "asset_id,start_time,end_time,resolved\nA-1,x,y,true\n");
    assert!(matches!(
        read_failures_csv(&missing_column),
        Err(PipelineError::Extraction(_))
    ));

    let bad_flag = temp_file(
        "csv",
        "asset_id,start_time,end_time,failure_type,resolved\n\
         A-1,2026-02-17T10:00:00,2026-02-17T10:45:00,power,maybe\n",
    );
    assert!(matches!(
        read_failures_csv(&bad_flag),
        Err(PipelineError::Extraction(_))
    ));
}

#[test]
fn config_file_is_validated() {
    assert_eq!(must(load_config(None)), PipelineConfig::default());

    let valid = temp_file("json", r#"{"outage_rounding": "floor", "progress_interval": 10}"#);
    let config = must(load_config(Some(&valid)));
    assert_eq!(config.progress_interval, 10);

    let invalid = temp_file("json", r#"{"progress_interval": 0}"#);
    assert!(matches!(
        load_config(Some(&invalid)),
        Err(PipelineError::Configuration(_))
    ));
}
