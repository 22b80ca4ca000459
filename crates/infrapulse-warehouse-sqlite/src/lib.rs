#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use infrapulse_core::{
    format_date, format_rfc3339, now_utc, OutageRounding, PipelineConfig, PipelineError,
    RunStatus, ValidatedBatch,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use time::OffsetDateTime;
use tracing::Span;
use ulid::Ulid;

pub const WAREHOUSE_TABLES: [&str; 4] = [
    "dim_asset",
    "dim_date",
    "fact_service_failure",
    "etl_metadata",
];

const SCHEMA_STAR_V1: &str = r"
CREATE TABLE IF NOT EXISTS dim_asset (
  asset_key INTEGER PRIMARY KEY AUTOINCREMENT,
  asset_id TEXT NOT NULL UNIQUE CHECK (length(trim(asset_id)) > 0),
  asset_type TEXT,
  service_type TEXT,
  location TEXT
);

CREATE TABLE IF NOT EXISTS dim_date (
  date_key INTEGER PRIMARY KEY CHECK (date_key > 0),
  full_date TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS fact_service_failure (
  failure_id INTEGER PRIMARY KEY AUTOINCREMENT,
  asset_key INTEGER NOT NULL,
  date_key INTEGER NOT NULL,
  failure_type TEXT NOT NULL,
  outage_minutes INTEGER NOT NULL CHECK (outage_minutes >= 0),
  resolved INTEGER NOT NULL CHECK (resolved IN (0, 1)),
  FOREIGN KEY (asset_key) REFERENCES dim_asset(asset_key),
  FOREIGN KEY (date_key) REFERENCES dim_date(date_key)
);

CREATE INDEX IF NOT EXISTS idx_fact_service_failure_asset
  ON fact_service_failure(asset_key);
CREATE INDEX IF NOT EXISTS idx_fact_service_failure_date
  ON fact_service_failure(date_key);

CREATE TABLE IF NOT EXISTS etl_metadata (
  run_id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_uid TEXT NOT NULL UNIQUE,
  records_loaded INTEGER NOT NULL CHECK (records_loaded >= 0),
  status TEXT NOT NULL CHECK (status IN ('SUCCESS', 'FAILURE')),
  records_received INTEGER NOT NULL CHECK (records_received >= 0),
  records_staged INTEGER NOT NULL CHECK (records_staged >= 0),
  error_kind TEXT,
  error_message TEXT,
  recorded_at TEXT NOT NULL,
  CHECK (status = 'SUCCESS' OR records_loaded = 0)
);

CREATE INDEX IF NOT EXISTS idx_etl_metadata_status
  ON etl_metadata(status, run_id);

CREATE TRIGGER IF NOT EXISTS trg_dim_asset_no_update
BEFORE UPDATE ON dim_asset
BEGIN
  SELECT RAISE(FAIL, 'dim_asset is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_dim_asset_no_delete
BEFORE DELETE ON dim_asset
BEGIN
  SELECT RAISE(FAIL, 'dim_asset is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_dim_date_no_update
BEFORE UPDATE ON dim_date
BEGIN
  SELECT RAISE(FAIL, 'dim_date is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_dim_date_no_delete
BEFORE DELETE ON dim_date
BEGIN
  SELECT RAISE(FAIL, 'dim_date is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_fact_service_failure_no_update
BEFORE UPDATE ON fact_service_failure
BEGIN
  SELECT RAISE(FAIL, 'fact_service_failure is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_fact_service_failure_no_delete
BEFORE DELETE ON fact_service_failure
BEGIN
  SELECT RAISE(FAIL, 'fact_service_failure is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_etl_metadata_no_update
BEFORE UPDATE ON etl_metadata
BEGIN
  SELECT RAISE(FAIL, 'etl_metadata is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_etl_metadata_no_delete
BEFORE DELETE ON etl_metadata
BEGIN
  SELECT RAISE(FAIL, 'etl_metadata is append-only');
END;
";

pub struct SqliteWarehouse {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LoadReport {
    pub run_id: i64,
    pub run_uid: Ulid,
    pub records_loaded: usize,
    pub assets_inserted: usize,
    pub dates_inserted: usize,
}

/// A failed unit of work. Nothing it staged was committed.
#[derive(Debug)]
pub struct LoadFailure {
    pub records_staged: usize,
    pub error: anyhow::Error,
}

impl LoadFailure {
    #[must_use]
    pub fn into_pipeline_error(self) -> PipelineError {
        PipelineError::Load(format!("{:#}", self.error))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RunMetadata {
    pub run_id: i64,
    pub run_uid: Ulid,
    pub records_loaded: usize,
    pub status: RunStatus,
    pub records_received: usize,
    pub records_staged: usize,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMetadataInput {
    pub run_uid: Ulid,
    pub status: RunStatus,
    pub records_loaded: usize,
    pub records_received: usize,
    pub records_staged: usize,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub total_records_loaded: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TableCount {
    pub table: String,
    pub rows: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WarehouseCounts {
    pub fact_rows: usize,
    pub asset_rows: usize,
    pub date_rows: usize,
    pub null_asset_keys: usize,
    pub negative_outages: usize,
    pub orphaned_asset_facts: usize,
    pub orphaned_date_facts: usize,
    pub runs: RunSummary,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct VerificationIssue {
    pub code: String,
    pub severity: VerificationIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FactSample {
    pub asset_id: String,
    pub asset_type: Option<String>,
    pub full_date: String,
    pub failure_type: String,
    pub outage_minutes: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub contract_version: String,
    pub healthy: bool,
    pub counts: WarehouseCounts,
    pub issues: Vec<VerificationIssue>,
    pub sample: Vec<FactSample>,
}

impl SqliteWarehouse {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite warehouse at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_STAR_V1)
            .context("failed to apply star schema")?;
        Ok(())
    }

    #[must_use]
    pub fn writer(&mut self, config: &PipelineConfig) -> WarehouseWriter<'_> {
        WarehouseWriter {
            conn: &mut self.conn,
            rounding: config.outage_rounding,
            progress_interval: config.progress_interval.max(1),
            span: Span::none(),
        }
    }

    #[must_use]
    pub fn run_metadata(&self) -> RunMetadataStore<'_> {
        RunMetadataStore::new(&self.conn)
    }

    /// Appends a `FAILURE` row in its own transaction.
    pub fn record_failed_run(
        &mut self,
        run_uid: Ulid,
        records_received: usize,
        records_staged: usize,
        error: &PipelineError,
    ) -> Result<RunMetadata> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start failure bookkeeping transaction")?;
        let row = RunMetadataStore::new(&tx).append(&RunMetadataInput {
            run_uid,
            status: RunStatus::Failure,
            records_loaded: 0,
            records_received,
            records_staged,
            error_kind: Some(error.kind().to_string()),
            error_message: Some(error.to_string()),
        })?;
        tx.commit()
            .context("failed to commit failure bookkeeping transaction")?;
        Ok(row)
    }

    pub fn table_counts(&self) -> Result<Vec<TableCount>> {
        WAREHOUSE_TABLES
            .iter()
            .map(|table| -> Result<TableCount> {
                Ok(TableCount {
                    table: (*table).to_string(),
                    rows: count_query(&self.conn, &format!("SELECT COUNT(*) FROM {table}"))?,
                })
            })
            .collect()
    }

    pub fn counts(&self) -> Result<WarehouseCounts> {
        Ok(WarehouseCounts {
            fact_rows: count_query(&self.conn, "SELECT COUNT(*) FROM fact_service_failure")?,
            asset_rows: count_query(&self.conn, "SELECT COUNT(*) FROM dim_asset")?,
            date_rows: count_query(&self.conn, "SELECT COUNT(*) FROM dim_date")?,
            null_asset_keys: count_query(
                &self.conn,
                "SELECT COUNT(*) FROM fact_service_failure WHERE asset_key IS NULL",
            )?,
            negative_outages: count_query(
                &self.conn,
                "SELECT COUNT(*) FROM fact_service_failure WHERE outage_minutes < 0",
            )?,
            orphaned_asset_facts: count_query(
                &self.conn,
                "SELECT COUNT(*)
                 FROM fact_service_failure fact
                 LEFT JOIN dim_asset asset ON asset.asset_key = fact.asset_key
                 WHERE asset.asset_key IS NULL",
            )?,
            orphaned_date_facts: count_query(
                &self.conn,
                "SELECT COUNT(*)
                 FROM fact_service_failure fact
                 LEFT JOIN dim_date day ON day.date_key = fact.date_key
                 WHERE day.date_key IS NULL",
            )?,
            runs: self.run_metadata().summary()?,
        })
    }

    /// Read-only acceptance checks over the whole warehouse.
    pub fn verify(&self) -> Result<VerificationReport> {
        let counts = self.counts()?;
        let mut issues = Vec::new();

        if counts.fact_rows == 0 {
            issues.push(VerificationIssue {
                code: "empty_fact_table".to_string(),
                severity: VerificationIssueSeverity::Error,
                message: "no records found in fact_service_failure".to_string(),
            });
        }

        if counts.null_asset_keys > 0 {
            issues.push(VerificationIssue {
                code: "null_asset_key".to_string(),
                severity: VerificationIssueSeverity::Error,
                message: format!(
                    "found {} fact rows with null asset_key",
                    counts.null_asset_keys
                ),
            });
        }

        if counts.negative_outages > 0 {
            issues.push(VerificationIssue {
                code: "negative_outage".to_string(),
                severity: VerificationIssueSeverity::Error,
                message: format!(
                    "found {} fact rows with negative outage_minutes",
                    counts.negative_outages
                ),
            });
        }

        let orphaned = counts.orphaned_asset_facts + counts.orphaned_date_facts;
        if orphaned > 0 {
            issues.push(VerificationIssue {
                code: "orphaned_facts".to_string(),
                severity: VerificationIssueSeverity::Error,
                message: format!(
                    "found orphaned fact rows: asset={} date={}",
                    counts.orphaned_asset_facts, counts.orphaned_date_facts
                ),
            });
        }

        if counts.runs.failed_runs > 0 {
            issues.push(VerificationIssue {
                code: "failed_runs_recorded".to_string(),
                severity: VerificationIssueSeverity::Warning,
                message: format!("{} failed runs recorded", counts.runs.failed_runs),
            });
        }

        let sample = self.fact_sample(3)?;
        let healthy = !issues
            .iter()
            .any(|item| item.severity == VerificationIssueSeverity::Error);

        Ok(VerificationReport {
            contract_version: "warehouse_verify.v1".to_string(),
            healthy,
            counts,
            issues,
            sample,
        })
    }

    pub fn asset_key(&self, asset_id: &str) -> Result<Option<i64>> {
        let key = self
            .conn
            .query_row(
                "SELECT asset_key FROM dim_asset WHERE asset_id = ?1",
                params![asset_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up asset_key for {asset_id}"))?;
        Ok(key)
    }

    fn fact_sample(&self, limit: usize) -> Result<Vec<FactSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT asset.asset_id, asset.asset_type, day.full_date, fact.failure_type,
                    fact.outage_minutes
             FROM fact_service_failure fact
             JOIN dim_asset asset ON fact.asset_key = asset.asset_key
             JOIN dim_date day ON fact.date_key = day.date_key
             ORDER BY fact.failure_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![usize_to_sql(limit)?], |row| {
            Ok(FactSample {
                asset_id: row.get(0)?,
                asset_type: row.get(1)?,
                full_date: row.get(2)?,
                failure_type: row.get(3)?,
                outage_minutes: row.get(4)?,
            })
        })?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Loads one quality-passed batch as a single unit of work.
pub struct WarehouseWriter<'conn> {
    conn: &'conn mut Connection,
    rounding: OutageRounding,
    progress_interval: usize,
    span: Span,
}

#[derive(Debug, Default)]
struct StagedCounts {
    assets_inserted: usize,
    dates_inserted: usize,
    facts_staged: usize,
}

impl WarehouseWriter<'_> {
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Upserts dimensions, inserts facts and appends the `SUCCESS` row, then
    /// commits. Any failure rolls the whole transaction back.
    pub fn load(
        self,
        run_uid: Ulid,
        batch: &ValidatedBatch,
        records_received: usize,
    ) -> Result<LoadReport, LoadFailure> {
        let Self {
            conn,
            rounding,
            progress_interval,
            span,
        } = self;

        let tx = conn.transaction().map_err(|err| LoadFailure {
            records_staged: 0,
            error: anyhow::Error::new(err).context("failed to start load transaction"),
        })?;

        tracing::info!(parent: &span, records = batch.len(), "loading batch into warehouse");

        let mut counts = StagedCounts::default();
        let staged = stage_batch(&tx, batch, rounding, progress_interval, &span, &mut counts)
            .and_then(|()| {
                RunMetadataStore::new(&tx).append(&RunMetadataInput {
                    run_uid,
                    status: RunStatus::Success,
                    records_loaded: counts.facts_staged,
                    records_received,
                    records_staged: counts.facts_staged,
                    error_kind: None,
                    error_message: None,
                })
            });

        let outcome = match staged {
            Ok(run) => tx
                .commit()
                .context("failed to commit load transaction")
                .map(|()| run),
            Err(error) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(parent: &span, error = %rollback_err, "explicit rollback failed");
                }
                Err(error)
            }
        };

        match outcome {
            Ok(run) => {
                tracing::info!(
                    parent: &span,
                    run_id = run.run_id,
                    records_loaded = counts.facts_staged,
                    assets_inserted = counts.assets_inserted,
                    dates_inserted = counts.dates_inserted,
                    "load committed"
                );
                Ok(LoadReport {
                    run_id: run.run_id,
                    run_uid,
                    records_loaded: counts.facts_staged,
                    assets_inserted: counts.assets_inserted,
                    dates_inserted: counts.dates_inserted,
                })
            }
            Err(error) => {
                tracing::error!(
                    parent: &span,
                    records_staged = counts.facts_staged,
                    error = %format!("{error:#}"),
                    "load rolled back"
                );
                Err(LoadFailure {
                    records_staged: counts.facts_staged,
                    error,
                })
            }
        }
    }
}

fn stage_batch(
    tx: &Transaction<'_>,
    batch: &ValidatedBatch,
    rounding: OutageRounding,
    progress_interval: usize,
    span: &Span,
    counts: &mut StagedCounts,
) -> Result<()> {
    let mut insert_asset = tx.prepare_cached(
        "INSERT INTO dim_asset(asset_id) VALUES (?1)
         ON CONFLICT(asset_id) DO NOTHING",
    )?;
    let mut select_asset =
        tx.prepare_cached("SELECT asset_key FROM dim_asset WHERE asset_id = ?1")?;
    let mut asset_keys: HashMap<&str, i64> = HashMap::new();

    for record in batch.records() {
        let asset_id = record.asset_id();
        if asset_keys.contains_key(asset_id) {
            continue;
        }
        counts.assets_inserted += insert_asset
            .execute(params![asset_id])
            .with_context(|| format!("failed to upsert dim_asset {asset_id}"))?;
        let asset_key: i64 = select_asset
            .query_row(params![asset_id], |row| row.get(0))
            .with_context(|| format!("failed to resolve asset_key for {asset_id}"))?;
        asset_keys.insert(asset_id, asset_key);
    }

    let mut insert_date = tx.prepare_cached(
        "INSERT INTO dim_date(date_key, full_date) VALUES (?1, ?2)
         ON CONFLICT(date_key) DO NOTHING",
    )?;
    let mut date_keys = BTreeSet::new();

    for record in batch.records() {
        if !date_keys.insert(record.date_key()) {
            continue;
        }
        let full_date = format_date(record.full_date()).map_err(|err| anyhow!(err.to_string()))?;
        counts.dates_inserted += insert_date
            .execute(params![record.date_key(), full_date])
            .with_context(|| format!("failed to upsert dim_date {}", record.date_key()))?;
    }

    tracing::debug!(
        parent: span,
        distinct_assets = asset_keys.len(),
        distinct_dates = date_keys.len(),
        assets_inserted = counts.assets_inserted,
        dates_inserted = counts.dates_inserted,
        "dimensions upserted"
    );

    let mut insert_fact = tx.prepare_cached(
        "INSERT INTO fact_service_failure(
            asset_key, date_key, failure_type, outage_minutes, resolved
         ) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;

    for (index, record) in batch.records().iter().enumerate() {
        let asset_key = asset_keys
            .get(record.asset_id())
            .copied()
            .ok_or_else(|| anyhow!("unresolved asset_key for {}", record.asset_id()))?;

        insert_fact
            .execute(params![
                asset_key,
                record.date_key(),
                record.failure_type(),
                rounding.apply(record.outage_minutes()),
                bool_to_sql(record.resolved()),
            ])
            .with_context(|| format!("failed to insert fact for record {}", index + 1))?;
        counts.facts_staged += 1;

        if counts.facts_staged % progress_interval == 0 {
            tracing::info!(
                parent: span,
                processed = counts.facts_staged,
                total = batch.len(),
                "load progress"
            );
        }
    }

    Ok(())
}

/// Append-only log of run outcomes.
pub struct RunMetadataStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> RunMetadataStore<'conn> {
    #[must_use]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn append(&self, input: &RunMetadataInput) -> Result<RunMetadata> {
        let recorded_at = now_utc();
        self.conn
            .execute(
                "INSERT INTO etl_metadata(
                    run_uid, records_loaded, status, records_received, records_staged,
                    error_kind, error_message, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    input.run_uid.to_string(),
                    usize_to_sql(input.records_loaded)?,
                    input.status.as_str(),
                    usize_to_sql(input.records_received)?,
                    usize_to_sql(input.records_staged)?,
                    input.error_kind,
                    input.error_message,
                    format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to append etl_metadata row")?;

        Ok(RunMetadata {
            run_id: self.conn.last_insert_rowid(),
            run_uid: input.run_uid,
            records_loaded: input.records_loaded,
            status: input.status,
            records_received: input.records_received,
            records_staged: input.records_staged,
            error_kind: input.error_kind.clone(),
            error_message: input.error_message.clone(),
            recorded_at,
        })
    }

    pub fn list(&self, status: Option<RunStatus>, limit: Option<usize>) -> Result<Vec<RunMetadata>> {
        let mut query = "SELECT
                run_id, run_uid, records_loaded, status, records_received, records_staged,
                error_kind, error_message, recorded_at
             FROM etl_metadata
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY run_id DESC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![status.map(RunStatus::as_str)], parse_run_row)?;
        collect_rows(rows)
    }

    pub fn get(&self, run_uid: Ulid) -> Result<Option<RunMetadata>> {
        let row = self
            .conn
            .query_row(
                "SELECT
                    run_id, run_uid, records_loaded, status, records_received, records_staged,
                    error_kind, error_message, recorded_at
                 FROM etl_metadata
                 WHERE run_uid = ?1",
                params![run_uid.to_string()],
                parse_run_row,
            )
            .optional()
            .with_context(|| format!("failed to read etl_metadata for run {run_uid}"))?;
        Ok(row)
    }

    pub fn summary(&self) -> Result<RunSummary> {
        let (successful, failed, loaded) = self
            .conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN status = 'SUCCESS' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'FAILURE' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'SUCCESS' THEN records_loaded ELSE 0 END), 0)
                 FROM etl_metadata",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .context("failed to summarize etl_metadata")?;

        Ok(RunSummary {
            successful_runs: sql_to_usize(successful)?,
            failed_runs: sql_to_usize(failed)?,
            total_records_loaded: sql_to_usize(loaded)?,
        })
    }
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunMetadata> {
    let run_uid_raw: String = row.get(1)?;
    let status_raw: String = row.get(3)?;
    let recorded_at_raw: String = row.get(8)?;

    let run_uid = Ulid::from_string(&run_uid_raw)
        .map_err(|err| invalid_column(1, rusqlite::types::Type::Text, err.to_string()))?;
    let status = RunStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(
            3,
            rusqlite::types::Type::Text,
            format!("invalid run status: {status_raw}"),
        )
    })?;
    let recorded_at = infrapulse_core::parse_timestamp(&recorded_at_raw)
        .map_err(|reason| invalid_column(8, rusqlite::types::Type::Text, reason))?;

    Ok(RunMetadata {
        run_id: row.get(0)?,
        run_uid,
        records_loaded: column_usize(row, 2)?,
        status,
        records_received: column_usize(row, 4)?,
        records_staged: column_usize(row, 5)?,
        error_kind: row.get(6)?,
        error_message: row.get(7)?,
        recorded_at,
    })
}

fn column_usize(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<usize> {
    let value: i64 = row.get(index)?;
    usize::try_from(value).map_err(|_| {
        invalid_column(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid count value: {value}"),
        )
    })
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn count_query(conn: &Connection, sql: &str) -> Result<usize> {
    let count = conn
        .query_row(sql, [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    sql_to_usize(count)
}

fn sql_to_usize(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("invalid count value: {value}"))
}

fn usize_to_sql(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count out of range: {value}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
