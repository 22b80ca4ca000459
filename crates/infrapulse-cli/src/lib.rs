//! Command surface and run orchestration for the failure-event warehouse.
//!
//! Hosts that schedule runs themselves should embed through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_etl`] for one run from a CSV file against an open warehouse.
//! - [`run_batch`] for one run from records already in memory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use infrapulse_core::{
    PipelineConfig, PipelineError, QualityGate, QualityReport, RawFailureRecord, RunStatus,
    TransformSummary, Transformer,
};
use infrapulse_warehouse_sqlite::SqliteWarehouse;
use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

pub const REQUIRED_COLUMNS: [&str; 5] = [
    "asset_id",
    "start_time",
    "end_time",
    "failure_type",
    "resolved",
];

#[derive(Debug, Parser)]
#[command(name = "infrapulse")]
#[command(about = "Infrastructure failure warehouse loader")]
pub struct Cli {
    #[arg(
        long,
        env = "INFRAPULSE_DB",
        default_value = "./infrapulse_warehouse.sqlite3"
    )]
    db: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Run(RunArgs),
    Inspect(InspectArgs),
    Verify,
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    Init,
    Status,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long, env = "INFRAPULSE_INPUT")]
    input: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    skip_missing: bool,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    List(RunsListArgs),
}

#[derive(Debug, Args)]
pub struct RunsListArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    status: Option<RunStatusArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RunStatusArg {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EtlRunReport {
    pub contract_version: String,
    pub run_id: i64,
    pub run_uid: Ulid,
    pub records_received: usize,
    pub duplicates_removed: usize,
    pub records_loaded: usize,
    pub assets_inserted: usize,
    pub dates_inserted: usize,
    pub quality: QualityReport,
    pub transform: TransformSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InspectReport {
    pub contract_version: String,
    pub loadable: bool,
    pub transform: TransformSummary,
    pub quality: QualityReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRun {
    pub contract_version: String,
    pub skipped: bool,
    pub input: String,
}

#[derive(Debug, Deserialize)]
struct CsvFailureRow {
    asset_id: Option<String>,
    start_time: String,
    end_time: String,
    failure_type: String,
    resolved: String,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the warehouse cannot be opened, a run fails, or
/// verification reports an unhealthy warehouse.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.log_format);

    match cli.command {
        Command::Inspect(args) => {
            let raw = read_failures_csv(&args.input)?;
            let report = inspect_batch(&raw)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        command => {
            let mut warehouse = SqliteWarehouse::open(&cli.db)?;
            warehouse.ensure_schema()?;
            run_command(command, &mut warehouse)
        }
    }
}

fn run_command(command: Command, warehouse: &mut SqliteWarehouse) -> Result<()> {
    match command {
        Command::Schema { command } => {
            let counts = match command {
                SchemaCommand::Init => {
                    tracing::info!("star schema ready");
                    warehouse.table_counts()?
                }
                SchemaCommand::Status => warehouse.table_counts()?,
            };
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::Run(args) => {
            if args.skip_missing && !args.input.exists() {
                tracing::info!(
                    input = %args.input.display(),
                    "input file not found, skipping run"
                );
                let skipped = SkippedRun {
                    contract_version: "etl_run.v1".to_string(),
                    skipped: true,
                    input: args.input.display().to_string(),
                };
                println!("{}", serde_json::to_string_pretty(&skipped)?);
                return Ok(());
            }

            let config = load_config(args.config.as_deref())?;
            let report = run_etl(warehouse, &args.input, &config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Verify => {
            let report = warehouse.verify()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.healthy {
                Ok(())
            } else {
                Err(anyhow!(
                    "warehouse verification failed: {}",
                    report
                        .issues
                        .iter()
                        .map(|issue| issue.code.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            }
        }
        Command::Runs {
            command: RunsCommand::List(args),
        } => {
            let status = args.status.map(|value| match value {
                RunStatusArg::Success => RunStatus::Success,
                RunStatusArg::Failure => RunStatus::Failure,
            });
            let runs = warehouse.run_metadata().list(status, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(())
        }
        Command::Inspect(_) => Err(anyhow!(
            "internal dispatch error: inspect should be handled before warehouse initialization"
        )),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(err) = installed {
        tracing::debug!(error = %err, "keeping the already installed subscriber");
    }
}

/// Reads a pipeline configuration file, falling back to defaults.
///
/// # Errors
/// Returns [`PipelineError::Configuration`] when the file is unreadable or
/// its content is invalid.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, PipelineError> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };

    let body = fs::read_to_string(path).map_err(|err| {
        PipelineError::Configuration(format!("failed to read {}: {err}", path.display()))
    })?;
    let value: serde_json::Value = serde_json::from_str(&body).map_err(|err| {
        PipelineError::Configuration(format!("invalid JSON in {}: {err}", path.display()))
    })?;
    PipelineConfig::from_json(&value)
}

/// Reads the tabular input into raw records.
///
/// # Errors
/// Returns [`PipelineError::Extraction`] when the file is missing, a
/// required column is absent, or a row cannot be decoded.
pub fn read_failures_csv(path: &Path) -> Result<Vec<RawFailureRecord>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| {
            PipelineError::Extraction(format!("failed to open {}: {err}", path.display()))
        })?;

    let headers = reader.headers().map_err(|err| {
        PipelineError::Extraction(format!("failed to read header of {}: {err}", path.display()))
    })?;
    for required in REQUIRED_COLUMNS {
        if !headers.iter().any(|candidate| candidate == required) {
            return Err(PipelineError::Extraction(format!(
                "missing column {required} in {}",
                path.display()
            )));
        }
    }

    let mut records = Vec::new();
    for (index, decoded) in reader.deserialize::<CsvFailureRow>().enumerate() {
        let row = index + 1;
        let decoded = decoded.map_err(|err| {
            PipelineError::Extraction(format!(
                "failed to decode row {row} of {}: {err}",
                path.display()
            ))
        })?;
        let resolved = parse_resolved(&decoded.resolved).ok_or_else(|| {
            PipelineError::Extraction(format!(
                "row {row}: invalid resolved value {:?}",
                decoded.resolved
            ))
        })?;

        records.push(RawFailureRecord {
            asset_id: decoded.asset_id,
            start_time: decoded.start_time,
            end_time: decoded.end_time,
            failure_type: decoded.failure_type,
            resolved,
        });
    }

    tracing::info!(
        input = %path.display(),
        records = records.len(),
        "extracted failure records"
    );
    Ok(records)
}

fn parse_resolved(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Transforms and gates a batch, then loads it as one run.
///
/// # Errors
/// Returns the first [`PipelineError`] raised by any stage. When the
/// configuration asks for it, a `FAILURE` run row is recorded first.
pub fn run_batch(
    warehouse: &mut SqliteWarehouse,
    raw: &[RawFailureRecord],
    config: &PipelineConfig,
) -> Result<EtlRunReport, PipelineError> {
    config.validate()?;
    EtlRun::start().execute(warehouse, raw, config)
}

/// Reads `input` and runs it through [`run_batch`]. Extraction failures are
/// recorded like any other failed run.
///
/// # Errors
/// Returns the first [`PipelineError`] raised by extraction or any stage.
pub fn run_etl(
    warehouse: &mut SqliteWarehouse,
    input: &Path,
    config: &PipelineConfig,
) -> Result<EtlRunReport, PipelineError> {
    config.validate()?;
    let run = EtlRun::start();
    match read_failures_csv(input) {
        Ok(raw) => run.execute(warehouse, &raw, config),
        Err(error) => Err(run.fail(warehouse, config, 0, 0, error)),
    }
}

/// Opens the warehouse at `db_path` and runs `input` against it.
///
/// # Errors
/// Returns an error when the warehouse cannot be opened or the run fails.
pub fn run_etl_with_db(
    db_path: &Path,
    input: &Path,
    config: &PipelineConfig,
) -> Result<EtlRunReport> {
    let mut warehouse = SqliteWarehouse::open(db_path)?;
    warehouse.ensure_schema()?;
    Ok(run_etl(&mut warehouse, input, config)?)
}

/// Transforms and evaluates a batch without touching any warehouse.
///
/// # Errors
/// Returns [`PipelineError::Transformation`] when a timestamp cannot be parsed.
pub fn inspect_batch(raw: &[RawFailureRecord]) -> Result<InspectReport, PipelineError> {
    let batch = Transformer::new().transform(raw)?;
    let quality = QualityGate::new().evaluate(&batch.records);
    Ok(InspectReport {
        contract_version: "etl_inspect.v1".to_string(),
        loadable: quality.passed(),
        transform: batch.summary,
        quality,
    })
}

struct EtlRun {
    run_uid: Ulid,
    span: Span,
}

impl EtlRun {
    fn start() -> Self {
        let run_uid = Ulid::new();
        let span = tracing::info_span!("etl_run", run_uid = %run_uid);
        Self { run_uid, span }
    }

    fn execute(
        &self,
        warehouse: &mut SqliteWarehouse,
        raw: &[RawFailureRecord],
        config: &PipelineConfig,
    ) -> Result<EtlRunReport, PipelineError> {
        tracing::info!(parent: &self.span, records_received = raw.len(), "etl run started");

        match self.stages(warehouse, raw, config) {
            Ok(report) => {
                tracing::info!(
                    parent: &self.span,
                    run_id = report.run_id,
                    records_loaded = report.records_loaded,
                    "etl run succeeded"
                );
                Ok(report)
            }
            Err((records_staged, error)) => {
                Err(self.fail(warehouse, config, raw.len(), records_staged, error))
            }
        }
    }

    fn stages(
        &self,
        warehouse: &mut SqliteWarehouse,
        raw: &[RawFailureRecord],
        config: &PipelineConfig,
    ) -> Result<EtlRunReport, (usize, PipelineError)> {
        let batch = Transformer::with_span(self.span.clone())
            .transform(raw)
            .map_err(|err| (0, err))?;
        let transform = batch.summary;
        let validated = QualityGate::with_span(self.span.clone())
            .admit(batch.records)
            .map_err(|err| (0, err))?;

        let loaded = warehouse
            .writer(config)
            .with_span(self.span.clone())
            .load(self.run_uid, &validated, raw.len())
            .map_err(|failure| (failure.records_staged, failure.into_pipeline_error()))?;

        Ok(EtlRunReport {
            contract_version: "etl_run.v1".to_string(),
            run_id: loaded.run_id,
            run_uid: loaded.run_uid,
            records_received: raw.len(),
            duplicates_removed: transform.duplicates_removed,
            records_loaded: loaded.records_loaded,
            assets_inserted: loaded.assets_inserted,
            dates_inserted: loaded.dates_inserted,
            quality: validated.report(),
            transform,
        })
    }

    fn fail(
        &self,
        warehouse: &mut SqliteWarehouse,
        config: &PipelineConfig,
        records_received: usize,
        records_staged: usize,
        error: PipelineError,
    ) -> PipelineError {
        tracing::error!(
            parent: &self.span,
            kind = error.kind(),
            error = %error,
            "etl run failed"
        );

        if config.record_failed_runs {
            match warehouse.record_failed_run(
                self.run_uid,
                records_received,
                records_staged,
                &error,
            ) {
                Ok(row) => {
                    tracing::info!(parent: &self.span, run_id = row.run_id, "recorded FAILURE run");
                }
                Err(bookkeeping) => {
                    tracing::error!(
                        parent: &self.span,
                        error = %format!("{bookkeeping:#}"),
                        "failed to record FAILURE run"
                    );
                }
            }
        }

        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_init_tolerates_an_existing_subscriber() {
        init_tracing(LogFormat::Text);
        init_tracing(LogFormat::Json);
        tracing::info!("subscriber still usable");
    }
}
