//! Record types and the pure pipeline stages for infrastructure-failure batches.
//!
//! The stages in this crate never touch the warehouse:
//! - [`Transformer`] deduplicates raw records, normalizes timestamps and
//!   derives `outage_minutes` and the `YYYYMMDD` date key.
//! - [`QualityGate`] counts batch-wide violations and only hands out a
//!   [`ValidatedBatch`] when there are none.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::Span;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("extraction error: {0}")]
    Extraction(String),
    #[error("transformation error: row {row}: cannot parse {field} {value:?}: {reason}")]
    Transformation {
        row: usize,
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("quality violation: {0}")]
    QualityViolation(QualityReport),
    #[error("load error: {0}")]
    Load(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "extraction",
            Self::Transformation { .. } => "transformation",
            Self::QualityViolation(_) => "quality_violation",
            Self::Load(_) => "load",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How fractional outage minutes become the integer stored on the fact row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OutageRounding {
    #[default]
    TowardZero,
    Floor,
    Ceil,
    Round,
}

impl OutageRounding {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(self, minutes: f64) -> i64 {
        let rounded = match self {
            Self::TowardZero => minutes.trunc(),
            Self::Floor => minutes.floor(),
            Self::Ceil => minutes.ceil(),
            Self::Round => minutes.round(),
        };
        rounded as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub outage_rounding: OutageRounding,
    pub record_failed_runs: bool,
    pub progress_interval: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            outage_rounding: OutageRounding::TowardZero,
            record_failed_runs: true,
            progress_interval: 50,
        }
    }
}

impl PipelineConfig {
    /// Validates configured values.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when a value is out of range.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.progress_interval == 0 {
            return Err(PipelineError::Configuration(
                "progress_interval MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates a pipeline configuration from JSON.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when JSON decoding fails
    /// or decoded values are invalid.
    pub fn from_json(value: &Value) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            PipelineError::Configuration(format!("invalid pipeline config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// One input row as handed over by the reader. Equality covers every field.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct RawFailureRecord {
    pub asset_id: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub failure_type: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformedFailureRecord {
    pub asset_id: Option<String>,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub failure_type: String,
    pub resolved: bool,
    pub outage_minutes: f64,
    pub date_key: i64,
}

impl TransformedFailureRecord {
    #[must_use]
    pub fn full_date(&self) -> Date {
        self.start.date()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformSummary {
    pub raw_records: usize,
    pub duplicates_removed: usize,
    pub transformed_records: usize,
    pub min_outage_minutes: Option<f64>,
    pub max_outage_minutes: Option<f64>,
    pub avg_outage_minutes: Option<f64>,
    pub earliest_date_key: Option<i64>,
    pub latest_date_key: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformedBatch {
    pub records: Vec<TransformedFailureRecord>,
    pub summary: TransformSummary,
}

#[derive(Debug, Clone)]
pub struct Transformer {
    span: Span,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::with_span(Span::none())
    }
}

impl Transformer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_span(span: Span) -> Self {
        Self { span }
    }

    /// Deduplicates whole records, parses timestamps and derives the
    /// outage duration and date key for every surviving record.
    ///
    /// Negative durations are kept; judging them is the quality gate's job.
    ///
    /// # Errors
    /// Returns [`PipelineError::Transformation`] for the first timestamp that
    /// cannot be parsed. No partial batch is returned.
    pub fn transform(&self, raw: &[RawFailureRecord]) -> Result<TransformedBatch, PipelineError> {
        tracing::info!(parent: &self.span, raw_records = raw.len(), "starting transformation");

        let mut seen = HashSet::with_capacity(raw.len());
        let mut records = Vec::with_capacity(raw.len());

        for (index, record) in raw.iter().enumerate() {
            if !seen.insert(record) {
                continue;
            }

            let row = index + 1;
            let start = parse_record_timestamp(row, "start_time", &record.start_time)?;
            let end = parse_record_timestamp(row, "end_time", &record.end_time)?;

            records.push(TransformedFailureRecord {
                asset_id: normalize_asset_id(record.asset_id.as_deref()),
                start,
                end,
                failure_type: record.failure_type.clone(),
                resolved: record.resolved,
                outage_minutes: outage_minutes(start, end),
                date_key: date_key(start.date()),
            });
        }

        let summary = summarize(raw.len(), &records);
        if summary.duplicates_removed > 0 {
            tracing::warn!(
                parent: &self.span,
                duplicates_removed = summary.duplicates_removed,
                "removed duplicate records"
            );
        }
        tracing::info!(
            parent: &self.span,
            min_outage_minutes = summary.min_outage_minutes,
            max_outage_minutes = summary.max_outage_minutes,
            avg_outage_minutes = summary.avg_outage_minutes,
            earliest_date_key = summary.earliest_date_key,
            latest_date_key = summary.latest_date_key,
            transformed_records = summary.transformed_records,
            "transformation complete"
        );

        Ok(TransformedBatch { records, summary })
    }
}

fn parse_record_timestamp(
    row: usize,
    field: &'static str,
    value: &str,
) -> Result<OffsetDateTime, PipelineError> {
    parse_timestamp(value).map_err(|reason| PipelineError::Transformation {
        row,
        field,
        value: value.to_string(),
        reason,
    })
}

fn normalize_asset_id(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(ToString::to_string)
}

#[allow(clippy::cast_precision_loss)]
fn summarize(raw_records: usize, records: &[TransformedFailureRecord]) -> TransformSummary {
    let minutes = records.iter().map(|record| record.outage_minutes);
    let min_outage_minutes = minutes.clone().reduce(f64::min);
    let max_outage_minutes = minutes.clone().reduce(f64::max);
    let avg_outage_minutes = if records.is_empty() {
        None
    } else {
        Some(minutes.sum::<f64>() / records.len() as f64)
    };

    TransformSummary {
        raw_records,
        duplicates_removed: raw_records - records.len(),
        transformed_records: records.len(),
        min_outage_minutes,
        max_outage_minutes,
        avg_outage_minutes,
        earliest_date_key: records.iter().map(|record| record.date_key).min(),
        latest_date_key: records.iter().map(|record| record.date_key).max(),
    }
}

/// Minutes between two instants, keeping fractional precision.
#[must_use]
pub fn outage_minutes(start: OffsetDateTime, end: OffsetDateTime) -> f64 {
    (end - start).as_seconds_f64() / 60.0
}

/// `YYYY * 10000 + MM * 100 + DD` for the given calendar date.
#[must_use]
pub fn date_key(date: Date) -> i64 {
    i64::from(date.year()) * 10_000 + i64::from(u8::from(date.month())) * 100 + i64::from(date.day())
}

/// Parses the timestamp shapes the upstream exports use.
///
/// Offset-bearing values keep their offset, so `.date()` is the calendar
/// date as written. Naive values are taken as UTC.
///
/// # Errors
/// Returns a human-readable reason when no supported shape matches.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("timestamp is empty".to_string());
    }

    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(parsed);
    }

    let naive = PrimitiveDateTime::parse(
        trimmed,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        )
    })
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        )
    })
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        )
    })
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!("[year]-[month]-[day] [hour]:[minute]"),
        )
    })
    .or_else(|_| {
        Date::parse(trimmed, format_description!("[year]-[month]-[day]")).map(Date::midnight)
    });

    match naive {
        Ok(value) => Ok(value.assume_utc()),
        Err(err) => Err(format!("unsupported timestamp format: {err}")),
    }
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns the underlying formatting error.
pub fn format_date(value: Date) -> Result<String, time::error::Format> {
    value.format(format_description!("[year]-[month]-[day]"))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns the underlying formatting error.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.to_offset(UtcOffset::UTC).format(&Rfc3339)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct QualityReport {
    pub total_records: usize,
    pub null_asset_count: usize,
    pub negative_outage_count: usize,
}

impl QualityReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.null_asset_count == 0 && self.negative_outage_count == 0
    }
}

impl Display for QualityReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "null_asset_count={} negative_outage_count={} total_records={}",
            self.null_asset_count, self.negative_outage_count, self.total_records
        )
    }
}

#[must_use]
pub fn check_null_asset(records: &[TransformedFailureRecord]) -> usize {
    records
        .iter()
        .filter(|record| record.asset_id.is_none())
        .count()
}

#[must_use]
pub fn check_negative_outage(records: &[TransformedFailureRecord]) -> usize {
    records
        .iter()
        .filter(|record| record.outage_minutes < 0.0)
        .count()
}

/// A record that passed the quality gate: it has an asset id and a
/// non-negative duration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadableFailure {
    asset_id: String,
    full_date: Date,
    date_key: i64,
    failure_type: String,
    outage_minutes: f64,
    resolved: bool,
}

impl LoadableFailure {
    #[must_use]
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    #[must_use]
    pub fn full_date(&self) -> Date {
        self.full_date
    }

    #[must_use]
    pub fn date_key(&self) -> i64 {
        self.date_key
    }

    #[must_use]
    pub fn failure_type(&self) -> &str {
        &self.failure_type
    }

    #[must_use]
    pub fn outage_minutes(&self) -> f64 {
        self.outage_minutes
    }

    #[must_use]
    pub fn resolved(&self) -> bool {
        self.resolved
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    records: Vec<LoadableFailure>,
    report: QualityReport,
}

impl ValidatedBatch {
    #[must_use]
    pub fn records(&self) -> &[LoadableFailure] {
        &self.records
    }

    #[must_use]
    pub fn report(&self) -> QualityReport {
        self.report
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    span: Span,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::with_span(Span::none())
    }
}

impl QualityGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_span(span: Span) -> Self {
        Self { span }
    }

    #[must_use]
    pub fn evaluate(&self, records: &[TransformedFailureRecord]) -> QualityReport {
        let report = QualityReport {
            total_records: records.len(),
            null_asset_count: check_null_asset(records),
            negative_outage_count: check_negative_outage(records),
        };
        tracing::info!(
            parent: &self.span,
            total_records = report.total_records,
            null_asset_count = report.null_asset_count,
            negative_outage_count = report.negative_outage_count,
            "quality checks evaluated"
        );
        report
    }

    /// Accepts the whole batch or nothing.
    ///
    /// # Errors
    /// Returns [`PipelineError::QualityViolation`] carrying the counts when
    /// any record has a null asset id or a negative outage.
    pub fn admit(
        &self,
        records: Vec<TransformedFailureRecord>,
    ) -> Result<ValidatedBatch, PipelineError> {
        let report = self.evaluate(&records);
        if !report.passed() {
            tracing::error!(parent: &self.span, %report, "batch rejected by quality gate");
            return Err(PipelineError::QualityViolation(report));
        }

        let mut loadable = Vec::with_capacity(records.len());
        for record in records {
            let full_date = record.full_date();
            let Some(asset_id) = record.asset_id else {
                return Err(PipelineError::QualityViolation(report));
            };
            loadable.push(LoadableFailure {
                asset_id,
                full_date,
                date_key: record.date_key,
                failure_type: record.failure_type,
                outage_minutes: record.outage_minutes,
                resolved: record.resolved,
            });
        }

        Ok(ValidatedBatch {
            records: loadable,
            report,
        })
    }
}
