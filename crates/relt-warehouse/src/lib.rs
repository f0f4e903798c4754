//! Warehouse contract for the load and merge jobs, plus the backends that
//! fulfil it.
//!
//! The pipeline never loads, deduplicates or merges rows itself: every
//! backend hands the work to an engine (BigQuery, Postgres) or, for local runs
//! and tests, to an in-process model of the same statements.

use async_trait::async_trait;
use relt_core::{ObjectLocator, TableRef, REVIEW_COLUMNS};
use relt_storage::{FetchError, TokenError};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub mod bigquery;
pub mod memory;
pub mod postgres;

pub use bigquery::{BigQueryConfig, BigQueryWarehouse};
pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "relt-warehouse";

/// Bulk append-load of one newline-delimited JSON object. Format, schema
/// auto-detection and append write mode are fixed for every load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJobSpec {
    pub source: ObjectLocator,
    pub destination: TableRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub job_id: String,
    pub output_rows: u64,
}

/// Staging → analytics transformation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub staging: TableRef,
    pub analytics: TableRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub job_id: String,
    pub inserted_rows: u64,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("line {line} is not a JSON object: {message}")]
    MalformedRecord { line: usize, message: String },
    #[error("schema conflict on field `{field}`: table has {existing}, row has {incoming}")]
    SchemaConflict {
        field: String,
        existing: String,
        incoming: String,
    },
    #[error("unexpected warehouse response: {0}")]
    Protocol(String),
    #[error(transparent)]
    Api(#[from] FetchError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Run the load job to completion. Either every row of the object lands in
    /// the destination or none does.
    async fn load_ndjson(&self, spec: &LoadJobSpec) -> Result<LoadReport, WarehouseError>;

    /// Insert validated, deduplicated staging rows whose `review_id` is not yet
    /// in the analytics table. Existing analytics rows are never touched.
    async fn merge_new_reviews(&self, spec: &MergeSpec) -> Result<MergeReport, WarehouseError>;
}

fn column_list() -> String {
    REVIEW_COLUMNS.join(", ")
}

/// BigQuery standard-SQL `MERGE` for one transformation pass.
///
/// Candidate rows are non-empty-text, dated, rated and keyed; exact duplicates
/// collapse through `DISTINCT`, and variants sharing a `review_id` collapse to
/// the one with the latest `date` so the target keeps one row per review.
pub fn bigquery_merge_statement(spec: &MergeSpec) -> String {
    let columns = column_list();
    let values = REVIEW_COLUMNS
        .iter()
        .map(|c| format!("source.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"MERGE {target} AS target
USING (
    SELECT {columns}
    FROM (
        SELECT DISTINCT {columns}
        FROM {staging}
        WHERE LENGTH(TRIM(text)) > 0
          AND date IS NOT NULL
          AND stars IS NOT NULL
          AND review_id IS NOT NULL
    )
    WHERE TRUE
    QUALIFY ROW_NUMBER() OVER (PARTITION BY review_id ORDER BY date DESC) = 1
) AS source
ON target.review_id = source.review_id
WHEN NOT MATCHED THEN
    INSERT ({columns})
    VALUES ({values})"#,
        target = spec.analytics.bigquery_path(),
        staging = spec.staging.bigquery_path(),
    )
}

/// Postgres rendition of the same pass. Staging rows keep the verbatim
/// document in a `raw` JSONB column, so the six columns are projected here.
/// Plain `TRIM` only strips spaces, so the text check names every whitespace
/// character explicitly.
pub fn postgres_merge_statement(spec: &MergeSpec) -> String {
    let columns = column_list();
    format!(
        r#"INSERT INTO {target} ({columns})
SELECT DISTINCT ON (review_id) {columns}
FROM (
    SELECT DISTINCT
        raw->>'review_id' AS review_id,
        raw->>'user_id' AS user_id,
        raw->>'business_id' AS business_id,
        (raw->>'stars')::double precision AS stars,
        raw->>'text' AS text,
        raw->>'date' AS date
    FROM {staging}
    WHERE LENGTH(BTRIM(raw->>'text', E' \t\n\r\f\x0B')) > 0
      AND raw->>'date' IS NOT NULL
      AND raw->>'stars' IS NOT NULL
      AND raw->>'review_id' IS NOT NULL
) AS source
ORDER BY review_id, date DESC
ON CONFLICT (review_id) DO NOTHING"#,
        target = spec.analytics.postgres_path(),
        staging = spec.staging.postgres_path(),
    )
}

/// Split newline-delimited JSON into objects. Blank lines are ignored; any
/// other line that is not a JSON object fails the whole batch.
pub fn parse_ndjson(bytes: &[u8]) -> Result<Vec<Map<String, JsonValue>>, WarehouseError> {
    let text = std::str::from_utf8(bytes).map_err(|err| WarehouseError::MalformedRecord {
        line: 0,
        message: format!("object is not valid UTF-8: {err}"),
    })?;

    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonValue>(line) {
            Ok(JsonValue::Object(map)) => rows.push(map),
            Ok(other) => {
                return Err(WarehouseError::MalformedRecord {
                    line: idx + 1,
                    message: format!("expected object, found {}", json_kind_name(&other)),
                })
            }
            Err(err) => {
                return Err(WarehouseError::MalformedRecord {
                    line: idx + 1,
                    message: err.to_string(),
                })
            }
        }
    }
    Ok(rows)
}

pub(crate) fn json_kind_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
