//! BigQuery backend speaking the v2 REST jobs API.
//!
//! Jobs are inserted with a client-chosen id, so an insert retried after a
//! lost response shows up as `409 Conflict` and is treated as submitted. The
//! job is then polled until `DONE` with no overall deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relt_core::TableRef;
use relt_storage::{AccessTokenProvider, ApiClient, BackoffPolicy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    bigquery_merge_statement, LoadJobSpec, LoadReport, MergeReport, MergeSpec, Warehouse,
    WarehouseError,
};

pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com";

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project: String,
    pub location: Option<String>,
    pub api_base: String,
    pub poll: BackoffPolicy,
}

impl BigQueryConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            location: None,
            api_base: DEFAULT_API_BASE.to_string(),
            poll: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}

pub struct BigQueryWarehouse {
    api: ApiClient,
    tokens: Arc<dyn AccessTokenProvider>,
    config: BigQueryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    status: JobStatus,
    #[serde(default)]
    statistics: JobStatistics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(reason), None) => reason.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
    #[serde(default)]
    query: Option<QueryStatistics>,
}

// The REST API encodes int64 counters as strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatistics {
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
}

fn parse_counter(value: Option<&str>, what: &str) -> Result<u64, WarehouseError> {
    match value {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| WarehouseError::Protocol(format!("{what} is not an integer: {raw}"))),
    }
}

fn table_reference(table: &TableRef) -> JsonValue {
    json!({
        "projectId": table.project,
        "datasetId": table.dataset,
        "tableId": table.table,
    })
}

pub fn load_job_configuration(spec: &LoadJobSpec) -> JsonValue {
    json!({
        "load": {
            "sourceUris": [spec.source.to_string()],
            "destinationTable": table_reference(&spec.destination),
            "sourceFormat": "NEWLINE_DELIMITED_JSON",
            "autodetect": true,
            "writeDisposition": "WRITE_APPEND",
        }
    })
}

pub fn merge_job_configuration(spec: &MergeSpec) -> JsonValue {
    json!({
        "query": {
            "query": bigquery_merge_statement(spec),
            "useLegacySql": false,
        }
    })
}

impl BigQueryWarehouse {
    pub fn new(api: ApiClient, tokens: Arc<dyn AccessTokenProvider>, config: BigQueryConfig) -> Self {
        Self { api, tokens, config }
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/jobs",
            self.config.api_base.trim_end_matches('/'),
            self.config.project
        )
    }

    async fn insert_job(&self, prefix: &str, configuration: JsonValue) -> Result<String, WarehouseError> {
        let job_id = format!("{prefix}_{}", Uuid::new_v4().simple());
        let mut job_reference = json!({
            "projectId": self.config.project,
            "jobId": job_id,
        });
        if let Some(location) = &self.config.location {
            job_reference["location"] = json!(location);
        }
        let body = json!({
            "jobReference": job_reference,
            "configuration": configuration,
        });

        let token = self.tokens.access_token().await?;
        let url = self.jobs_url();
        match self
            .api
            .send_with_retry(|client| client.post(&url).bearer_auth(&token).json(&body))
            .await
        {
            Ok(_) => {}
            Err(err) if err.status() == Some(409) => {
                debug!(%job_id, "job already submitted");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(job_id)
    }

    async fn wait_for_job(&self, job_id: &str) -> Result<JobResource, WarehouseError> {
        let url = format!("{}/{}", self.jobs_url(), job_id);
        let mut query = Vec::new();
        if let Some(location) = &self.config.location {
            query.push(("location", location.clone()));
        }

        let mut attempt = 0usize;
        loop {
            let token = self.tokens.access_token().await?;
            let resp = self
                .api
                .send_with_retry(|client| client.get(&url).bearer_auth(&token).query(&query))
                .await?;
            let job: JobResource = resp
                .json()
                .await
                .map_err(|err| WarehouseError::Protocol(format!("decoding job {job_id}: {err}")))?;

            if job.status.state == "DONE" {
                if let Some(error) = &job.status.error_result {
                    return Err(WarehouseError::JobFailed {
                        job_id: job_id.to_string(),
                        reason: error.describe(),
                    });
                }
                return Ok(job);
            }

            debug!(job_id, state = %job.status.state, "job still running");
            tokio::time::sleep(self.config.poll.delay_for_attempt(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn backend(&self) -> &'static str {
        "bigquery"
    }

    async fn load_ndjson(&self, spec: &LoadJobSpec) -> Result<LoadReport, WarehouseError> {
        let job_id = self.insert_job("relt_load", load_job_configuration(spec)).await?;
        let job = self.wait_for_job(&job_id).await?;
        let output_rows = parse_counter(
            job.statistics
                .load
                .as_ref()
                .and_then(|s| s.output_rows.as_deref()),
            "outputRows",
        )?;
        info!(%job_id, source = %spec.source, destination = %spec.destination, output_rows, "load job finished");
        Ok(LoadReport { job_id, output_rows })
    }

    async fn merge_new_reviews(&self, spec: &MergeSpec) -> Result<MergeReport, WarehouseError> {
        let job_id = self.insert_job("relt_merge", merge_job_configuration(spec)).await?;
        let job = self.wait_for_job(&job_id).await?;
        let inserted_rows = parse_counter(
            job.statistics
                .query
                .as_ref()
                .and_then(|s| s.num_dml_affected_rows.as_deref()),
            "numDmlAffectedRows",
        )?;
        Ok(MergeReport {
            job_id,
            inserted_rows,
        })
    }
}
