//! Core domain model for the review ELT pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "relt-core";

/// Columns projected from staging into the analytics table, in insert order.
pub const REVIEW_COLUMNS: [&str; 6] = ["review_id", "user_id", "business_id", "stars", "text", "date"];

pub const DEFAULT_INBOUND_PREFIX: &str = "elt-inbound/";
pub const DEFAULT_INBOUND_EXTENSION: &str = ".json";

/// Storage object-finalized notification payload. Only the fields the pipeline
/// reads are modelled; everything else in the event is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub bucket: String,
    pub name: String,
}

impl StorageEvent {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    pub fn locator(&self) -> ObjectLocator {
        ObjectLocator {
            bucket: self.bucket.clone(),
            name: self.name.clone(),
        }
    }
}

/// `gs://bucket/name` style pointer handed to the warehouse load job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocator {
    pub bucket: String,
    pub name: String,
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.name)
    }
}

/// Gate applied to incoming object names before anything is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFilter {
    pub prefix: String,
    pub extension: String,
}

impl Default for InboundFilter {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_INBOUND_PREFIX.to_string(),
            extension: DEFAULT_INBOUND_EXTENSION.to_string(),
        }
    }
}

impl InboundFilter {
    pub fn accepts(&self, object_name: &str) -> bool {
        object_name.starts_with(&self.prefix) && object_name.ends_with(&self.extension)
    }
}

/// Fully qualified warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Backtick-quoted form used in BigQuery standard SQL.
    pub fn bigquery_path(&self) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, self.table)
    }

    /// `"dataset"."table"` form used by Postgres, where the dataset maps to a schema.
    pub fn postgres_path(&self) -> String {
        format!("\"{}\".\"{}\"", self.dataset, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Dataset and table names end up inside SQL text, so they are restricted to
/// the charset every supported warehouse accepts unquoted.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 1024
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// GCP project ids additionally allow dashes, and may be scoped to a domain
/// (`example.com:my-project`).
pub fn is_valid_project_id(name: &str) -> bool {
    match name.split_once(':') {
        Some((domain, project)) => is_valid_project_domain(domain) && is_plain_project_id(project),
        None => is_plain_project_id(name),
    }
}

fn is_plain_project_id(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 30
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_valid_project_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

/// Validated, deduplicated review as stored in the analytics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReview {
    pub review_id: String,
    pub user_id: Option<String>,
    pub business_id: Option<String>,
    pub stars: f64,
    pub text: String,
    pub date: String,
}
