use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use relt_core::{
    is_valid_identifier, is_valid_project_id, InboundFilter, TableRef, DEFAULT_INBOUND_EXTENSION,
    DEFAULT_INBOUND_PREFIX,
};
use relt_storage::LocalObjectStore;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_STAGING_DATASET: &str = "yelp_landing";
pub const DEFAULT_STAGING_TABLE: &str = "reviews_raw";
pub const DEFAULT_ANALYTICS_DATASET: &str = "yelp_analytics";
pub const DEFAULT_ANALYTICS_TABLE: &str = "reviews";
pub const LOCAL_PROJECT_ID: &str = "local-dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseBackend {
    #[serde(rename = "bigquery")]
    BigQuery,
    Postgres,
    Memory,
}

impl FromStr for WarehouseBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bigquery" | "bq" => Ok(Self::BigQuery),
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "RELT_WAREHOUSE",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("{key} has invalid value `{value}`")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must contain only letters, digits and underscores, got `{value}`")]
    InvalidIdentifier { key: &'static str, value: String },
    #[error("invalid project id `{0}`")]
    InvalidProject(String),
    #[error("merge url `{value}` is not usable: {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("the bigquery warehouse loads objects from gs://, not from the local object root")]
    RemoteObjects,
}

/// Everything both stages need, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineConfig {
    pub project_id: String,
    pub staging_dataset: String,
    pub staging_table: String,
    pub analytics_dataset: String,
    pub analytics_table: String,
    pub inbound_prefix: String,
    pub inbound_extension: String,
    pub merge_url: Option<String>,
    pub warehouse: WarehouseBackend,
    pub bigquery_location: Option<String>,
    #[serde(serialize_with = "serialize_redacted_url")]
    pub database_url: Option<String>,
    pub local_object_root: PathBuf,
    pub http_timeout_secs: u64,
    #[serde(skip_serializing)]
    pub identity_token: Option<String>,
    pub port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            staging_dataset: DEFAULT_STAGING_DATASET.to_string(),
            staging_table: DEFAULT_STAGING_TABLE.to_string(),
            analytics_dataset: DEFAULT_ANALYTICS_DATASET.to_string(),
            analytics_table: DEFAULT_ANALYTICS_TABLE.to_string(),
            inbound_prefix: DEFAULT_INBOUND_PREFIX.to_string(),
            inbound_extension: DEFAULT_INBOUND_EXTENSION.to_string(),
            merge_url: None,
            warehouse: WarehouseBackend::BigQuery,
            bigquery_location: None,
            database_url: None,
            local_object_root: PathBuf::from("./objects"),
            http_timeout_secs: 30,
            identity_token: None,
            port: 8080,
        }
    }
}

/// Partial settings from one layer (YAML file or process environment).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub project_id: Option<String>,
    pub staging_dataset: Option<String>,
    pub staging_table: Option<String>,
    pub analytics_dataset: Option<String>,
    pub analytics_table: Option<String>,
    pub inbound_prefix: Option<String>,
    pub inbound_extension: Option<String>,
    pub merge_url: Option<String>,
    pub warehouse: Option<WarehouseBackend>,
    pub bigquery_location: Option<String>,
    pub database_url: Option<String>,
    pub local_object_root: Option<PathBuf>,
    pub http_timeout_secs: Option<u64>,
    pub identity_token: Option<String>,
    pub port: Option<u16>,
}

impl ConfigOverrides {
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build overrides from a variable lookup; empty values count as unset.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let http_timeout_secs: Option<u64> = match get("RELT_HTTP_TIMEOUT_SECS") {
            Some(v) => Some(v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RELT_HTTP_TIMEOUT_SECS",
                value: v.clone(),
            })?),
            None => None,
        };
        let port_key = if get("RELT_WEB_PORT").is_some() {
            "RELT_WEB_PORT"
        } else {
            "PORT"
        };
        let port: Option<u16> = match get(port_key) {
            Some(v) => Some(v.parse().map_err(|_| ConfigError::InvalidValue {
                key: port_key,
                value: v.clone(),
            })?),
            None => None,
        };
        let warehouse: Option<WarehouseBackend> = get("RELT_WAREHOUSE").map(|v| v.parse()).transpose()?;

        Ok(Self {
            project_id: get("GCP_PROJECT").or_else(|| get("GOOGLE_CLOUD_PROJECT")),
            staging_dataset: get("RELT_STAGING_DATASET"),
            staging_table: get("RELT_STAGING_TABLE"),
            analytics_dataset: get("RELT_ANALYTICS_DATASET"),
            analytics_table: get("RELT_ANALYTICS_TABLE"),
            inbound_prefix: get("RELT_INBOUND_PREFIX"),
            inbound_extension: get("RELT_INBOUND_EXTENSION"),
            merge_url: get("RELT_MERGE_URL"),
            warehouse,
            bigquery_location: get("RELT_BIGQUERY_LOCATION"),
            database_url: get("DATABASE_URL"),
            local_object_root: get("RELT_LOCAL_OBJECT_ROOT").map(PathBuf::from),
            http_timeout_secs,
            identity_token: get("RELT_IDENTITY_TOKEN"),
            port,
        })
    }
}

impl PipelineConfig {
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.project_id {
            self.project_id = v;
        }
        if let Some(v) = overrides.staging_dataset {
            self.staging_dataset = v;
        }
        if let Some(v) = overrides.staging_table {
            self.staging_table = v;
        }
        if let Some(v) = overrides.analytics_dataset {
            self.analytics_dataset = v;
        }
        if let Some(v) = overrides.analytics_table {
            self.analytics_table = v;
        }
        if let Some(v) = overrides.inbound_prefix {
            self.inbound_prefix = v;
        }
        if let Some(v) = overrides.inbound_extension {
            self.inbound_extension = v;
        }
        if let Some(v) = overrides.warehouse {
            self.warehouse = v;
        }
        if let Some(v) = overrides.local_object_root {
            self.local_object_root = v;
        }
        if let Some(v) = overrides.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = overrides.port {
            self.port = v;
        }
        if overrides.merge_url.is_some() {
            self.merge_url = overrides.merge_url;
        }
        if overrides.bigquery_location.is_some() {
            self.bigquery_location = overrides.bigquery_location;
        }
        if overrides.database_url.is_some() {
            self.database_url = overrides.database_url;
        }
        if overrides.identity_token.is_some() {
            self.identity_token = overrides.identity_token;
        }
    }

    /// Defaults, then the YAML file named by `RELT_CONFIG`, then the process
    /// environment; validated before returning.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("RELT_CONFIG") {
            config.apply(ConfigOverrides::from_yaml_file(Path::new(&path))?);
        }
        config.apply(ConfigOverrides::from_env()?);
        config.fill_local_project();
        config.validate()?;
        Ok(config)
    }

    /// Local backends do not talk to a cloud project, so they get a placeholder.
    pub fn fill_local_project(&mut self) {
        if self.project_id.is_empty() && self.warehouse != WarehouseBackend::BigQuery {
            self.project_id = LOCAL_PROJECT_ID.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.is_empty() {
            return Err(ConfigError::Missing("GCP_PROJECT"));
        }
        if !is_valid_project_id(&self.project_id) {
            return Err(ConfigError::InvalidProject(self.project_id.clone()));
        }
        for (key, value) in [
            ("RELT_STAGING_DATASET", &self.staging_dataset),
            ("RELT_STAGING_TABLE", &self.staging_table),
            ("RELT_ANALYTICS_DATASET", &self.analytics_dataset),
            ("RELT_ANALYTICS_TABLE", &self.analytics_table),
        ] {
            if !is_valid_identifier(value) {
                return Err(ConfigError::InvalidIdentifier {
                    key,
                    value: value.clone(),
                });
            }
        }
        if self.inbound_extension.is_empty() {
            return Err(ConfigError::Missing("RELT_INBOUND_EXTENSION"));
        }
        if let Some(url) = &self.merge_url {
            validate_merge_url(url)?;
        }
        if self.warehouse == WarehouseBackend::Postgres && self.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELT_HTTP_TIMEOUT_SECS",
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Effective settings as YAML. The identity token is left out and the
    /// database password is masked.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("serializing effective config")
    }

    /// The ingest stage cannot run without somewhere to send the trigger.
    pub fn require_merge_url(&self) -> Result<&str, ConfigError> {
        self.merge_url
            .as_deref()
            .ok_or(ConfigError::Missing("RELT_MERGE_URL"))
    }

    /// Object mirror read by the local warehouse backends.
    pub fn local_object_store(&self) -> Result<LocalObjectStore, ConfigError> {
        if self.warehouse == WarehouseBackend::BigQuery {
            return Err(ConfigError::RemoteObjects);
        }
        Ok(LocalObjectStore::new(self.local_object_root.clone()))
    }

    pub fn staging_table_ref(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.staging_dataset, &self.staging_table)
    }

    pub fn analytics_table_ref(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.analytics_dataset, &self.analytics_table)
    }

    pub fn inbound_filter(&self) -> InboundFilter {
        InboundFilter {
            prefix: self.inbound_prefix.clone(),
            extension: self.inbound_extension.clone(),
        }
    }
}

const REDACTED: &str = "redacted";

/// Mask the password of a connection URL. Strings that do not parse as a URL
/// (key/value DSNs) are masked entirely.
fn redact_url_password(value: &str) -> String {
    let Ok(mut url) = reqwest::Url::parse(value) else {
        return REDACTED.to_string();
    };
    if url.password().is_some() && url.set_password(Some(REDACTED)).is_err() {
        return REDACTED.to_string();
    }
    if url.query_pairs().any(|(key, _)| key.eq_ignore_ascii_case("password")) {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| {
                if key.eq_ignore_ascii_case("password") {
                    (key.into_owned(), REDACTED.to_string())
                } else {
                    (key.into_owned(), value.into_owned())
                }
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string()
}

fn serialize_redacted_url<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    value.as_deref().map(redact_url_password).serialize(serializer)
}

fn validate_merge_url(value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let url = reqwest::Url::parse(value).map_err(|err| invalid(&err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(())
}
