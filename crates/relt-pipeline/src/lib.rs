//! Two-stage review pipeline: ingest (load into staging, then trigger) and
//! merge (staging → analytics).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use relt_storage::{
    AccessTokenProvider, ApiClient, HttpClientConfig, IdentityTokenProvider,
    MetadataServerTokenProvider, StaticTokenProvider,
};
use relt_warehouse::{BigQueryConfig, BigQueryWarehouse, MemoryWarehouse, MergeSpec, PgWarehouse, Warehouse};
use tracing::info;

pub mod config;
pub mod ingest;
pub mod merge;
pub mod trigger;

pub use config::{ConfigError, ConfigOverrides, PipelineConfig, WarehouseBackend};
pub use ingest::{IngestOutcome, IngestStage};
pub use merge::{MergeError, MergeStage, MergeSummary};
pub use trigger::{HttpMergeTrigger, MergeTrigger, TriggerError, TriggerReceipt};

pub const CRATE_NAME: &str = "relt-pipeline";

/// Shared clients for both stages, built once from a validated config.
pub struct Pipeline {
    config: PipelineConfig,
    api: ApiClient,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let api = ApiClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })?;
        let warehouse = build_warehouse(&config, &api).await?;
        info!(backend = warehouse.backend(), project = %config.project_id, "pipeline ready");
        Ok(Self {
            config,
            api,
            warehouse,
        })
    }

    /// Wire the pipeline around an already-built warehouse.
    pub fn with_warehouse(config: PipelineConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self> {
        config.validate()?;
        let api = ApiClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            api,
            warehouse,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ingest_stage(&self) -> Result<IngestStage> {
        let url = self.config.require_merge_url()?.to_string();
        let tokens: Arc<dyn IdentityTokenProvider> = match &self.config.identity_token {
            Some(token) => Arc::new(StaticTokenProvider::new(token.clone())),
            None => Arc::new(MetadataServerTokenProvider::from_env(self.api.clone())),
        };
        let trigger = HttpMergeTrigger::new(self.api.client().clone(), url, tokens);
        Ok(IngestStage::new(
            self.config.inbound_filter(),
            self.config.staging_table_ref(),
            self.warehouse.clone(),
            Arc::new(trigger),
        ))
    }

    pub fn merge_stage(&self) -> MergeStage {
        MergeStage::new(
            MergeSpec {
                staging: self.config.staging_table_ref(),
                analytics: self.config.analytics_table_ref(),
            },
            self.warehouse.clone(),
        )
    }
}

async fn build_warehouse(config: &PipelineConfig, api: &ApiClient) -> Result<Arc<dyn Warehouse>> {
    let warehouse: Arc<dyn Warehouse> = match config.warehouse {
        WarehouseBackend::BigQuery => {
            let tokens: Arc<dyn AccessTokenProvider> = Arc::new(MetadataServerTokenProvider::from_env(api.clone()));
            let mut bq = BigQueryConfig::new(&config.project_id);
            bq.location = config.bigquery_location.clone();
            Arc::new(BigQueryWarehouse::new(api.clone(), tokens, bq))
        }
        WarehouseBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            Arc::new(
                PgWarehouse::connect(database_url, config.local_object_store()?)
                    .await
                    .context("connecting to postgres warehouse")?,
            )
        }
        WarehouseBackend::Memory => Arc::new(MemoryWarehouse::new(config.local_object_store()?)),
    };
    Ok(warehouse)
}

/// Create the staging and analytics tables on the Postgres backend.
pub async fn migrate(config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    if config.warehouse != WarehouseBackend::Postgres {
        bail!("migrate only applies to the postgres warehouse backend");
    }
    let database_url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let warehouse = PgWarehouse::connect(database_url, config.local_object_store()?)
        .await
        .context("connecting to postgres warehouse")?;
    warehouse
        .ensure_schema(&config.staging_table_ref(), &config.analytics_table_ref())
        .await
        .context("creating pipeline tables")?;
    info!(staging = %config.staging_table_ref(), analytics = %config.analytics_table_ref(), "schema ready");
    Ok(())
}

pub async fn run_merge_once_from_env() -> Result<MergeSummary> {
    let pipeline = Pipeline::from_config(PipelineConfig::load()?).await?;
    Ok(pipeline.merge_stage().run().await?)
}
