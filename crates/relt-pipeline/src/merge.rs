use std::sync::Arc;

use chrono::{DateTime, Utc};
use relt_warehouse::{MergeSpec, Warehouse, WarehouseError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("merge failed: {0}")]
pub struct MergeError(#[from] pub WarehouseError);

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub invocation_id: Uuid,
    pub job_id: String,
    pub inserted_rows: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MergeSummary {
    pub fn message(&self) -> String {
        format!("Merge completed: {} new rows inserted.", self.inserted_rows)
    }
}

/// Moves validated, deduplicated staging rows into the analytics table.
/// Repeatable: a pass over unchanged staging data inserts nothing.
pub struct MergeStage {
    spec: MergeSpec,
    warehouse: Arc<dyn Warehouse>,
}

impl MergeStage {
    pub fn new(spec: MergeSpec, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { spec, warehouse }
    }

    pub async fn run(&self) -> Result<MergeSummary, MergeError> {
        let invocation_id = Uuid::new_v4();
        let span = info_span!("merge", %invocation_id, staging = %self.spec.staging, analytics = %self.spec.analytics);
        async {
            let started_at = Utc::now();
            info!(backend = self.warehouse.backend(), "starting merge");
            let report = self.warehouse.merge_new_reviews(&self.spec).await?;
            let finished_at = Utc::now();
            info!(job_id = %report.job_id, inserted_rows = report.inserted_rows, "merge completed");
            Ok(MergeSummary {
                invocation_id,
                job_id: report.job_id,
                inserted_rows: report.inserted_rows,
                started_at,
                finished_at,
            })
        }
        .instrument(span)
        .await
    }
}
