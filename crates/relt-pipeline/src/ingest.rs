use std::sync::Arc;

use relt_core::{InboundFilter, StorageEvent, TableRef};
use relt_warehouse::{LoadJobSpec, LoadReport, Warehouse};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::trigger::MergeTrigger;

/// Result of one ingest invocation.
///
/// `LoadFailed` leaves nothing staged and fails the invocation so the event is
/// redelivered. `TriggerFailed` happens after the rows are staged and must not
/// fail the invocation, or the redelivery would load them again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Skipped { object_name: String },
    Completed { job_id: String, output_rows: u64, trigger_status: u16 },
    TriggerFailed { job_id: String, output_rows: u64, reason: String },
    LoadFailed { reason: String },
}

impl IngestOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::LoadFailed { .. } => 500,
            Self::Skipped { .. } | Self::Completed { .. } | Self::TriggerFailed { .. } => 200,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code() < 400
    }

    pub fn message(&self) -> String {
        match self {
            Self::Skipped { .. } => "Not a valid ELT file.".to_string(),
            Self::Completed { .. } => "Pipeline (load and trigger) successful!".to_string(),
            Self::TriggerFailed { reason, .. } => {
                format!("Load succeeded, but merge trigger failed: {reason}")
            }
            Self::LoadFailed { reason } => format!("Load failed: {reason}"),
        }
    }
}

/// Loads newly arrived objects into staging, then kicks the merge stage.
///
/// Redelivered events load the same object again; the duplicate staging rows
/// are absorbed by the merge stage's deduplication, not here.
pub struct IngestStage {
    filter: InboundFilter,
    staging: TableRef,
    warehouse: Arc<dyn Warehouse>,
    trigger: Arc<dyn MergeTrigger>,
}

impl IngestStage {
    pub fn new(
        filter: InboundFilter,
        staging: TableRef,
        warehouse: Arc<dyn Warehouse>,
        trigger: Arc<dyn MergeTrigger>,
    ) -> Self {
        Self {
            filter,
            staging,
            warehouse,
            trigger,
        }
    }

    pub async fn handle(&self, event: &StorageEvent) -> IngestOutcome {
        let invocation_id = Uuid::new_v4();
        let span = info_span!("ingest", %invocation_id, bucket = %event.bucket, object = %event.name);
        self.handle_inner(event).instrument(span).await
    }

    async fn handle_inner(&self, event: &StorageEvent) -> IngestOutcome {
        if !self.filter.accepts(&event.name) {
            info!(
                prefix = %self.filter.prefix,
                extension = %self.filter.extension,
                "object does not match inbound prefix/extension; skipping"
            );
            return IngestOutcome::Skipped {
                object_name: event.name.clone(),
            };
        }

        let spec = LoadJobSpec {
            source: event.locator(),
            destination: self.staging.clone(),
        };
        info!(source = %spec.source, destination = %spec.destination, backend = self.warehouse.backend(), "starting load job");

        let LoadReport { job_id, output_rows } = match self.warehouse.load_ndjson(&spec).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "load job failed; merge will not be triggered");
                return IngestOutcome::LoadFailed {
                    reason: err.to_string(),
                };
            }
        };
        info!(%job_id, output_rows, "load job completed");

        match self.trigger.trigger().await {
            Ok(receipt) => {
                info!(status = receipt.status, "merge stage triggered");
                IngestOutcome::Completed {
                    job_id,
                    output_rows,
                    trigger_status: receipt.status,
                }
            }
            Err(err) => {
                warn!(error = %err, "load succeeded but merge trigger failed");
                IngestOutcome::TriggerFailed {
                    job_id,
                    output_rows,
                    reason: err.to_string(),
                }
            }
        }
    }
}
