//! In-process warehouse that models the load and merge statements.
//!
//! Staging tables auto-detect a schema from the first rows they see and reject
//! later loads whose field types disagree, as a managed warehouse would.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use relt_core::{AnalyticsReview, TableRef};
use relt_storage::LocalObjectStore;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::{
    json_kind_name, parse_ndjson, LoadJobSpec, LoadReport, MergeReport, MergeSpec, Warehouse,
    WarehouseError,
};

#[derive(Debug, Default)]
struct StagingTable {
    schema: BTreeMap<String, &'static str>,
    rows: Vec<Map<String, JsonValue>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    staging: HashMap<TableRef, StagingTable>,
    analytics: HashMap<TableRef, Vec<AnalyticsReview>>,
}

#[derive(Debug)]
pub struct MemoryWarehouse {
    objects: LocalObjectStore,
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new(objects: LocalObjectStore) -> Self {
        Self {
            objects,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Append rows straight into a staging table, bypassing object storage.
    pub async fn append_staging_rows(
        &self,
        table: &TableRef,
        rows: Vec<Map<String, JsonValue>>,
    ) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().await;
        append_with_schema_check(state.staging.entry(table.clone()).or_default(), rows)
    }

    pub async fn staging_row_count(&self, table: &TableRef) -> usize {
        let state = self.state.lock().await;
        state.staging.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub async fn analytics_rows(&self, table: &TableRef) -> Vec<AnalyticsReview> {
        let state = self.state.lock().await;
        state.analytics.get(table).cloned().unwrap_or_default()
    }
}

fn append_with_schema_check(
    table: &mut StagingTable,
    rows: Vec<Map<String, JsonValue>>,
) -> Result<u64, WarehouseError> {
    let mut schema = table.schema.clone();
    for row in &rows {
        for (field, value) in row {
            if value.is_null() {
                continue;
            }
            let incoming = json_kind_name(value);
            match schema.get(field) {
                Some(existing) if *existing != incoming => {
                    return Err(WarehouseError::SchemaConflict {
                        field: field.clone(),
                        existing: (*existing).to_string(),
                        incoming: incoming.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    schema.insert(field.clone(), incoming);
                }
            }
        }
    }

    let count = rows.len() as u64;
    table.schema = schema;
    table.rows.extend(rows);
    Ok(count)
}

fn text_of(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn stars_of(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn candidate_from_row(row: &Map<String, JsonValue>) -> Option<AnalyticsReview> {
    let text = text_of(row.get("text"))?;
    if text.trim().is_empty() {
        return None;
    }
    Some(AnalyticsReview {
        review_id: text_of(row.get("review_id"))?,
        user_id: text_of(row.get("user_id")),
        business_id: text_of(row.get("business_id")),
        stars: stars_of(row.get("stars"))?,
        text,
        date: text_of(row.get("date"))?,
    })
}

type DistinctKey = (String, Option<String>, Option<String>, u64, String, String);

fn distinct_key(review: &AnalyticsReview) -> DistinctKey {
    (
        review.review_id.clone(),
        review.user_id.clone(),
        review.business_id.clone(),
        review.stars.to_bits(),
        review.text.clone(),
        review.date.clone(),
    )
}

/// Valid staging rows, `DISTINCT` over the six columns, then one row per
/// `review_id` (latest `date`, first seen on ties), in first-seen order.
fn merge_candidates(rows: &[Map<String, JsonValue>]) -> Vec<AnalyticsReview> {
    let mut seen = HashSet::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<AnalyticsReview> = Vec::new();

    for candidate in rows.iter().filter_map(candidate_from_row) {
        if !seen.insert(distinct_key(&candidate)) {
            continue;
        }
        match by_id.get(&candidate.review_id) {
            Some(&idx) => {
                if candidate.date > out[idx].date {
                    out[idx] = candidate;
                }
            }
            None => {
                by_id.insert(candidate.review_id.clone(), out.len());
                out.push(candidate);
            }
        }
    }
    out
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn load_ndjson(&self, spec: &LoadJobSpec) -> Result<LoadReport, WarehouseError> {
        let job_id = format!("memory_load_{}", Uuid::new_v4().simple());
        let bytes = self.objects.read_object(&spec.source).await?;
        let rows = parse_ndjson(&bytes)?;

        let mut state = self.state.lock().await;
        let table = state.staging.entry(spec.destination.clone()).or_default();
        let output_rows = append_with_schema_check(table, rows)?;
        info!(%job_id, source = %spec.source, destination = %spec.destination, output_rows, "memory load finished");
        Ok(LoadReport { job_id, output_rows })
    }

    async fn merge_new_reviews(&self, spec: &MergeSpec) -> Result<MergeReport, WarehouseError> {
        let job_id = format!("memory_merge_{}", Uuid::new_v4().simple());
        let mut state = self.state.lock().await;

        let candidates = state
            .staging
            .get(&spec.staging)
            .map(|t| merge_candidates(&t.rows))
            .unwrap_or_default();

        let target = state.analytics.entry(spec.analytics.clone()).or_default();
        let existing: HashSet<String> = target.iter().map(|r| r.review_id.clone()).collect();

        let mut inserted_rows = 0u64;
        for candidate in candidates {
            if existing.contains(&candidate.review_id) {
                continue;
            }
            target.push(candidate);
            inserted_rows += 1;
        }
        Ok(MergeReport {
            job_id,
            inserted_rows,
        })
    }
}
