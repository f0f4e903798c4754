//! HTTP surface for the ingest and merge stages (axum).

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relt_core::StorageEvent;
use relt_pipeline::{IngestStage, MergeStage, Pipeline, PipelineConfig};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "relt-web";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStage {
    Ingest,
    Merge,
    /// Both stages in one process, under `/ingest` and `/merge`.
    All,
}

/// Storage notifications arrive either as the bare object resource (binary
/// CloudEvents mode) or wrapped in a structured envelope under `data`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventPayload {
    Envelope { data: StorageEvent },
    Bare(StorageEvent),
}

impl EventPayload {
    fn into_event(self) -> StorageEvent {
        match self {
            Self::Envelope { data } => data,
            Self::Bare(event) => event,
        }
    }
}

pub fn ingest_router(stage: Arc<IngestStage>) -> Router {
    Router::new()
        .route("/", post(ingest_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(stage)
}

pub fn merge_router(stage: Arc<MergeStage>) -> Router {
    Router::new()
        .route("/", post(merge_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(stage)
}

pub fn app(ingest: Arc<IngestStage>, merge: Arc<MergeStage>) -> Router {
    Router::new()
        .nest("/ingest", ingest_router(ingest))
        .nest("/merge", merge_router(merge))
        .route("/healthz", get(healthz_handler))
}

pub fn router_for(pipeline: &Pipeline, stage: ServeStage) -> anyhow::Result<Router> {
    Ok(match stage {
        ServeStage::Ingest => ingest_router(Arc::new(pipeline.ingest_stage()?)),
        ServeStage::Merge => merge_router(Arc::new(pipeline.merge_stage())),
        ServeStage::All => app(
            Arc::new(pipeline.ingest_stage()?),
            Arc::new(pipeline.merge_stage()),
        ),
    })
}

pub async fn serve(pipeline: &Pipeline, stage: ServeStage) -> anyhow::Result<()> {
    let port = pipeline.config().port;
    let router = router_for(pipeline, stage)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, ?stage, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub async fn serve_from_env(stage: ServeStage) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(PipelineConfig::load()?).await?;
    serve(&pipeline, stage).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn ingest_handler(
    State(stage): State<Arc<IngestStage>>,
    payload: Result<Json<EventPayload>, JsonRejection>,
) -> Response {
    let event = match payload {
        Ok(Json(payload)) => payload.into_event(),
        Err(rejection) => {
            error!(error = %rejection, "rejecting malformed storage event");
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid storage event: {}", rejection.body_text()),
            )
                .into_response();
        }
    };

    let outcome = stage.handle(&event).await;
    let status =
        StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, outcome.message()).into_response()
}

async fn merge_handler(State(stage): State<Arc<MergeStage>>) -> Response {
    match stage.run().await {
        Ok(summary) => (StatusCode::OK, summary.message()).into_response(),
        Err(err) => {
            error!(error = %err, "merge stage failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use relt_core::{InboundFilter, TableRef};
    use relt_pipeline::{MergeTrigger, TriggerError, TriggerReceipt};
    use relt_storage::LocalObjectStore;
    use relt_warehouse::{
        LoadJobSpec, LoadReport, MemoryWarehouse, MergeReport, MergeSpec, Warehouse, WarehouseError,
    };
    use tower::ServiceExt;

    #[derive(Default)]
    struct CountingTrigger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MergeTrigger for CountingTrigger {
        async fn trigger(&self) -> Result<TriggerReceipt, TriggerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TriggerReceipt { status: 200 })
        }
    }

    struct BrokenWarehouse;

    #[async_trait]
    impl Warehouse for BrokenWarehouse {
        fn backend(&self) -> &'static str {
            "broken"
        }

        async fn load_ndjson(&self, _spec: &LoadJobSpec) -> Result<LoadReport, WarehouseError> {
            Err(WarehouseError::Protocol("storage unavailable".into()))
        }

        async fn merge_new_reviews(&self, _spec: &MergeSpec) -> Result<MergeReport, WarehouseError> {
            Err(WarehouseError::Protocol("query exploded".into()))
        }
    }

    fn staging() -> TableRef {
        TableRef::new("demo", "yelp_landing", "reviews_raw")
    }

    fn merge_spec() -> MergeSpec {
        MergeSpec {
            staging: staging(),
            analytics: TableRef::new("demo", "yelp_analytics", "reviews"),
        }
    }

    fn ingest_stage(warehouse: Arc<dyn Warehouse>, trigger: Arc<CountingTrigger>) -> Arc<IngestStage> {
        Arc::new(IngestStage::new(InboundFilter::default(), staging(), warehouse, trigger))
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn ingest_skips_objects_outside_inbound_prefix() {
        let trigger = Arc::new(CountingTrigger::default());
        let app = ingest_router(ingest_stage(Arc::new(BrokenWarehouse), trigger.clone()));

        let resp = app
            .oneshot(json_post("/", r#"{"bucket":"drop","name":"archive/old.json","size":"12"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "Not a valid ELT file.");
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ingest_load_failure_is_a_500_without_trigger() {
        let trigger = Arc::new(CountingTrigger::default());
        let app = ingest_router(ingest_stage(Arc::new(BrokenWarehouse), trigger.clone()));

        let resp = app
            .oneshot(json_post(
                "/",
                r#"{"specversion":"1.0","data":{"bucket":"drop","name":"elt-inbound/a.json"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_text(resp).await,
            "Load failed: unexpected warehouse response: storage unavailable"
        );
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ingest_rejects_payload_without_object_name() {
        let trigger = Arc::new(CountingTrigger::default());
        let app = ingest_router(ingest_stage(Arc::new(BrokenWarehouse), trigger));

        let resp = app.oneshot(json_post("/", r#"{"bucket":"drop"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn combined_app_loads_then_merges() {
        let dir = tempfile::tempdir().unwrap();
        let objects = LocalObjectStore::new(dir.path());
        let event = StorageEvent::new("drop", "elt-inbound/batch.json");
        objects
            .put_object(
                &event.locator(),
                concat!(
                    r#"{"review_id":"r1","user_id":"u","business_id":"b","stars":5,"text":"Great","date":"2019-05-05 12:00:00"}"#,
                    "\n",
                    r#"{"review_id":"r1","user_id":"u","business_id":"b","stars":5,"text":"Great","date":"2019-05-05 12:00:00"}"#,
                    "\n",
                    r#"{"review_id":"r2","user_id":"u","business_id":"b","stars":3,"text":"","date":"2019-05-06 12:00:00"}"#,
                    "\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let warehouse = Arc::new(MemoryWarehouse::new(objects));
        let trigger = Arc::new(CountingTrigger::default());
        let app = app(
            ingest_stage(warehouse.clone(), trigger.clone()),
            Arc::new(MergeStage::new(merge_spec(), warehouse.clone())),
        );

        let resp = app
            .clone()
            .oneshot(json_post("/ingest", r#"{"bucket":"drop","name":"elt-inbound/batch.json"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "Pipeline (load and trigger) successful!");
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);

        let merge = |app: Router| async move {
            app.oneshot(Request::builder().method("POST").uri("/merge").body(Body::empty()).unwrap())
                .await
                .unwrap()
        };
        let first = merge(app.clone()).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_text(first).await, "Merge completed: 1 new rows inserted.");

        let second = merge(app.clone()).await;
        assert_eq!(body_text(second).await, "Merge completed: 0 new rows inserted.");

        let rows = warehouse.analytics_rows(&merge_spec().analytics).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].review_id, "r1");
    }

    #[tokio::test]
    async fn merge_failure_is_a_500() {
        let app = merge_router(Arc::new(MergeStage::new(merge_spec(), Arc::new(BrokenWarehouse))));
        let resp = app
            .oneshot(Request::builder().method("POST").uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.contains("query exploded"));
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = merge_router(Arc::new(MergeStage::new(merge_spec(), Arc::new(BrokenWarehouse))));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
