//! Postgres development warehouse.
//!
//! Staging keeps each raw record as a JSONB document; the merge projects the
//! review columns out of it and relies on the analytics primary key for
//! insert-only semantics.

use async_trait::async_trait;
use relt_core::TableRef;
use relt_storage::LocalObjectStore;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::{
    parse_ndjson, postgres_merge_statement, LoadJobSpec, LoadReport, MergeReport, MergeSpec,
    Warehouse, WarehouseError,
};

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    objects: LocalObjectStore,
}

impl PgWarehouse {
    pub fn new(pool: PgPool, objects: LocalObjectStore) -> Self {
        Self { pool, objects }
    }

    pub async fn connect(database_url: &str, objects: LocalObjectStore) -> Result<Self, WarehouseError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool, objects))
    }

    /// Create the schemas and tables both stages expect. Safe to run repeatedly.
    pub async fn ensure_schema(&self, staging: &TableRef, analytics: &TableRef) -> Result<(), WarehouseError> {
        for statement in schema_statements(staging, analytics) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

pub fn schema_statements(staging: &TableRef, analytics: &TableRef) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", staging.dataset),
        format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", analytics.dataset),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
    id BIGSERIAL PRIMARY KEY,
    raw JSONB NOT NULL,
    source_uri TEXT NOT NULL,
    loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#,
            staging.postgres_path()
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
    review_id TEXT PRIMARY KEY,
    user_id TEXT,
    business_id TEXT,
    stars DOUBLE PRECISION NOT NULL,
    text TEXT NOT NULL,
    date TEXT NOT NULL
)"#,
            analytics.postgres_path()
        ),
    ]
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn load_ndjson(&self, spec: &LoadJobSpec) -> Result<LoadReport, WarehouseError> {
        let job_id = format!("pg_load_{}", Uuid::new_v4().simple());
        let bytes = self.objects.read_object(&spec.source).await?;
        let rows = parse_ndjson(&bytes)?;
        let documents = JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect());

        let statement = format!(
            "INSERT INTO {} (raw, source_uri) SELECT doc, $2 FROM jsonb_array_elements($1) AS doc",
            spec.destination.postgres_path()
        );
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&statement)
            .bind(&documents)
            .bind(spec.source.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let output_rows = result.rows_affected();
        info!(%job_id, source = %spec.source, destination = %spec.destination, output_rows, "postgres load finished");
        Ok(LoadReport { job_id, output_rows })
    }

    async fn merge_new_reviews(&self, spec: &MergeSpec) -> Result<MergeReport, WarehouseError> {
        let job_id = format!("pg_merge_{}", Uuid::new_v4().simple());
        let result = sqlx::query(&postgres_merge_statement(spec))
            .execute(&self.pool)
            .await?;
        Ok(MergeReport {
            job_id,
            inserted_rows: result.rows_affected(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relt_core::ObjectLocator;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn database_url(test: &str) -> Option<String> {
        match std::env::var("DATABASE_URL") {
            Ok(url) => Some(url),
            Err(_) => {
                eprintln!("skipping {test}; set DATABASE_URL to run");
                None
            }
        }
    }

    /// Warehouse bound to throwaway schemas so runs never see each other's rows.
    struct Scratch {
        wh: PgWarehouse,
        objects: LocalObjectStore,
        spec: MergeSpec,
        _dir: TempDir,
    }

    impl Scratch {
        async fn new(database_url: &str) -> Self {
            let dir = tempdir().expect("tempdir");
            let objects = LocalObjectStore::new(dir.path());
            let suffix = Uuid::new_v4().simple().to_string();
            let spec = MergeSpec {
                staging: TableRef::new("local-dev", format!("relt_landing_{suffix}"), "reviews_raw"),
                analytics: TableRef::new("local-dev", format!("relt_analytics_{suffix}"), "reviews"),
            };
            let wh = PgWarehouse::connect(database_url, objects.clone())
                .await
                .expect("connect");
            wh.ensure_schema(&spec.staging, &spec.analytics)
                .await
                .expect("schema");
            Self {
                wh,
                objects,
                spec,
                _dir: dir,
            }
        }

        async fn load(&self, name: &str, rows: &[JsonValue]) -> LoadReport {
            let locator = ObjectLocator {
                bucket: "drop".into(),
                name: format!("elt-inbound/{name}.json"),
            };
            let body = rows
                .iter()
                .map(|row| row.to_string())
                .collect::<Vec<_>>()
                .join("\n");
            self.objects
                .put_object(&locator, body.as_bytes())
                .await
                .expect("put");
            self.wh
                .load_ndjson(&LoadJobSpec {
                    source: locator,
                    destination: self.spec.staging.clone(),
                })
                .await
                .expect("load")
        }

        async fn analytics(&self) -> Vec<(String, String)> {
            sqlx::query_as::<_, (String, String)>(&format!(
                "SELECT review_id, text FROM {} ORDER BY review_id",
                self.spec.analytics.postgres_path()
            ))
            .fetch_all(&self.wh.pool)
            .await
            .expect("select analytics")
        }

        async fn drop_schemas(&self) {
            for dataset in [&self.spec.staging.dataset, &self.spec.analytics.dataset] {
                let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{dataset}\" CASCADE"))
                    .execute(&self.wh.pool)
                    .await;
            }
        }
    }

    fn review(id: &str, text: &str, date: JsonValue, stars: JsonValue) -> JsonValue {
        json!({
            "review_id": id,
            "user_id": "u1",
            "business_id": "b1",
            "stars": stars,
            "text": text,
            "date": date,
            "useful": 0
        })
    }

    #[tokio::test]
    async fn postgres_merge_inserts_only_distinct_valid_new_reviews() {
        let Some(url) = database_url("postgres_merge_inserts_only_distinct_valid_new_reviews") else {
            return;
        };
        let scratch = Scratch::new(&url).await;
        let date = json!("2019-05-05 12:00:00");

        let report = scratch
            .load(
                "batch",
                &[
                    review("r1", "Great", date.clone(), json!(5)),
                    review("r1", "Great", date.clone(), json!(5)),
                    review("r2", "", date.clone(), json!(3)),
                    review("r3", "\n\t ", date.clone(), json!(4)),
                    review("r4", "no date", JsonValue::Null, json!(4)),
                    review("r5", "no stars", date.clone(), JsonValue::Null),
                ],
            )
            .await;
        assert_eq!(report.output_rows, 6);

        let first = scratch.wh.merge_new_reviews(&scratch.spec).await.expect("first merge");
        assert_eq!(first.inserted_rows, 1);
        let second = scratch.wh.merge_new_reviews(&scratch.spec).await.expect("second merge");
        assert_eq!(second.inserted_rows, 0);

        assert_eq!(scratch.analytics().await, vec![("r1".to_string(), "Great".to_string())]);
        scratch.drop_schemas().await;
    }

    #[tokio::test]
    async fn postgres_merge_leaves_matched_rows_untouched() {
        let Some(url) = database_url("postgres_merge_leaves_matched_rows_untouched") else {
            return;
        };
        let scratch = Scratch::new(&url).await;

        scratch
            .load("first", &[review("r1", "original", json!("2020-01-01 00:00:00"), json!(4))])
            .await;
        let first = scratch.wh.merge_new_reviews(&scratch.spec).await.expect("first merge");
        assert_eq!(first.inserted_rows, 1);

        scratch
            .load("edit", &[review("r1", "edited later", json!("2021-01-01 00:00:00"), json!(2))])
            .await;
        let second = scratch.wh.merge_new_reviews(&scratch.spec).await.expect("second merge");
        assert_eq!(second.inserted_rows, 0);

        assert_eq!(scratch.analytics().await, vec![("r1".to_string(), "original".to_string())]);
        scratch.drop_schemas().await;
    }

    #[test]
    fn schema_statements_key_analytics_by_review_id() {
        let staging = TableRef::new("demo", "yelp_landing", "reviews_raw");
        let analytics = TableRef::new("demo", "yelp_analytics", "reviews");
        let statements = schema_statements(&staging, &analytics);
        assert_eq!(statements.len(), 4);
        assert_eq!(statements[0], "CREATE SCHEMA IF NOT EXISTS \"yelp_landing\"");
        assert!(statements[2].contains("\"yelp_landing\".\"reviews_raw\""));
        assert!(statements[2].contains("raw JSONB NOT NULL"));
        assert!(statements[3].contains("review_id TEXT PRIMARY KEY"));
    }
}
