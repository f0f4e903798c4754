use std::sync::Arc;

use async_trait::async_trait;
use relt_storage::{IdentityTokenProvider, TokenError};
use reqwest::header::CONTENT_LENGTH;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("could not mint identity token: {0}")]
    Token(#[from] TokenError),
    #[error("merge call failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("merge endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerReceipt {
    pub status: u16,
}

/// One-shot invocation of the merge stage after a successful load.
#[async_trait]
pub trait MergeTrigger: Send + Sync {
    async fn trigger(&self) -> Result<TriggerReceipt, TriggerError>;
}

/// Authenticated `POST` with an empty body. Never retried: the ingest stage
/// makes exactly one attempt per invocation.
pub struct HttpMergeTrigger {
    client: reqwest::Client,
    url: String,
    tokens: Arc<dyn IdentityTokenProvider>,
}

impl HttpMergeTrigger {
    pub fn new(client: reqwest::Client, url: impl Into<String>, tokens: Arc<dyn IdentityTokenProvider>) -> Self {
        Self {
            client,
            url: url.into(),
            tokens,
        }
    }
}

#[async_trait]
impl MergeTrigger for HttpMergeTrigger {
    async fn trigger(&self) -> Result<TriggerReceipt, TriggerError> {
        let token = self.tokens.identity_token(&self.url).await?;
        info!(url = %self.url, "triggering merge stage");
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TriggerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(TriggerReceipt {
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use relt_storage::StaticTokenProvider;

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        fail: bool,
    }

    async fn merge_endpoint(
        State(rec): State<Arc<Recorder>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, &'static str) {
        rec.calls.fetch_add(1, Ordering::SeqCst);
        let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
        if auth != Some("Bearer id-token") || !body.is_empty() {
            return (StatusCode::BAD_REQUEST, "bad request");
        }
        if rec.fail {
            return (StatusCode::INTERNAL_SERVER_ERROR, "merge blew up");
        }
        (StatusCode::OK, "Merge completed")
    }

    async fn spawn(rec: Arc<Recorder>) -> String {
        let router = Router::new().route("/", post(merge_endpoint)).with_state(rec);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}/")
    }

    fn trigger(url: String) -> HttpMergeTrigger {
        HttpMergeTrigger::new(
            reqwest::Client::new(),
            url,
            Arc::new(StaticTokenProvider::new("id-token")),
        )
    }

    #[tokio::test]
    async fn posts_empty_body_with_bearer_token() {
        let rec = Arc::new(Recorder::default());
        let receipt = trigger(spawn(rec.clone()).await).trigger().await.expect("ok");
        assert_eq!(receipt.status, 200);
        assert_eq!(rec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_and_not_retried() {
        let rec = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let err = trigger(spawn(rec.clone()).await).trigger().await.expect_err("500");
        assert!(matches!(err, TriggerError::Status { status: 500, .. }));
        assert_eq!(rec.calls.load(Ordering::SeqCst), 1);
    }
}
