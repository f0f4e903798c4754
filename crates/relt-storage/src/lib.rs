//! Object storage access, retrying HTTP plumbing and platform token providers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relt_core::ObjectLocator;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "relt-storage";

pub const DEFAULT_METADATA_HOST: &str = "http://metadata.google.internal";

/// Directory-backed mirror of a bucket namespace: `gs://bucket/name` lives at
/// `<root>/bucket/name`. Used by the local warehouse backends.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, locator: &ObjectLocator) -> PathBuf {
        let mut path = self.root.join(&locator.bucket);
        for segment in locator.name.split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(segment);
        }
        path
    }

    pub async fn read_object(&self, locator: &ObjectLocator) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(locator);
        fs::read(&path)
            .await
            .with_context(|| format!("reading object {locator} from {}", path.display()))
    }

    /// Write an object through a temp file + rename so readers never observe a
    /// partially written object.
    pub async fn put_object(&self, locator: &ObjectLocator, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let absolute_path = self.path_for(locator);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating object directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp object {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(absolute_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("relt/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// reqwest client plus the retry policy applied to idempotent API calls.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request rebuilt on every attempt; retryable statuses and
    /// transport errors back off and try again. Non-2xx answers that are not
    /// retried surface as [`FetchError::HttpStatus`].
    pub async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, status = status.as_u16(), attempt, "retrying api call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying api call after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("token response was malformed: {0}")]
    Malformed(String),
}

/// Mints audience-scoped identity tokens for service-to-service calls.
#[async_trait]
pub trait IdentityTokenProvider: Send + Sync {
    async fn identity_token(&self, audience: &str) -> Result<String, TokenError>;
}

/// Supplies OAuth access tokens for warehouse API calls.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, TokenError>;
}

/// Fixed token, for local runs where no metadata server is reachable.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl IdentityTokenProvider for StaticTokenProvider {
    async fn identity_token(&self, _audience: &str) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedAccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Token provider backed by the compute metadata server of the runtime
/// platform. Identity tokens are fetched fresh per call; access tokens are
/// reused until shortly before they expire.
#[derive(Debug)]
pub struct MetadataServerTokenProvider {
    api: ApiClient,
    base_url: String,
    cached: Mutex<Option<CachedAccessToken>>,
}

impl MetadataServerTokenProvider {
    const EXPIRY_MARGIN_SECS: i64 = 60;

    pub fn new(api: ApiClient, base_url: impl Into<String>) -> Self {
        Self {
            api,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Honors `GCE_METADATA_HOST` the same way the platform client libraries do.
    pub fn from_env(api: ApiClient) -> Self {
        let base_url = std::env::var("GCE_METADATA_HOST")
            .map(|host| {
                if host.starts_with("http://") || host.starts_with("https://") {
                    host
                } else {
                    format!("http://{host}")
                }
            })
            .unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        Self::new(api, base_url)
    }

    fn service_account_url(&self, leaf: &str) -> String {
        format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/{leaf}",
            self.base_url
        )
    }
}

#[async_trait]
impl IdentityTokenProvider for MetadataServerTokenProvider {
    async fn identity_token(&self, audience: &str) -> Result<String, TokenError> {
        let url = self.service_account_url("identity");
        let resp = self
            .api
            .send_with_retry(|client| {
                client
                    .get(&url)
                    .header("Metadata-Flavor", "Google")
                    .query(&[("audience", audience), ("format", "full")])
            })
            .await?;
        let token = resp.text().await.map_err(FetchError::from)?;
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Malformed("empty identity token".into()));
        }
        debug!(audience, "minted identity token");
        Ok(token.to_string())
    }
}

#[async_trait]
impl AccessTokenProvider for MetadataServerTokenProvider {
    async fn access_token(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > Utc::now() {
                return Ok(entry.token.clone());
            }
        }

        let url = self.service_account_url("token");
        let resp = self
            .api
            .send_with_retry(|client| client.get(&url).header("Metadata-Flavor", "Google"))
            .await?;
        let parsed: AccessTokenResponse = resp
            .json()
            .await
            .map_err(|err| TokenError::Malformed(err.to_string()))?;
        let lifetime = (parsed.expires_in - Self::EXPIRY_MARGIN_SECS).max(0);
        *cached = Some(CachedAccessToken {
            token: parsed.access_token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        });
        Ok(parsed.access_token)
    }
}
