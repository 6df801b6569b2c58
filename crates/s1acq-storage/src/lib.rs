//! Dataset directory storage + HTTP transport utilities for s1acq.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use s1acq_core::{AcquisitionRecord, DatasetDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(any(test, feature = "test-util"))]
mod memory;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryTransport;

pub const CRATE_NAME: &str = "s1acq-storage";

pub const ERROR_FILE: &str = "_alt_error.txt";
pub const TRACEBACK_FILE: &str = "_alt_traceback.txt";

#[derive(Debug, Clone)]
pub struct WrittenDataset {
    pub dataset_id: String,
    pub dir: PathBuf,
    pub dataset_json: PathBuf,
    pub met_json: PathBuf,
}

/// Writes `<id>/<id>.dataset.json` + `<id>/<id>.met.json` dataset directories.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(dataset_id)
    }

    pub async fn write_acquisition(
        &self,
        record: &AcquisitionRecord,
        version: &str,
    ) -> anyhow::Result<WrittenDataset> {
        let descriptor = DatasetDescriptor::for_record(record, version);
        self.write_dataset(&record.dataset_id(), &descriptor, record)
            .await
    }

    pub async fn write_dataset<D, M>(
        &self,
        dataset_id: &str,
        dataset: &D,
        met: &M,
    ) -> anyhow::Result<WrittenDataset>
    where
        D: Serialize + ?Sized,
        M: Serialize + ?Sized,
    {
        let dir = self.dataset_dir(dataset_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating dataset directory {}", dir.display()))?;

        let dataset_json = dir.join(format!("{dataset_id}.dataset.json"));
        let met_json = dir.join(format!("{dataset_id}.met.json"));
        write_json_atomic(&dataset_json, dataset).await?;
        write_json_atomic(&met_json, met).await?;

        Ok(WrittenDataset {
            dataset_id: dataset_id.to_string(),
            dir,
            dataset_json,
            met_json,
        })
    }
}

/// Pretty JSON with sorted object keys, written via temp file + rename.
async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    // Round-tripping through Value sorts keys.
    let value = serde_json::to_value(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    let bytes = serde_json::to_vec_pretty(&value)
        .with_context(|| format!("serializing {}", path.display()))?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BrowseImages {
    pub png: PathBuf,
    pub small_png: PathBuf,
}

/// Downloads a quicklook and converts it with ImageMagick.
#[derive(Debug, Clone)]
pub struct BrowseRenderer {
    program: String,
    small_size: String,
}

impl Default for BrowseRenderer {
    fn default() -> Self {
        Self {
            program: "convert".to_string(),
            small_size: "250x250".to_string(),
        }
    }
}

impl BrowseRenderer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub async fn render(
        &self,
        transport: &dyn Transport,
        icon_url: &str,
        dataset_dir: &Path,
    ) -> anyhow::Result<BrowseImages> {
        let response = transport
            .execute(HttpRequest::get(icon_url).retry_transient())
            .await?
            .error_for_status()?;

        let jpg = dataset_dir.join("browse.jpg");
        let png = dataset_dir.join("browse.png");
        let small_png = dataset_dir.join("browse_small.png");

        fs::write(&jpg, &response.body)
            .await
            .with_context(|| format!("writing {}", jpg.display()))?;
        self.convert(&[jpg.as_os_str(), png.as_os_str()]).await?;
        fs::remove_file(&jpg)
            .await
            .with_context(|| format!("removing {}", jpg.display()))?;
        self.convert(&[
            "-resize".as_ref(),
            self.small_size.as_ref(),
            png.as_os_str(),
            small_png.as_os_str(),
        ])
        .await?;

        Ok(BrowseImages { png, small_png })
    }

    async fn convert(&self, args: &[&std::ffi::OsStr]) -> anyhow::Result<()> {
        let status = Command::new(&self.program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("spawning {}", self.program))?;
        if !status.success() {
            bail!("{} {:?} exited with {}", self.program, args, status);
        }
        Ok(())
    }
}

/// Appends the one-line summary and full error chain read by the job runner.
pub fn append_error_artifacts(dir: &Path, error: &anyhow::Error) -> std::io::Result<()> {
    let summary = error.to_string().replace('\n', " ");
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(ERROR_FILE))?;
    writeln!(f, "{summary}")?;

    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(TRACEBACK_FILE))?;
    writeln!(f, "{error:?}")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

/// Whether a request may be re-sent after a connect/timeout failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    TransientOnly,
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub retry: RetryMode,
}

impl HttpRequest {
    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
            basic_auth: None,
            retry: RetryMode::Never,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::Head, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn basic_auth(mut self, credentials: Option<(String, String)>) -> Self {
        self.basic_auth = credentials;
        self
    }

    pub fn retry_transient(mut self) -> Self {
        self.retry = RetryMode::TransientOnly;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(FetchError::HttpStatus {
            status: self.status,
            url: self.final_url,
            body: String::from_utf8_lossy(&self.body).chars().take(512).collect(),
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
            url: self.final_url.clone(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Blocking-style request/response seam shared by every catalog and orchestrator client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, FetchError>;

    /// Sends the request, fails on non-2xx, decodes the JSON body.
    async fn send_json(&self, request: HttpRequest) -> Result<JsonValue, FetchError> {
        let response = self.execute(request).await?.error_for_status()?;
        response.json()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only network-level failures are transient; HTTP status codes never are.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 7,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
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
    pub accept_invalid_certs: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            user_agent: None,
            accept_invalid_certs: false,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Head => self.client.head(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        builder
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            debug!(method = ?request.method, url = %request.url, attempt, "http request");
            match self.build(&request).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(HttpResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Err(err) => {
                    let retryable = request.retry == RetryMode::TransientOnly
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries;
                    if !retryable {
                        return Err(FetchError::Request(err));
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        url = %request.url,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient transport error; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
