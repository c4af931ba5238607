//! Result-file storage + outbound HTTP plumbing for the link checker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "slc-storage";

#[derive(Debug, Clone)]
pub struct StoredResult {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

/// Output directory for annotated workbooks and run reports.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Write `bytes` to `<root>/<file_name>` via temp file + rename. An existing
    /// file with identical content is left untouched.
    pub async fn store_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredResult> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.root.join(file_name);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating result directory {}", self.root.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking result path {}", path.display()))?
        {
            let existing = fs::read(&path)
                .await
                .with_context(|| format!("reading existing result {}", path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredResult {
                    content_hash,
                    path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp result file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp result file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp result file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp result {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredResult {
            content_hash,
            path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Terminal,
}

/// Non-success statuses: 404/410 are a definitive answer, everything else is worth retrying.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        RetryDisposition::Terminal
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(6),
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

/// Randomized pre-call delay, applied globally: concurrent callers queue on the gate.
#[derive(Debug)]
pub struct JitterRateLimiter {
    min_delay: Duration,
    max_delay: Duration,
    gate: Mutex<()>,
}

impl JitterRateLimiter {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let (min_delay, max_delay) = if min_delay <= max_delay {
            (min_delay, max_delay)
        } else {
            (max_delay, min_delay)
        };
        Self {
            min_delay,
            max_delay,
            gate: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn window(&self) -> (Duration, Duration) {
        (self.min_delay, self.max_delay)
    }

    pub fn sample_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(fastrand::u64(min..=max))
    }

    /// Wait out one jittered interval. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        let _gate = self.gate.lock().await;
        let delay = self.sample_delay();
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        debug!(delay_ms = delay.as_millis() as u64, "rate limiter wait");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ProbeRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("could not connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
}

impl FetchError {
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            FetchError::Timeout { url }
        } else if err.is_connect() {
            FetchError::Connect {
                url,
                message: err.to_string(),
            }
        } else {
            FetchError::Request {
                url,
                message: err.to_string(),
            }
        }
    }
}

/// Outbound HTTP seam used by the checker. Any HTTP status comes back as `Ok`;
/// only transport failures are errors.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn get(&self, request: ProbeRequest) -> Result<FetchedResponse, FetchError>;
    async fn head(&self, request: ProbeRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(3));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn send(
        &self,
        method: reqwest::Method,
        request: ProbeRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_probe", method = %method, url = %request.url);
        async move {
            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(request.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let resp = builder
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(&request.url, &err))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(&request.url, &err))?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "probe response");

            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl ProbeTransport for HttpFetcher {
    async fn get(&self, request: ProbeRequest) -> Result<FetchedResponse, FetchError> {
        self.send(reqwest::Method::GET, request).await
    }

    async fn head(&self, request: ProbeRequest) -> Result<FetchedResponse, FetchError> {
        self.send(reqwest::Method::HEAD, request).await
    }
}
