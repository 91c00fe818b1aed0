//! Append-only artifact cache + HTTP fetch utilities for mortviz.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mortviz_core::ArtifactKey;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::{StatusCode, Url};

pub const CRATE_NAME: &str = "mortviz-storage";

/// Upper bound on entities in one bar-chart request.
pub const MAX_ENTITIES_PER_CHART: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one entity is required")]
    NoEntities,
    #[error("{count} entities requested, at most {max} allowed")]
    TooManyEntities { count: usize, max: usize },
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
}

/// Check an entity-keyed chart request against the dataset's known entities.
///
/// Returns the trimmed names in request order.
pub fn validate_entities<S: AsRef<str>>(
    entities: &[S],
    known: &BTreeSet<&str>,
) -> Result<Vec<String>, ValidationError> {
    if entities.is_empty() {
        return Err(ValidationError::NoEntities);
    }
    if entities.len() > MAX_ENTITIES_PER_CHART {
        return Err(ValidationError::TooManyEntities {
            count: entities.len(),
            max: MAX_ENTITIES_PER_CHART,
        });
    }
    entities
        .iter()
        .map(|e| {
            let name = e.as_ref().trim();
            if known.contains(name) {
                Ok(name.to_string())
            } else {
                Err(ValidationError::UnknownEntity(name.to_string()))
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("generating artifact {key}: {source}")]
    Generate {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("writing artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Result of an existence probe at a key's canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCacheEntry {
    pub key: ArtifactKey,
    pub path: PathBuf,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub key: ArtifactKey,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub generated: bool,
}

/// Filesystem cache of rendered artifacts keyed by [`ArtifactKey`].
///
/// Entries are never invalidated. Generation for one key is serialized within the process;
/// separate processes racing on a missing key both render and the last rename wins.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
    in_flight: Arc<Mutex<HashMap<ArtifactKey, Arc<Mutex<()>>>>>,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    pub async fn probe(&self, key: &ArtifactKey) -> Result<ArtifactCacheEntry, ArtifactError> {
        let path = self.path_for(key);
        let exists = exists(&path).await?;
        Ok(ArtifactCacheEntry {
            key: key.clone(),
            path,
            exists,
        })
    }

    async fn key_lock(&self, key: &ArtifactKey) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().await;
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return the cached artifact for `key`, invoking `generate` only when it is absent on disk.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &ArtifactKey,
        generate: F,
    ) -> Result<CachedArtifact, ArtifactError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<u8>>>,
    {
        let relative_path = key.relative_path();
        let absolute_path = self.root.join(&relative_path);
        let hit = CachedArtifact {
            key: key.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            generated: false,
        };

        if exists(&absolute_path).await? {
            debug!(%key, "artifact cache hit");
            return Ok(hit);
        }

        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;
        if exists(&absolute_path).await? {
            debug!(%key, "artifact generated by concurrent request");
            return Ok(hit);
        }

        let written = self.generate_and_write(key, &absolute_path, generate).await;
        self.in_flight.lock().await.remove(key);
        let bytes = written?;
        info!(%key, path = %absolute_path.display(), bytes, "artifact generated");

        Ok(CachedArtifact {
            generated: true,
            ..hit
        })
    }
}

impl ArtifactCache {
    async fn generate_and_write<F, Fut>(
        &self,
        key: &ArtifactKey,
        path: &Path,
        generate: F,
    ) -> Result<usize, ArtifactError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<u8>>>,
    {
        let bytes = generate().await.map_err(|source| ArtifactError::Generate {
            key: key.to_string(),
            source,
        })?;
        write_atomic(path, &bytes)
            .await
            .map_err(|source| ArtifactError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(bytes.len())
    }

    #[cfg(test)]
    async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

async fn exists(path: &Path) -> Result<bool, ArtifactError> {
    fs::try_exists(path).await.map_err(|err| ArtifactError::Write {
        path: path.to_path_buf(),
        source: anyhow::Error::new(err).context("checking artifact path"),
    })
}

/// Write `bytes` next to `path` under a hidden partial name, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        anyhow::bail!("artifact path {} has no file name", path.display());
    };
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating artifact directory {}", dir.display()))?;

    let partial = dir.join(format!(
        ".{}.{}.partial",
        name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));
    fs::write(&partial, bytes)
        .await
        .with_context(|| format!("writing partial artifact {}", partial.display()))?;

    let renamed = fs::rename(&partial, path).await;
    if renamed.is_err() {
        let _ = fs::remove_file(&partial).await;
    }
    renamed.with_context(|| format!("moving {} into place", path.display()))
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
            max_retries: 2,
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
    pub max_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 16,
        }
    }
}

/// Single-attempt HTTP GET with a global concurrency cap; retry policy is the caller's.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http fetcher is closed")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }
}

impl HttpFetcher {
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
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        })
    }

    /// GET `url`. Server errors and 429 become [`FetchError::HttpStatus`]; any other
    /// status is returned with its body so callers can branch on content.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", url = %url);

        async {
            let resp = self
                .client
                .get(url.clone())
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if classify_status(status) == RetryDisposition::Retryable {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Request {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
