//! Tabular job store, description cache and HTTP fetch utilities for jobsift.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod table;

pub use table::{CsvTableStore, MemoryTableStore, RowFilter, RowUpdate, StoredRow, TableStore};

/// Descriptions longer than this are cut before they reach the cache.
pub const MAX_DESCRIPTION_CHARS: usize = 50_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed table {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("tab {0} does not exist")]
    TabNotFound(String),
    #[error("row {index} does not exist in tab {tab}")]
    RowNotFound { tab: String, index: usize },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Replace `path` with `bytes` through a temp file in the same directory and a rename, so
/// readers never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

/// Canonical URL -> full description text, kept outside the table.
#[derive(Debug, Default)]
pub struct DescriptionCache {
    path: PathBuf,
    entries: HashMap<String, String>,
    dirty: bool,
}

impl DescriptionCache {
    /// Load the cache file. A missing or unreadable file yields an empty cache.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<HashMap<String, String>>(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "description cache unreadable; starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "description cache unreadable; starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            entries,
            dirty: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, canonical_url: &str) -> Option<&str> {
        self.entries.get(canonical_url).map(String::as_str)
    }

    /// Store a description. Empty text is ignored so it never shadows an earlier capture.
    pub fn insert(&mut self, canonical_url: &str, description: &str) {
        let description = description.trim();
        if description.is_empty() {
            return;
        }
        let truncated = truncate_chars(description, MAX_DESCRIPTION_CHARS);
        if self.entries.get(canonical_url).map(String::as_str) != Some(truncated) {
            self.entries
                .insert(canonical_url.to_string(), truncated.to_string());
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist the whole map if anything changed since the last flush.
    pub async fn flush(&mut self) -> Result<bool, StoreError> {
        if !self.dirty || self.path.as_os_str().is_empty() {
            return Ok(false);
        }
        let bytes = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| StoreError::io(&self.path, e.into()))?;
        write_atomic(&self.path, &bytes).await?;
        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.entries.len(), "description cache flushed");
        Ok(true)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Rate limits and server errors are worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Delay before retry `n` is `initial * 2^n`, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub retries: usize,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            retries: 3,
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule {
    pub fn delay(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.initial.saturating_mul(1 << shift).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Requests in flight across all sources.
    pub max_in_flight: usize,
    /// Requests in flight against a single source.
    pub max_in_flight_per_source: usize,
    pub retry: RetrySchedule,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: format!("jobsift/{}", env!("CARGO_PKG_VERSION")),
            max_in_flight: 8,
            max_in_flight_per_source: 2,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// One failed attempt: the error plus whether retrying could help.
struct AttemptFailure {
    transient: bool,
    error: FetchError,
}

impl AttemptFailure {
    fn transport(url: &str, source: reqwest::Error) -> Self {
        Self {
            transient: is_transient_transport(&source),
            error: FetchError::Transport {
                url: url.to_string(),
                source,
            },
        }
    }
}

/// Shared HTTP client for source adapters. Bounds requests in flight globally and per source.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_source_cap: usize,
    sources: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_source_cap: config.max_in_flight_per_source.max(1),
            sources: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn source_gate(&self, source_id: &str) -> Arc<Semaphore> {
        let mut sources = self.sources.lock().await;
        Arc::clone(
            sources
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_cap))),
        )
    }

    /// GET `url`, retrying transient failures on the configured schedule.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let gate = self.source_gate(source_id).await;
        let _source_permit = gate.acquire_owned().await.map_err(|_| FetchError::Closed)?;
        let _permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;

        async {
            let mut retry = 0;
            loop {
                let failure = match self.attempt(url).await {
                    Ok(response) => return Ok(response),
                    Err(failure) => failure,
                };
                if !failure.transient || retry >= self.retry.retries {
                    return Err(failure.error);
                }
                let delay = self.retry.delay(retry);
                warn!(error = %failure.error, retry, ?delay, "fetch failed; retrying");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
        .instrument(info_span!("http_fetch", %run_id, source_id, url))
        .await
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, AttemptFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptFailure::transport(url, e))?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(AttemptFailure {
                transient: is_transient_status(status),
                error: FetchError::Status {
                    status: status.as_u16(),
                    url: final_url,
                },
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptFailure::transport(url, e))?;
        debug!(%status, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            final_url,
            body: body.to_vec(),
        })
    }
}
