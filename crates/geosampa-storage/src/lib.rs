//! Local snapshot storage + retrying HTTP transport for the GeoSampa harvester.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use geosampa_core::{decode_latin1, escape_non_ascii, ErrorKind, FileDescriptor};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Suffix appended to an artifact's file name to form its sidecar.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot path {0} does not exist")]
    Missing(PathBuf),
    #[error("snapshot path {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sidecar {path} is not valid metadata: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Fetch(err) => err.kind(),
            _ => ErrorKind::Filesystem,
        }
    }

    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result of storing one descriptor's artifact.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub artifact_path: PathBuf,
    pub sidecar_path: PathBuf,
    pub byte_size: u64,
    /// SHA-256 of the freshly written bytes; `None` when the file was already on disk.
    pub content_hash: Option<String>,
    pub already_present: bool,
}

/// One sidecar found in the snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub sidecar_path: PathBuf,
    pub artifact_path: PathBuf,
    pub artifact_present: bool,
}

/// Flat directory of `<artifact>` + `<artifact>.meta.json` pairs.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open an existing snapshot directory, failing if it is absent or not a directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let meta = match fs::metadata(&root).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(root));
            }
            Err(err) => return Err(StoreError::io(root, err)),
        };
        if !meta.is_dir() {
            return Err(StoreError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    /// Deterministic artifact name: sanitized hierarchy parts joined by `-`, then the unmodified file name.
    ///
    /// Sanitizing is lossy. Parts that differ only in case, punctuation or
    /// whitespace versus `-` (`"Theme X"` and `"Theme-X"`) map to the same
    /// name, and the later descriptor is treated as already present.
    pub fn sanitize_filename(theme: &str, sub_theme: &str, layer: &str, file: &str) -> String {
        let parts = [theme, sub_theme, layer]
            .iter()
            .map(|part| sanitize_segment(part))
            .collect::<Vec<_>>();
        format!("{}-{}", parts.join("-"), file)
    }

    pub fn artifact_path(&self, descriptor: &FileDescriptor) -> PathBuf {
        let (theme, sub_theme, layer, file) = descriptor.hierarchy();
        self.root
            .join(Self::sanitize_filename(theme, sub_theme, layer, file))
    }

    pub fn sidecar_path(artifact_path: &Path) -> PathBuf {
        let mut name = artifact_path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    /// Download the descriptor's artifact (unless already on disk) and record its sidecar.
    ///
    /// The sidecar is only written once the artifact exists, so a failed
    /// download leaves neither file behind.
    pub async fn store_descriptor(
        &self,
        http: &HttpFetcher,
        descriptor: &FileDescriptor,
    ) -> Result<StoredArtifact, StoreError> {
        let artifact_path = self.artifact_path(descriptor);
        let sidecar_path = Self::sidecar_path(&artifact_path);

        let stored = if fs::try_exists(&artifact_path)
            .await
            .map_err(|err| StoreError::io(&artifact_path, err))?
        {
            info!(path = %artifact_path.display(), "artifact already present, skipping download");
            let byte_size = fs::metadata(&artifact_path)
                .await
                .map_err(|err| StoreError::io(&artifact_path, err))?
                .len();
            StoredArtifact {
                artifact_path,
                sidecar_path,
                byte_size,
                content_hash: None,
                already_present: true,
            }
        } else {
            let (byte_size, content_hash) = self
                .download_to(http, &descriptor.link, &artifact_path)
                .instrument(info_span!("download", file = %descriptor.file))
                .await?;
            StoredArtifact {
                artifact_path,
                sidecar_path,
                byte_size,
                content_hash: Some(content_hash),
                already_present: false,
            }
        };

        write_sidecar(&stored.sidecar_path, descriptor).await?;
        Ok(stored)
    }

    /// Stream `url` into `target` through a temp file + rename. Partial output is removed on failure.
    async fn download_to(
        &self,
        http: &HttpFetcher,
        url: &str,
        target: &Path,
    ) -> Result<(u64, String), StoreError> {
        let temp_path = self.root.join(format!(".{}.part", Uuid::new_v4()));
        match stream_to_file(http, url, &temp_path).await {
            Ok(written) => match fs::rename(&temp_path, target).await {
                Ok(()) => {
                    debug!(bytes = written.0, path = %target.display(), "download complete");
                    Ok(written)
                }
                Err(err) => {
                    let _ = fs::remove_file(&temp_path).await;
                    Err(StoreError::io(target, err))
                }
            },
            Err(err) => {
                if fs::try_exists(&temp_path).await.unwrap_or(false) {
                    if let Err(rm) = fs::remove_file(&temp_path).await {
                        warn!(path = %temp_path.display(), error = %rm, "could not remove partial download");
                    }
                }
                Err(err)
            }
        }
    }

    /// List every sidecar in name order, paired with its artifact.
    pub async fn scan(&self) -> Result<Vec<SnapshotEntry>, StoreError> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|err| StoreError::io(&self.root, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| StoreError::io(&self.root, err))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                // not written by this store, so never an orphan
                warn!(path = %entry.path().display(), "skipping non UTF-8 file name");
                continue;
            };
            let Some(artifact_name) = name.strip_suffix(SIDECAR_SUFFIX) else {
                continue;
            };
            if artifact_name.is_empty() {
                continue;
            }
            let artifact_path = self.root.join(artifact_name);
            let artifact_present = fs::try_exists(&artifact_path)
                .await
                .map_err(|err| StoreError::io(&artifact_path, err))?;
            entries.push(SnapshotEntry {
                sidecar_path: entry.path(),
                artifact_path,
                artifact_present,
            });
        }
        entries.sort_by(|a, b| a.sidecar_path.cmp(&b.sidecar_path));
        Ok(entries)
    }

    pub async fn remove_sidecar(&self, entry: &SnapshotEntry) -> Result<(), StoreError> {
        fs::remove_file(&entry.sidecar_path)
            .await
            .map_err(|err| StoreError::io(&entry.sidecar_path, err))
    }
}

fn sanitize_segment(part: &str) -> String {
    part.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

async fn stream_to_file(
    http: &HttpFetcher,
    url: &str,
    temp_path: &Path,
) -> Result<(u64, String), StoreError> {
    let mut response = http.send("download", |client| client.get(url)).await?;
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|err| StoreError::io(temp_path, err))?;

    let mut hasher = Sha256::new();
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(FetchError::Request)? {
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|err| StoreError::io(temp_path, err))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|err| StoreError::io(temp_path, err))?;
    Ok((written, hex::encode(hasher.finalize())))
}

/// Serialize a sidecar as 4-space indented, ASCII-only JSON (readable as Latin-1).
pub fn render_sidecar(descriptor: &FileDescriptor) -> Result<String, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    descriptor.serialize(&mut ser)?;
    Ok(escape_non_ascii(&String::from_utf8_lossy(&buf)))
}

pub async fn write_sidecar(path: &Path, descriptor: &FileDescriptor) -> Result<(), StoreError> {
    let text = render_sidecar(descriptor).map_err(|source| StoreError::Sidecar {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text)
        .await
        .map_err(|err| StoreError::io(path, err))
}

pub async fn read_sidecar(path: &Path) -> Result<FileDescriptor, StoreError> {
    let bytes = fs::read(path).await.map_err(|err| StoreError::io(path, err))?;
    serde_json::from_str(&decode_latin1(&bytes)).map_err(|source| StoreError::Sidecar {
        path: path.to_path_buf(),
        source,
    })
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
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
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("geosampa-harvester/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("GEOSAMPA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("GEOSAMPA_USER_AGENT")
                .ok()
                .or(defaults.user_agent),
            backoff: BackoffPolicy {
                max_retries: std::env::var("GEOSAMPA_HTTP_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.backoff.max_retries),
                ..defaults.backoff
            },
        }
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
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Network
    }
}

/// Sequential HTTP client with a request timeout and capped exponential retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
            backoff: config.backoff,
        })
    }

    /// Send an idempotent request built by `build`, retrying transient failures.
    ///
    /// `build` runs once per attempt, so bodies that cannot be cloned (multipart
    /// uploads) are rebuilt each time. Only a successful status is returned as `Ok`.
    pub async fn send<F>(&self, label: &str, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.send_with(label, self.backoff.max_retries, build).await
    }

    /// Send a request exactly once. For calls the server may have applied even
    /// when the response is lost (creates), where a resend could duplicate state.
    pub async fn send_once<F>(&self, label: &str, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.send_with(label, 0, build).await
    }

    async fn send_with<F>(
        &self,
        label: &str,
        max_retries: usize,
        build: F,
    ) -> Result<reqwest::Response, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
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
                        && attempt < max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(label, %url, status = status.as_u16(), attempt, ?delay, "retrying after http status");
                        tokio::time::sleep(delay).await;
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
                        && attempt < max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(label, error = %err, attempt, ?delay, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
