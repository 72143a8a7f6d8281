//! Transfer engine - one resumable HTTP download of an episode
//!
//! A transfer streams into `<destination>.part`, verifies the written size
//! against what the server declared, and atomically renames the part file
//! onto the destination. An existing part file is resumed with a `Range`
//! request. Partial files are never deleted on failure or cancellation,
//! only when the server rejects the resume offset.

use crate::engine::publish::{publish, remove_if_exists};
use crate::engine::retry::{parse_retry_after, run_with_retry, RetryPolicy};
use crate::error::DownloadError;
use crate::paths;
use futures::TryStreamExt;
use podcatch_types::{EpisodeId, EpisodeInfo, Settings};
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Size of a single body read
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Tunables of the transfer engine
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub header_timeout: Duration,
    pub read_timeout: Duration,
    pub size_tolerance: u64,
    pub progress_interval: Duration,
    pub fallback_extension: String,
}

impl TransferConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            header_timeout: Duration::from_secs(settings.header_timeout_secs),
            read_timeout: Duration::from_secs(settings.read_timeout_secs),
            size_tolerance: settings.size_tolerance_bytes,
            progress_interval: Duration::from_millis(settings.progress_interval_ms),
            fallback_extension: settings.fallback_extension.clone(),
        }
    }
}

/// A resolved download: where to fetch from and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub id: EpisodeId,
    pub url: String,
    /// Final path; the part file lives next to it
    pub destination: PathBuf,
    /// Whether the extension came from the URL rather than the fallback
    pub extension_from_url: bool,
}

impl TransferJob {
    pub fn part_path(&self) -> PathBuf {
        paths::part_path(&self.destination)
    }
}

/// Progress reported while a transfer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// Headers accepted; writing starts at `offset`
    AttemptStarted { offset: u64, total: Option<u64> },
    Progress { received: u64, total: Option<u64> },
    Verifying,
}

/// A published download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub total: Option<u64>,
}

/// What the response headers told us about the body
struct ResponseMeta {
    resuming: bool,
    start: u64,
    total: Option<u64>,
    identity: bool,
    hinted_extension: Option<String>,
}

/// Performs single-connection, resumable downloads
#[derive(Clone)]
pub struct TransferEngine {
    client: Client,
    config: TransferConfig,
}

impl TransferEngine {
    /// Create an engine with a client built from `settings`.
    ///
    /// The client has a connect timeout but no overall timeout; the header
    /// phase and every body read are bounded separately.
    pub fn new(settings: &Settings) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, TransferConfig::from_settings(settings)))
    }

    pub fn with_client(client: Client, config: TransferConfig) -> Self {
        Self { client, config }
    }

    /// Resolve where an episode goes under `root`.
    ///
    /// An existing part file pins the destination so it can be resumed; a
    /// destination occupied by something else gets a unique sibling name.
    pub fn prepare(&self, root: &Path, episode: &EpisodeInfo) -> Result<TransferJob, DownloadError> {
        let url = Url::parse(&episode.url)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", episode.url, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(DownloadError::UnsupportedScheme(other.to_string())),
        }

        let extension_from_url = paths::extension_from_url(&episode.url).is_some();
        let extension =
            paths::get_extension(Some(episode.url.as_str()), None, &self.config.fallback_extension);
        let mut destination = paths::build_download_path(
            root,
            &episode.feed_title,
            &episode.episode_title,
            &extension,
        );

        if !paths::part_path(&destination).exists() && destination.exists() {
            let unique = paths::ensure_unique_path(&destination);
            info!(
                "{:?} already exists, downloading episode {} to {:?}",
                destination, episode.id, unique
            );
            destination = unique;
        }

        Ok(TransferJob {
            id: episode.id.clone(),
            url: episode.url.clone(),
            destination,
            extension_from_url,
        })
    }

    /// Download `job` with retries, reporting progress to `observer`
    pub async fn download(
        &self,
        job: &TransferJob,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        observer: &(dyn Fn(TransferEvent) + Send + Sync),
    ) -> Result<TransferOutcome, DownloadError> {
        run_with_retry(policy, cancel, |attempt| {
            debug!("Episode {} attempt {}", job.id, attempt);
            self.attempt(job, cancel, observer)
        })
        .await
    }

    /// One attempt. A rejected resume offset discards the part file and
    /// restarts from zero within the same attempt.
    pub async fn attempt(
        &self,
        job: &TransferJob,
        cancel: &CancellationToken,
        observer: &(dyn Fn(TransferEvent) + Send + Sync),
    ) -> Result<TransferOutcome, DownloadError> {
        let part = job.part_path();
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let offset = resume_offset(&part).await?;
        match self.transfer(job, &part, offset, cancel, observer).await {
            Err(DownloadError::RangeNotSatisfiable { offset }) => {
                warn!(
                    "Server rejected resume of episode {} at byte {}, discarding {:?}",
                    job.id, offset, part
                );
                remove_if_exists(&part).await?;
                self.transfer(job, &part, 0, cancel, observer).await
            }
            other => other,
        }
    }

    async fn transfer(
        &self,
        job: &TransferJob,
        part: &Path,
        offset: u64,
        cancel: &CancellationToken,
        observer: &(dyn Fn(TransferEvent) + Send + Sync),
    ) -> Result<TransferOutcome, DownloadError> {
        let mut request = self
            .client
            .get(&job.url)
            .header(header::ACCEPT_ENCODING, "identity");
        if offset > 0 {
            info!("Resuming episode {} from byte {}", job.id, offset);
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Canceled),
            result = tokio::time::timeout(self.config.header_timeout, request.send()) => match result {
                Ok(response) => response?,
                Err(_) => return Err(DownloadError::HeaderTimeout(self.config.header_timeout)),
            },
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            return Err(DownloadError::RangeNotSatisfiable { offset });
        }
        if !status.is_success() {
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| parse_retry_after(v, chrono::Utc::now()))
            } else {
                None
            };
            return Err(DownloadError::Http {
                status: status.as_u16(),
                retry_after,
            });
        }

        let meta = self.inspect(job, &response, offset);
        if offset > 0 && !meta.resuming {
            info!(
                "Server ignored range for episode {}, restarting from zero",
                job.id
            );
        }

        let mut file = open_part(part, meta.resuming).await?;
        observer(TransferEvent::AttemptStarted {
            offset: meta.start,
            total: meta.total,
        });

        let stream = response.bytes_stream().map_err(io::Error::other);
        let mut reader = StreamReader::new(Box::pin(stream));
        let streamed = self
            .stream_body(&mut reader, &mut file, meta.start, meta.total, cancel, observer)
            .await;

        // Whatever happened, keep what was written for a later resume
        let synced = sync_file(&mut file).await;
        drop(file);
        let received = streamed?;
        synced?;
        observer(TransferEvent::Progress {
            received,
            total: meta.total,
        });

        observer(TransferEvent::Verifying);
        let actual = tokio::fs::metadata(part).await?.len();
        if meta.identity {
            if let Some(expected) = meta.total {
                if actual.abs_diff(expected) > self.config.size_tolerance {
                    warn!(
                        "Episode {}: expected {} bytes, wrote {}",
                        job.id, expected, actual
                    );
                    return Err(DownloadError::SizeMismatch { expected, actual });
                }
            }
        }

        let final_path = self.final_path(job, meta.hinted_extension.as_deref());
        publish(part, &final_path).await?;
        info!(
            "Episode {} downloaded to {:?} ({} bytes)",
            job.id, final_path, actual
        );

        Ok(TransferOutcome {
            path: final_path,
            bytes: actual,
            total: meta.total,
        })
    }

    fn inspect(&self, job: &TransferJob, response: &reqwest::Response, offset: u64) -> ResponseMeta {
        let headers = response.headers();
        let resuming = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let start = if resuming { offset } else { 0 };
        let content_length = content_length(headers);
        let total = if resuming {
            content_range_total(headers).or(content_length.map(|len| start + len))
        } else {
            content_length
        };
        let identity = headers
            .get(header::CONTENT_ENCODING)
            .map(|v| {
                v.to_str()
                    .map(|s| s.trim().eq_ignore_ascii_case("identity"))
                    .unwrap_or(false)
            })
            .unwrap_or(true);
        let hinted_extension = if job.extension_from_url {
            None
        } else {
            headers
                .get(header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(paths::extension_from_hint)
        };

        ResponseMeta {
            resuming,
            start,
            total,
            identity,
            hinted_extension,
        }
    }

    /// Copy the body into `file`, one bounded read at a time
    async fn stream_body<R>(
        &self,
        reader: &mut R,
        file: &mut File,
        start: u64,
        total: Option<u64>,
        cancel: &CancellationToken,
        observer: &(dyn Fn(TransferEvent) + Send + Sync),
    ) -> Result<u64, DownloadError>
    where
        R: AsyncRead + Unpin,
    {
        let read_timeout = self.config.read_timeout;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = start;
        let mut last_emit = Instant::now();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Canceled),
                result = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => match result {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(DownloadError::Stream(e)),
                    Err(_) => return Err(DownloadError::ReadTimeout(read_timeout)),
                },
            };
            if read == 0 {
                return Ok(received);
            }

            file.write_all(&buf[..read]).await?;
            received += read as u64;

            if last_emit.elapsed() >= self.config.progress_interval {
                observer(TransferEvent::Progress { received, total });
                last_emit = Instant::now();
            }
        }
    }

    /// The destination, re-extended when the server named a better type
    fn final_path(&self, job: &TransferJob, hinted_extension: Option<&str>) -> PathBuf {
        let Some(ext) = hinted_extension else {
            return job.destination.clone();
        };
        let current = job
            .destination
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        if current.as_deref() == Some(ext) {
            return job.destination.clone();
        }
        paths::ensure_unique_path(&paths::with_extension(&job.destination, &format!(".{ext}")))
    }
}

/// Length of an existing part file, or zero
pub async fn resume_offset(part: &Path) -> Result<u64, DownloadError> {
    match tokio::fs::metadata(part).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(DownloadError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a file", part.display()),
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

async fn open_part(part: &Path, append: bool) -> Result<File, DownloadError> {
    let file = if append {
        OpenOptions::new().append(true).open(part).await?
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part)
            .await?
    };
    Ok(file)
}

async fn sync_file(file: &mut File) -> Result<(), DownloadError> {
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Total size from `Content-Range: bytes a-b/total`
pub fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tempfile::TempDir;

    fn engine() -> TransferEngine {
        TransferEngine::new(&Settings::default()).unwrap()
    }

    fn episode(url: &str) -> EpisodeInfo {
        EpisodeInfo {
            id: "e1".into(),
            url: url.to_string(),
            feed_title: "My Show".into(),
            episode_title: "Episode One".into(),
        }
    }

    #[test]
    fn test_content_range_total() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range_total(&headers), None);
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 100-999/1000"));
        assert_eq!(content_range_total(&headers), Some(1000));
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 100-999/*"));
        assert_eq!(content_range_total(&headers), None);
    }

    #[test]
    fn test_prepare_builds_destination() {
        let dir = TempDir::new().unwrap();
        let job = engine()
            .prepare(dir.path(), &episode("https://cdn.example/ep1.mp3"))
            .unwrap();
        assert_eq!(job.destination, dir.path().join("My Show").join("Episode One.mp3"));
        assert_eq!(
            job.part_path(),
            dir.path().join("My Show").join("Episode One.mp3.part")
        );
        assert!(job.extension_from_url);
    }

    #[test]
    fn test_prepare_uses_fallback_extension() {
        let dir = TempDir::new().unwrap();
        let job = engine()
            .prepare(dir.path(), &episode("https://cdn.example/stream?id=4"))
            .unwrap();
        assert_eq!(job.destination, dir.path().join("My Show").join("Episode One.mp3"));
        assert!(!job.extension_from_url);
    }

    #[test]
    fn test_prepare_avoids_foreign_files_but_keeps_part_files() {
        let dir = TempDir::new().unwrap();
        let show = dir.path().join("My Show");
        std::fs::create_dir_all(&show).unwrap();
        std::fs::write(show.join("Episode One.mp3"), b"someone else").unwrap();

        let job = engine()
            .prepare(dir.path(), &episode("https://cdn.example/ep1.mp3"))
            .unwrap();
        assert_eq!(job.destination, show.join("Episode One (1).mp3"));

        std::fs::write(show.join("Episode One.mp3.part"), b"ours").unwrap();
        let job = engine()
            .prepare(dir.path(), &episode("https://cdn.example/ep1.mp3"))
            .unwrap();
        assert_eq!(job.destination, show.join("Episode One.mp3"));
    }

    #[test]
    fn test_prepare_rejects_bad_urls() {
        let dir = TempDir::new().unwrap();
        let err = engine()
            .prepare(dir.path(), &episode("ftp://cdn.example/ep1.mp3"))
            .unwrap_err();
        assert!(matches!(err, DownloadError::UnsupportedScheme(ref s) if s == "ftp"));
        assert!(!err.is_retryable());

        let err = engine().prepare(dir.path(), &episode("::nope")).unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
    }

    #[test]
    fn test_final_path_follows_content_disposition() {
        let dir = TempDir::new().unwrap();
        let job = TransferJob {
            id: "e1".into(),
            url: "https://cdn.example/stream".into(),
            destination: dir.path().join("Episode.mp3"),
            extension_from_url: false,
        };
        let engine = engine();
        assert_eq!(engine.final_path(&job, None), job.destination);
        assert_eq!(engine.final_path(&job, Some("mp3")), job.destination);
        assert_eq!(
            engine.final_path(&job, Some("m4a")),
            dir.path().join("Episode.m4a")
        );
    }

    #[tokio::test]
    async fn test_resume_offset() {
        let dir = TempDir::new().unwrap();
        let part = dir.path().join("a.mp3.part");
        assert_eq!(resume_offset(&part).await.unwrap(), 0);
        tokio::fs::write(&part, vec![0u8; 321]).await.unwrap();
        assert_eq!(resume_offset(&part).await.unwrap(), 321);
    }
}
