//! Shared types for Podcatch
//!
//! This crate contains the data structures shared between the
//! download engine and the command-line front end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Episode Types
// ============================================================================

/// Opaque identifier of an episode, owned by the episode repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(String);

impl EpisodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EpisodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EpisodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The fields of an episode the download engine reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub id: EpisodeId,
    /// Enclosure (audio) URL
    pub url: String,
    pub feed_title: String,
    pub episode_title: String,
}

// ============================================================================
// Download Types
// ============================================================================

/// Lifecycle state of an episode download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    #[default]
    None,
    Queued,
    Running,
    Verifying,
    Done,
    Failed,
    Canceled,
}

impl DownloadState {
    /// Whether no further transition happens without a new enqueue
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Snapshot of one episode's download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub state: DownloadState,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    pub local_path: Option<PathBuf>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadStatus {
    pub fn new() -> Self {
        Self {
            state: DownloadState::None,
            bytes_received: 0,
            total_bytes: None,
            local_path: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Progress in percent, when the total is known
    pub fn progress(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_received as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }
}

impl Default for DownloadStatus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings, persisted as `settings.json` in the config directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the download tree; unset means the user's default
    pub download_dir: Option<PathBuf>,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Random jitter as a fraction of the computed backoff
    pub retry_jitter: f64,
    /// Upper clamp on server `Retry-After` hints
    pub max_retry_after_ms: u64,
    pub connect_timeout_secs: u64,
    /// Time allowed until response headers arrive
    pub header_timeout_secs: u64,
    /// Time allowed for any single body read
    pub read_timeout_secs: u64,
    pub size_tolerance_bytes: u64,
    pub index_debounce_ms: u64,
    pub progress_interval_ms: u64,
    pub user_agent: String,
    pub fallback_extension: String,
}

impl Settings {
    /// The configured download root, or `<audio dir>/Podcasts`
    pub fn download_root(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(default_download_dir)
    }
}

fn default_download_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::home_dir)
        .map(|p| p.join("Podcasts"))
        .unwrap_or_else(|| PathBuf::from("Podcasts"))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: None,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_jitter: 0.25,
            max_retry_after_ms: 300_000,
            connect_timeout_secs: 15,
            header_timeout_secs: 30,
            read_timeout_secs: 60,
            size_tolerance_bytes: 1024,
            index_debounce_ms: 800,
            progress_interval_ms: 300,
            user_agent: concat!("podcatch/", env!("CARGO_PKG_VERSION")).to_string(),
            fallback_extension: "mp3".to_string(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Fired on every state transition and on progress pulses while running
    StatusChanged {
        id: EpisodeId,
        status: DownloadStatus,
    },
}
