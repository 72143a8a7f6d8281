//! Podcatch Core - Download Engine
//!
//! This crate fetches podcast episodes into a local library. It handles
//! the download queue, resumable transfers, retries, file naming and the
//! index of finished downloads.

mod catalog;
pub mod engine;
mod error;
pub mod paths;
mod queue;
mod storage;

pub use catalog::*;
pub use engine::{DownloadManager, IndexEntry, RetryPolicy, TransferEngine};
pub use error::*;
pub use queue::*;
pub use storage::*;

use podcatch_types::{DownloadState, EpisodeInfo, Settings};
use std::path::PathBuf;
use std::sync::Arc;

/// The main Podcatch core instance
pub struct PodcatchCore {
    /// Config directory and settings file
    pub storage: ConfigStore,
    /// Settings loaded at startup
    pub settings: Settings,
    /// Episodes known to this process
    pub catalog: Arc<EpisodeCatalog>,
    /// Download queue and worker
    pub downloads: DownloadManager,
}

impl PodcatchCore {
    /// Open the config directory, load settings and restore the index
    pub async fn new(config_dir: PathBuf) -> Result<Self, DownloadError> {
        let storage = ConfigStore::new(config_dir).await?;
        let settings = storage.load_settings().await?;
        let catalog = Arc::new(EpisodeCatalog::new());
        let downloads =
            DownloadManager::new(&settings, storage.index_path(), catalog.clone()).await?;

        Ok(Self {
            storage,
            settings,
            catalog,
            downloads,
        })
    }

    /// Register `episode` and queue it for download
    pub fn add_episode(&self, episode: EpisodeInfo) {
        let id = episode.id.clone();
        self.catalog.insert(episode);
        self.downloads.enqueue(id);
        self.downloads.ensure_running();
    }

    /// Finished downloads, as they would be written to the index
    pub fn library(&self) -> Vec<IndexEntry> {
        self.downloads
            .statuses()
            .into_iter()
            .filter(|(_, status)| status.state == DownloadState::Done)
            .filter_map(|(episode_id, status)| {
                status.local_path.map(|local_path| IndexEntry {
                    episode_id,
                    local_path,
                })
            })
            .collect()
    }
}
