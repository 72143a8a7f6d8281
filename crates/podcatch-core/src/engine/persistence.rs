//! Persisted index of finished downloads
//!
//! A small JSON document listing `{episode_id, local_path}` for every
//! `Done` download. It is rebuilt from the live status map, written to a
//! temp file and swapped in atomically. Writes are debounced so a burst of
//! completions costs one rewrite.

use crate::engine::publish::{remove_if_exists, replace_file};
use crate::error::DownloadError;
use podcatch_types::EpisodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Schema version written by this build
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// One finished download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub episode_id: EpisodeId,
    pub local_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    #[serde(default)]
    entries: Vec<IndexEntry>,
}

/// The index file on disk
#[derive(Debug, Clone)]
pub struct DownloadIndex {
    path: PathBuf,
}

impl DownloadIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut raw = self.path.as_os_str().to_os_string();
        raw.push(".tmp");
        PathBuf::from(raw)
    }

    /// Load entries whose files still exist.
    ///
    /// A leftover temp file from an interrupted save is deleted. A missing,
    /// unreadable or newer-versioned index yields no entries.
    pub async fn load(&self) -> Result<Vec<IndexEntry>, DownloadError> {
        let temp = self.temp_path();
        if let Err(e) = remove_if_exists(&temp).await {
            warn!("Failed to remove stale index temp file {:?}: {}", temp, e);
        }

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let document: IndexDocument = match serde_json::from_str(&content) {
            Ok(document) => document,
            Err(e) => {
                warn!("Ignoring unreadable download index {:?}: {}", self.path, e);
                return Ok(Vec::new());
            }
        };
        if document.version > INDEX_SCHEMA_VERSION {
            warn!(
                "Ignoring download index {:?} with unsupported version {}",
                self.path, document.version
            );
            return Ok(Vec::new());
        }

        let total = document.entries.len();
        let mut entries = Vec::with_capacity(total);
        for entry in document.entries {
            if is_file(&entry.local_path).await {
                entries.push(entry);
            } else {
                debug!(
                    "Dropping index entry for {}: {:?} is gone",
                    entry.episode_id, entry.local_path
                );
            }
        }
        info!(
            "Loaded {} of {} download index entries from {:?}",
            entries.len(),
            total,
            self.path
        );
        Ok(entries)
    }

    /// Rewrite the index with `entries`
    pub async fn save(&self, entries: &[IndexEntry]) -> Result<(), DownloadError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let document = IndexDocument {
            version: INDEX_SCHEMA_VERSION,
            entries: entries.to_vec(),
        };
        let content = serde_json::to_vec_pretty(&document)?;

        let temp = self.temp_path();
        let result = write_and_replace(&temp, &self.path, &content).await;
        if let Err(e) = remove_if_exists(&temp).await {
            warn!("Failed to remove index temp file {:?}: {}", temp, e);
        }
        result
    }
}

async fn write_and_replace(temp: &Path, dest: &Path, content: &[u8]) -> Result<(), DownloadError> {
    let mut file = tokio::fs::File::create(temp).await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    replace_file(temp, dest).await?;
    Ok(())
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

enum WriterCommand {
    Schedule,
    Flush(oneshot::Sender<()>),
}

/// Debounced background writer for a [`DownloadIndex`]
#[derive(Clone)]
pub struct IndexWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl IndexWriter {
    /// Spawn the writer task.
    ///
    /// `snapshot` is called at write time to collect the current entries;
    /// entries whose files have disappeared are left out. The task ends
    /// once every handle is dropped.
    pub fn spawn<F>(index: DownloadIndex, debounce: Duration, snapshot: F) -> (Self, JoinHandle<()>)
    where
        F: Fn() -> Vec<IndexEntry> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(index, debounce, snapshot, rx));
        (Self { tx }, handle)
    }

    /// Request a save within the debounce window
    pub fn schedule(&self) {
        let _ = self.tx.send(WriterCommand::Schedule);
    }

    /// Save now and wait for the write to finish
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer<F>(
    index: DownloadIndex,
    debounce: Duration,
    snapshot: F,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) where
    F: Fn() -> Vec<IndexEntry> + Send + Sync + 'static,
{
    while let Some(command) = rx.recv().await {
        let mut waiters = Vec::new();
        match command {
            WriterCommand::Flush(tx) => waiters.push(tx),
            WriterCommand::Schedule => {
                // Coalesce until the window closes or someone needs it now
                let deadline = tokio::time::sleep(debounce);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        command = rx.recv() => match command {
                            Some(WriterCommand::Schedule) => continue,
                            Some(WriterCommand::Flush(tx)) => {
                                waiters.push(tx);
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
        }

        let mut entries = Vec::new();
        for entry in snapshot() {
            if is_file(&entry.local_path).await {
                entries.push(entry);
            }
        }
        match index.save(&entries).await {
            Ok(()) => debug!("Saved {} download index entries", entries.len()),
            Err(e) => warn!("Failed to save download index {:?}: {}", index.path(), e),
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}
