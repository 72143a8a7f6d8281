//! Download Manager - the queue and its single worker
//!
//! This is the top-level coordinator that:
//! - Owns the pending queue and the per-episode status map
//! - Runs one background worker that processes jobs strictly in order
//! - Applies every status change through the state machine and
//!   broadcasts it to observers
//! - Keeps the persisted index in step with finished downloads

use crate::catalog::EpisodeLookup;
use crate::engine::persistence::{DownloadIndex, IndexEntry, IndexWriter};
use crate::engine::retry::RetryPolicy;
use crate::engine::state::{transition, StatusEvent};
use crate::engine::transfer::{TransferEngine, TransferEvent};
use crate::error::DownloadError;
use crate::queue::DownloadQueue;
use chrono::Utc;
use parking_lot::Mutex;
use podcatch_types::{CoreEvent, DownloadState, DownloadStatus, EpisodeId, Settings};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often an idle worker wakes up to look at the shutdown flag
const IDLE_WAKE_INTERVAL: Duration = Duration::from_secs(2);
/// How long `shutdown` waits for the worker before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 1024;

/// Everything guarded by the single state lock
struct SharedState {
    queue: DownloadQueue,
    statuses: HashMap<EpisodeId, DownloadStatus>,
    active: Option<ActiveJob>,
    shutdown: CancellationToken,
}

/// The job currently owned by the worker
struct ActiveJob {
    id: EpisodeId,
    cancel: CancellationToken,
}

struct Inner {
    state: Arc<Mutex<SharedState>>,
    /// Wakes the worker on enqueue or stop
    wake: Notify,
    engine: TransferEngine,
    policy: RetryPolicy,
    lookup: Arc<dyn EpisodeLookup>,
    download_root: PathBuf,
    index: IndexWriter,
    event_tx: broadcast::Sender<CoreEvent>,
}

/// Download manager that owns the queue and its worker
pub struct DownloadManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Create a manager, restoring finished downloads from the index at
    /// `index_path`. The worker is not started; see [`Self::ensure_running`].
    pub async fn new(
        settings: &Settings,
        index_path: PathBuf,
        lookup: Arc<dyn EpisodeLookup>,
    ) -> Result<Self, DownloadError> {
        let engine = TransferEngine::new(settings)?;
        Self::with_engine(settings, index_path, lookup, engine).await
    }

    /// Create a manager around a preconfigured transfer engine
    pub async fn with_engine(
        settings: &Settings,
        index_path: PathBuf,
        lookup: Arc<dyn EpisodeLookup>,
        engine: TransferEngine,
    ) -> Result<Self, DownloadError> {
        let index = DownloadIndex::new(index_path);
        let restored = index.load().await?;

        let mut statuses = HashMap::new();
        for entry in restored {
            let bytes = tokio::fs::metadata(&entry.local_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            let status = transition(
                &DownloadStatus::new(),
                StatusEvent::Restored {
                    path: entry.local_path,
                    bytes,
                },
                Utc::now(),
            )
            .status;
            statuses.insert(entry.episode_id, status);
        }

        let state = Arc::new(Mutex::new(SharedState {
            queue: DownloadQueue::new(),
            statuses,
            active: None,
            shutdown: CancellationToken::new(),
        }));

        let snapshot_state = state.clone();
        let (index, _writer) = IndexWriter::spawn(
            index,
            Duration::from_millis(settings.index_debounce_ms),
            move || done_entries(&snapshot_state.lock().statuses),
        );

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                state,
                wake: Notify::new(),
                engine,
                policy: RetryPolicy::from_settings(settings),
                lookup,
                download_root: settings.download_root(),
                index,
                event_tx,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.event_tx.subscribe()
    }

    // ========================================================================
    // Queue Operations
    // ========================================================================

    /// Append `id` to the queue and wake the worker. Idempotent.
    ///
    /// A finished episode whose file still exists and a job the worker is
    /// transferring are left alone.
    pub fn enqueue(&self, id: EpisodeId) {
        if self.inner.admit(&id, false) {
            self.inner.wake.notify_one();
        }
    }

    /// Move `id` to the head of the queue, inserting it if needed
    pub fn force_front(&self, id: EpisodeId) {
        if self.inner.admit(&id, true) {
            self.inner.wake.notify_one();
        }
    }

    /// Cancel `id`: drop it from the queue, or signal its running transfer.
    ///
    /// A running job becomes `Canceled` once the transfer has stopped; its
    /// part file is kept for a later resume.
    pub fn cancel(&self, id: &EpisodeId) {
        let mut state = self.inner.state.lock();
        if state.queue.remove(id) {
            info!("Removed episode {} from the queue", id);
            self.inner.apply_locked(&mut state, id, StatusEvent::Canceled);
            return;
        }
        if let Some(active) = state.active.as_ref().filter(|job| &job.id == id) {
            info!("Canceling running download of episode {}", id);
            active.cancel.cancel();
        }
    }

    // ========================================================================
    // Worker Lifecycle
    // ========================================================================

    /// Start the worker if it is not running.
    ///
    /// A worker that was told to stop but has not exited yet is replaced.
    /// It takes no further jobs, and its successor starts only once it has
    /// finished winding down.
    pub fn ensure_running(&self) {
        let mut worker = self.worker.lock();
        let shutdown = {
            let mut state = self.inner.state.lock();
            let alive = worker.as_ref().is_some_and(|handle| !handle.is_finished());
            if alive && !state.shutdown.is_cancelled() {
                return;
            }
            if state.shutdown.is_cancelled() {
                state.shutdown = CancellationToken::new();
            }
            state.shutdown.clone()
        };

        let previous = worker.take().filter(|handle| !handle.is_finished());
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            run_worker(inner, shutdown).await;
        }));
    }

    /// Ask the worker to stop; any running transfer is canceled
    pub fn stop(&self) {
        self.inner.state.lock().shutdown.cancel();
        self.inner.wake.notify_one();
    }

    /// Stop the worker, wait briefly for it, and flush the index
    pub async fn shutdown(&self) {
        self.stop();

        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Download worker did not stop in time, aborting it");
                handle.abort();
            }
        }

        if let Some(active) = self.inner.state.lock().active.take() {
            active.cancel.cancel();
        }
        self.inner.index.flush().await;
    }

    /// Persist the index now instead of waiting for the debounce
    pub async fn flush_index(&self) {
        self.inner.index.flush().await;
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current state of `id`; `None` when unknown
    pub fn state(&self, id: &EpisodeId) -> DownloadState {
        self.inner
            .state
            .lock()
            .statuses
            .get(id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn status(&self, id: &EpisodeId) -> Option<DownloadStatus> {
        self.inner.state.lock().statuses.get(id).cloned()
    }

    /// Every known status
    pub fn statuses(&self) -> Vec<(EpisodeId, DownloadStatus)> {
        let state = self.inner.state.lock();
        let mut all: Vec<_> = state
            .statuses
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Pending ids in processing order
    pub fn queued(&self) -> Vec<EpisodeId> {
        self.inner.state.lock().queue.to_vec()
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown.cancel();
            if let Some(active) = state.active.take() {
                active.cancel.cancel();
            }
        }
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

/// The file of a finished episode, if it is still on disk
fn finished_file(state: &SharedState, id: &EpisodeId) -> Option<PathBuf> {
    let status = state.statuses.get(id)?;
    if status.state != DownloadState::Done {
        return None;
    }
    status.local_path.clone().filter(|path| path.is_file())
}

fn done_entries(statuses: &HashMap<EpisodeId, DownloadStatus>) -> Vec<IndexEntry> {
    let mut entries: Vec<_> = statuses
        .iter()
        .filter(|(_, status)| status.state == DownloadState::Done)
        .filter_map(|(id, status)| {
            status.local_path.clone().map(|local_path| IndexEntry {
                episode_id: id.clone(),
                local_path,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.episode_id.cmp(&b.episode_id));
    entries
}

impl Inner {
    /// Apply `event` to `id` and broadcast the result if it changed
    fn apply(&self, id: &EpisodeId, event: StatusEvent) {
        let mut state = self.state.lock();
        self.apply_locked(&mut state, id, event);
    }

    fn apply_locked(&self, state: &mut SharedState, id: &EpisodeId, event: StatusEvent) {
        let current = state.statuses.entry(id.clone()).or_default();
        let next = transition(current, event, Utc::now());
        *current = next.status.clone();
        if next.notify {
            debug!("Episode {} is now {}", id, next.status.state);
            let _ = self.event_tx.send(CoreEvent::StatusChanged {
                id: id.clone(),
                status: next.status,
            });
        }
    }

    /// Queue `id` unless there is nothing to do for it. Returns whether the
    /// queue changed.
    fn admit(&self, id: &EpisodeId, front: bool) -> bool {
        let mut state = self.state.lock();
        if let Some(path) = finished_file(&state, id) {
            debug!("Episode {} already downloaded at {:?}", id, path);
            return false;
        }

        let transferring = state
            .active
            .as_ref()
            .filter(|job| &job.id == id)
            .map(|job| !job.cancel.is_cancelled());
        match transferring {
            Some(true) => {
                debug!("Episode {} is already downloading", id);
                return false;
            }
            // Still winding down after a cancel; `finish_job` marks it queued
            Some(false) => {}
            None => self.apply_locked(&mut state, id, StatusEvent::Enqueued),
        }

        if front {
            state.queue.force_front(id.clone());
            info!("Moved episode {} to the front of the queue", id);
        } else if state.queue.push_back(id.clone()) {
            info!("Queued episode {}", id);
        }
        true
    }

    /// Pop the next job and register it as active, atomically
    fn next_job(&self, shutdown: &CancellationToken) -> Option<(EpisodeId, CancellationToken)> {
        let mut state = self.state.lock();
        let id = state.queue.pop_front()?;
        let cancel = shutdown.child_token();
        state.active = Some(ActiveJob {
            id: id.clone(),
            cancel: cancel.clone(),
        });
        Some((id, cancel))
    }

    /// Release the active slot. A job that was queued again while its
    /// canceled transfer wound down becomes `Queued`, unless it finished.
    fn finish_job(&self, id: &EpisodeId) {
        let mut state = self.state.lock();
        if state.active.as_ref().is_some_and(|job| &job.id == id) {
            state.active = None;
        }
        if !state.queue.contains(id) {
            return;
        }
        if finished_file(&state, id).is_some() {
            state.queue.remove(id);
        } else {
            self.apply_locked(&mut state, id, StatusEvent::Enqueued);
        }
    }

    async fn process(&self, id: EpisodeId, cancel: CancellationToken) {
        self.apply(&id, StatusEvent::Started);
        match self.run_job(&id, &cancel).await {
            Ok(()) => {}
            Err(e) if e.is_canceled() => {
                info!("Download of episode {} canceled", id);
                self.apply(&id, StatusEvent::Canceled);
            }
            Err(e) => {
                error!("Download of episode {} failed: {}", id, e);
                self.apply(&id, StatusEvent::Failed { message: failure_message(&e) });
            }
        }
    }

    async fn run_job(&self, id: &EpisodeId, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let episode = self
            .lookup
            .lookup(id)
            .ok_or_else(|| DownloadError::EpisodeNotFound(id.clone()))?;
        let job = self.engine.prepare(&self.download_root, &episode)?;
        info!("Downloading episode {} from {} to {:?}", id, job.url, job.destination);

        let observer = |event: TransferEvent| self.apply(id, status_event(event));
        let outcome = self
            .engine
            .download(&job, &self.policy, cancel, &observer)
            .await?;

        self.apply(
            id,
            StatusEvent::Completed {
                path: outcome.path,
                bytes: outcome.bytes,
                total: outcome.total,
            },
        );
        self.index.schedule();
        Ok(())
    }
}

fn status_event(event: TransferEvent) -> StatusEvent {
    match event {
        TransferEvent::AttemptStarted { offset, total } => {
            StatusEvent::AttemptStarted { offset, total }
        }
        TransferEvent::Progress { received, total } => StatusEvent::Progress { received, total },
        TransferEvent::Verifying => StatusEvent::Verifying,
    }
}

/// The message a `Failed` status shows: the last attempt's cause
fn failure_message(error: &DownloadError) -> String {
    match error {
        DownloadError::RetriesExhausted { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

async fn run_worker(inner: Arc<Inner>, shutdown: CancellationToken) {
    info!("Download worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let Some((id, cancel)) = inner.next_job(&shutdown) else {
            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(IDLE_WAKE_INTERVAL) => {}
            }
            continue;
        };

        inner.process(id.clone(), cancel).await;
        inner.finish_job(&id);
    }
    info!("Download worker stopped");
}
