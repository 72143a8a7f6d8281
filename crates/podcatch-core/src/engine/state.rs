//! Download state machine
//!
//! ```text
//! None → Queued → Running → Verifying → Done
//!                    │            │
//!                    ├──────→ Failed
//!                    └──────→ Canceled
//! ```
//!
//! Every status change goes through [`transition`], which the manager
//! applies while holding the state lock.

use chrono::{DateTime, Utc};
use podcatch_types::{DownloadState, DownloadStatus};
use std::path::PathBuf;

/// Something that happened to a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Added to (or moved within) the pending queue
    Enqueued,
    /// Picked up by the worker
    Started,
    /// Response headers received for an attempt
    AttemptStarted { offset: u64, total: Option<u64> },
    Progress { received: u64, total: Option<u64> },
    Verifying,
    /// Transfer verified and published
    Completed {
        path: PathBuf,
        bytes: u64,
        total: Option<u64>,
    },
    /// Known finished file, from the index
    Restored { path: PathBuf, bytes: u64 },
    Failed { message: String },
    Canceled,
}

/// Result of applying a [`StatusEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: DownloadStatus,
    /// Whether observers should hear about it
    pub notify: bool,
}

impl Transition {
    fn unchanged(current: &DownloadStatus) -> Self {
        Self {
            status: current.clone(),
            notify: false,
        }
    }

    fn changed(status: DownloadStatus) -> Self {
        Self {
            status,
            notify: true,
        }
    }
}

/// Compute the status that follows `current` after `event`.
///
/// Events that are not legal in the current state leave it untouched and
/// do not notify.
pub fn transition(current: &DownloadStatus, event: StatusEvent, now: DateTime<Utc>) -> Transition {
    use DownloadState as S;

    let mut next = current.clone();
    next.updated_at = now;

    match (current.state, event) {
        (S::Queued, StatusEvent::Enqueued) => Transition::unchanged(current),
        // Reached for a finished episode only when its file is gone
        (S::None | S::Done | S::Failed | S::Canceled, StatusEvent::Enqueued) => {
            next.state = S::Queued;
            next.bytes_received = 0;
            next.total_bytes = None;
            next.error = None;
            next.local_path = None;
            Transition::changed(next)
        }

        (S::Queued, StatusEvent::Started) => {
            next.state = S::Running;
            next.bytes_received = 0;
            next.total_bytes = None;
            next.local_path = None;
            Transition::changed(next)
        }

        // A new attempt may restart from a smaller offset
        (S::Running, StatusEvent::AttemptStarted { offset, total }) => {
            next.bytes_received = offset;
            next.total_bytes = total;
            Transition::changed(next)
        }

        (S::Running, StatusEvent::Progress { received, total }) => {
            if received < current.bytes_received {
                return Transition::unchanged(current);
            }
            if received == current.bytes_received && total == current.total_bytes {
                return Transition::unchanged(current);
            }
            next.bytes_received = received;
            next.total_bytes = total.or(current.total_bytes);
            Transition::changed(next)
        }

        (S::Running, StatusEvent::Verifying) => {
            next.state = S::Verifying;
            Transition::changed(next)
        }

        (S::Running | S::Verifying, StatusEvent::Completed { path, bytes, total }) => {
            next.state = S::Done;
            next.bytes_received = bytes;
            next.total_bytes = Some(total.unwrap_or(bytes));
            next.local_path = Some(path);
            next.error = None;
            Transition::changed(next)
        }

        (S::None, StatusEvent::Restored { path, bytes }) => {
            next.state = S::Done;
            next.bytes_received = bytes;
            next.total_bytes = Some(bytes);
            next.local_path = Some(path);
            next.error = None;
            Transition::changed(next)
        }

        (S::Queued | S::Running | S::Verifying, StatusEvent::Failed { message }) => {
            next.state = S::Failed;
            next.error = Some(message);
            next.local_path = None;
            Transition::changed(next)
        }

        (S::Queued | S::Running | S::Verifying, StatusEvent::Canceled) => {
            next.state = S::Canceled;
            next.error = None;
            next.local_path = None;
            Transition::changed(next)
        }

        _ => Transition::unchanged(current),
    }
}
