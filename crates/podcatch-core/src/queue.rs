//! Pending download queue

use podcatch_types::EpisodeId;
use std::collections::VecDeque;

/// FIFO of episodes waiting for the worker.
///
/// An id is present at most once.
#[derive(Debug, Default, Clone)]
pub struct DownloadQueue {
    items: VecDeque<EpisodeId>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` unless it is already waiting. Returns whether it was added.
    pub fn push_back(&mut self, id: EpisodeId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.items.push_back(id);
        true
    }

    /// Move `id` to the head, inserting it if absent
    pub fn force_front(&mut self, id: EpisodeId) {
        self.remove(&id);
        self.items.push_front(id);
    }

    /// Remove `id` if it is still waiting. Returns whether it was present.
    pub fn remove(&mut self, id: &EpisodeId) -> bool {
        match self.items.iter().position(|item| item == id) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn pop_front(&mut self) -> Option<EpisodeId> {
        self.items.pop_front()
    }

    pub fn contains(&self, id: &EpisodeId) -> bool {
        self.items.iter().any(|item| item == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Waiting ids in processing order
    pub fn to_vec(&self) -> Vec<EpisodeId> {
        self.items.iter().cloned().collect()
    }
}
