//! Episode metadata lookup

use parking_lot::RwLock;
use podcatch_types::{EpisodeId, EpisodeInfo};
use std::collections::HashMap;

/// Read access to the episode repository
pub trait EpisodeLookup: Send + Sync {
    fn lookup(&self, id: &EpisodeId) -> Option<EpisodeInfo>;
}

/// In-memory episode repository
#[derive(Debug, Default)]
pub struct EpisodeCatalog {
    episodes: RwLock<HashMap<EpisodeId, EpisodeInfo>>,
}

impl EpisodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, episode: EpisodeInfo) {
        self.episodes.write().insert(episode.id.clone(), episode);
    }
}

impl FromIterator<EpisodeInfo> for EpisodeCatalog {
    fn from_iter<I: IntoIterator<Item = EpisodeInfo>>(iter: I) -> Self {
        let catalog = Self::new();
        for episode in iter {
            catalog.insert(episode);
        }
        catalog
    }
}

impl EpisodeLookup for EpisodeCatalog {
    fn lookup(&self, id: &EpisodeId) -> Option<EpisodeInfo> {
        self.episodes.read().get(id).cloned()
    }
}
