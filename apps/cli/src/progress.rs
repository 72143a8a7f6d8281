//! Progress bar utilities for CLI downloads

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use podcatch_types::{CoreEvent, DownloadState, EpisodeId, EpisodeInfo};
use std::collections::HashMap;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Manages progress bars for the episodes of one command
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<EpisodeId, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for an episode
    pub fn add_episode(&mut self, episode: &EpisodeInfo) {
        let pb = self.multi.add(ProgressBar::new(0));
        if let Ok(bar_style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        pb.set_message(episode.episode_title.clone());
        self.bars.insert(episode.id.clone(), pb);
    }

    /// Update a progress bar from an event
    pub fn handle_event(&mut self, event: &CoreEvent) {
        let CoreEvent::StatusChanged { id, status } = event;
        let Some(pb) = self.bars.get(id) else {
            return;
        };

        if let Some(total) = status.total_bytes {
            pb.set_length(total);
        }
        pb.set_position(status.bytes_received);

        match status.state {
            DownloadState::Done => {
                pb.finish_with_message(format!("{} Downloaded", style("✓").green().bold()));
            }
            DownloadState::Failed => {
                pb.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    status.error.as_deref().unwrap_or("Unknown error")
                ));
            }
            DownloadState::Canceled => {
                pb.abandon_with_message(format!("{} Canceled", style("○").dim()));
            }
            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
