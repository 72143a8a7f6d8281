//! CLI command implementations

use crate::output::{format_bytes, format_transfer, print_output};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Context, Result};
use console::style;
use podcatch_core::PodcatchCore;
use podcatch_types::{CoreEvent, DownloadState, DownloadStatus, EpisodeId, EpisodeInfo, Settings};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// Download Commands
// ============================================================================

pub async fn fetch(
    core: &PodcatchCore,
    url: String,
    feed: String,
    title: String,
    id: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let episode = EpisodeInfo {
        id: EpisodeId::new(id.unwrap_or_else(|| url.clone())),
        url,
        feed_title: feed,
        episode_title: title,
    };
    download_all(core, vec![episode], format).await
}

pub async fn batch(core: &PodcatchCore, file: PathBuf, format: OutputFormat) -> Result<()> {
    let content = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let episodes: Vec<EpisodeInfo> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a list of episodes", file.display()))?;

    if episodes.is_empty() {
        println!("{}", style("Nothing to download").dim());
        return Ok(());
    }
    download_all(core, episodes, format).await
}

#[derive(Serialize)]
struct EpisodeResult {
    id: EpisodeId,
    #[serde(flatten)]
    status: DownloadStatus,
}

/// Queue `episodes` in order and follow them until every one has settled.
/// Ctrl-C cancels whatever is still pending.
async fn download_all(
    core: &PodcatchCore,
    episodes: Vec<EpisodeInfo>,
    format: OutputFormat,
) -> Result<()> {
    let mut events = core.downloads.subscribe();
    let mut progress = DownloadProgress::new();
    let ids: Vec<EpisodeId> = episodes.iter().map(|e| e.id.clone()).collect();

    for episode in episodes {
        if matches!(format, OutputFormat::Human) {
            progress.add_episode(&episode);
        }
        core.add_episode(episode);
    }

    let mut interrupted = false;
    while !is_settled(core, &ids) {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => progress.handle_event(&event),
                Err(RecvError::Lagged(_)) => {
                    for id in &ids {
                        if let Some(status) = core.downloads.status(id) {
                            progress.handle_event(&CoreEvent::StatusChanged { id: id.clone(), status });
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                for id in &ids {
                    core.downloads.cancel(id);
                }
            }
        }
    }
    progress.clear();
    core.downloads.flush_index().await;

    let results: Vec<EpisodeResult> = ids
        .iter()
        .map(|id| EpisodeResult {
            id: id.clone(),
            status: core.downloads.status(id).unwrap_or_default(),
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        OutputFormat::Human => {
            for result in &results {
                print_result(result);
            }
        }
    }

    let failed = results
        .iter()
        .filter(|r| r.status.state != DownloadState::Done)
        .count();
    if failed > 0 {
        return Err(anyhow!("{} of {} episode(s) not downloaded", failed, results.len()));
    }
    Ok(())
}

fn is_settled(core: &PodcatchCore, ids: &[EpisodeId]) -> bool {
    ids.iter().all(|id| core.downloads.state(id).is_terminal())
}

fn print_result(result: &EpisodeResult) {
    let status = &result.status;
    match status.state {
        DownloadState::Done => {
            println!(
                "{} {} ({})",
                style("✓").green().bold(),
                status
                    .local_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                format_transfer(status)
            );
        }
        DownloadState::Failed => {
            println!(
                "{} {}: {}",
                style("✗").red().bold(),
                style(&result.id).bold(),
                style(status.error.as_deref().unwrap_or("Unknown error")).red()
            );
        }
        other => {
            println!(
                "{} {} [{}] {}",
                style("○").dim(),
                result.id,
                style(other).dim(),
                format_transfer(status)
            );
        }
    }
}

// ============================================================================
// Library Commands
// ============================================================================

pub async fn list(core: &PodcatchCore, format: OutputFormat) -> Result<()> {
    let entries = core.library();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Human => {
            if entries.is_empty() {
                println!("{}", style("No downloaded episodes").dim());
                return Ok(());
            }

            for entry in &entries {
                let size = tokio::fs::metadata(&entry.local_path)
                    .await
                    .map(|m| format_bytes(m.len()))
                    .unwrap_or_else(|_| "?".to_string());
                println!(
                    "{} {} {}",
                    style("✓").green(),
                    style(&entry.episode_id).bold(),
                    style(format!("({})", size)).dim()
                );
                println!("    {}", entry.local_path.display());
            }
            println!();
            println!("{} episode(s) downloaded", style(entries.len()).bold());
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Serialize)]
struct SettingsView<'a> {
    config_dir: PathBuf,
    download_root: PathBuf,
    #[serde(flatten)]
    settings: &'a Settings,
}

impl fmt::Display for SettingsView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.settings;
        writeln!(f, "{}", style("Settings").bold().underlined())?;
        writeln!(f, "  Config directory:   {}", self.config_dir.display())?;
        writeln!(f, "  Download directory: {}", self.download_root.display())?;
        writeln!(f, "  Max retries:        {}", s.max_retries)?;
        writeln!(
            f,
            "  Retry delay:        {}ms to {}ms (jitter {})",
            s.retry_base_delay_ms, s.retry_max_delay_ms, s.retry_jitter
        )?;
        writeln!(f, "  Max Retry-After:    {}ms", s.max_retry_after_ms)?;
        writeln!(
            f,
            "  Timeouts:           connect {}s, headers {}s, read {}s",
            s.connect_timeout_secs, s.header_timeout_secs, s.read_timeout_secs
        )?;
        writeln!(
            f,
            "  Size tolerance:     {}",
            format_bytes(s.size_tolerance_bytes)
        )?;
        writeln!(f, "  Fallback extension: .{}", s.fallback_extension)?;
        write!(f, "  User agent:         {}", s.user_agent)
    }
}

#[derive(Serialize)]
struct PathView {
    path: PathBuf,
}

impl fmt::Display for PathView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

pub async fn config_action(
    core: &PodcatchCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let view = SettingsView {
                config_dir: core.storage.config_dir().to_path_buf(),
                download_root: core.settings.download_root(),
                settings: &core.settings,
            };
            print_output(&view, format)?;
        }

        ConfigAction::Path => {
            let view = PathView {
                path: core.storage.config_dir().to_path_buf(),
            };
            print_output(&view, format)?;
        }

        ConfigAction::SetDir { dir } => {
            let dir = if dir.is_absolute() {
                dir
            } else {
                std::env::current_dir()?.join(dir)
            };
            let settings = Settings {
                download_dir: Some(dir.clone()),
                ..core.settings.clone()
            };
            core.storage.save_settings(&settings).await?;

            match format {
                OutputFormat::Json => print_output(&PathView { path: dir }, format)?,
                OutputFormat::Human => println!(
                    "{} Downloads will be saved to {}",
                    style("✓").green().bold(),
                    style(dir.display()).cyan()
                ),
            }
        }
    }

    Ok(())
}
