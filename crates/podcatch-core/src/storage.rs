//! Config directory: settings file and download index location

use crate::error::DownloadError;
use directories::ProjectDirs;
use podcatch_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;

const SETTINGS_FILE: &str = "settings.json";
const INDEX_FILE: &str = "downloads.json";

/// Storage manager for Podcatch configuration
#[derive(Clone, Debug)]
pub struct ConfigStore {
    config_dir: PathBuf,
}

impl ConfigStore {
    /// Open (and create) the config directory at `config_dir`
    pub async fn new(config_dir: PathBuf) -> Result<Self, DownloadError> {
        fs::create_dir_all(&config_dir).await?;
        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    /// Where the persisted download index lives
    pub fn index_path(&self) -> PathBuf {
        self.config_dir.join(INDEX_FILE)
    }

    /// Load settings; a missing file yields the defaults
    pub async fn load_settings(&self) -> Result<Settings, DownloadError> {
        let path = self.settings_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| DownloadError::Config(format!("{}: {}", path.display(), e)))
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), DownloadError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }
}

/// `~/.config/podcatch` or the platform equivalent
pub fn default_config_dir() -> Result<PathBuf, DownloadError> {
    ProjectDirs::from("", "", "podcatch")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| DownloadError::Config("no home directory found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_settings_are_defaults() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("podcatch")).await.unwrap();
        assert!(store.config_dir().is_dir());
        assert_eq!(store.load_settings().await.unwrap(), Settings::default());
        assert_eq!(store.index_path(), dir.path().join("podcatch").join("downloads.json"));
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().to_path_buf()).await.unwrap();
        let settings = Settings {
            download_dir: Some(dir.path().join("media")),
            max_retries: 9,
            ..Settings::default()
        };
        store.save_settings(&settings).await.unwrap();
        assert_eq!(store.load_settings().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_malformed_settings_are_an_error() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().to_path_buf()).await.unwrap();
        fs::write(store.settings_path(), "{ nope").await.unwrap();
        assert!(matches!(
            store.load_settings().await,
            Err(DownloadError::Config(_))
        ));
    }
}
