//! Atomic publish - move a finished temp file onto its final name

use std::io;
use std::path::Path;
use tracing::warn;

/// Replace `to` with `from` in one step where the platform allows it
#[cfg(not(windows))]
pub async fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    tokio::fs::rename(from, to).await
}

/// Replace `to` with `from` in one step where the platform allows it.
///
/// `rename` maps to `MoveFileExW(MOVEFILE_REPLACE_EXISTING)`; when that is
/// refused (e.g. on some network shares) the target is deleted first.
#[cfg(windows)]
pub async fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if tokio::fs::metadata(to).await.is_ok() => {
            warn!("Atomic replace of {:?} failed ({}), deleting target first", to, e);
            tokio::fs::remove_file(to).await?;
            tokio::fs::rename(from, to).await
        }
        Err(e) => Err(e),
    }
}

/// Publish `temp` as `dest`. On failure the temp file is deleted.
pub async fn publish(temp: &Path, dest: &Path) -> io::Result<()> {
    let result = replace_file(temp, dest).await;
    if let Err(e) = &result {
        warn!("Publishing {:?} to {:?} failed: {}", temp, dest, e);
        if let Err(cleanup) = tokio::fs::remove_file(temp).await {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {:?}: {}", temp, cleanup);
            }
        }
    }
    result
}

/// Delete `path`, treating an absent file as success
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("ep.mp3.part");
        let dest = dir.path().join("ep.mp3");
        tokio::fs::write(&temp, b"new").await.unwrap();
        tokio::fs::write(&dest, b"old").await.unwrap();

        publish(&temp, &dest).await.unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"new");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_failed_publish_removes_temp() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("ep.mp3.part");
        let dest = dir.path().join("occupied");
        tokio::fs::write(&temp, b"data").await.unwrap();
        tokio::fs::create_dir(&dest).await.unwrap();
        tokio::fs::write(dest.join("child"), b"x").await.unwrap();

        assert!(publish(&temp, &dest).await.is_err());
        assert!(!temp.exists());
        assert!(dest.is_dir());
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        remove_if_exists(&path).await.unwrap();
        tokio::fs::write(&path, b"x").await.unwrap();
        remove_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }
}
