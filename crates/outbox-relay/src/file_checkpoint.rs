//! Checkpoint store backed by a JSON file.

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use outbox_runner::{BoxError, CheckpointStore, CheckpointToken};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Persists the checkpoint token as JSON in a single file.
///
/// A missing or empty file means "no checkpoint". Writes replace the file
/// atomically, so a crash leaves either the old or the new token on disk.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> RelayResult<Option<CheckpointToken>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn write(&self, token: &CheckpointToken) -> RelayResult<()> {
        let content = serde_json::to_string(token)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || atomic_write_text(&path, &content))
            .await
            .map_err(|e| RelayError::Io(io::Error::new(io::ErrorKind::Other, e)))??;

        debug!(path = %self.path.display(), token = %token, "Checkpoint persisted");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self) -> Result<Option<CheckpointToken>, BoxError> {
        Ok(self.read().await?)
    }

    async fn set(&self, token: &CheckpointToken) -> Result<(), BoxError> {
        Ok(self.write(token).await?)
    }
}

/// Write via a sibling temp file, fsync, rename, then fsync the directory.
fn atomic_write_text(path: &Path, content: &str) -> RelayResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RelayError::Config(format!("invalid checkpoint path {}", path.display())))?;

    fs::create_dir_all(dir)?;

    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        file_name,
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));

    let write_result = (|| -> Result<(), io::Error> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp_path, path)?;

        if let Ok(parent_dir) = fs::File::open(dir) {
            let _ = parent_dir.sync_all();
        }

        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }

    Ok(())
}
