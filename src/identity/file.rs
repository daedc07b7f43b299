//! File-backed key-value store
//!
//! Each record is a text file named after the percent-encoded key, so keys
//! containing `/`, `:` or `@` (proxy URIs) map to distinct, flat file names.
//! Writes go through a temporary file and are published atomically.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use super::store::KeyValueStore;
use crate::types::{Result, TetherError};

/// Backend storing one file per record under a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir` for records. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", urlencoding::encode(key)))
    }

    /// Write `value` to a fresh temporary file in the store directory
    async fn write_temp(&self, value: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| persistence(&self.dir, e))?;

        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| persistence(&tmp, e))?;
        Ok(tmp)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.record_path(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let value = contents.trim();
                if value.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(value.to_string()))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence(&path, e)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.record_path(key);
        let tmp = self.write_temp(value).await?;

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_temp(&tmp).await;
            return Err(persistence(&path, e));
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String> {
        let path = self.record_path(key);
        let tmp = self.write_temp(value).await?;

        // hard_link fails if the target exists, which makes creation atomic
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        remove_temp(&tmp).await;

        match linked {
            Ok(()) => Ok(value.to_string()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.get(key).await?.ok_or_else(|| {
                    TetherError::Persistence(format!("{}: record is empty", path.display()))
                })
            }
            Err(e) => Err(persistence(&path, e)),
        }
    }
}

async fn remove_temp(tmp: &Path) {
    if let Err(e) = tokio::fs::remove_file(tmp).await {
        warn!("Failed to remove temporary file {}: {}", tmp.display(), e);
    }
}

fn persistence(path: &Path, e: std::io::Error) -> TetherError {
    TetherError::Persistence(format!("{}: {}", path.display(), e))
}
