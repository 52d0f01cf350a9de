//! Filesystem storage root for backup containers.
//!
//! Every path the engine reads or writes is resolved through
//! [`BackupStorage::resolve`], which rejects anything escaping the root.

use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::error::{AppError, Result};
use crate::services::container::CONTAINER_EXTENSION;

/// Storage root for encrypted containers
#[derive(Debug, Clone)]
pub struct BackupStorage {
    base_path: PathBuf,
}

impl BackupStorage {
    /// Create new storage rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Make sure the root exists and is a directory.
    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            AppError::StorageUnavailable(format!(
                "cannot create {}: {}",
                self.base_path.display(),
                e
            ))
        })?;
        let meta = fs::metadata(&self.base_path)
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;
        if !meta.is_dir() {
            return Err(AppError::StorageUnavailable(format!(
                "{} is not a directory",
                self.base_path.display()
            )));
        }
        Ok(())
    }

    /// Resolve a root-relative key to an absolute path inside the root.
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(AppError::FileMissing(format!(
                "'{}' is outside the backup storage root",
                key
            )));
        }
        let path = self.base_path.join(relative);

        // Symlinks may still point out of the root.
        if let (Ok(real), Ok(root)) = (path.canonicalize(), self.base_path.canonicalize()) {
            if !real.starts_with(&root) {
                return Err(AppError::FileMissing(format!(
                    "'{}' resolves outside the backup storage root",
                    key
                )));
            }
        }
        Ok(path)
    }

    /// Root-relative key for a path given either relative or absolute.
    pub fn key_for(&self, path: &Path) -> Result<String> {
        let relative = if path.is_absolute() {
            let root = self
                .base_path
                .canonicalize()
                .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;
            let real = path
                .canonicalize()
                .map_err(|_| AppError::FileMissing(format!("{} does not exist", path.display())))?;
            real.strip_prefix(&root)
                .map_err(|_| {
                    AppError::FileMissing(format!(
                        "{} is outside the backup storage root",
                        path.display()
                    ))
                })?
                .to_path_buf()
        } else {
            path.to_path_buf()
        };
        let key = relative.to_string_lossy().replace('\\', "/");
        self.resolve(&key)?;
        Ok(key)
    }

    /// Resolve `key` and require an existing regular file.
    pub async fn existing_file(&self, key: &str) -> Result<PathBuf> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(AppError::FileMissing(format!("{} not found on disk", key))),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    pub async fn size(&self, key: &str) -> Result<u64> {
        let path = self.existing_file(key).await?;
        Ok(fs::metadata(&path).await?.len())
    }

    /// Delete a container. Missing files are not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::StorageUnavailable(format!(
                "failed to delete {}: {}",
                key, e
            ))),
        }
    }

    /// Keys of every container file directly under the root.
    pub async fn list_containers(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(AppError::StorageUnavailable(e.to_string())),
        };
        let suffix = format!(".{}", CONTAINER_EXTENSION);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(&suffix) && entry.file_type().await?.is_file() {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
