//! Filesystem archive backend: segments are written in place by the
//! archiver, so storing is a no-op beyond directory management.

use async_trait::async_trait;
use tokio::fs;

use super::{ArchiveStorage, ArchiveUnit, StorageError, StorageKind};

#[derive(Debug, Default)]
pub struct FilesystemStorage;

impl FilesystemStorage {
    pub fn new() -> Self {
        Self
    }
}

fn map_io(err: std::io::Error, what: &str) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(what.to_string()),
        _ => StorageError::BackendUnavailable(format!("{what}: {err}")),
    }
}

#[async_trait]
impl ArchiveStorage for FilesystemStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Filesystem
    }

    async fn ensure_container(&self, name: &str) -> Result<(), StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidKey("empty container name".into()));
        }
        fs::create_dir_all(name).await.map_err(|e| map_io(e, name))
    }

    async fn put_segment(&self, unit: ArchiveUnit) -> Result<String, StorageError> {
        // The archiver already wrote the file into its destination directory.
        if !fs::try_exists(&unit.source).await.unwrap_or(false) {
            return Err(StorageError::InvalidKey(format!(
                "segment file missing: {}",
                unit.source.display()
            )));
        }
        Ok(unit.segment_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn ensure_container_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("archive").to_string_lossy().into_owned();
        let storage = FilesystemStorage::new();
        storage.ensure_container(&target).await.unwrap();
        storage.ensure_container(&target).await.unwrap();
        assert!(std::path::Path::new(&target).is_dir());
    }

    #[tokio::test]
    async fn put_segment_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.mp4");
        tokio::fs::write(&path, b"data").await.unwrap();
        let storage = FilesystemStorage::new();

        let stored = storage
            .put_segment(ArchiveUnit {
                bucket: dir.path().to_string_lossy().into_owned(),
                key_prefix: String::new(),
                segment_name: "seg.mp4".into(),
                source: path.clone(),
            })
            .await
            .unwrap();
        assert_eq!(stored, "seg.mp4");
        // Filesystem backend leaves the file in place.
        assert!(path.exists());

        let missing = storage
            .put_segment(ArchiveUnit {
                bucket: String::new(),
                key_prefix: String::new(),
                segment_name: "gone.mp4".into(),
                source: PathBuf::from("/nonexistent/gone.mp4"),
            })
            .await;
        assert!(missing.is_err());
    }
}
