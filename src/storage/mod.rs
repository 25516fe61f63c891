//! Archive store abstraction: where finished MP4 segments end up.
//!
//! Two backends: the local filesystem (segments are already in place) and an
//! S3-compatible object store (segments are uploaded, then the local scratch
//! file is removed). The backend is chosen at configuration time and stored
//! in each stream's archive spec.

pub mod filesystem;
pub mod minio;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

pub use filesystem::FilesystemStorage;
pub use minio::{MinioSettings, MinioStorage};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Filesystem,
    Minio,
}

impl StorageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" => Some(StorageKind::Filesystem),
            "minio" => Some(StorageKind::Minio),
            _ => None,
        }
    }
}

/// One finished segment handed to the store.
#[derive(Debug, Clone)]
pub struct ArchiveUnit {
    pub bucket: String,
    /// Key prefix inside the bucket (object-store backend only).
    pub key_prefix: String,
    pub segment_name: String,
    /// Local file holding the segment bytes.
    pub source: PathBuf,
}

#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Idempotent container creation/verification. Existing containers are
    /// not errors.
    async fn ensure_container(&self, name: &str) -> Result<(), StorageError>;

    /// Store one segment; returns the stored key (segment name).
    async fn put_segment(&self, unit: ArchiveUnit) -> Result<String, StorageError>;

    /// Delete stored segments older than the cutoff; returns how many were
    /// removed. Backends without retention management report zero.
    async fn retention_sweep(&self, _older_than: Duration) -> Result<usize, StorageError> {
        Ok(0)
    }
}
