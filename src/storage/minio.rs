//! S3-compatible archive backend (MinIO and friends) over OpenDAL.
//!
//! Segments are uploaded under `{key_prefix}/{segment_name}`; the local
//! scratch file is removed after a successful upload. The bucket itself is
//! deployment-provisioned; `ensure_container` verifies reachability and a
//! periodic retention sweep replaces a bucket lifecycle rule.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use opendal::{services::S3, Operator};
use tokio::fs;

use super::{ArchiveStorage, ArchiveUnit, StorageError, StorageKind};

#[derive(Debug, Clone)]
pub struct MinioSettings {
    pub host: String,
    pub port: i32,
    pub user: String,
    pub password: String,
    pub default_bucket: String,
    pub default_path: String,
}

pub struct MinioStorage {
    operator: Operator,
    bucket: String,
}

impl MinioStorage {
    pub fn new(settings: &MinioSettings) -> Result<Self, StorageError> {
        let endpoint = format!("http://{}:{}", settings.host, settings.port);
        let builder = S3::default()
            .endpoint(&endpoint)
            .access_key_id(&settings.user)
            .secret_access_key(&settings.password)
            .region("us-east-1")
            .bucket(&settings.default_bucket);
        let operator = Operator::new(builder)
            .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?
            .finish();
        Ok(Self {
            operator,
            bucket: settings.default_bucket.clone(),
        })
    }

    fn object_key(prefix: &str, name: &str) -> Result<String, StorageError> {
        if name.is_empty() || name.contains("..") || name.contains('/') {
            return Err(StorageError::InvalidKey(name.to_string()));
        }
        if prefix.is_empty() {
            Ok(name.to_string())
        } else {
            Ok(format!("{}/{}", prefix.trim_end_matches('/'), name))
        }
    }
}

fn map_opendal(err: &opendal::Error) -> StorageError {
    match err.kind() {
        opendal::ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
        opendal::ErrorKind::NotFound => StorageError::InvalidKey(err.to_string()),
        _ => StorageError::BackendUnavailable(err.to_string()),
    }
}

#[async_trait]
impl ArchiveStorage for MinioStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Minio
    }

    async fn ensure_container(&self, name: &str) -> Result<(), StorageError> {
        if name != self.bucket {
            return Err(StorageError::InvalidKey(format!(
                "operator is scoped to bucket '{}', got '{name}'",
                self.bucket
            )));
        }
        self.operator.check().await.map_err(|e| map_opendal(&e))
    }

    async fn put_segment(&self, unit: ArchiveUnit) -> Result<String, StorageError> {
        let key = Self::object_key(&unit.key_prefix, &unit.segment_name)?;
        let payload = fs::read(&unit.source)
            .await
            .map_err(|e| StorageError::InvalidKey(format!("{}: {e}", unit.source.display())))?;
        let size = payload.len();
        self.operator
            .write(&key, payload)
            .await
            .map_err(|e| map_opendal(&e))?;
        tracing::debug!(key = %key, size, "segment uploaded");
        if let Err(e) = fs::remove_file(&unit.source).await {
            tracing::warn!(path = %unit.source.display(), error = %e, "can't remove uploaded scratch file");
        }
        Ok(unit.segment_name)
    }

    async fn retention_sweep(&self, older_than: Duration) -> Result<usize, StorageError> {
        let chrono_cutoff = ChronoDuration::from_std(older_than)
            .map_err(|e| StorageError::InvalidKey(format!("bad retention duration: {e}")))?;
        let cutoff = Utc::now() - chrono_cutoff;
        let mut deleted = 0;

        let mut entries = self
            .operator
            .lister("")
            .await
            .map_err(|e| map_opendal(&e))?;
        while let Some(entry) = entries.try_next().await.map_err(|e| map_opendal(&e))? {
            let path = entry.path().to_string();
            match self.operator.stat(&path).await {
                Ok(metadata) => {
                    if let Some(modified) = metadata.last_modified() {
                        if modified < cutoff && self.operator.delete(&path).await.is_ok() {
                            deleted += 1;
                            tracing::debug!(path = %path, "expired archive object removed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "can't stat archive object");
                }
            }
        }
        Ok(deleted)
    }
}
