//! Application assembly: configuration into registry records, archive
//! specs, supervisor and HTTP routers.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::run_retention_sweep;
use crate::config::Configuration;
use crate::error::Result;
use crate::hls::HlsSettings;
use crate::media::{parse_output_type, StreamType, VerboseLevel};
use crate::registry::{ArchiveSpec, StreamRegistry};
use crate::server;
use crate::source::{SourceDialer, Supervisor};
use crate::storage::{ArchiveStorage, FilesystemStorage, MinioSettings, MinioStorage, StorageKind};

pub struct Application {
    pub config: Configuration,
    pub registry: Arc<StreamRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub cancel: CancellationToken,
    minio_storages: Vec<Arc<dyn ArchiveStorage>>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Application {
    pub fn new(config: Configuration, dialer: Arc<dyn SourceDialer>) -> Result<Self> {
        let registry = Arc::new(StreamRegistry::new());
        let mut minio_storages: Vec<Arc<dyn ArchiveStorage>> = Vec::new();
        let mut seen_buckets: Vec<String> = Vec::new();

        for stream in &config.rtsp_streams {
            let id = match Uuid::parse_str(&stream.guid) {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(guid = %stream.guid, "not a valid UUID, stream skipped");
                    continue;
                }
            };
            let mut outputs: Vec<StreamType> = Vec::with_capacity(stream.output_types.len());
            for name in &stream.output_types {
                outputs.push(parse_output_type(name)?);
            }
            registry.insert(
                id,
                stream.url.clone(),
                outputs,
                VerboseLevel::parse(&stream.verbose),
            );

            if config.archive.enabled && stream.archive.enabled {
                let kind = StorageKind::parse(&stream.archive.storage_type)
                    .unwrap_or(StorageKind::Filesystem);
                let spec = match kind {
                    StorageKind::Filesystem => ArchiveSpec {
                        storage: Arc::new(FilesystemStorage::new()),
                        directory: PathBuf::from(&stream.archive.directory),
                        bucket: stream.archive.directory.clone(),
                        bucket_path: String::new(),
                        ms_per_segment: stream.archive.ms_per_file,
                    },
                    StorageKind::Minio => {
                        let settings = MinioSettings {
                            host: config.archive.minio.host.clone(),
                            port: config.archive.minio.port,
                            user: config.archive.minio.user.clone(),
                            password: config.archive.minio.password.clone(),
                            default_bucket: stream.archive.minio_bucket.clone(),
                            default_path: stream.archive.minio_path.clone(),
                        };
                        let storage: Arc<dyn ArchiveStorage> =
                            Arc::new(MinioStorage::new(&settings)?);
                        if !seen_buckets.contains(&stream.archive.minio_bucket) {
                            seen_buckets.push(stream.archive.minio_bucket.clone());
                            minio_storages.push(Arc::clone(&storage));
                        }
                        ArchiveSpec {
                            storage,
                            directory: PathBuf::from(&stream.archive.directory),
                            bucket: stream.archive.minio_bucket.clone(),
                            bucket_path: stream.archive.minio_path.clone(),
                            ms_per_segment: stream.archive.ms_per_file,
                        }
                    }
                };
                registry.set_archive(id, Some(spec))?;
            }
        }

        let cancel = CancellationToken::new();
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            dialer,
            HlsSettings {
                directory: PathBuf::from(&config.hls.directory),
                ms_per_segment: config.hls.ms_per_segment,
                window_size: config.hls.window_size,
                capacity: config.hls.capacity,
            },
            cancel.clone(),
        );

        Ok(Self {
            config,
            registry,
            supervisor,
            cancel,
            minio_storages,
        })
    }

    /// Spawn every stream's source task plus the object-store retention
    /// sweeps.
    pub fn start_streams(&self) {
        Arc::clone(&self.supervisor).start_all();
        for storage in &self.minio_storages {
            tokio::spawn(run_retention_sweep(
                Arc::clone(storage),
                self.cancel.clone(),
            ));
        }
    }

    pub fn video_router(&self) -> axum::Router {
        let router = server::video::router(server::video::VideoState {
            registry: Arc::clone(&self.registry),
            hls_directory: PathBuf::from(&self.config.hls.directory),
        });
        if self.config.cors.enabled {
            router.layer(server::cors_layer(&self.config.cors))
        } else {
            router
        }
    }

    pub fn api_router(&self) -> axum::Router {
        let router = server::api::router(server::api::ApiState {
            registry: Arc::clone(&self.registry),
            supervisor: Arc::clone(&self.supervisor),
        });
        if self.config.cors.enabled {
            router.layer(server::cors_layer(&self.config.cors))
        } else {
            router
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{postprocess, StreamArchiveConfiguration, StreamConfiguration};
    use crate::error::Error;
    use crate::source::{DialOptions, SourceSession};
    use async_trait::async_trait;

    struct NullDialer;

    #[async_trait]
    impl SourceDialer for NullDialer {
        async fn dial(&self, opts: DialOptions) -> Result<SourceSession> {
            Err(Error::SessionDialFailed(opts.url))
        }
    }

    fn stream(guid: &str, outputs: &[&str]) -> StreamConfiguration {
        StreamConfiguration {
            guid: guid.to_string(),
            url: "rtsp://camera/main".to_string(),
            stream_type: "rtsp".to_string(),
            output_types: outputs.iter().map(|s| s.to_string()).collect(),
            verbose: String::new(),
            archive: StreamArchiveConfiguration::default(),
        }
    }

    #[test]
    fn bad_guids_are_skipped_and_good_ones_registered() {
        let mut cfg = Configuration::default();
        cfg.rtsp_streams = vec![
            stream("not-a-uuid", &["hls"]),
            stream("22222222-2222-4222-8222-222222222222", &["hls", "mse"]),
        ];
        let app = Application::new(postprocess(cfg), Arc::new(NullDialer)).unwrap();
        assert_eq!(app.registry.all_ids().len(), 1);
    }

    #[test]
    fn unknown_output_type_is_an_error() {
        let mut cfg = Configuration::default();
        cfg.rtsp_streams = vec![stream("22222222-2222-4222-8222-222222222222", &["dash"])];
        let err = Application::new(postprocess(cfg), Arc::new(NullDialer)).unwrap_err();
        assert!(matches!(err, Error::InvalidStreamType(_)));
    }

    #[test]
    fn filesystem_archive_spec_is_attached() {
        let mut cfg = Configuration::default();
        cfg.archive.enabled = true;
        let mut s = stream("22222222-2222-4222-8222-222222222222", &["hls"]);
        s.archive = StreamArchiveConfiguration {
            enabled: true,
            ms_per_file: 1_000,
            directory: String::new(),
            storage_type: "filesystem".to_string(),
            minio_bucket: String::new(),
            minio_path: String::new(),
        };
        cfg.rtsp_streams = vec![s];
        let app = Application::new(postprocess(cfg), Arc::new(NullDialer)).unwrap();
        let id = app.registry.all_ids()[0];
        let spec = app.registry.get_archive(id).unwrap().unwrap();
        assert_eq!(spec.ms_per_segment, 1_000);
        assert_eq!(spec.directory, PathBuf::from(crate::config::DEFAULT_ARCHIVE_DIR));
        assert_eq!(spec.storage.kind(), StorageKind::Filesystem);
    }
}
