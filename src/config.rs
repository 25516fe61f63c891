//! User-facing configuration: deserialized from a JSON or TOML file (with
//! `STREAMFAN__`-prefixed environment overrides), then post-processed with
//! the defaulting and clamping rules.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HLS_DIR: &str = "./hls";
pub const DEFAULT_HLS_MS_PER_SEGMENT: i64 = 10_000;
pub const DEFAULT_HLS_CAPACITY: usize = 10;
pub const DEFAULT_HLS_WINDOW_SIZE: usize = 5;
pub const DEFAULT_ARCHIVE_MS_PER_FILE: i64 = 30;
pub const DEFAULT_ARCHIVE_DIR: &str = "./mp4";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub api: ApiConfiguration,
    pub video: VideoConfiguration,
    pub hls: HlsConfiguration,
    pub archive: ArchiveConfiguration,
    pub cors: CorsConfiguration,
    pub logging: LoggingConfiguration,
    pub rtsp_streams: Vec<StreamConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfiguration {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub mode: String,
    pub verbose: String,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8888,
            mode: "release".to_string(),
            verbose: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfiguration {
    pub host: String,
    pub port: u16,
    pub mode: String,
    pub verbose: String,
}

impl Default for VideoConfiguration {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            mode: "release".to_string(),
            verbose: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfiguration {
    pub ms_per_segment: i64,
    pub directory: String,
    pub window_size: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfiguration {
    pub enabled: bool,
    pub ms_per_file: i64,
    pub directory: String,
    pub minio: MinioConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinioConfiguration {
    pub host: String,
    pub port: i32,
    pub user: String,
    pub password: String,
    pub default_bucket: String,
    pub default_path: String,
}

impl Default for MinioConfiguration {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            user: String::new(),
            password: String::new(),
            default_bucket: String::new(),
            default_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfiguration {
    pub enabled: bool,
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfiguration {
    pub level: String,
    /// "json" or "pretty".
    pub format: String,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfiguration {
    pub guid: String,
    pub url: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub output_types: Vec<String>,
    pub verbose: String,
    pub archive: StreamArchiveConfiguration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamArchiveConfiguration {
    pub enabled: bool,
    pub ms_per_file: i64,
    pub directory: String,
    #[serde(rename = "type")]
    pub storage_type: String,
    pub minio_bucket: String,
    pub minio_path: String,
}

/// Load a configuration file and apply the defaulting rules.
pub fn load(path: &str) -> Result<Configuration, ConfigError> {
    let raw = ConfigBuilder::builder()
        .add_source(File::with_name(path))
        .add_source(Environment::with_prefix("STREAMFAN").separator("__"))
        .build()?
        .try_deserialize::<Configuration>()?;
    Ok(postprocess(raw))
}

/// Fill defaults and clamp: zero/empty HLS settings fall back, the playlist
/// window never exceeds its capacity, and per-stream archive settings fall
/// back to the globals.
pub fn postprocess(mut cfg: Configuration) -> Configuration {
    if cfg.hls.directory.is_empty() {
        cfg.hls.directory = DEFAULT_HLS_DIR.to_string();
    }
    if cfg.hls.ms_per_segment == 0 {
        cfg.hls.ms_per_segment = DEFAULT_HLS_MS_PER_SEGMENT;
    }
    if cfg.hls.capacity == 0 {
        cfg.hls.capacity = DEFAULT_HLS_CAPACITY;
    }
    if cfg.hls.window_size == 0 {
        cfg.hls.window_size = DEFAULT_HLS_WINDOW_SIZE;
    }
    if cfg.hls.window_size > cfg.hls.capacity {
        cfg.hls.window_size = cfg.hls.capacity;
    }

    for stream in &mut cfg.rtsp_streams {
        let archive = &mut stream.archive;
        if !archive.enabled {
            continue;
        }
        if archive.ms_per_file <= 0 {
            archive.ms_per_file = if cfg.archive.ms_per_file > 0 {
                cfg.archive.ms_per_file
            } else {
                DEFAULT_ARCHIVE_MS_PER_FILE
            };
        }
        if archive.directory.is_empty() {
            archive.directory = if cfg.archive.directory.is_empty() {
                DEFAULT_ARCHIVE_DIR.to_string()
            } else {
                cfg.archive.directory.clone()
            };
        }
        if archive.minio_bucket.is_empty() {
            archive.minio_bucket = cfg.archive.minio.default_bucket.clone();
        }
        if archive.minio_path.is_empty() {
            archive.minio_path = cfg.archive.minio.default_path.clone();
        }
    }
    cfg
}
