//! Multi-stream video fan-out server.
//!
//! Pulls live video from RTSP sources and re-emits every stream through
//! three channels at once: fragmented MP4 over WebSocket for low-latency
//! viewing, HLS playlists with TS segments over HTTP, and MP4 archive
//! segments written locally or shipped to an S3-compatible store.

pub mod app;
pub mod archive;
pub mod config;
pub mod error;
pub mod hls;
pub mod logging;
pub mod media;
pub mod mp4;
pub mod mpegts;
pub mod registry;
pub mod server;
pub mod source;
pub mod storage;

pub use app::Application;
pub use error::{Error, Result};
