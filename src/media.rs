//! Shared media data model: the packet unit exchanged on every channel and
//! the codec descriptors stored per stream.
//!
//! Payloads use `Bytes` so fan-out clones are O(1) reference bumps, never
//! data copies.

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::error::Error;

/// Capacity of every packet queue in the system: HLS channel, archive
/// channel and each per-viewer queue.
pub const PACKET_CHANNEL_CAPACITY: usize = 100;

/// Unit exchanged on HLS/archive/viewer channels.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Track index within the stream's codec sequence.
    pub track: usize,
    /// Presentation time as duration since stream start.
    pub time: Duration,
    /// Encoded payload. H.264 is AVCC (length-prefixed NAL units), AAC is a
    /// raw frame.
    pub data: Bytes,
    pub is_keyframe: bool,
    /// Per-packet duration hint from the source (may be zero).
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct H264Parameters {
    pub sps: Bytes,
    pub pps: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct AacParameters {
    /// AudioSpecificConfig bytes.
    pub asc: Bytes,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Codec descriptor for one track. Only `H264` and `Aac` may be stored in
/// the registry; `Other` exists so sessions can report tracks the server
/// refuses.
#[derive(Debug, Clone)]
pub enum CodecParameters {
    H264(H264Parameters),
    Aac(AacParameters),
    Other { name: String },
}

impl CodecParameters {
    pub fn is_video(&self) -> bool {
        matches!(self, CodecParameters::H264(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, CodecParameters::Aac(_))
    }

    /// RFC 6381 codec tag, used in the MSE metadata frame.
    pub fn codec_tag(&self) -> String {
        match self {
            CodecParameters::H264(p) => {
                if p.sps.len() >= 4 {
                    format!("avc1.{:02X}{:02X}{:02X}", p.sps[1], p.sps[2], p.sps[3])
                } else {
                    "avc1".to_string()
                }
            }
            CodecParameters::Aac(_) => "mp4a.40.2".to_string(),
            CodecParameters::Other { name } => name.clone(),
        }
    }
}

/// Kinds of streams the server knows about. `Rtsp` is input-only; `Hls` and
/// `Mse` are the output channels a stream can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Rtsp,
    Hls,
    Mse,
}

impl StreamType {
    pub fn is_output(self) -> bool {
        matches!(self, StreamType::Hls | StreamType::Mse)
    }
}

impl FromStr for StreamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rtsp" => Ok(StreamType::Rtsp),
            "hls" => Ok(StreamType::Hls),
            "mse" => Ok(StreamType::Mse),
            other => Err(Error::InvalidStreamType(other.to_string())),
        }
    }
}

/// Parse a configuration `output_types` entry, rejecting input-only types.
pub fn parse_output_type(name: &str) -> Result<StreamType, Error> {
    let ty: StreamType = name.parse()?;
    if !ty.is_output() {
        return Err(Error::UnsupportedStreamType(name.to_string()));
    }
    Ok(ty)
}

/// Diagnostics verbosity, per stream. Parsed from "", "v", "vv", "vvv".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VerboseLevel {
    #[default]
    None,
    Simple,
    Add,
    All,
}

impl VerboseLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "v" => VerboseLevel::Simple,
            "vv" => VerboseLevel::Add,
            "vvv" => VerboseLevel::All,
            _ => VerboseLevel::None,
        }
    }
}
