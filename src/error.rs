use crate::mp4::Mp4Error;
use crate::mpegts::MpegTsError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream not found for provided ID")]
    StreamNotFound,

    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    #[error("stream has no video")]
    StreamHasNoVideo,

    #[error("stream disconnected")]
    StreamDisconnected,

    #[error("archive requested for a stream without archive configuration")]
    NullArchive,

    #[error("accumulated non-monotonic packet time exceeded failure budget")]
    TimeFailure,

    #[error("stream type does not exist: {0}")]
    InvalidStreamType(String),

    #[error("stream type is not supported as output: {0}")]
    UnsupportedStreamType(String),

    #[error("can't dial source: {0}")]
    SessionDialFailed(String),

    #[error("source session i/o error: {0}")]
    SessionIoError(String),

    #[error("{sink} channel closed")]
    SinkClosed { sink: &'static str },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("mpeg-ts mux error: {0}")]
    MpegTs(#[from] MpegTsError),

    #[error("mp4 mux error: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
