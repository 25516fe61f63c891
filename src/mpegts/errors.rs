#[derive(Debug, thiserror::Error)]
pub enum MpegTsError {
    #[error("muxer has no tracks (write_header not called or empty codec sequence)")]
    NoTracks,

    #[error("packet references unknown track index {0}")]
    BadTrackIndex(usize),

    #[error("codec not representable in a transport stream: {0}")]
    UnsupportedCodec(String),
}
