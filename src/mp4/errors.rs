#[derive(Debug, thiserror::Error)]
pub enum Mp4Error {
    #[error("muxer needs at least one track")]
    NoTracks,

    #[error("packet references unknown track index {0}")]
    BadTrackIndex(usize),

    #[error("codec not representable in an MP4 container: {0}")]
    UnsupportedCodec(String),
}
