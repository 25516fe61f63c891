//! MPEG-TS constants (ITU-T H.222.0).

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_PAYLOAD_SIZE: usize = 184;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
/// First elementary stream PID; tracks get consecutive PIDs from here.
pub const ES_PID_BASE: u16 = 0x0100;

pub const PAT_TID: u8 = 0x00;
pub const PMT_TID: u8 = 0x02;

pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_AAC: u8 = 0x0F;

pub const STREAM_ID_VIDEO: u8 = 0xE0;
pub const STREAM_ID_AUDIO: u8 = 0xC0;

/// 90 kHz clock ticks per millisecond.
pub const TICKS_PER_MS: u64 = 90;
