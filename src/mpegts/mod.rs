//! MPEG transport stream muxer for HLS segments.
//!
//! One muxer instance per segment file: `write_header` emits PAT/PMT for the
//! stream's codec sequence, `write_packet` packetizes each sample into PES
//! and 188-byte TS packets (PCR rides the video PID on keyframes). Output
//! accumulates in an internal buffer drained by the segment writer.

pub mod crc32;
pub mod define;
pub mod errors;
pub mod pat;
pub mod pmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::media::{CodecParameters, Packet};
use define::{
    ES_PID_BASE, PAT_PID, PMT_PID, STREAM_ID_AUDIO, STREAM_ID_VIDEO, STREAM_TYPE_AAC,
    STREAM_TYPE_H264, TICKS_PER_MS, TS_PACKET_SIZE, TS_PAYLOAD_SIZE,
};
pub use errors::MpegTsError;

const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
/// Access unit delimiter NAL prepended to every H.264 access unit.
const AUD_NAL: [u8; 2] = [0x09, 0xF0];

struct Track {
    pid: u16,
    stream_id: u8,
    codec: CodecParameters,
    continuity: u8,
}

pub struct TsMuxer {
    tracks: Vec<Track>,
    pcr_pid: u16,
    pat_continuity: u8,
    pmt_continuity: u8,
    out: BytesMut,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            pcr_pid: ES_PID_BASE,
            pat_continuity: 0,
            pmt_continuity: 0,
            out: BytesMut::new(),
        }
    }

    /// Emit PAT and PMT for the codec sequence. Must be called once before
    /// any packet.
    pub fn write_header(&mut self, codecs: &[CodecParameters]) -> Result<(), MpegTsError> {
        if codecs.is_empty() {
            return Err(MpegTsError::NoTracks);
        }
        self.tracks.clear();
        let mut pmt_streams = Vec::with_capacity(codecs.len());
        for (idx, codec) in codecs.iter().enumerate() {
            let pid = ES_PID_BASE + idx as u16;
            let (stream_id, stream_type) = match codec {
                CodecParameters::H264(_) => (STREAM_ID_VIDEO, STREAM_TYPE_H264),
                CodecParameters::Aac(_) => (STREAM_ID_AUDIO, STREAM_TYPE_AAC),
                CodecParameters::Other { name } => {
                    return Err(MpegTsError::UnsupportedCodec(name.clone()))
                }
            };
            pmt_streams.push(pmt::PmtStream { pid, stream_type });
            self.tracks.push(Track {
                pid,
                stream_id,
                codec: codec.clone(),
                continuity: 0,
            });
        }
        // PCR rides the first video PID (first track when there is no video).
        self.pcr_pid = self
            .tracks
            .iter()
            .find(|t| t.codec.is_video())
            .map(|t| t.pid)
            .unwrap_or(self.tracks[0].pid);

        let pat_section = pat::Pat::single_program(PMT_PID).write_section();
        let pmt_section = pmt::Pmt {
            program_number: 1,
            version_number: 0,
            pcr_pid: self.pcr_pid,
            streams: pmt_streams,
        }
        .write_section();
        let pat_cc = &mut self.pat_continuity;
        Self::write_psi(&mut self.out, PAT_PID, &pat_section, pat_cc);
        let pmt_cc = &mut self.pmt_continuity;
        Self::write_psi(&mut self.out, PMT_PID, &pmt_section, pmt_cc);
        Ok(())
    }

    pub fn write_packet(&mut self, packet: &Packet) -> Result<(), MpegTsError> {
        if self.tracks.is_empty() {
            return Err(MpegTsError::NoTracks);
        }
        let pcr_pid = self.pcr_pid;
        let track = self
            .tracks
            .get_mut(packet.track)
            .ok_or(MpegTsError::BadTrackIndex(packet.track))?;

        let es = match &track.codec {
            CodecParameters::H264(params) => {
                h264_access_unit(&packet.data, packet.is_keyframe, &params.sps, &params.pps)
            }
            CodecParameters::Aac(params) => adts_frame(&params.asc, &packet.data),
            CodecParameters::Other { name } => {
                return Err(MpegTsError::UnsupportedCodec(name.clone()))
            }
        };

        let pts = packet.time.as_millis() as u64 * TICKS_PER_MS;
        let pes = build_pes(track.stream_id, pts, &es);
        let with_pcr = track.pid == pcr_pid && packet.is_keyframe;
        packetize(
            &mut self.out,
            track.pid,
            &pes,
            with_pcr.then_some(pts),
            &mut track.continuity,
        );
        Ok(())
    }

    /// Drain everything produced so far.
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    fn write_psi(out: &mut BytesMut, pid: u16, section: &[u8], continuity: &mut u8) {
        let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
        packet.put_u8(0x47);
        packet.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F));
        packet.put_u8((pid & 0xFF) as u8);
        packet.put_u8(0x10 | (*continuity & 0x0F));
        *continuity = continuity.wrapping_add(1);
        /* pointer_field */
        packet.put_u8(0x00);
        packet.extend_from_slice(section);
        packet.resize(TS_PACKET_SIZE, 0xFF);
        out.extend_from_slice(&packet);
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert one AVCC access unit to Annex B, prepending an AUD and, on
/// keyframes, the parameter sets.
fn h264_access_unit(data: &[u8], is_keyframe: bool, sps: &[u8], pps: &[u8]) -> BytesMut {
    let mut es = BytesMut::with_capacity(data.len() + 64);
    es.extend_from_slice(&ANNEXB_START_CODE);
    es.extend_from_slice(&AUD_NAL);
    if is_keyframe {
        if !sps.is_empty() {
            es.extend_from_slice(&ANNEXB_START_CODE);
            es.extend_from_slice(sps);
        }
        if !pps.is_empty() {
            es.extend_from_slice(&ANNEXB_START_CODE);
            es.extend_from_slice(pps);
        }
    }
    if data.starts_with(&[0x00, 0x00, 0x01]) || data.starts_with(&ANNEXB_START_CODE) {
        // Already Annex B.
        es.extend_from_slice(data);
        return es;
    }
    let mut rest = data;
    while rest.len() >= 4 {
        let nal_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if nal_len == 0 || nal_len > rest.len() {
            break;
        }
        es.extend_from_slice(&ANNEXB_START_CODE);
        es.extend_from_slice(&rest[..nal_len]);
        rest = &rest[nal_len..];
    }
    es
}

/// Wrap a raw AAC frame in an ADTS header derived from the
/// AudioSpecificConfig.
fn adts_frame(asc: &[u8], data: &[u8]) -> BytesMut {
    let mut es = BytesMut::with_capacity(data.len() + 7);
    let (object_type, freq_index, channels) = if asc.len() >= 2 {
        (
            (asc[0] >> 3) & 0x1F,
            ((asc[0] & 0x07) << 1) | (asc[1] >> 7),
            (asc[1] >> 3) & 0x0F,
        )
    } else {
        (2, 4, 2) // AAC-LC, 44.1 kHz, stereo
    };
    let profile = object_type.saturating_sub(1) & 0x03;
    let frame_len = (data.len() + 7) as u16;
    es.put_u8(0xFF);
    es.put_u8(0xF1);
    es.put_u8((profile << 6) | (freq_index << 2) | ((channels >> 2) & 0x01));
    es.put_u8(((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03));
    es.put_u8((frame_len >> 3) as u8);
    es.put_u8(((frame_len as u8 & 0x07) << 5) | 0x1F);
    es.put_u8(0xFC);
    es.extend_from_slice(data);
    es
}

fn build_pes(stream_id: u8, pts: u64, es: &[u8]) -> BytesMut {
    let mut pes = BytesMut::with_capacity(es.len() + 14);
    pes.put_u8(0x00);
    pes.put_u8(0x00);
    pes.put_u8(0x01);
    pes.put_u8(stream_id);
    // optional header(3) + PTS(5) + payload; 0 means unbounded (video only)
    let length = 3 + 5 + es.len();
    if length > u16::MAX as usize {
        pes.put_u16(0);
    } else {
        pes.put_u16(length as u16);
    }
    pes.put_u8(0x80);
    /* PTS only */
    pes.put_u8(0x80);
    pes.put_u8(0x05);
    pes.put_u8(0x21 | ((pts >> 29) as u8 & 0x0E));
    pes.put_u8((pts >> 22) as u8);
    pes.put_u8(0x01 | ((pts >> 14) as u8 & 0xFE));
    pes.put_u8((pts >> 7) as u8);
    pes.put_u8(0x01 | ((pts << 1) as u8 & 0xFE));
    pes.extend_from_slice(es);
    pes
}

/// Split one PES packet into 188-byte TS packets, stuffing the tail through
/// the adaptation field and carrying PCR on the first packet when requested.
fn packetize(out: &mut BytesMut, pid: u16, pes: &[u8], pcr: Option<u64>, continuity: &mut u8) {
    let mut remaining = pes;
    let mut first = true;
    while first || !remaining.is_empty() {
        let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
        packet.put_u8(0x47);
        let pusi = if first { 0x40 } else { 0x00 };
        packet.put_u8(pusi | ((pid >> 8) as u8 & 0x1F));
        packet.put_u8((pid & 0xFF) as u8);

        let with_pcr = first && pcr.is_some();
        // flags byte + 6-byte PCR is the minimum adaptation content with PCR
        let min_af: usize = if with_pcr { 7 } else { 0 };
        let adaptation = with_pcr || remaining.len() < TS_PAYLOAD_SIZE;

        let take;
        if adaptation {
            packet.put_u8(0x30 | (*continuity & 0x0F));
            // 4(header) + 1(af_length) + af_len + payload == 188
            let payload = remaining.len().min(TS_PAYLOAD_SIZE - 1 - min_af);
            let af_len = TS_PAYLOAD_SIZE - 1 - payload;
            packet.put_u8(af_len as u8);
            if af_len > 0 {
                packet.put_u8(if with_pcr { 0x10 } else { 0x00 });
                if with_pcr {
                    let base = pcr.unwrap_or(0);
                    packet.put_u8((base >> 25) as u8);
                    packet.put_u8((base >> 17) as u8);
                    packet.put_u8((base >> 9) as u8);
                    packet.put_u8((base >> 1) as u8);
                    packet.put_u8((((base & 0x01) as u8) << 7) | 0x7E);
                    packet.put_u8(0x00);
                }
                let used = 1 + if with_pcr { 6 } else { 0 };
                for _ in used..af_len {
                    packet.put_u8(0xFF);
                }
            }
            take = payload;
        } else {
            packet.put_u8(0x10 | (*continuity & 0x0F));
            take = TS_PAYLOAD_SIZE;
        }
        *continuity = continuity.wrapping_add(1);

        packet.extend_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
        out.extend_from_slice(&packet);
        first = false;
    }
}
