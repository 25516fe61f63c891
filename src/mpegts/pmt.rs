//! Program map table section writer (ITU-T H.222.0 §2.4.4.8).

use bytes::{BufMut, BytesMut};

use super::crc32::gen_crc32;
use super::define::PMT_TID;

#[derive(Debug, Clone, Copy)]
pub struct PmtStream {
    pub pid: u16,
    pub stream_type: u8,
}

#[derive(Debug, Clone)]
pub struct Pmt {
    pub program_number: u16,
    pub version_number: u8,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    pub fn write_section(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u16(self.program_number);
        body.put_u8(0xC1 | (self.version_number << 1));
        /* section_number, last_section_number */
        body.put_u8(0x00);
        body.put_u8(0x00);
        body.put_u16(0xE000 | self.pcr_pid);
        /* program_info_length = 0 */
        body.put_u16(0xF000);
        for stream in &self.streams {
            body.put_u8(stream.stream_type);
            body.put_u16(0xE000 | stream.pid);
            /* ES_info_length = 0 */
            body.put_u16(0xF000);
        }

        let mut section = BytesMut::new();
        section.put_u8(PMT_TID);
        section.put_u16(0xB000 | (body.len() as u16 + 4));
        section.extend_from_slice(&body);
        let crc = gen_crc32(&section);
        section.put_u32(crc);
        section
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpegts::define::{STREAM_TYPE_AAC, STREAM_TYPE_H264};

    #[test]
    fn section_layout_with_two_streams() {
        let pmt = Pmt {
            program_number: 1,
            version_number: 0,
            pcr_pid: 0x100,
            streams: vec![
                PmtStream { pid: 0x100, stream_type: STREAM_TYPE_H264 },
                PmtStream { pid: 0x101, stream_type: STREAM_TYPE_AAC },
            ],
        };
        let section = pmt.write_section();
        assert_eq!(section[0], PMT_TID);
        let length = (u16::from(section[1] & 0x0F) << 8) | u16::from(section[2]);
        assert_eq!(usize::from(length), section.len() - 3);
        // fixed body(9) + 2 streams(5 each) + header(3) + crc(4)
        assert_eq!(section.len(), 3 + 9 + 10 + 4);
        assert_eq!(section[12], STREAM_TYPE_H264);
        assert_eq!(section[17], STREAM_TYPE_AAC);
    }
}
