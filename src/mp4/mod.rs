//! Fragmented-MP4 writer shared by the MSE viewer path and the archiver.
//!
//! Layout: `ftyp` + `moov` init segment, one `moof`/`mdat` pair per sample,
//! and (for file archiving) an `mfra` trailer indexing keyframe fragments.
//! Video uses a 90 kHz timescale, audio its sample rate.

pub mod errors;

use bytes::{BufMut, Bytes, BytesMut};

use crate::media::{AacParameters, CodecParameters, H264Parameters, Packet};
pub use errors::Mp4Error;

const VIDEO_TIMESCALE: u32 = 90_000;
/// Fallback sample duration when the source gives no hint (25 fps in 90 kHz).
const DEFAULT_VIDEO_DURATION: u32 = 3_600;
/// AAC frames always decode to 1024 PCM samples.
const AAC_SAMPLES_PER_FRAME: u32 = 1_024;

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

fn write_box(buf: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.extend_from_slice(fourcc);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(
    buf: &mut BytesMut,
    fourcc: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut BytesMut),
) {
    write_box(buf, fourcc, |b| {
        b.put_u32((u32::from(version) << 24) | (flags & 0x00FF_FFFF));
        body(b);
    });
}

fn put_matrix(buf: &mut BytesMut) {
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.put_u32(value);
    }
}

#[derive(Debug)]
struct Track {
    codec: CodecParameters,
    timescale: u32,
}

impl Track {
    fn sample_duration(&self, packet: &Packet) -> u32 {
        match &self.codec {
            CodecParameters::Aac(_) => AAC_SAMPLES_PER_FRAME,
            _ => {
                let hint = packet.duration.as_millis() as u64;
                if hint == 0 {
                    DEFAULT_VIDEO_DURATION
                } else {
                    (hint * u64::from(self.timescale) / 1_000) as u32
                }
            }
        }
    }

    fn decode_time(&self, packet: &Packet) -> u64 {
        packet.time.as_millis() as u64 * u64::from(self.timescale) / 1_000
    }
}

#[derive(Debug)]
struct TfraEntry {
    time: u64,
    moof_offset: u64,
}

#[derive(Debug)]
pub struct Mp4Muxer {
    tracks: Vec<Track>,
    sequence: u32,
    /// Cumulative output length, used as the moof file offset for `tfra`.
    bytes_written: u64,
    keyframe_index: Vec<(u32, TfraEntry)>,
}

impl Mp4Muxer {
    pub fn new(codecs: &[CodecParameters]) -> Result<Self, Mp4Error> {
        if codecs.is_empty() {
            return Err(Mp4Error::NoTracks);
        }
        let mut tracks = Vec::with_capacity(codecs.len());
        for codec in codecs {
            let timescale = match codec {
                CodecParameters::H264(_) => VIDEO_TIMESCALE,
                CodecParameters::Aac(params) => params.sample_rate.max(1),
                CodecParameters::Other { name } => {
                    return Err(Mp4Error::UnsupportedCodec(name.clone()))
                }
            };
            tracks.push(Track {
                codec: codec.clone(),
                timescale,
            });
        }
        Ok(Self {
            tracks,
            sequence: 0,
            bytes_written: 0,
            keyframe_index: Vec::new(),
        })
    }

    /// MSE metadata: comma-joined RFC 6381 codec tags.
    pub fn codec_metadata(&self) -> String {
        self.tracks
            .iter()
            .map(|t| t.codec.codec_tag())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// `ftyp` + `moov` initialization segment.
    pub fn init_segment(&mut self) -> Bytes {
        let next_track_id = self.tracks.len() as u32 + 1;
        let mut buf = BytesMut::new();
        write_box(&mut buf, b"ftyp", |b| {
            b.extend_from_slice(b"isom");
            b.put_u32(512);
            b.extend_from_slice(b"isom");
            b.extend_from_slice(b"iso5");
            b.extend_from_slice(b"avc1");
            b.extend_from_slice(b"mp41");
        });
        write_box(&mut buf, b"moov", |b| {
            write_full_box(b, b"mvhd", 0, 0, |b| {
                b.put_u32(0); // creation_time
                b.put_u32(0); // modification_time
                b.put_u32(1_000); // timescale
                b.put_u32(0); // duration (unknown: fragmented)
                b.put_u32(0x0001_0000); // rate
                b.put_u16(0x0100); // volume
                b.put_u16(0);
                b.put_u64(0);
                put_matrix(b);
                for _ in 0..6 {
                    b.put_u32(0);
                }
                b.put_u32(next_track_id);
            });
            for (idx, track) in self.tracks.iter().enumerate() {
                write_trak(b, idx as u32 + 1, track);
            }
            write_box(b, b"mvex", |b| {
                for idx in 0..self.tracks.len() {
                    write_full_box(b, b"trex", 0, 0, |b| {
                        b.put_u32(idx as u32 + 1);
                        b.put_u32(1); // default_sample_description_index
                        b.put_u32(0);
                        b.put_u32(0);
                        b.put_u32(0);
                    });
                }
            });
        });
        let out = buf.freeze();
        self.bytes_written += out.len() as u64;
        out
    }

    /// One `moof`+`mdat` fragment carrying a single sample.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<Option<Bytes>, Mp4Error> {
        let track = self
            .tracks
            .get(packet.track)
            .ok_or(Mp4Error::BadTrackIndex(packet.track))?;
        let track_id = packet.track as u32 + 1;
        let duration = track.sample_duration(packet);
        let decode_time = track.decode_time(packet);
        let sample_flags = if track.codec.is_video() && !packet.is_keyframe {
            SAMPLE_FLAGS_NON_SYNC
        } else {
            SAMPLE_FLAGS_SYNC
        };
        self.sequence += 1;
        let sequence = self.sequence;

        let mut moof = BytesMut::new();
        let mut data_offset_pos = 0usize;
        write_box(&mut moof, b"moof", |b| {
            write_full_box(b, b"mfhd", 0, 0, |b| b.put_u32(sequence));
            write_box(b, b"traf", |b| {
                // default-base-is-moof
                write_full_box(b, b"tfhd", 0, 0x0002_0000, |b| b.put_u32(track_id));
                write_full_box(b, b"tfdt", 1, 0, |b| b.put_u64(decode_time));
                // data-offset + per-sample duration/size/flags
                write_full_box(b, b"trun", 0, 0x0000_0701, |b| {
                    b.put_u32(1);
                    data_offset_pos = b.len();
                    b.put_u32(0); // patched below
                    b.put_u32(duration);
                    b.put_u32(packet.data.len() as u32);
                    b.put_u32(sample_flags);
                });
            });
        });
        let data_offset = (moof.len() + 8) as i32;
        moof[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

        if track.codec.is_video() && packet.is_keyframe {
            self.keyframe_index.push((
                track_id,
                TfraEntry {
                    time: decode_time,
                    moof_offset: self.bytes_written,
                },
            ));
        }

        let mut out = moof;
        write_box(&mut out, b"mdat", |b| b.extend_from_slice(&packet.data));
        let out = out.freeze();
        self.bytes_written += out.len() as u64;
        Ok(Some(out))
    }

    /// `mfra` trailer indexing keyframe fragments; written once at the end
    /// of an archive segment file.
    pub fn finalize(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        let mut mfro_size_pos = 0usize;
        write_box(&mut buf, b"mfra", |b| {
            let mut by_track: Vec<(u32, Vec<&TfraEntry>)> = Vec::new();
            for (track_id, entry) in &self.keyframe_index {
                match by_track.iter_mut().find(|(id, _)| id == track_id) {
                    Some((_, entries)) => entries.push(entry),
                    None => by_track.push((*track_id, vec![entry])),
                }
            }
            for (track_id, entries) in by_track {
                write_full_box(b, b"tfra", 1, 0, |b| {
                    b.put_u32(track_id);
                    b.put_u32(0); // 1-byte traf/trun/sample numbers
                    b.put_u32(entries.len() as u32);
                    for entry in entries {
                        b.put_u64(entry.time);
                        b.put_u64(entry.moof_offset);
                        b.put_u8(1);
                        b.put_u8(1);
                        b.put_u8(1);
                    }
                });
            }
            write_full_box(b, b"mfro", 0, 0, |b| {
                mfro_size_pos = b.len();
                b.put_u32(0); // patched: total mfra size
            });
        });
        let total = buf.len() as u32;
        buf[mfro_size_pos..mfro_size_pos + 4].copy_from_slice(&total.to_be_bytes());
        let out = buf.freeze();
        self.bytes_written += out.len() as u64;
        out
    }
}

fn write_trak(buf: &mut BytesMut, track_id: u32, track: &Track) {
    write_box(buf, b"trak", |b| {
        write_full_box(b, b"tkhd", 0, 0x0000_0003, |b| {
            b.put_u32(0);
            b.put_u32(0);
            b.put_u32(track_id);
            b.put_u32(0);
            b.put_u32(0); // duration
            b.put_u64(0);
            b.put_u16(0); // layer
            b.put_u16(0); // alternate_group
            b.put_u16(if track.codec.is_audio() { 0x0100 } else { 0 });
            b.put_u16(0);
            put_matrix(b);
            match &track.codec {
                CodecParameters::H264(p) => {
                    b.put_u32(p.width << 16);
                    b.put_u32(p.height << 16);
                }
                _ => {
                    b.put_u32(0);
                    b.put_u32(0);
                }
            }
        });
        write_box(b, b"mdia", |b| {
            write_full_box(b, b"mdhd", 0, 0, |b| {
                b.put_u32(0);
                b.put_u32(0);
                b.put_u32(track.timescale);
                b.put_u32(0);
                b.put_u16(0x55C4); // "und"
                b.put_u16(0);
            });
            write_full_box(b, b"hdlr", 0, 0, |b| {
                b.put_u32(0);
                b.extend_from_slice(if track.codec.is_video() {
                    b"vide"
                } else {
                    b"soun"
                });
                for _ in 0..3 {
                    b.put_u32(0);
                }
                b.extend_from_slice(if track.codec.is_video() {
                    b"VideoHandler\0"
                } else {
                    b"SoundHandler\0"
                });
            });
            write_box(b, b"minf", |b| {
                if track.codec.is_video() {
                    write_full_box(b, b"vmhd", 0, 1, |b| {
                        b.put_u16(0);
                        for _ in 0..3 {
                            b.put_u16(0);
                        }
                    });
                } else {
                    write_full_box(b, b"smhd", 0, 0, |b| {
                        b.put_u16(0);
                        b.put_u16(0);
                    });
                }
                write_box(b, b"dinf", |b| {
                    write_full_box(b, b"dref", 0, 0, |b| {
                        b.put_u32(1);
                        write_full_box(b, b"url ", 0, 1, |_| {});
                    });
                });
                write_box(b, b"stbl", |b| {
                    write_full_box(b, b"stsd", 0, 0, |b| {
                        b.put_u32(1);
                        match &track.codec {
                            CodecParameters::H264(p) => write_avc1(b, p),
                            CodecParameters::Aac(p) => write_mp4a(b, track_id, p),
                            CodecParameters::Other { .. } => {}
                        }
                    });
                    write_full_box(b, b"stts", 0, 0, |b| b.put_u32(0));
                    write_full_box(b, b"stsc", 0, 0, |b| b.put_u32(0));
                    write_full_box(b, b"stsz", 0, 0, |b| {
                        b.put_u32(0);
                        b.put_u32(0);
                    });
                    write_full_box(b, b"stco", 0, 0, |b| b.put_u32(0));
                });
            });
        });
    });
}

fn write_avc1(buf: &mut BytesMut, params: &H264Parameters) {
    write_box(buf, b"avc1", |b| {
        for _ in 0..6 {
            b.put_u8(0);
        }
        b.put_u16(1); // data_reference_index
        b.put_u16(0);
        b.put_u16(0);
        for _ in 0..3 {
            b.put_u32(0);
        }
        b.put_u16(params.width as u16);
        b.put_u16(params.height as u16);
        b.put_u32(0x0048_0000); // 72 dpi
        b.put_u32(0x0048_0000);
        b.put_u32(0);
        b.put_u16(1); // frame_count
        for _ in 0..32 {
            b.put_u8(0); // compressorname
        }
        b.put_u16(0x0018); // depth
        b.put_u16(0xFFFF); // pre_defined = -1
        write_box(b, b"avcC", |b| {
            b.put_u8(1);
            let (profile, compat, level) = if params.sps.len() >= 4 {
                (params.sps[1], params.sps[2], params.sps[3])
            } else {
                (0x42, 0x00, 0x1E)
            };
            b.put_u8(profile);
            b.put_u8(compat);
            b.put_u8(level);
            b.put_u8(0xFF); // 4-byte NAL lengths
            b.put_u8(0xE1); // one SPS
            b.put_u16(params.sps.len() as u16);
            b.extend_from_slice(&params.sps);
            b.put_u8(1); // one PPS
            b.put_u16(params.pps.len() as u16);
            b.extend_from_slice(&params.pps);
        });
    });
}

fn write_mp4a(buf: &mut BytesMut, track_id: u32, params: &AacParameters) {
    write_box(buf, b"mp4a", |b| {
        for _ in 0..6 {
            b.put_u8(0);
        }
        b.put_u16(1); // data_reference_index
        b.put_u64(0);
        b.put_u16(u16::from(params.channels));
        b.put_u16(16); // sample size
        b.put_u16(0);
        b.put_u16(0);
        b.put_u32(params.sample_rate << 16);
        write_full_box(b, b"esds", 0, 0, |b| {
            let asc_len = params.asc.len();
            let dcd_len = 13 + 2 + asc_len;
            let es_len = 3 + 2 + dcd_len + 3;
            b.put_u8(0x03); // ES_Descriptor
            b.put_u8(es_len as u8);
            b.put_u16(track_id as u16);
            b.put_u8(0);
            b.put_u8(0x04); // DecoderConfigDescriptor
            b.put_u8(dcd_len as u8);
            b.put_u8(0x40); // Audio ISO/IEC 14496-3
            b.put_u8(0x15); // audio stream
            b.put_u8(0);
            b.put_u16(0); // bufferSizeDB (24 bits with byte above)
            b.put_u32(0); // maxBitrate
            b.put_u32(0); // avgBitrate
            b.put_u8(0x05); // DecoderSpecificInfo
            b.put_u8(asc_len as u8);
            b.extend_from_slice(&params.asc);
            b.put_u8(0x06); // SLConfigDescriptor
            b.put_u8(1);
            b.put_u8(0x02);
        });
    });
}
