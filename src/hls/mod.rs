//! HLS segmenter: consumes a stream's packet channel and maintains
//! keyframe-aligned TS segments plus a sliding M3U8 playlist on disk.
//!
//! Segment files are `{stream_id}{NNNN}.ts`, the playlist is
//! `{stream_id}.m3u8`. Old segments that fell out of the playlist are
//! garbage-collected after every rotation; on shutdown a deferred task
//! removes whatever the playlist still references.

pub mod playlist;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::media::Packet;
use crate::mpegts::TsMuxer;
use crate::registry::StreamRegistry;
use crate::source::StopReason;
use playlist::MediaPlaylist;

#[derive(Debug, Clone)]
pub struct HlsSettings {
    pub directory: PathBuf,
    pub ms_per_segment: i64,
    pub window_size: usize,
    pub capacity: usize,
}

/// Run one segmenter until its stop channel fires or the packet channel
/// closes. A header write failure is fatal (the parent session restarts);
/// playlist and GC errors are logged and skipped.
pub async fn run_segmenter(
    registry: std::sync::Arc<StreamRegistry>,
    stream_id: Uuid,
    mut packets: mpsc::Receiver<Packet>,
    mut stop: mpsc::Receiver<StopReason>,
    settings: HlsSettings,
) -> Result<()> {
    fs::create_dir_all(&settings.directory).await?;
    let playlist_path = settings.directory.join(format!("{stream_id}.m3u8"));
    tracing::info!(stream_id = %stream_id, playlist = %playlist_path.display(), "hls segmenter started");

    let mut playlist = MediaPlaylist::new(settings.window_size, settings.capacity);
    let mut segment_number: u64 = 0;
    let mut last_packet_time = Duration::ZERO;
    let mut carry_keyframe: Option<Packet> = None;
    let mut connected = true;

    while connected {
        let segment_name = format!("{stream_id}{segment_number:04}.ts");
        let segment_path = settings.directory.join(&segment_name);
        let mut file = fs::File::create(&segment_path).await?;

        let codecs = registry.get_codecs(stream_id)?;
        let mut muxer = TsMuxer::new();
        muxer.write_header(&codecs)?;
        file.write_all(&muxer.take_output()).await?;

        let video_track = codecs.iter().position(|c| c.is_video()).unwrap_or(0);
        let mut segment_length = Duration::ZERO;
        let mut started = false;

        // The keyframe that closed the previous segment opens this one.
        if let Some(keyframe) = carry_keyframe.take() {
            started = true;
            muxer.write_packet(&keyframe)?;
            file.write_all(&muxer.take_output()).await?;
            segment_length += keyframe.time.saturating_sub(last_packet_time);
            last_packet_time = keyframe.time;
        }

        'segment: loop {
            // Queued packets are drained before a stop is honored, so the
            // segment closes with everything that was already cast.
            tokio::select! {
                biased;
                packet = packets.recv() => {
                    let Some(packet) = packet else {
                        connected = false;
                        break 'segment;
                    };
                    if packet.track == video_track && packet.is_keyframe {
                        started = true;
                        if segment_length.as_millis() as i64 >= settings.ms_per_segment {
                            carry_keyframe = Some(packet);
                            break 'segment;
                        }
                    }
                    if !started {
                        // Segments must open on a keyframe.
                        continue;
                    }
                    if packet.track == video_track {
                        if packet.time > last_packet_time {
                            muxer.write_packet(&packet)?;
                            file.write_all(&muxer.take_output()).await?;
                            segment_length += packet.time - last_packet_time;
                            last_packet_time = packet.time;
                        }
                        // Non-monotonic video timestamps are dropped.
                    } else {
                        muxer.write_packet(&packet)?;
                        file.write_all(&muxer.take_output()).await?;
                    }
                }
                reason = stop.recv() => {
                    match reason.unwrap_or(StopReason::StopDial) {
                        StopReason::Error => {
                            tracing::warn!(stream_id = %stream_id, "hls segmenter stopping after session error");
                        }
                        StopReason::NoVideo => {
                            tracing::warn!(stream_id = %stream_id, "hls segmenter stopping: no video");
                        }
                        StopReason::Disconnect | StopReason::StopDial => {
                            tracing::info!(stream_id = %stream_id, "hls segmenter stopping");
                        }
                    }
                    connected = false;
                    break 'segment;
                }
            }
        }

        if let Err(e) = file.sync_all().await {
            tracing::warn!(stream_id = %stream_id, segment = %segment_name, error = %e, "can't sync segment file");
        }
        drop(file);

        playlist.slide(segment_name, segment_length.as_secs_f64());
        if let Err(e) = write_playlist(&playlist_path, &playlist).await {
            tracing::warn!(stream_id = %stream_id, error = %e, "can't rewrite playlist");
        }
        if let Err(e) = remove_outdated_segments(&settings.directory, stream_id, &playlist).await {
            tracing::warn!(stream_id = %stream_id, error = %e, "can't clean outdated segments");
        }
        segment_number += 1;
    }

    schedule_final_cleanup(&settings, &playlist, playlist_path);
    Ok(())
}

/// Rewrite the playlist atomically: temp file then rename.
async fn write_playlist(path: &Path, playlist: &MediaPlaylist) -> std::io::Result<()> {
    let tmp = path.with_extension("m3u8.tmp");
    fs::write(&tmp, playlist.encode()).await?;
    fs::rename(&tmp, path).await
}

/// Delete `{stream_id}*.ts` files no longer referenced by the playlist.
async fn remove_outdated_segments(
    directory: &Path,
    stream_id: Uuid,
    playlist: &MediaPlaylist,
) -> std::io::Result<()> {
    let current: std::collections::HashSet<&str> = playlist.uris().collect();
    let prefix = stream_id.to_string();
    let mut entries = fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && name.ends_with(".ts") && !current.contains(name) {
            if let Err(e) = fs::remove_file(entry.path()).await {
                tracing::warn!(segment = %name, error = %e, "can't remove outdated segment");
            }
        }
    }
    Ok(())
}

/// After shutdown the playlist stays serveable for one full window, then
/// everything it references (and the playlist itself) is deleted.
fn schedule_final_cleanup(settings: &HlsSettings, playlist: &MediaPlaylist, playlist_path: PathBuf) {
    let delay = Duration::from_millis(
        settings.ms_per_segment.max(0) as u64 * playlist.capacity() as u64,
    );
    let mut files: Vec<PathBuf> = playlist
        .uris()
        .map(|uri| settings.directory.join(uri))
        .collect();
    files.push(playlist_path);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        for file in files {
            if let Err(e) = fs::remove_file(&file).await {
                tracing::debug!(file = %file.display(), error = %e, "deferred hls cleanup skip");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecParameters, H264Parameters, StreamType, VerboseLevel};
    use bytes::{BufMut, Bytes, BytesMut};
    use std::sync::Arc;

    fn h264_codecs() -> Vec<CodecParameters> {
        vec![CodecParameters::H264(H264Parameters {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEE]),
            width: 640,
            height: 360,
        })]
    }

    fn avcc_packet(ms: u64, keyframe: bool) -> Packet {
        let nal: &[u8] = if keyframe { &[0x65, 1, 2, 3] } else { &[0x41, 1, 2, 3] };
        let mut data = BytesMut::new();
        data.put_u32(nal.len() as u32);
        data.extend_from_slice(nal);
        Packet {
            track: 0,
            time: Duration::from_millis(ms),
            data: data.freeze(),
            is_keyframe: keyframe,
            duration: Duration::from_millis(40),
        }
    }

    fn test_registry(stream_id: Uuid) -> Arc<StreamRegistry> {
        let registry = Arc::new(StreamRegistry::new());
        registry.insert(
            stream_id,
            "rtsp://camera/main".into(),
            vec![StreamType::Hls],
            VerboseLevel::None,
        );
        registry.set_codecs(stream_id, h264_codecs()).unwrap();
        registry
    }

    #[tokio::test]
    async fn playlist_rotation_keeps_window_and_gcs_files() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        let registry = test_registry(stream_id);
        let settings = HlsSettings {
            directory: dir.path().to_path_buf(),
            ms_per_segment: 2_000,
            window_size: 3,
            capacity: 5,
        };

        let (packet_tx, packet_rx) = mpsc::channel(100);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_segmenter(
            registry,
            stream_id,
            packet_rx,
            stop_rx,
            settings,
        ));

        // Keyframes every 2 s, filler in between: six segment boundaries.
        for second in 0..=10u64 {
            let keyframe = second % 2 == 0;
            packet_tx
                .send(avcc_packet(second * 1_000, keyframe))
                .await
                .unwrap();
            packet_tx
                .send(avcc_packet(second * 1_000 + 500, false))
                .await
                .unwrap();
        }
        stop_tx.send(StopReason::StopDial).await.unwrap();
        handle.await.unwrap().unwrap();

        let playlist = tokio::fs::read_to_string(dir.path().join(format!("{stream_id}.m3u8")))
            .await
            .unwrap();
        let entries: Vec<&str> = playlist
            .lines()
            .filter(|l| l.ends_with(".ts"))
            .collect();
        assert_eq!(entries.len(), 3, "playlist: {playlist}");

        // Only the windowed segment files survive rotation GC.
        let mut ts_files = Vec::new();
        let mut dir_entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = dir_entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".ts") {
                ts_files.push(name);
            }
        }
        ts_files.sort();
        let mut expected: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(ts_files, expected);

        // Every segment begins with a sync byte and tiles into 188-byte packets.
        for name in &ts_files {
            let data = tokio::fs::read(dir.path().join(name)).await.unwrap();
            assert!(!data.is_empty());
            assert_eq!(data.len() % 188, 0);
            assert_eq!(data[0], 0x47);
        }
    }

    #[tokio::test]
    async fn segment_at_exact_duration_closes_on_next_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        let registry = test_registry(stream_id);
        let settings = HlsSettings {
            directory: dir.path().to_path_buf(),
            ms_per_segment: 2_000,
            window_size: 5,
            capacity: 10,
        };

        let (packet_tx, packet_rx) = mpsc::channel(100);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_segmenter(
            registry,
            stream_id,
            packet_rx,
            stop_rx,
            settings,
        ));

        // The segment reaches exactly 2 s at the non-keyframe, which must
        // not close it; the keyframe afterwards does.
        packet_tx.send(avcc_packet(1_000, true)).await.unwrap();
        packet_tx.send(avcc_packet(2_000, false)).await.unwrap();
        packet_tx.send(avcc_packet(3_000, true)).await.unwrap();
        stop_tx.send(StopReason::StopDial).await.unwrap();
        handle.await.unwrap().unwrap();

        let playlist = tokio::fs::read_to_string(dir.path().join(format!("{stream_id}.m3u8")))
            .await
            .unwrap();
        let entries: Vec<&str> = playlist.lines().filter(|l| l.ends_with(".ts")).collect();
        assert_eq!(entries.len(), 2, "playlist: {playlist}");
        assert!(playlist.contains("#EXTINF:2.000"), "playlist: {playlist}");
    }

    #[tokio::test]
    async fn discards_packets_until_first_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        let registry = test_registry(stream_id);
        let settings = HlsSettings {
            directory: dir.path().to_path_buf(),
            ms_per_segment: 10_000,
            window_size: 5,
            capacity: 10,
        };

        let (packet_tx, packet_rx) = mpsc::channel(100);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_segmenter(
            registry,
            stream_id,
            packet_rx,
            stop_rx,
            settings,
        ));

        // Non-keyframes before the first keyframe must not be written.
        packet_tx.send(avcc_packet(0, false)).await.unwrap();
        packet_tx.send(avcc_packet(40, false)).await.unwrap();
        stop_tx.send(StopReason::Disconnect).await.unwrap();
        handle.await.unwrap().unwrap();

        let segment = tokio::fs::read(dir.path().join(format!("{stream_id}0000.ts")))
            .await
            .unwrap();
        // PAT + PMT only: nothing but the header reached the file.
        assert_eq!(segment.len(), 2 * 188);
    }
}
