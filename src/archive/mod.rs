//! MP4 archiver: slices a stream into keyframe-aligned fragmented-MP4 files
//! named by wall clock, optionally shipping each finished segment to the
//! object store.
//!
//! Segment names are `{stream_id}_{unix_seconds}.mp4`; the timestamp
//! advances by the real elapsed time of the previous segment so files are
//! discoverable by time range.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::Packet;
use crate::mp4::Mp4Muxer;
use crate::registry::{ArchiveSpec, StreamRegistry};
use crate::source::StopReason;
use crate::storage::{ArchiveUnit, StorageKind};

/// Budget for accumulated non-monotonic packet time before the session is
/// declared broken.
const MAX_FAILURE_DURATION: Duration = Duration::from_secs(3);

/// Object-store retention: sweep hourly, expire after two days.
pub const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const RETENTION_MAX_AGE: Duration = Duration::from_secs(2 * 24 * 60 * 60);

pub async fn run_archiver(
    registry: Arc<StreamRegistry>,
    stream_id: Uuid,
    mut packets: mpsc::Receiver<Packet>,
    mut stop: mpsc::Receiver<StopReason>,
    spec: ArchiveSpec,
) -> Result<()> {
    spec.storage.ensure_container(&spec.bucket).await?;
    fs::create_dir_all(&spec.directory).await?;
    tracing::info!(stream_id = %stream_id, directory = %spec.directory.display(), "archiver started");

    let mut connected = true;
    let mut segment_time = chrono::Utc::now();
    let mut last_packet_time = Duration::ZERO;
    let mut carry_keyframe: Option<Packet> = None;
    let mut fault = Duration::ZERO;

    while connected {
        let wall_start = Instant::now();
        let segment_name = format!("{}_{}.mp4", stream_id, segment_time.timestamp());
        let segment_path = spec.directory.join(&segment_name);
        let mut file = fs::File::create(&segment_path).await?;
        tracing::info!(stream_id = %stream_id, segment = %segment_path.display(), "create segment");

        let codecs = registry.get_codecs(stream_id)?;
        let mut muxer = Mp4Muxer::new(&codecs)?;
        file.write_all(&muxer.init_segment()).await?;

        let video_track = codecs.iter().position(|c| c.is_video()).unwrap_or(0);
        let mut segment_length = Duration::ZERO;
        let mut started = false;

        if let Some(keyframe) = carry_keyframe.take() {
            started = true;
            if let Some(fragment) = muxer.write_packet(&keyframe)? {
                file.write_all(&fragment).await?;
            }
            segment_length += keyframe.time.saturating_sub(last_packet_time);
            last_packet_time = keyframe.time;
        }

        'segment: loop {
            // Drain queued packets before honoring a stop, so the closing
            // segment carries everything already cast.
            tokio::select! {
                biased;
                packet = packets.recv() => {
                    let Some(packet) = packet else {
                        connected = false;
                        break 'segment;
                    };
                    if packet.track == video_track && packet.is_keyframe {
                        started = true;
                        if segment_length.as_millis() as i64 >= spec.ms_per_segment {
                            carry_keyframe = Some(packet);
                            break 'segment;
                        }
                    }
                    if !started {
                        continue;
                    }
                    if packet.track == video_track {
                        if packet.time > last_packet_time {
                            if let Some(fragment) = muxer.write_packet(&packet)? {
                                file.write_all(&fragment).await?;
                            }
                            segment_length += packet.time - last_packet_time;
                            last_packet_time = packet.time;
                        } else {
                            // Sources without a duration hint charge the
                            // backwards jump itself against the budget.
                            fault += if packet.duration.is_zero() {
                                last_packet_time.saturating_sub(packet.time)
                            } else {
                                packet.duration
                            };
                            if fault > MAX_FAILURE_DURATION {
                                return Err(Error::TimeFailure);
                            }
                        }
                    } else if let Some(fragment) = muxer.write_packet(&packet)? {
                        file.write_all(&fragment).await?;
                    }
                }
                reason = stop.recv() => {
                    tracing::info!(stream_id = %stream_id, reason = ?reason.unwrap_or(StopReason::StopDial), "archiver stopping");
                    connected = false;
                    break 'segment;
                }
            }
        }

        let trailer = muxer.finalize();
        if let Err(e) = file.write_all(&trailer).await {
            tracing::error!(stream_id = %stream_id, segment = %segment_name, error = %e, "can't write segment trailer");
        }
        if let Err(e) = file.sync_all().await {
            tracing::warn!(stream_id = %stream_id, segment = %segment_name, error = %e, "can't sync segment file");
        }
        drop(file);
        tracing::info!(stream_id = %stream_id, segment = %segment_name, "close segment");

        if spec.storage.kind() == StorageKind::Minio {
            let storage = Arc::clone(&spec.storage);
            let unit = ArchiveUnit {
                bucket: spec.bucket.clone(),
                key_prefix: spec.bucket_path.clone(),
                segment_name: segment_name.clone(),
                source: segment_path.clone(),
            };
            // Uploads run detached: a slow or failing store never stalls the
            // next segment.
            tokio::spawn(async move {
                match storage.put_segment(unit).await {
                    Ok(key) => tracing::debug!(key = %key, "segment stored"),
                    Err(e) => tracing::error!(error = %e, "can't store segment"),
                }
            });
        }

        segment_time += chrono::Duration::from_std(wall_start.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
    }
    Ok(())
}

/// Periodic expiry for object-store archives, standing in for a bucket
/// lifecycle rule. Runs until cancelled.
pub async fn run_retention_sweep(
    storage: Arc<dyn crate::storage::ArchiveStorage>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                match storage.retention_sweep(RETENTION_MAX_AGE).await {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "expired archive segments removed"),
                    Err(e) => tracing::warn!(error = %e, "archive retention sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecParameters, H264Parameters, StreamType, VerboseLevel};
    use crate::storage::FilesystemStorage;
    use bytes::Bytes;
    use std::path::PathBuf;

    fn h264_codecs() -> Vec<CodecParameters> {
        vec![CodecParameters::H264(H264Parameters {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEE]),
            width: 640,
            height: 360,
        })]
    }

    fn packet(ms: u64, keyframe: bool) -> Packet {
        Packet {
            track: 0,
            time: Duration::from_millis(ms),
            data: Bytes::from_static(&[0x00, 0x00, 0x00, 0x02, 0x65, 0x88]),
            is_keyframe: keyframe,
            duration: Duration::from_millis(500),
        }
    }

    fn setup(dir: PathBuf) -> (Arc<StreamRegistry>, Uuid, ArchiveSpec) {
        let stream_id = Uuid::new_v4();
        let registry = Arc::new(StreamRegistry::new());
        registry.insert(
            stream_id,
            "rtsp://camera/main".into(),
            vec![StreamType::Hls],
            VerboseLevel::None,
        );
        registry.set_codecs(stream_id, h264_codecs()).unwrap();
        let spec = ArchiveSpec {
            storage: Arc::new(FilesystemStorage::new()),
            bucket: dir.to_string_lossy().into_owned(),
            directory: dir,
            bucket_path: String::new(),
            ms_per_segment: 1_000,
        };
        (registry, stream_id, spec)
    }

    #[tokio::test]
    async fn segments_rotate_on_keyframes_and_are_complete_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, stream_id, spec) = setup(dir.path().to_path_buf());

        let (packet_tx, packet_rx) = mpsc::channel(100);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_archiver(
            registry,
            stream_id,
            packet_rx,
            stop_rx,
            spec,
        ));

        // Keyframes every 500 ms of media time; 1 s per file -> rotation on
        // every other keyframe. Real sleeps keep the wall-clock names apart.
        for i in 0..3u64 {
            packet_tx.send(packet(i * 500, true)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        packet_tx.send(packet(1_500, true)).await.unwrap(); // closes segment 0
        packet_tx.send(packet(2_000, true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        packet_tx.send(packet(2_500, true)).await.unwrap(); // closes segment 1
        stop_tx.send(StopReason::StopDial).await.unwrap();
        handle.await.unwrap().unwrap();

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            files.push(entry.path());
        }
        files.sort();
        assert!(files.len() >= 2, "expected rotation, got {files:?}");

        // Wall-clock suffixes advance by roughly the elapsed segment time.
        let stamps: Vec<i64> = files
            .iter()
            .filter_map(|p| {
                p.file_stem()?
                    .to_str()?
                    .rsplit('_')
                    .next()?
                    .parse()
                    .ok()
            })
            .collect();
        for pair in stamps.windows(2) {
            assert!(pair[1] > pair[0]);
        }

        for path in &files {
            let data = tokio::fs::read(path).await.unwrap();
            assert_eq!(&data[4..8], b"ftyp");
            assert!(data.windows(4).any(|w| w == b"moov"));
            assert!(data.windows(4).any(|w| w == b"moof"));
            // Trailer closes the file.
            assert_eq!(&data[data.len() - 12..data.len() - 8], b"mfro");
        }
    }

    /// Object-store double: "uploads" by recording the key and deleting the
    /// local scratch file, like the real backend.
    struct RecordingStorage {
        uploaded: parking_lot::Mutex<Vec<String>>,
        containers: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::storage::ArchiveStorage for RecordingStorage {
        fn kind(&self) -> StorageKind {
            StorageKind::Minio
        }

        async fn ensure_container(
            &self,
            name: &str,
        ) -> std::result::Result<(), crate::storage::StorageError> {
            self.containers.lock().push(name.to_string());
            Ok(())
        }

        async fn put_segment(
            &self,
            unit: crate::storage::ArchiveUnit,
        ) -> std::result::Result<String, crate::storage::StorageError> {
            tokio::fs::remove_file(&unit.source).await.map_err(|e| {
                crate::storage::StorageError::InvalidKey(format!(
                    "{}: {e}",
                    unit.source.display()
                ))
            })?;
            self.uploaded
                .lock()
                .push(format!("{}/{}", unit.key_prefix, unit.segment_name));
            Ok(unit.segment_name)
        }
    }

    #[tokio::test]
    async fn object_store_upload_removes_local_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, stream_id, mut spec) = setup(dir.path().to_path_buf());
        let storage = Arc::new(RecordingStorage {
            uploaded: parking_lot::Mutex::new(Vec::new()),
            containers: parking_lot::Mutex::new(Vec::new()),
        });
        spec.storage = Arc::clone(&storage) as Arc<dyn crate::storage::ArchiveStorage>;
        spec.bucket = "cams".into();
        spec.bucket_path = "videos".into();

        let (packet_tx, packet_rx) = mpsc::channel(100);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_archiver(
            registry,
            stream_id,
            packet_rx,
            stop_rx,
            spec,
        ));

        for i in 0..4u64 {
            packet_tx.send(packet(i * 500, true)).await.unwrap();
        }
        stop_tx.send(StopReason::StopDial).await.unwrap();
        handle.await.unwrap().unwrap();

        // Detached upload tasks get a moment to run.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(storage.containers.lock().as_slice(), ["cams"]);
        let uploaded = storage.uploaded.lock().clone();
        assert!(!uploaded.is_empty());
        for key in &uploaded {
            assert!(key.starts_with(&format!("videos/{stream_id}_")));
            assert!(key.ends_with(".mp4"));
        }

        // Every scratch file was consumed by an upload.
        let mut remaining = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            remaining.push(entry.path());
        }
        assert!(remaining.is_empty(), "scratch left behind: {remaining:?}");
    }

    #[tokio::test]
    async fn time_failure_after_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, stream_id, spec) = setup(dir.path().to_path_buf());

        let (packet_tx, packet_rx) = mpsc::channel(100);
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_archiver(
            registry,
            stream_id,
            packet_rx,
            stop_rx,
            spec,
        ));

        packet_tx.send(packet(5_000, true)).await.unwrap();
        // Seven non-monotonic packets at 500 ms fault each blow the 3 s
        // budget.
        for _ in 0..7 {
            packet_tx.send(packet(1_000, false)).await.unwrap();
        }
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TimeFailure));
    }

    #[tokio::test]
    async fn time_failure_without_duration_hints() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, stream_id, spec) = setup(dir.path().to_path_buf());

        let (packet_tx, packet_rx) = mpsc::channel(100);
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_archiver(
            registry,
            stream_id,
            packet_rx,
            stop_rx,
            spec,
        ));

        let hintless = |ms: u64, keyframe: bool| Packet {
            duration: Duration::ZERO,
            ..packet(ms, keyframe)
        };
        packet_tx.send(hintless(10_000, true)).await.unwrap();
        // A 5 s backwards jump with no hint charges the jump itself.
        packet_tx.send(hintless(5_000, false)).await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TimeFailure));
    }
}
