//! Process-wide stream registry: the single point of synchronized mutation.
//!
//! One readers-writer lock guards the whole map; every public operation
//! acquires it internally and callers never see the lock. `cast` snapshots
//! the channel senders under the lock and releases it before sending, so a
//! full HLS/archive channel can never stall other registry users.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::{CodecParameters, Packet, StreamType, VerboseLevel, PACKET_CHANNEL_CAPACITY};
use crate::storage::ArchiveStorage;

/// Archive destination for one stream, resolved at configuration time.
#[derive(Clone)]
pub struct ArchiveSpec {
    pub storage: Arc<dyn ArchiveStorage>,
    /// Local scratch directory segments are written to before upload.
    pub directory: PathBuf,
    pub bucket: String,
    pub bucket_path: String,
    pub ms_per_segment: i64,
}

struct PacketChannel {
    tx: mpsc::Sender<Packet>,
    rx: Option<mpsc::Receiver<Packet>>,
}

impl PacketChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        Self { tx, rx: Some(rx) }
    }

    /// Replace the pair and hand out the fresh receiver. The previous
    /// consumer observes its channel closing.
    fn rearm(&mut self) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        self.tx = tx;
        rx
    }
}

struct StreamRecord {
    url: String,
    supported_outputs: Vec<StreamType>,
    status: bool,
    codecs: Vec<CodecParameters>,
    viewers: HashMap<Uuid, mpsc::Sender<Packet>>,
    hls: PacketChannel,
    archive: PacketChannel,
    archive_spec: Option<ArchiveSpec>,
    verbose: VerboseLevel,
}

impl StreamRecord {
    fn new(url: String, supported_outputs: Vec<StreamType>, verbose: VerboseLevel) -> Self {
        Self {
            url,
            supported_outputs,
            status: false,
            codecs: Vec::new(),
            viewers: HashMap::new(),
            hls: PacketChannel::new(),
            archive: PacketChannel::new(),
            archive_spec: None,
            verbose,
        }
    }
}

/// Status snapshot served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub id: Uuid,
    pub url: String,
    pub status: bool,
    pub supported_outputs: Vec<StreamType>,
    pub archive_enabled: bool,
}

#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<Uuid, StreamRecord>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record. Replaces nothing: returns false when the ID is
    /// already present.
    pub fn insert(
        &self,
        id: Uuid,
        url: String,
        supported_outputs: Vec<StreamType>,
        verbose: VerboseLevel,
    ) -> bool {
        let mut streams = self.streams.write();
        if streams.contains_key(&id) {
            return false;
        }
        streams.insert(id, StreamRecord::new(url, supported_outputs, verbose));
        true
    }

    /// Drop a record. Running tasks observe the absence through subsequent
    /// operations returning `StreamNotFound`.
    pub fn remove(&self, id: Uuid) -> bool {
        self.streams.write().remove(&id).is_some()
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.streams.read().contains_key(&id)
    }

    /// Source URL and supported output types.
    pub fn info(&self, id: Uuid) -> Result<(String, Vec<StreamType>)> {
        let streams = self.streams.read();
        let record = streams.get(&id).ok_or(Error::StreamNotFound)?;
        Ok((record.url.clone(), record.supported_outputs.clone()))
    }

    pub fn supports(&self, id: Uuid, ty: StreamType) -> bool {
        let streams = self.streams.read();
        streams
            .get(&id)
            .map(|r| r.supported_outputs.contains(&ty))
            .unwrap_or(false)
    }

    /// Atomically replace the codec sequence. Every entry must be H.264 or
    /// AAC; any other variant fails with `UnknownCodec` and leaves the
    /// previous sequence untouched.
    pub fn set_codecs(&self, id: Uuid, codecs: Vec<CodecParameters>) -> Result<()> {
        for codec in &codecs {
            if let CodecParameters::Other { name } = codec {
                return Err(Error::UnknownCodec(name.clone()));
            }
        }
        let mut streams = self.streams.write();
        let record = streams.get_mut(&id).ok_or(Error::StreamNotFound)?;
        if record.verbose > VerboseLevel::Simple {
            tracing::info!(stream_id = %id, tracks = codecs.len(), "codecs updated");
        }
        record.codecs = codecs;
        Ok(())
    }

    /// Copy of the codec sequence.
    pub fn get_codecs(&self, id: Uuid) -> Result<Vec<CodecParameters>> {
        let streams = self.streams.read();
        let record = streams.get(&id).ok_or(Error::StreamNotFound)?;
        Ok(record.codecs.clone())
    }

    pub fn set_status(&self, id: Uuid, status: bool) -> Result<()> {
        let mut streams = self.streams.write();
        let record = streams.get_mut(&id).ok_or(Error::StreamNotFound)?;
        if record.verbose > VerboseLevel::Simple {
            tracing::info!(stream_id = %id, status, "status updated");
        }
        record.status = status;
        Ok(())
    }

    /// Register a viewer: fresh ID, bounded queue, reader half returned.
    pub fn add_viewer(&self, id: Uuid) -> Result<(Uuid, mpsc::Receiver<Packet>)> {
        let mut streams = self.streams.write();
        let record = streams.get_mut(&id).ok_or(Error::StreamNotFound)?;
        let viewer_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        record.viewers.insert(viewer_id, tx);
        if record.verbose > VerboseLevel::Simple {
            tracing::info!(stream_id = %id, viewer_id = %viewer_id, "viewer added");
        }
        Ok((viewer_id, rx))
    }

    /// Idempotent: removing an unknown viewer (or from an unknown stream) is
    /// a no-op.
    pub fn remove_viewer(&self, id: Uuid, viewer_id: Uuid) {
        let mut streams = self.streams.write();
        if let Some(record) = streams.get_mut(&id) {
            if record.verbose > VerboseLevel::Simple {
                tracing::info!(stream_id = %id, viewer_id = %viewer_id, "viewer removed");
            }
            record.viewers.remove(&viewer_id);
        }
    }

    /// Re-arm the HLS channel for a new segmenter and return its receiver.
    pub fn begin_hls(&self, id: Uuid) -> Result<mpsc::Receiver<Packet>> {
        let mut streams = self.streams.write();
        let record = streams.get_mut(&id).ok_or(Error::StreamNotFound)?;
        Ok(record.hls.rx.take().unwrap_or_else(|| record.hls.rearm()))
    }

    /// Re-arm the archive channel for a new archiver and return its receiver.
    pub fn begin_archive(&self, id: Uuid) -> Result<mpsc::Receiver<Packet>> {
        let mut streams = self.streams.write();
        let record = streams.get_mut(&id).ok_or(Error::StreamNotFound)?;
        Ok(record
            .archive
            .rx
            .take()
            .unwrap_or_else(|| record.archive.rearm()))
    }

    pub fn set_archive(&self, id: Uuid, spec: Option<ArchiveSpec>) -> Result<()> {
        let mut streams = self.streams.write();
        let record = streams.get_mut(&id).ok_or(Error::StreamNotFound)?;
        record.archive_spec = spec;
        Ok(())
    }

    pub fn get_archive(&self, id: Uuid) -> Result<Option<ArchiveSpec>> {
        let streams = self.streams.read();
        let record = streams.get(&id).ok_or(Error::StreamNotFound)?;
        Ok(record.archive_spec.clone())
    }

    pub fn archive_enabled(&self, id: Uuid) -> Result<bool> {
        Ok(self.get_archive(id)?.is_some())
    }

    pub fn verbose_level(&self, id: Uuid) -> VerboseLevel {
        self.streams
            .read()
            .get(&id)
            .map(|r| r.verbose)
            .unwrap_or(VerboseLevel::None)
    }

    pub fn all_ids(&self) -> Vec<Uuid> {
        self.streams.read().keys().copied().collect()
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        self.streams
            .read()
            .iter()
            .map(|(id, record)| StreamStatus {
                id: *id,
                url: record.url.clone(),
                status: record.status,
                supported_outputs: record.supported_outputs.clone(),
                archive_enabled: record.archive_spec.is_some(),
            })
            .collect()
    }

    /// Fan one packet out to the stream's sinks and viewers.
    ///
    /// The HLS and archive sends may block: they are the chosen
    /// back-pressure point. Viewer sends never block; a full viewer queue
    /// drops the packet for that viewer only (it recovers on the next
    /// keyframe). The lock is held only while snapshotting senders.
    pub async fn cast(
        &self,
        id: Uuid,
        packet: Packet,
        hls_enabled: bool,
        archive_enabled: bool,
    ) -> Result<()> {
        let (hls_tx, archive_tx, viewer_txs, verbose) = {
            let streams = self.streams.write();
            let record = streams.get(&id).ok_or(Error::StreamNotFound)?;
            (
                record.hls.tx.clone(),
                record.archive.tx.clone(),
                record.viewers.values().cloned().collect::<Vec<_>>(),
                record.verbose,
            )
        };
        if verbose > VerboseLevel::Add {
            tracing::trace!(
                stream_id = %id,
                hls_enabled,
                archive_enabled,
                viewers = viewer_txs.len(),
                "cast packet"
            );
        }
        if hls_enabled {
            hls_tx
                .send(packet.clone())
                .await
                .map_err(|_| Error::SinkClosed { sink: "hls" })?;
        }
        if archive_enabled {
            archive_tx
                .send(packet.clone())
                .await
                .map_err(|_| Error::SinkClosed { sink: "archive" })?;
        }
        for tx in &viewer_txs {
            // Full viewer queues drop the packet; the viewer catches up on
            // the next keyframe.
            let _ = tx.try_send(packet.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AacParameters, H264Parameters};
    use bytes::Bytes;
    use std::time::Duration;

    fn h264() -> CodecParameters {
        CodecParameters::H264(H264Parameters {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f]),
            pps: Bytes::from_static(&[0x68, 0xee]),
            width: 1280,
            height: 720,
        })
    }

    fn aac() -> CodecParameters {
        CodecParameters::Aac(AacParameters {
            asc: Bytes::from_static(&[0x12, 0x10]),
            sample_rate: 44100,
            channels: 2,
        })
    }

    fn packet(keyframe: bool, ms: u64) -> Packet {
        Packet {
            track: 0,
            time: Duration::from_millis(ms),
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            is_keyframe: keyframe,
            duration: Duration::from_millis(40),
        }
    }

    fn registry_with_stream(id: Uuid) -> StreamRegistry {
        let registry = StreamRegistry::new();
        assert!(registry.insert(
            id,
            "rtsp://example/stream".to_string(),
            vec![StreamType::Hls, StreamType::Mse],
            VerboseLevel::None,
        ));
        registry
    }

    #[test]
    fn insert_is_exclusive() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);
        assert!(!registry.insert(id, "rtsp://other".into(), vec![], VerboseLevel::None));
        assert!(registry.exists(id));
    }

    #[test]
    fn missing_stream_errors() {
        let registry = StreamRegistry::new();
        let id = Uuid::new_v4();
        assert!(matches!(registry.info(id), Err(Error::StreamNotFound)));
        assert!(matches!(
            registry.get_codecs(id),
            Err(Error::StreamNotFound)
        ));
        assert!(matches!(
            registry.set_status(id, true),
            Err(Error::StreamNotFound)
        ));
        assert!(!registry.supports(id, StreamType::Hls));
    }

    #[test]
    fn set_codecs_rejects_unknown_and_keeps_previous() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);
        registry.set_codecs(id, vec![h264(), aac()]).unwrap();

        let err = registry
            .set_codecs(
                id,
                vec![h264(), CodecParameters::Other { name: "hevc".into() }],
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCodec(name) if name == "hevc"));

        let codecs = registry.get_codecs(id).unwrap();
        assert_eq!(codecs.len(), 2);
        assert!(codecs[0].is_video());
        assert!(codecs[1].is_audio());
    }

    #[test]
    fn remove_viewer_is_idempotent() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);
        let (viewer_id, _rx) = registry.add_viewer(id).unwrap();
        registry.remove_viewer(id, viewer_id);
        registry.remove_viewer(id, viewer_id);
        registry.remove_viewer(Uuid::new_v4(), viewer_id);
    }

    #[tokio::test]
    async fn cast_reaches_viewers() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);
        let (_viewer_id, mut rx) = registry.add_viewer(id).unwrap();

        registry.cast(id, packet(true, 0), false, false).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert!(received.is_keyframe);
    }

    #[tokio::test]
    async fn full_viewer_queue_drops_without_blocking() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);
        let (_slow, mut slow_rx) = registry.add_viewer(id).unwrap();
        let (_ok, mut ok_rx) = registry.add_viewer(id).unwrap();

        for i in 0..(PACKET_CHANNEL_CAPACITY + 10) {
            registry
                .cast(id, packet(i == 0, i as u64 * 40), false, false)
                .await
                .unwrap();
            // Keep the healthy viewer drained.
            assert!(ok_rx.recv().await.is_some());
        }

        // The slow viewer holds exactly its queue capacity; the overflow was
        // dropped at the fan-out.
        let mut queued = 0;
        while slow_rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, PACKET_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn cast_after_remove_reports_not_found() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);
        assert!(registry.remove(id));
        let err = registry
            .cast(id, packet(true, 0), true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StreamNotFound));
    }

    #[tokio::test]
    async fn begin_hls_rearms_channel() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);

        let mut first = registry.begin_hls(id).unwrap();
        registry.cast(id, packet(true, 0), true, false).await.unwrap();
        assert!(first.recv().await.is_some());

        // A second session takes a fresh pair; the first receiver closes.
        let mut second = registry.begin_hls(id).unwrap();
        registry.cast(id, packet(false, 40), true, false).await.unwrap();
        assert!(second.recv().await.is_some());
        assert!(first.recv().await.is_none());
    }

    #[test]
    fn archive_spec_roundtrip() {
        let id = Uuid::new_v4();
        let registry = registry_with_stream(id);
        assert!(!registry.archive_enabled(id).unwrap());

        let spec = ArchiveSpec {
            storage: Arc::new(crate::storage::FilesystemStorage::new()),
            directory: PathBuf::from("./mp4"),
            bucket: "bucket".into(),
            bucket_path: "path".into(),
            ms_per_segment: 1000,
        };
        registry.set_archive(id, Some(spec)).unwrap();
        assert!(registry.archive_enabled(id).unwrap());
        assert_eq!(registry.get_archive(id).unwrap().unwrap().ms_per_segment, 1000);

        registry.set_archive(id, None).unwrap();
        assert!(!registry.archive_enabled(id).unwrap());
    }
}
