//! RTSP source supervision: one long-lived task per stream that dials the
//! source, tracks codecs, pumps packets into the registry fan-out and
//! reconnects with a fixed backoff.
//!
//! The wire protocol lives behind [`SourceDialer`]; the supervisor only sees
//! the session contract (codec list, control signals, packet queue).

pub mod rtsp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::run_archiver;
use crate::error::{Error, Result};
use crate::hls::{run_segmenter, HlsSettings};
use crate::media::{CodecParameters, Packet, StreamType};
use crate::registry::StreamRegistry;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(33);
pub const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(33);
pub const RESTART_INTERVAL: Duration = Duration::from_secs(5);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);
/// Liveness resets land one second past the base timeout.
const LIVENESS_RESET: Duration = Duration::from_secs(16);

/// Reason carried on sink stop channels. Sinks flush and exit on any of
/// them; the reason only steers logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Error,
    NoVideo,
    Disconnect,
    StopDial,
}

/// Control events surfaced by a source session.
#[derive(Debug, Clone)]
pub enum SourceSignal {
    /// The source renegotiated its tracks; the full sequence replaces the
    /// stored codecs.
    CodecUpdate(Vec<CodecParameters>),
    RtpStop,
}

#[derive(Debug, Clone)]
pub struct DialOptions {
    pub url: String,
    pub dial_timeout: Duration,
    pub read_write_timeout: Duration,
    pub disable_audio: bool,
}

impl DialOptions {
    pub fn for_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            dial_timeout: DIAL_TIMEOUT,
            read_write_timeout: READ_WRITE_TIMEOUT,
            disable_audio: true,
        }
    }
}

/// One live connection to a source. Dropping the session (or cancelling its
/// token via `close`) tears down the underlying transport.
pub struct SourceSession {
    pub codecs: Vec<CodecParameters>,
    pub signals: mpsc::Receiver<SourceSignal>,
    pub packets: mpsc::Receiver<Packet>,
    shutdown: CancellationToken,
}

impl SourceSession {
    pub fn new(
        codecs: Vec<CodecParameters>,
        signals: mpsc::Receiver<SourceSignal>,
        packets: mpsc::Receiver<Packet>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            codecs,
            signals,
            packets,
            shutdown,
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SourceSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
pub trait SourceDialer: Send + Sync + 'static {
    async fn dial(&self, opts: DialOptions) -> Result<SourceSession>;
}

/// Spawns and supervises per-stream source tasks.
pub struct Supervisor {
    registry: Arc<StreamRegistry>,
    dialer: Arc<dyn SourceDialer>,
    hls: HlsSettings,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        registry: Arc<StreamRegistry>,
        dialer: Arc<dyn SourceDialer>,
        hls: HlsSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            dialer,
            hls,
            cancel,
        })
    }

    /// Start a source task for every registered stream.
    pub fn start_all(self: Arc<Self>) {
        for id in self.registry.all_ids() {
            Arc::clone(&self).start_stream(id);
        }
    }

    pub fn start_stream(self: Arc<Self>, stream_id: Uuid) {
        tokio::spawn(async move {
            self.run_stream(stream_id).await;
        });
    }

    /// Outer supervisory loop: one RTSP session per iteration, fixed sleep
    /// between attempts, exits when cancelled or when the stream record is
    /// gone.
    async fn run_stream(&self, stream_id: Uuid) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let (url, outputs) = match self.registry.info(stream_id) {
                Ok(info) => info,
                // Disabled via the API: nothing left to supervise.
                Err(_) => return,
            };
            let hls_enabled = outputs.contains(&StreamType::Hls);
            tracing::info!(stream_id = %stream_id, url = %url, "establishing stream");
            if let Err(e) = self.run_session(stream_id, &url, hls_enabled).await {
                tracing::warn!(stream_id = %stream_id, url = %url, error = %e, "session ended");
            }
            tracing::info!(
                stream_id = %stream_id,
                url = %url,
                retry_in = ?RESTART_INTERVAL,
                "re-establishing stream"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(RESTART_INTERVAL) => {}
            }
        }
    }

    /// One dial-to-teardown session.
    async fn run_session(&self, stream_id: Uuid, url: &str, hls_enabled: bool) -> Result<()> {
        let opts = DialOptions::for_url(url);
        let mut session = tokio::time::timeout(opts.dial_timeout, self.dialer.dial(opts.clone()))
            .await
            .map_err(|_| Error::SessionDialFailed(format!("dial timeout for '{url}'")))??;

        if !session.codecs.is_empty() {
            self.registry.set_codecs(stream_id, session.codecs.clone())?;
            self.registry.set_status(stream_id, true)?;
        }
        let audio_only = session.codecs.len() == 1 && session.codecs[0].is_audio();

        // Sinks live for exactly this session; their stop channels carry the
        // teardown reason and their failures surface through sink_errors.
        let (sink_error_tx, mut sink_errors) = mpsc::channel::<Error>(2);
        let mut sink_stops: Vec<mpsc::Sender<StopReason>> = Vec::new();

        if hls_enabled {
            let packets = self.registry.begin_hls(stream_id)?;
            let (stop_tx, stop_rx) = mpsc::channel(1);
            sink_stops.push(stop_tx);
            let registry = Arc::clone(&self.registry);
            let settings = self.hls.clone();
            let errors = sink_error_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = run_segmenter(registry, stream_id, packets, stop_rx, settings).await
                {
                    tracing::error!(stream_id = %stream_id, error = %e, "hls segmenter failed");
                    let _ = errors.try_send(e);
                }
            });
        }

        let archive_enabled = self.registry.archive_enabled(stream_id)?;
        if archive_enabled {
            let spec = self
                .registry
                .get_archive(stream_id)?
                .ok_or(Error::NullArchive)?;
            let packets = self.registry.begin_archive(stream_id)?;
            let (stop_tx, stop_rx) = mpsc::channel(1);
            sink_stops.push(stop_tx);
            let registry = Arc::clone(&self.registry);
            let errors = sink_error_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = run_archiver(registry, stream_id, packets, stop_rx, spec).await {
                    tracing::error!(stream_id = %stream_id, error = %e, "archiver failed");
                    let _ = errors.try_send(e);
                }
            });
        }

        let liveness = tokio::time::sleep(LIVENESS_TIMEOUT);
        tokio::pin!(liveness);

        let result = loop {
            tokio::select! {
                () = &mut liveness => {
                    break Err(Error::StreamHasNoVideo);
                }
                signal = session.signals.recv() => match signal {
                    Some(SourceSignal::CodecUpdate(codecs)) => {
                        self.registry.set_codecs(stream_id, codecs)?;
                        self.registry.set_status(stream_id, true)?;
                    }
                    Some(SourceSignal::RtpStop) | None => {
                        break Err(Error::StreamDisconnected);
                    }
                },
                packet = session.packets.recv() => match packet {
                    Some(packet) => {
                        if audio_only || packet.is_keyframe {
                            liveness.as_mut().reset(Instant::now() + LIVENESS_RESET);
                        }
                        if let Err(e) = self
                            .registry
                            .cast(stream_id, packet, hls_enabled, archive_enabled)
                            .await
                        {
                            break Err(e);
                        }
                    }
                    None => break Err(Error::StreamDisconnected),
                },
                error = sink_errors.recv() => {
                    if let Some(e) = error {
                        break Err(e);
                    }
                }
            }
        };

        let reason = match &result {
            Ok(()) => StopReason::StopDial,
            Err(Error::StreamHasNoVideo) => StopReason::NoVideo,
            Err(Error::StreamDisconnected) => StopReason::Disconnect,
            Err(_) => StopReason::Error,
        };
        for stop in &sink_stops {
            let _ = stop.try_send(reason);
        }
        // Record may already be gone when the stream was disabled.
        let _ = self.registry.set_status(stream_id, false);
        session.close();
        result
    }
}
