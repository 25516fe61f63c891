//! Per-viewer MSE session over a WebSocket.
//!
//! Wire protocol, server to client (binary frames): `[0x09] ++ codec
//! metadata` first, then the fMP4 init segment, then media fragments.
//! Client to server: the text frame `"ping"` is answered with `"pong"`;
//! anything else (or a read error) ends the session. Delivery is gated on
//! the first keyframe so the browser decoder starts clean.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::media::{Packet, StreamType, VerboseLevel};
use crate::mp4::Mp4Muxer;
use crate::registry::StreamRegistry;

const VIEWER_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// First frame on the socket: this tag byte followed by codec metadata.
const META_FRAME_TAG: u8 = 0x09;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub async fn serve_viewer(socket: WebSocket, registry: Arc<StreamRegistry>, raw_stream_id: String) {
    let (mut sink, reader) = socket.split();

    let stream_id = match Uuid::parse_str(&raw_stream_id) {
        Ok(id) => id,
        Err(e) => {
            close_with_error(&mut sink, format!("can't parse stream id '{raw_stream_id}': {e}"))
                .await;
            return;
        }
    };
    if registry.verbose_level(stream_id) > VerboseLevel::Simple {
        tracing::info!(stream_id = %stream_id, "viewer websocket upgraded");
    }
    if !registry.supports(stream_id, StreamType::Mse) {
        close_with_error(&mut sink, format!("stream {stream_id} does not support MSE")).await;
        return;
    }
    let (viewer_id, packets) = match registry.add_viewer(stream_id) {
        Ok(added) => added,
        Err(e) => {
            close_with_error(&mut sink, format!("can't add viewer for {stream_id}: {e}")).await;
            return;
        }
    };

    let outcome = run_viewer(&mut sink, reader, &registry, stream_id, packets).await;
    registry.remove_viewer(stream_id, viewer_id);
    if let Err(reason) = outcome {
        close_with_error(&mut sink, reason).await;
    }
}

async fn run_viewer(
    sink: &mut SplitSink<WebSocket, Message>,
    mut reader: SplitStream<WebSocket>,
    registry: &StreamRegistry,
    stream_id: Uuid,
    mut packets: mpsc::Receiver<Packet>,
) -> Result<(), String> {
    let codecs = registry
        .get_codecs(stream_id)
        .map_err(|e| format!("can't read codecs for {stream_id}: {e}"))?;
    if codecs.is_empty() {
        return Err(format!("no codec information for stream {stream_id}"));
    }
    let mut muxer =
        Mp4Muxer::new(&codecs).map_err(|e| format!("can't init muxer for {stream_id}: {e}"))?;

    let mut meta_frame = vec![META_FRAME_TAG];
    meta_frame.extend_from_slice(muxer.codec_metadata().as_bytes());
    send_binary(sink, meta_frame).await?;
    send_binary(sink, muxer.init_segment().to_vec()).await?;

    let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
    let (ping_tx, mut ping_rx) = mpsc::channel::<()>(1);
    let reader_task = tokio::spawn(async move {
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) if text == "ping" => {
                    // A still-queued pong already answers this ping.
                    let _ = ping_tx.try_send(());
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = quit_tx.try_send(());
    });

    let liveness = tokio::time::sleep(VIEWER_LIVENESS_TIMEOUT);
    tokio::pin!(liveness);
    let mut started = false;

    let outcome = loop {
        tokio::select! {
            () = &mut liveness => {
                tracing::debug!(stream_id = %stream_id, "viewer keyframe timeout");
                break Ok(());
            }
            _ = quit_rx.recv() => break Ok(()),
            _ = ping_rx.recv() => {
                if send_with_deadline(sink, Message::Text("pong".to_string())).await.is_err() {
                    break Ok(());
                }
            }
            packet = packets.recv() => {
                let Some(packet) = packet else { break Ok(()) };
                if packet.is_keyframe {
                    liveness.as_mut().reset(Instant::now() + VIEWER_LIVENESS_TIMEOUT);
                    started = true;
                }
                if !started {
                    continue;
                }
                match muxer.write_packet(&packet) {
                    Ok(Some(fragment)) => {
                        if let Err(reason) = send_binary(sink, fragment.to_vec()).await {
                            break Err(reason);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(stream_id = %stream_id, error = %e, "can't mux packet for viewer");
                    }
                }
            }
        }
    };

    reader_task.abort();
    outcome
}

async fn send_binary(sink: &mut SplitSink<WebSocket, Message>, data: Vec<u8>) -> Result<(), String> {
    send_with_deadline(sink, Message::Binary(data)).await
}

async fn send_with_deadline(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
) -> Result<(), String> {
    tokio::time::timeout(WRITE_DEADLINE, sink.send(message))
        .await
        .map_err(|_| "write deadline exceeded".to_string())?
        .map_err(|e| format!("can't write message: {e}"))
}

async fn close_with_error(sink: &mut SplitSink<WebSocket, Message>, reason: String) {
    tracing::debug!(reason = %reason, "closing viewer socket");
    let frame = CloseFrame {
        code: CLOSE_INTERNAL_ERROR,
        reason: reason.into(),
    };
    let _ = tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Close(Some(frame)))).await;
}
